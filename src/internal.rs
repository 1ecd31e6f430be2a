use crate::error::Error;
use crate::hardware_id::slot_size;
use crate::raw::{
    ERASED, PAGE_HEADER_SIZE, PageField, PageHeader, RECORD_HEADER_SIZE, RecordField,
    RecordHeader, WRITTEN, ZEROED_ID, checksum, checksum_from_flash, erased_checksum, read_bytes,
    record_footprint, write_aligned, write_field,
};
use crate::{HARDWARE_ID_ITEM, ItemInit, Nv};
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "debug-logs")]
use core::fmt::{Debug, Formatter};

use crate::platform::{AlignedOps, Platform};
#[cfg(feature = "defmt")]
use defmt::trace;
#[cfg(feature = "defmt")]
use defmt::warn;

/// Position of a page inside the pool, `0` being the page at the partition offset.
#[derive(Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) struct PageIndex(pub(crate) usize);

#[derive(Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) struct Address {
    pub(crate) page: PageIndex,
    pub(crate) offset: u16,
}

/// A record header together with where it was read from.
#[derive(Copy, Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) struct Record {
    pub(crate) address: Address,
    pub(crate) header: RecordHeader,
}

#[derive(PartialEq, Copy, Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) enum Role {
    Current,
    Superseded,
}

/// Identifies a record by item id and whether its `stat` field has been programmed.
#[derive(Copy, Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) struct ItemKey {
    pub(crate) id: u16,
    pub(crate) role: Role,
}

impl ItemKey {
    pub(crate) fn current(id: u16) -> Self {
        Self {
            id,
            role: Role::Current,
        }
    }

    pub(crate) fn superseded(id: u16) -> Self {
        Self {
            id,
            role: Role::Superseded,
        }
    }

    fn matches(&self, header: &RecordHeader) -> bool {
        let role = if header.is_superseded() {
            Role::Superseded
        } else {
            Role::Current
        };
        header.id == self.id && role == self.role
    }
}

#[derive(Copy, Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) enum ScanMode {
    /// Stop at the first valid record matching the key.
    Lookup(ItemKey),
    /// Walk the whole page and report whether superseded records were seen.
    Census,
    /// Tombstone superseded copies of every current record on the page.
    Dedupe,
}

pub(crate) enum Scan {
    Found(Record),
    Done { superseded: bool },
}

pub(crate) struct ThinPage {
    pub(crate) address: usize,
    pub(crate) state: ThinPageState,
    /// Offset of the first unwritten record slot.
    pub(crate) next_offset: u16,
    /// Bytes held by tombstones, corrupt records and unusable tails.
    pub(crate) lost: u16,
}

impl ThinPage {
    pub(crate) fn new(address: usize, state: ThinPageState) -> Self {
        Self {
            address,
            state,
            next_offset: PAGE_HEADER_SIZE,
            lost: 0,
        }
    }

    pub(crate) fn reset(&mut self, state: ThinPageState) {
        self.state = state;
        self.next_offset = PAGE_HEADER_SIZE;
        self.lost = 0;
    }

    pub(crate) fn free(&self, page_end: u16) -> u16 {
        page_end.saturating_sub(self.next_offset)
    }

    pub(crate) fn live(&self) -> u16 {
        self.next_offset
            .saturating_sub(PAGE_HEADER_SIZE)
            .saturating_sub(self.lost)
    }
}

#[cfg(feature = "debug-logs")]
impl Debug for ThinPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let address = self.address;
        let state = &self.state;
        match state {
            ThinPageState::InUse | ThinPageState::Compacting | ThinPageState::Target => {
                let next_offset = self.next_offset;
                let lost = self.lost;
                f.write_fmt(format_args!("Page {{ address: 0x{address:0>8x}, state: {state:>10}, next_offset: {next_offset:>5}, lost: {lost:>5} }}"))
            }
            _ => f.write_fmt(format_args!(
                "Page {{ address: 0x{address:0>8x}, state: {state:>10} }}"
            )),
        }
    }
}

#[derive(strum::Display, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "debug-logs", derive(Debug))]
pub(crate) enum ThinPageState {
    Reserve,
    Target,
    InUse,
    Compacting,
    Corrupt,
}

impl ThinPageState {
    /// Pages that hold records and take part in lookups.
    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self,
            ThinPageState::Target | ThinPageState::InUse | ThinPageState::Compacting
        )
    }

    /// Pages new items may be placed on.
    pub(crate) fn accepts_items(&self) -> bool {
        matches!(self, ThinPageState::InUse | ThinPageState::Compacting)
    }
}

impl<T> Nv<T>
where
    T: Platform,
{
    /// First byte behind the record log of every page.
    pub(crate) fn page_end(&self) -> u16 {
        (self.page_size - slot_size::<T>()) as u16
    }

    pub(crate) fn flash_offset(&self, page: PageIndex, offset: u16) -> u32 {
        (self.pages[page.0].address + offset as usize) as u32
    }

    pub(crate) fn active_pages(&self) -> Vec<PageIndex> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, page)| page.state.is_active())
            .map(|(index, _)| PageIndex(index))
            .collect()
    }

    /// Pages in placement order, starting behind the reserve and wrapping around.
    pub(crate) fn placement_order(&self) -> Vec<PageIndex> {
        let count = self.pages.len();
        let start = self.reserve.map(|reserve| reserve.0 + 1).unwrap_or(0);
        (0..count)
            .map(|step| PageIndex((start + step) % count))
            .collect()
    }

    /// Largest payload a single record can carry.
    pub(crate) fn max_payload(&self) -> u16 {
        let room = (self.page_end() - PAGE_HEADER_SIZE - RECORD_HEADER_SIZE) as usize;
        T::align_write_floor(room) as u16
    }

    pub(crate) fn read_page_header(&mut self, page: PageIndex) -> Result<PageHeader, Error> {
        let mut raw = [0u8; PAGE_HEADER_SIZE as usize];
        let offset = self.flash_offset(page, 0);
        read_bytes(&mut self.hal, offset, &mut raw)?;
        Ok(PageHeader::decode(&raw))
    }

    pub(crate) fn write_page_field(&mut self, page: PageIndex, field: PageField) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_page_field: page {} field {}", page.0, field as u16);

        #[cfg(feature = "debug-logs")]
        println!("  internal: write_page_field: page {} {field}", page.0);

        let offset = self.flash_offset(page, field as u16);
        write_field(&mut self.hal, offset, WRITTEN)
    }

    /// Writes `active` and `in_use` so an erased page takes records right away.
    pub(crate) fn format_page(&mut self, page: PageIndex) -> Result<(), Error> {
        self.write_page_field(page, PageField::Active)?;
        self.write_page_field(page, PageField::InUse)?;
        self.pages[page.0].reset(ThinPageState::InUse);
        Ok(())
    }

    pub(crate) fn read_record_header(
        &mut self,
        page: PageIndex,
        offset: u16,
    ) -> Result<RecordHeader, Error> {
        let mut raw = [0u8; RECORD_HEADER_SIZE as usize];
        let offset = self.flash_offset(page, offset);
        read_bytes(&mut self.hal, offset, &mut raw)?;
        Ok(RecordHeader::decode(&raw))
    }

    /// A record is valid if its length is non-zero and the committed checksum matches its payload.
    pub(crate) fn verify_record(&mut self, record: &Record) -> Result<bool, Error> {
        let header = &record.header;
        if header.len == 0 || header.chk == ERASED {
            return Ok(false);
        }
        let offset = self.flash_offset(record.address.page, record.address.offset + RECORD_HEADER_SIZE);
        let sum = checksum_from_flash(&mut self.hal, offset, header.len)?;
        Ok(sum.matches(header.chk, header.len))
    }

    pub(crate) fn read_payload(
        &mut self,
        record: &Record,
        index: u16,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let offset = self.flash_offset(
            record.address.page,
            record.address.offset + RECORD_HEADER_SIZE + index,
        );
        read_bytes(&mut self.hal, offset, buf)
    }

    /// Walks the record log of a page. Unless a lookup returns early, the page's `next_offset` and
    /// `lost` counters are refreshed from what was found on flash. Records failing their checksum
    /// are tombstoned on the way.
    pub(crate) fn scan_page(&mut self, page: PageIndex, mode: ScanMode) -> Result<Scan, Error> {
        #[cfg(feature = "debug-logs")]
        println!("  internal: scan_page: page {} {mode:?}", page.0);

        let end = self.page_end() as usize;
        let mut offset = PAGE_HEADER_SIZE as usize;
        let mut lost = 0usize;
        let mut superseded = false;

        while offset + RECORD_HEADER_SIZE as usize <= end {
            let header = self.read_record_header(page, offset as u16)?;
            if header.is_end() {
                break;
            }

            let footprint = header.footprint::<T>();
            if offset + footprint > end {
                // a torn length, nothing behind it can be trusted
                #[cfg(feature = "defmt")]
                warn!("page {}: record @{} overruns the page", page.0, offset);

                #[cfg(feature = "debug-logs")]
                println!("  internal: page {}: record @{offset} overruns the page", page.0);

                lost += end - offset;
                offset = end;
                break;
            }

            let record = Record {
                address: Address {
                    page,
                    offset: offset as u16,
                },
                header,
            };
            offset += footprint;

            if header.is_tombstone() {
                lost += footprint;
                continue;
            }

            if !self.verify_record(&record)? {
                #[cfg(feature = "defmt")]
                warn!(
                    "page {}: dropping corrupt record {:#06x} @{}",
                    page.0, header.id, record.address.offset
                );

                #[cfg(feature = "debug-logs")]
                println!(
                    "  internal: page {}: dropping corrupt record {:#06x} @{}",
                    page.0, header.id, record.address.offset
                );

                lost += footprint;
                self.tombstone_tolerant(&record)?;
                continue;
            }

            match mode {
                ScanMode::Lookup(key) => {
                    if key.matches(&header) {
                        return Ok(Scan::Found(record));
                    }
                }
                ScanMode::Census => superseded |= header.is_superseded(),
                ScanMode::Dedupe => {
                    if !header.is_superseded() {
                        let stale = self.find_key(ItemKey::superseded(header.id))?;
                        // a page being compacted keeps its copies until it is erased
                        if let Some(stale) = stale.filter(|stale| {
                            self.pages[stale.address.page.0].state != ThinPageState::Compacting
                        }) {
                            #[cfg(feature = "defmt")]
                            warn!("dropping superseded copy of {:#06x}", header.id);

                            #[cfg(feature = "debug-logs")]
                            println!("  internal: dropping superseded copy of {:#06x}", header.id);

                            self.tombstone_tolerant(&stale)?;
                        }
                    }
                }
            }
        }

        // too small for another header
        if end - offset < RECORD_HEADER_SIZE as usize {
            lost += end - offset;
            offset = end;
        }

        let entry = &mut self.pages[page.0];
        entry.next_offset = offset as u16;
        entry.lost = lost as u16;

        Ok(Scan::Done { superseded })
    }

    /// First valid record matching `key`, searching active pages in index order.
    pub(crate) fn find_key(&mut self, key: ItemKey) -> Result<Option<Record>, Error> {
        for page in self.active_pages() {
            if let Scan::Found(record) = self.scan_page(page, ScanMode::Lookup(key))? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// The current record of an item, falling back to a superseded one if an update got
    /// interrupted before its replacement was committed.
    pub(crate) fn find(&mut self, id: u16) -> Result<Option<Record>, Error> {
        #[cfg(feature = "defmt")]
        trace!("find: {:#06x}", id);

        if let Some(record) = self.find_key(ItemKey::current(id))? {
            return Ok(Some(record));
        }
        self.find_key(ItemKey::superseded(id))
    }

    /// Appends a record to a page and verifies it by reading it back. Without a payload the data
    /// area is left erased.
    pub(crate) fn append_record(
        &mut self,
        page: PageIndex,
        id: u16,
        len: u16,
        payload: Option<&[u8]>,
    ) -> Result<Record, Error> {
        #[cfg(feature = "defmt")]
        trace!("append_record: page {} id {:#06x} len {}", page.0, id, len);

        #[cfg(feature = "debug-logs")]
        println!("  internal: append_record: page {} id {id:#06x} len {len}", page.0);

        let footprint = record_footprint::<T>(len);
        let offset = self.pages[page.0].next_offset;
        if offset as usize + footprint > self.page_end() as usize {
            return Err(Error::FlashFull);
        }

        let chk = match payload {
            Some(data) => checksum(data),
            None => erased_checksum(len),
        };
        let header = RecordHeader::new(id, len, chk);
        let address = self.flash_offset(page, offset);

        // the space is gone as soon as the first word is programmed
        self.pages[page.0].next_offset += footprint as u16;

        let raw = header.encode();
        write_aligned(&mut self.hal, address, &raw[..RecordField::Chk as usize])?;
        if let Some(data) = payload {
            write_aligned(&mut self.hal, address + RECORD_HEADER_SIZE as u32, data)?;
        }
        write_field(&mut self.hal, address + RecordField::Chk as u32, chk)?;

        let record = Record {
            address: Address { page, offset },
            header,
        };
        if !self.verify_record(&record)? {
            return Err(Error::VerificationFailed);
        }

        Ok(record)
    }

    pub(crate) fn mark_superseded(&mut self, record: &Record) -> Result<(), Error> {
        if record.header.is_superseded() {
            return Ok(());
        }
        let offset = self.flash_offset(record.address.page, record.address.offset);
        write_field(&mut self.hal, offset + RecordField::Stat as u32, WRITTEN)
    }

    pub(crate) fn tombstone(&mut self, record: &Record) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!(
            "tombstone: page {} @{}",
            record.address.page.0, record.address.offset
        );

        let offset = self.flash_offset(record.address.page, record.address.offset);
        write_field(&mut self.hal, offset + RecordField::Id as u32, ZEROED_ID)?;

        let footprint = record.header.footprint::<T>() as u16;
        let page = &mut self.pages[record.address.page.0];
        page.lost = page.lost.saturating_add(footprint);
        Ok(())
    }

    /// Housekeeping tombstones are retried on the next scan if the supply is low.
    fn tombstone_tolerant(&mut self, record: &Record) -> Result<(), Error> {
        match self.tombstone(record) {
            Ok(()) | Err(Error::LowVoltage) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn check_id(id: u16) -> Result<(), Error> {
        if id == ZEROED_ID || id == ERASED {
            return Err(Error::InvalidItemId);
        }
        Ok(())
    }

    pub(crate) fn init_item(
        &mut self,
        id: u16,
        len: u16,
        initial: Option<&[u8]>,
    ) -> Result<ItemInit, Error> {
        #[cfg(feature = "defmt")]
        trace!("init_item: {:#06x} len {}", id, len);

        #[cfg(feature = "debug-logs")]
        println!("internal: init_item: {id:#06x} len {len}");

        Self::check_id(id)?;
        if let Some(data) = initial {
            if data.len() != len as usize {
                return Err(Error::InvalidLength);
            }
        }
        if id == HARDWARE_ID_ITEM {
            return self.init_hardware_id(len, initial);
        }
        if len == 0 || len > self.max_payload() {
            return Err(Error::InvalidLength);
        }

        self.settle_compaction()?;
        if self.find(id)?.is_some() {
            return Ok(ItemInit::AlreadyExists);
        }

        let footprint = record_footprint::<T>(len);
        let end = self.page_end();
        let order = self.placement_order();

        let with_room = order.iter().copied().find(|page| {
            let page = &self.pages[page.0];
            page.state.accepts_items() && page.free(end) as usize >= footprint
        });
        if let Some(page) = with_room {
            self.append_record(page, id, len, initial)?;
            return Ok(ItemInit::Created);
        }

        let reclaimable = order
            .iter()
            .copied()
            .find(|page| {
                let page = &self.pages[page.0];
                page.state.accepts_items()
                    && page.free(end) as usize + page.lost as usize >= footprint
            })
            .ok_or(Error::FlashFull)?;

        let target = self.begin_compaction(reclaimable)?;
        self.append_record(target, id, len, initial)?;
        self.finish_compaction(reclaimable, target)?;

        Ok(ItemInit::Created)
    }

    pub(crate) fn update_item(&mut self, id: u16, index: u16, data: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("update_item: {:#06x}[{}..+{}]", id, index, data.len());

        #[cfg(feature = "debug-logs")]
        println!("internal: update_item: {id:#06x}[{index}..+{}]", data.len());

        Self::check_id(id)?;
        if id == HARDWARE_ID_ITEM {
            return self.write_hardware_id(index, data);
        }

        self.settle_compaction()?;
        let record = self.find(id)?.ok_or(Error::ItemNotFound)?;
        let len = record.header.len as usize;
        let start = index as usize;
        if start + data.len() > len {
            return Err(Error::RangeInvalid);
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut existing = vec![0u8; data.len()];
        self.read_payload(&record, index, &mut existing)?;
        if existing == data {
            #[cfg(feature = "debug-logs")]
            println!("internal: update_item: content unchanged");

            return Ok(());
        }

        let mut payload = vec![0u8; len];
        self.read_payload(&record, 0, &mut payload)?;
        payload[start..start + data.len()].copy_from_slice(data);

        let page = record.address.page;
        let fits = self.pages[page.0].free(self.page_end()) as usize >= record.header.footprint::<T>();
        if !fits && self.reserve.is_none() {
            return Err(Error::FlashFull);
        }

        self.mark_superseded(&record)?;
        if fits {
            self.append_record(page, id, record.header.len, Some(payload.as_slice()))?;
            self.tombstone(&record)?;
        } else {
            // the old copy goes away with its page
            let target = self.begin_compaction(page)?;
            self.append_record(target, id, record.header.len, Some(payload.as_slice()))?;
            self.finish_compaction(page, target)?;
        }

        Ok(())
    }

    pub(crate) fn read_item(&mut self, id: u16, index: u16, buf: &mut [u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("read_item: {:#06x}[{}..+{}]", id, index, buf.len());

        Self::check_id(id)?;
        if id == HARDWARE_ID_ITEM {
            return self.read_hardware_id(index, buf);
        }

        let record = self.find(id)?.ok_or(Error::ItemNotFound)?;
        if index as usize + buf.len() > record.header.len as usize {
            return Err(Error::RangeInvalid);
        }
        self.read_payload(&record, index, buf)
    }

    pub(crate) fn item_length(&mut self, id: u16) -> Result<u16, Error> {
        if id == HARDWARE_ID_ITEM {
            return Ok(crate::HARDWARE_ID_LEN as u16);
        }
        if Self::check_id(id).is_err() {
            return Ok(0);
        }
        Ok(self.find(id)?.map(|record| record.header.len).unwrap_or(0))
    }

    pub(crate) fn delete_item(&mut self, id: u16, len: u16) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("delete_item: {:#06x}", id);

        #[cfg(feature = "debug-logs")]
        println!("internal: delete_item: {id:#06x}");

        Self::check_id(id)?;
        if id == HARDWARE_ID_ITEM {
            return Err(Error::InvalidItemId);
        }

        self.settle_compaction()?;
        let record = self.find(id)?.ok_or(Error::ItemNotFound)?;
        if record.header.len != len {
            return Err(Error::LengthMismatch);
        }
        self.tombstone(&record)?;

        // leftovers of an interrupted update
        while let Some(stale) = self.find(id)? {
            self.tombstone(&stale)?;
        }

        Ok(())
    }
}
