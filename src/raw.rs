use crate::error::Error;
use crate::internal::ThinPageState;
use crate::platform::{AlignedOps, Platform};
use alloc::vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

pub(crate) const PAGE_HEADER_SIZE: u16 = 8;
pub(crate) const RECORD_HEADER_SIZE: u16 = 8;

pub(crate) const MIN_PAGE_SIZE: usize = 64;
pub(crate) const MAX_PAGE_SIZE: usize = 0x8000;
pub(crate) const MAX_WRITE_SIZE: usize = 8;

/// Value of every 16-bit field after an erase.
pub(crate) const ERASED: u16 = 0xFFFF;
/// Value a header field is programmed to when it gets set.
pub(crate) const WRITTEN: u16 = 0x0000;
/// A record whose id has been programmed to zero is a tombstone.
pub(crate) const ZEROED_ID: u16 = 0x0000;

/// Byte offsets of the fields of the 8 byte page header.
#[derive(strum::Display, Debug, PartialEq, Copy, Clone)]
#[repr(u16)]
pub(crate) enum PageField {
    Active = 0,
    InUse = 2,
    Xfer = 4,
    #[allow(dead_code)]
    Spare = 6,
}

/// Byte offsets of the fields of the 8 byte record header.
#[derive(strum::Display, Debug, PartialEq, Copy, Clone)]
#[repr(u16)]
pub(crate) enum RecordField {
    Id = 0,
    #[allow(dead_code)]
    Len = 2,
    Chk = 4,
    Stat = 6,
}

/// On-flash page state, derived from which header fields have been programmed.
#[derive(strum::Display, Debug, PartialEq, Copy, Clone)]
pub(crate) enum PageState {
    // `active` erased: empty page, held back as compaction target.
    Erased,

    // `active` written, `in_use` erased: target of a running or just finished compaction.
    ActiveNotInUse,

    // `active` and `in_use` written: regular page holding records.
    InUse,

    // like `InUse` plus `xfer` written: its records are being moved to the target.
    InUseCompacting,
}

impl From<PageState> for ThinPageState {
    fn from(val: PageState) -> Self {
        match val {
            PageState::Erased => ThinPageState::Reserve,
            PageState::ActiveNotInUse => ThinPageState::Target,
            PageState::InUse => ThinPageState::InUse,
            PageState::InUseCompacting => ThinPageState::Compacting,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub(crate) struct PageHeader {
    pub(crate) active: u16,
    pub(crate) in_use: u16,
    pub(crate) xfer: u16,
    pub(crate) spare: u16,
}

impl PageHeader {
    pub(crate) fn decode(raw: &[u8; PAGE_HEADER_SIZE as usize]) -> Self {
        Self {
            active: u16::from_le_bytes([raw[0], raw[1]]),
            in_use: u16::from_le_bytes([raw[2], raw[3]]),
            xfer: u16::from_le_bytes([raw[4], raw[5]]),
            spare: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub(crate) fn state(&self) -> PageState {
        if self.active == ERASED {
            PageState::Erased
        } else if self.in_use == ERASED {
            PageState::ActiveNotInUse
        } else if self.xfer != ERASED {
            PageState::InUseCompacting
        } else {
            PageState::InUse
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct RecordHeader {
    pub(crate) id: u16,
    pub(crate) len: u16,
    pub(crate) chk: u16,
    pub(crate) stat: u16,
}

impl RecordHeader {
    pub(crate) fn new(id: u16, len: u16, chk: u16) -> Self {
        Self {
            id,
            len,
            chk,
            stat: ERASED,
        }
    }

    pub(crate) fn encode(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut raw = [0u8; RECORD_HEADER_SIZE as usize];
        raw[0..2].copy_from_slice(&self.id.to_le_bytes());
        raw[2..4].copy_from_slice(&self.len.to_le_bytes());
        raw[4..6].copy_from_slice(&self.chk.to_le_bytes());
        raw[6..8].copy_from_slice(&self.stat.to_le_bytes());
        raw
    }

    pub(crate) fn decode(raw: &[u8; RECORD_HEADER_SIZE as usize]) -> Self {
        Self {
            id: u16::from_le_bytes([raw[0], raw[1]]),
            len: u16::from_le_bytes([raw[2], raw[3]]),
            chk: u16::from_le_bytes([raw[4], raw[5]]),
            stat: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// An erased id marks the end of the written log.
    pub(crate) fn is_end(&self) -> bool {
        self.id == ERASED
    }

    pub(crate) fn is_tombstone(&self) -> bool {
        self.id == ZEROED_ID
    }

    /// Set once a newer copy of the item is (being) written elsewhere.
    pub(crate) fn is_superseded(&self) -> bool {
        self.stat != ERASED
    }

    pub(crate) fn footprint<T: Platform>(&self) -> usize {
        record_footprint::<T>(self.len)
    }
}

/// Header plus payload, padded to the write size.
pub(crate) fn record_footprint<T: Platform>(len: u16) -> usize {
    RECORD_HEADER_SIZE as usize + T::align_write_ceil(len as usize)
}

/// Additive checksum over all payload bytes. `0xFFFF` is folded to zero so that a committed
/// checksum can never be mistaken for an unwritten field.
pub(crate) fn checksum(payload: &[u8]) -> u16 {
    let mut acc = Checksum::new();
    acc.update(payload);
    acc.value()
}

/// Checksum of a payload that was never written.
pub(crate) fn erased_checksum(len: u16) -> u16 {
    fold(len.wrapping_mul(0xFF))
}

fn fold(sum: u16) -> u16 {
    if sum == ERASED { 0 } else { sum }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub(crate) enum FlashChecksum {
    /// Every byte read was `0xFF`.
    Erased,
    Sum(u16),
}

impl FlashChecksum {
    pub(crate) fn matches(&self, stored: u16, len: u16) -> bool {
        let expected = match self {
            FlashChecksum::Erased => erased_checksum(len),
            FlashChecksum::Sum(sum) => *sum,
        };
        stored != ERASED && stored == expected
    }
}

struct Checksum {
    sum: u16,
    erased: bool,
}

impl Checksum {
    fn new() -> Self {
        Self {
            sum: 0,
            erased: true,
        }
    }

    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.sum = self.sum.wrapping_add(byte as u16);
            self.erased &= byte == 0xFF;
        }
    }

    fn value(&self) -> u16 {
        fold(self.sum)
    }

    fn finish(self) -> FlashChecksum {
        if self.erased {
            FlashChecksum::Erased
        } else {
            FlashChecksum::Sum(self.value())
        }
    }
}

/// Sums `len` bytes straight from flash. Never fails on torn data, the caller decides what a
/// mismatch means.
pub(crate) fn checksum_from_flash<T: Platform>(
    hal: &mut T,
    offset: u32,
    len: u16,
) -> Result<FlashChecksum, Error> {
    let mut acc = Checksum::new();
    let mut chunk = [0u8; 64];
    let mut done = 0usize;
    while done < len as usize {
        let n = chunk.len().min(len as usize - done);
        read_bytes(hal, offset + done as u32, &mut chunk[..n])?;
        acc.update(&chunk[..n]);
        done += n;
    }
    Ok(acc.finish())
}

/// Reads an arbitrary byte range, widening the access to the read alignment of the flash.
pub(crate) fn read_bytes<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), Error> {
    if bytes.is_empty() {
        return Ok(());
    }

    let start = T::align_read_floor(offset as usize);
    let end = T::align_read_ceil(offset as usize + bytes.len());
    if start == offset as usize && end == offset as usize + bytes.len() {
        return hal.read(offset, bytes).map_err(|_| Error::FlashError);
    }

    let mut buf = vec![0u8; end - start];
    hal.read(start as u32, &mut buf)
        .map_err(|_| Error::FlashError)?;
    let skip = offset as usize - start;
    bytes.copy_from_slice(&buf[skip..skip + bytes.len()]);
    Ok(())
}

fn ensure_supply<T: Platform>(hal: &mut T) -> Result<(), Error> {
    if hal.supply_ok() {
        Ok(())
    } else {
        #[cfg(feature = "defmt")]
        warn!("supply voltage low, flash mutation skipped");

        #[cfg(feature = "debug-logs")]
        println!("  raw: supply voltage low, flash mutation skipped");

        Err(Error::LowVoltage)
    }
}

#[inline(always)]
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.is_empty() {
        return Ok(());
    }

    ensure_supply(hal)?;

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        hal.write(offset, bytes).map_err(|_| Error::FlashError)
    } else {
        let pivot = T::align_write_floor(bytes.len());
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(offset, header).map_err(|_| Error::FlashError)?;
        }

        // no need to write the trailer if remaining data is all ones - this the default state of the flash
        if trailer.iter().any(|&e| e != 0xFF) {
            let mut buf = vec![0xFFu8; T::WRITE_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf)
                .map_err(|_| Error::FlashError)?;
        }

        Ok(())
    }
}

/// Programs a single 16-bit field. The surrounding bytes of the write unit are sent as `0xFF` and
/// therefore keep their current content.
pub(crate) fn write_field<T: Platform>(hal: &mut T, offset: u32, value: u16) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("write_field @{:#08x}: {:#06x}", offset, value);

    let start = T::align_write_floor(offset as usize);
    let end = T::align_write_ceil(offset as usize + 2);
    let mut buf = vec![0xFFu8; end - start];
    let at = offset as usize - start;
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());

    ensure_supply(hal)?;
    hal.write(start as u32, &buf)
        .map_err(|_| Error::FlashError)
}

pub(crate) fn erase<T: Platform>(hal: &mut T, from: u32, to: u32) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("erase {:#08x}..{:#08x}", from, to);

    ensure_supply(hal)?;
    hal.erase(from, to).map_err(|_| Error::FlashError)
}
