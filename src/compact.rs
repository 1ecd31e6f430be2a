use crate::Nv;
use crate::error::Error;
use crate::internal::{Address, ItemKey, PageIndex, Record, ThinPageState};
use crate::platform::Platform;
use crate::raw::{PAGE_HEADER_SIZE, PageField, RECORD_HEADER_SIZE, erase};
use alloc::vec;
#[cfg(feature = "defmt")]
use defmt::trace;

impl<T> Nv<T>
where
    T: Platform,
{
    /// Flags `source` as being compacted and activates the reserve as its target.
    pub(crate) fn begin_compaction(&mut self, source: PageIndex) -> Result<PageIndex, Error> {
        #[cfg(feature = "defmt")]
        trace!("begin_compaction: page {}", source.0);

        #[cfg(feature = "debug-logs")]
        println!("  compact: begin_compaction: page {}", source.0);

        let target = self.reserve.ok_or(Error::FlashFull)?;

        if self.pages[source.0].state != ThinPageState::Compacting {
            self.write_page_field(source, PageField::Xfer)?;
            self.pages[source.0].state = ThinPageState::Compacting;
        }

        self.write_page_field(target, PageField::Active)?;
        self.reserve = None;
        self.pages[target.0].reset(ThinPageState::Target);

        Ok(target)
    }

    /// Moves every live record from `source` to `target`, erases `source` to become the new
    /// reserve and promotes `target`. Safe to call again on a half finished compaction.
    ///
    /// Apart from `stat` flags the source is left untouched until it gets erased, so it still
    /// holds a copy of everything and the target can be thrown away and refilled.
    pub(crate) fn finish_compaction(
        &mut self,
        source: PageIndex,
        target: PageIndex,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("finish_compaction: page {} -> page {}", source.0, target.0);

        #[cfg(feature = "debug-logs")]
        println!("  compact: finish_compaction: page {} -> page {}", source.0, target.0);

        self.copy_records(source, target)?;
        self.erase_page(source)?;
        self.reserve = Some(source);
        self.restore_hardware_id(source)?;
        self.promote(target)
    }

    pub(crate) fn promote(&mut self, target: PageIndex) -> Result<(), Error> {
        #[cfg(feature = "debug-logs")]
        println!("  compact: promote: page {}", target.0);

        self.write_page_field(target, PageField::InUse)?;
        self.pages[target.0].state = ThinPageState::InUse;
        Ok(())
    }

    fn copy_records(&mut self, source: PageIndex, target: PageIndex) -> Result<(), Error> {
        let end = self.page_end() as usize;
        let mut offset = PAGE_HEADER_SIZE as usize;

        while offset + RECORD_HEADER_SIZE as usize <= end {
            let header = self.read_record_header(source, offset as u16)?;
            if header.is_end() {
                break;
            }

            let footprint = header.footprint::<T>();
            if offset + footprint > end {
                break;
            }

            let record = Record {
                address: Address {
                    page: source,
                    offset: offset as u16,
                },
                header,
            };
            offset += footprint;

            if header.is_tombstone() || !self.verify_record(&record)? {
                continue;
            }

            if header.is_superseded() {
                // either replaced by the update that started this compaction or already copied
                if self.find_key(ItemKey::current(header.id))?.is_some() {
                    continue;
                }
            } else {
                self.mark_superseded(&record)?;
            }

            let mut payload = vec![0u8; header.len as usize];
            self.read_payload(&record, 0, &mut payload)?;
            let content = if payload.iter().all(|&b| b == 0xFF) {
                None
            } else {
                Some(payload.as_slice())
            };
            self.append_record(target, header.id, header.len, content)?;
        }

        Ok(())
    }

    pub(crate) fn erase_page(&mut self, page: PageIndex) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase_page: page {}", page.0);

        #[cfg(feature = "debug-logs")]
        println!("  compact: erase_page: page {}", page.0);

        let from = self.pages[page.0].address as u32;
        erase(&mut self.hal, from, from + self.page_size as u32)?;
        self.pages[page.0].reset(ThinPageState::Reserve);
        Ok(())
    }
}
