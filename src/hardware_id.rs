//! The hardware identifier lives outside the record log. Every page ends with a slot holding a
//! copy of it followed by a checksum, the copy on the last page of the pool being the primary one.
//! Slots are only ever programmed while erased, so the identifier can be written exactly once.

use crate::error::Error;
use crate::internal::{PageIndex, ThinPageState};
use crate::platform::{AlignedOps, Platform};
use crate::raw::{ERASED, checksum, read_bytes, write_aligned, write_field};
use crate::{HARDWARE_ID_LEN, ItemInit, Nv};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

const SLOT_CONTENT_SIZE: usize = HARDWARE_ID_LEN + 2;

/// Bytes reserved at the end of every page.
pub(crate) fn slot_size<T: Platform>() -> usize {
    T::align_write_ceil(SLOT_CONTENT_SIZE)
}

enum Slot {
    Erased,
    Valid([u8; HARDWARE_ID_LEN]),
    /// Programming got interrupted. The slot stays unusable until its page is erased.
    Torn,
}

impl<T> Nv<T>
where
    T: Platform,
{
    fn primary_slot_page(&self) -> PageIndex {
        PageIndex(self.pages.len() - 1)
    }

    fn read_slot(&mut self, page: PageIndex) -> Result<Slot, Error> {
        let mut raw = [0u8; SLOT_CONTENT_SIZE];
        let offset = self.flash_offset(page, self.page_end());
        read_bytes(&mut self.hal, offset, &mut raw)?;

        if raw.iter().all(|&b| b == 0xFF) {
            return Ok(Slot::Erased);
        }

        let mut id = [0u8; HARDWARE_ID_LEN];
        id.copy_from_slice(&raw[..HARDWARE_ID_LEN]);
        let chk = u16::from_le_bytes([raw[HARDWARE_ID_LEN], raw[HARDWARE_ID_LEN + 1]]);
        if chk != ERASED && chk == checksum(&id) {
            Ok(Slot::Valid(id))
        } else {
            Ok(Slot::Torn)
        }
    }

    fn write_slot(&mut self, page: PageIndex, id: &[u8; HARDWARE_ID_LEN]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_slot: page {}", page.0);

        let offset = self.flash_offset(page, self.page_end());
        write_aligned(&mut self.hal, offset, id)?;
        write_field(&mut self.hal, offset + HARDWARE_ID_LEN as u32, checksum(id))
    }

    /// Copies the identifier into the slot of `page` if that slot is still erased.
    fn propagate_to(&mut self, page: PageIndex, id: &[u8; HARDWARE_ID_LEN]) -> Result<(), Error> {
        if self.pages[page.0].state == ThinPageState::Corrupt {
            return Ok(());
        }
        if !matches!(self.read_slot(page)?, Slot::Erased) {
            return Ok(());
        }

        match self.write_slot(page, id) {
            Ok(()) => Ok(()),
            Err(Error::LowVoltage) => {
                #[cfg(feature = "defmt")]
                warn!("hardware id copy to page {} skipped", page.0);

                #[cfg(feature = "debug-logs")]
                println!("  hardware_id: copy to page {} skipped", page.0);

                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Picks up the identifier from flash, restoring the primary copy from any other page and
    /// filling every erased slot.
    pub(crate) fn load_hardware_id(&mut self) -> Result<(), Error> {
        let primary = self.primary_slot_page();
        let mut found = match self.read_slot(primary)? {
            Slot::Valid(id) => Some(id),
            _ => None,
        };

        if found.is_none() {
            for index in 0..self.pages.len() {
                if let Slot::Valid(id) = self.read_slot(PageIndex(index))? {
                    found = Some(id);
                    break;
                }
            }
        }

        self.hardware_id = found;

        if let Some(id) = found {
            for index in (0..self.pages.len()).rev() {
                self.propagate_to(PageIndex(index), &id)?;
            }
        }

        Ok(())
    }

    /// Called after a page got erased.
    pub(crate) fn restore_hardware_id(&mut self, page: PageIndex) -> Result<(), Error> {
        if let Some(id) = self.hardware_id {
            self.propagate_to(page, &id)?;
        }
        Ok(())
    }

    fn hardware_id_written(&mut self) -> Result<bool, Error> {
        if self.hardware_id.is_some() {
            return Ok(true);
        }
        let primary = self.primary_slot_page();
        Ok(!matches!(self.read_slot(primary)?, Slot::Erased))
    }

    pub(crate) fn init_hardware_id(
        &mut self,
        len: u16,
        initial: Option<&[u8]>,
    ) -> Result<ItemInit, Error> {
        if len as usize != HARDWARE_ID_LEN {
            return Err(Error::InvalidLength);
        }
        if self.hardware_id_written()? {
            return Ok(ItemInit::AlreadyExists);
        }
        if let Some(data) = initial {
            self.write_hardware_id(0, data)?;
        }
        Ok(ItemInit::Created)
    }

    pub(crate) fn write_hardware_id(&mut self, index: u16, data: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("write_hardware_id");

        #[cfg(feature = "debug-logs")]
        println!("  hardware_id: write");

        if index as usize + data.len() > HARDWARE_ID_LEN {
            return Err(Error::RangeInvalid);
        }
        if data.is_empty() {
            return Ok(());
        }
        // written as a whole or not at all
        if index != 0 || data.len() != HARDWARE_ID_LEN {
            return Err(Error::RangeInvalid);
        }
        if self.hardware_id_written()? {
            return Err(Error::AlreadyWritten);
        }

        let mut id = [0u8; HARDWARE_ID_LEN];
        id.copy_from_slice(data);

        let primary = self.primary_slot_page();
        self.write_slot(primary, &id)?;
        match self.read_slot(primary)? {
            Slot::Valid(stored) if stored == id => {}
            _ => return Err(Error::VerificationFailed),
        }
        self.hardware_id = Some(id);

        for index in 0..primary.0 {
            self.propagate_to(PageIndex(index), &id)?;
        }

        Ok(())
    }

    /// An identifier that was never written reads as all `0xFF`.
    pub(crate) fn read_hardware_id(&mut self, index: u16, buf: &mut [u8]) -> Result<(), Error> {
        let start = index as usize;
        if start + buf.len() > HARDWARE_ID_LEN {
            return Err(Error::RangeInvalid);
        }
        let id = self.hardware_id.unwrap_or([0xFF; HARDWARE_ID_LEN]);
        buf.copy_from_slice(&id[start..start + buf.len()]);
        Ok(())
    }
}
