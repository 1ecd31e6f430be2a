#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use flash_nv::platform::SupplyMonitor;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

pub const PAGE_SIZE: usize = 2048;
pub const WORD_SIZE: usize = 4;
pub const PAGE_HEADER_SIZE: usize = 8;
pub const RECORD_HEADER_SIZE: usize = 8;
// 8 byte id + 2 byte checksum, padded to the word size
pub const HARDWARE_ID_SLOT_SIZE: usize = 12;
pub const PAGE_END: usize = PAGE_SIZE - HARDWARE_ID_SLOT_SIZE;
pub const LOG_SIZE: u32 = (PAGE_END - PAGE_HEADER_SIZE) as u32;

#[derive(Default, Clone)]
pub struct Flash {
    pub buf: Vec<u8>,
    /// Every operation from this index on fails, as if power was cut.
    pub fail_after_operation: usize,
    /// The failing erase or multi-word write is applied halfway.
    pub tear_on_fault: bool,
    /// From this operation index on, the supply is reported as too low.
    pub brownout_after_operation: usize,
    /// Ends a brown-out while the flash is lent to the engine.
    pub supply_restored: Rc<Cell<bool>>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

/// A record as found on flash, independent of the engine's view.
#[derive(Debug, PartialEq, Clone)]
pub struct RawRecord {
    pub page: usize,
    pub offset: usize,
    pub id: u16,
    pub len: u16,
    pub superseded: bool,
    pub valid: bool,
    pub payload: Vec<u8>,
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; PAGE_SIZE * pages],
            fail_after_operation: usize::MAX,
            brownout_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::new(pages)
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn pages(&self) -> usize {
        self.buf.len() / PAGE_SIZE
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.brownout_after_operation = usize::MAX;
        self.tear_on_fault = false;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    /// Writes and erases.
    pub fn mutations(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| !matches!(op, Operation::Read { .. }))
            .count()
    }

    pub fn erased_pages(&self) -> BTreeSet<usize> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Erase { offset, .. } => Some(*offset as usize / PAGE_SIZE),
                _ => None,
            })
            .collect()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    /// `active`, `in_use`, `xfer` and `spare` of a page.
    pub fn page_header(&self, page: usize) -> [u16; 4] {
        let base = page * PAGE_SIZE;
        [
            self.u16_at(base),
            self.u16_at(base + 2),
            self.u16_at(base + 4),
            self.u16_at(base + 6),
        ]
    }

    pub fn hardware_id_slot(&self, page: usize) -> &[u8] {
        let base = page * PAGE_SIZE + PAGE_END;
        &self.buf[base..base + 8]
    }

    pub fn is_page_erased(&self, page: usize) -> bool {
        let base = page * PAGE_SIZE;
        self.buf[base..base + PAGE_END].iter().all(|&b| b == 0xFF)
    }

    pub fn records(&self) -> Vec<RawRecord> {
        let mut records = vec![];
        for page in 0..self.pages() {
            let base = page * PAGE_SIZE;
            if self.u16_at(base) == 0xFFFF {
                continue;
            }

            let mut offset = PAGE_HEADER_SIZE;
            while offset + RECORD_HEADER_SIZE <= PAGE_END {
                let id = self.u16_at(base + offset);
                if id == 0xFFFF {
                    break;
                }
                let len = self.u16_at(base + offset + 2);
                let chk = self.u16_at(base + offset + 4);
                let stat = self.u16_at(base + offset + 6);
                let footprint = RECORD_HEADER_SIZE + (len as usize).div_ceil(WORD_SIZE) * WORD_SIZE;
                if offset + footprint > PAGE_END {
                    break;
                }

                let start = base + offset + RECORD_HEADER_SIZE;
                let payload = self.buf[start..start + len as usize].to_vec();
                records.push(RawRecord {
                    page,
                    offset,
                    id,
                    len,
                    superseded: stat != 0xFFFF,
                    valid: len > 0 && chk != 0xFFFF && chk == checksum(&payload),
                    payload,
                });
                offset += footprint;
            }
        }
        records
    }

    /// Valid, not tombstoned records of an item.
    pub fn live_records(&self, id: u16) -> Vec<RawRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.id == id && record.valid)
            .collect()
    }

    fn faulted(&self) -> bool {
        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return true;
        }
        false
    }
}

pub fn checksum(payload: &[u8]) -> u16 {
    let sum = payload
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    if sum == 0xFFFF { 0 } else { sum }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl SupplyMonitor for Flash {
    fn supply_ok(&mut self) -> bool {
        self.supply_restored.get() || self.operations.len() < self.brownout_after_operation
    }
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));

        println!(
            "    flash: read:  0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );

        if self.faulted() {
            if self.tear_on_fault {
                let half = from + (to - from) / 2;
                for addr in from..half {
                    self.buf[addr as usize] = 0xff;
                }
            }
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );

        let applied = if self.faulted() {
            if !self.tear_on_fault {
                return Err(FlashError);
            }
            // single words are programmed atomically
            bytes.len() / WORD_SIZE / 2 * WORD_SIZE
        } else {
            self.operations.push(Operation::Write {
                offset,
                len: bytes.len(),
            });
            bytes.len()
        };

        let offset = offset as usize;
        for (i, &val) in bytes[..applied].iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }

        if applied < bytes.len() {
            return Err(FlashError);
        }
        Ok(())
    }
}
