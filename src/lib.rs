#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

mod compact;
pub mod error;
mod get;
mod hardware_id;
mod internal;
pub mod platform;
mod raw;
mod recovery;
mod set;

pub use get::Get;
pub use set::Set;

extern crate alloc;

use crate::error::Error;
use crate::internal::{PageIndex, ThinPage, ThinPageState};
use crate::platform::Platform;
use crate::raw::{MAX_PAGE_SIZE, MAX_WRITE_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_SIZE};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::warn;

/// Item id under which the hardware identifier can be read and (once) written.
pub const HARDWARE_ID_ITEM: u16 = 0x0001;

/// The hardware identifier always has this length.
pub const HARDWARE_ID_LEN: usize = 8;

/// Outcome of a successful [`Nv::item_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ItemInit {
    Created,
    /// The item was present already and has not been touched.
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NvStatistics {
    pub pages: PageStatistics,
    pub bytes_per_page: Vec<ByteStatistics>,
    pub bytes_overall: ByteStatistics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageStatistics {
    pub reserve: u16,
    pub in_use: u16,
    pub compacting: u16,
    pub target: u16,
    pub corrupted: u16,
}

/// Byte counts of the record log area of a page. Page headers and the hardware id slots are not
/// included.
#[derive(Debug, Clone, PartialEq)]
pub struct ByteStatistics {
    /// Held by valid records.
    pub live: u32,
    /// Held by tombstones and corrupt records, reclaimed by compaction.
    pub lost: u32,
    pub free: u32,
}

/// The Nv struct keeps a small table of all pages in memory. Increases in size with the number of
/// pages in the partition.
pub struct Nv<T: Platform> {
    pub(crate) hal: T,
    pub(crate) page_size: usize,

    // set after calling self.load_pages
    pub(crate) pages: Vec<ThinPage>,
    pub(crate) reserve: Option<PageIndex>,
    pub(crate) hardware_id: Option<[u8; HARDWARE_ID_LEN]>,
}

impl<T: Platform> Nv<T> {
    /// Reads all pages of the given partition to
    /// 1. Redo erases that were cut short
    /// 2. Build the in-memory page table
    /// 3. Drop superseded copies left behind by interrupted updates
    /// 4. Finish an interrupted compaction
    /// 5. Load and replicate the hardware identifier
    ///
    /// An erased partition is formatted on the fly. Records with a broken checksum are dropped.
    pub fn new(partition_offset: usize, partition_size: usize, hal: T) -> Result<Nv<T>, Error> {
        let page_size = T::ERASE_SIZE;
        if !page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
            || !T::WRITE_SIZE.is_power_of_two()
            || T::WRITE_SIZE > MAX_WRITE_SIZE
            || T::READ_SIZE > page_size
        {
            return Err(Error::UnsupportedGeometry);
        }

        if !partition_offset.is_multiple_of(page_size) {
            return Err(Error::InvalidPartitionOffset);
        }

        if !partition_size.is_multiple_of(page_size) {
            return Err(Error::InvalidPartitionSize);
        }

        let page_count = partition_size / page_size;
        if page_count < 2 || page_count > u16::MAX as usize {
            return Err(Error::InvalidPartitionSize);
        }

        let pages = (0..page_count)
            .map(|index| ThinPage::new(partition_offset + index * page_size, ThinPageState::Reserve))
            .collect();

        let mut nv: Nv<T> = Self {
            hal,
            page_size,
            pages,
            reserve: None,
            hardware_id: None,
        };

        nv.load_pages()?;

        Ok(nv)
    }

    /// Re-reads the partition and repairs whatever an earlier interruption left behind. Runs
    /// automatically after a failed mutation, calling it again is harmless.
    pub fn init(&mut self) -> Result<(), Error> {
        self.load_pages()
    }

    /// Creates an item of `len` bytes. Without `initial` content the payload stays erased and
    /// reads as `0xFF` until written.
    ///
    /// An existing item is left as is, regardless of its length.
    pub fn item_init(
        &mut self,
        id: u16,
        len: u16,
        initial: Option<&[u8]>,
    ) -> Result<ItemInit, Error> {
        self.recover_on_failure(|nv| nv.init_item(id, len, initial))
    }

    /// Reads `buf.len()` bytes of an item, starting at `index`.
    pub fn read(&mut self, id: u16, index: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.recover_on_failure(|nv| nv.read_item(id, index, buf))
    }

    /// Overwrites `data.len()` bytes of an item, starting at `index`. The item has to exist.
    ///
    /// Nothing is written if the stored bytes already match. Otherwise a new copy of the whole
    /// item is written and the old one dropped, so a power loss at any point leaves either the old
    /// or the new content.
    pub fn write(&mut self, id: u16, index: u16, data: &[u8]) -> Result<(), Error> {
        self.recover_on_failure(|nv| nv.update_item(id, index, data))
    }

    /// Length of an item or `0` if it does not exist.
    pub fn item_len(&mut self, id: u16) -> Result<u16, Error> {
        self.recover_on_failure(|nv| nv.item_length(id))
    }

    /// Deletes an item, if `len` matches its stored length. The hardware identifier can't be
    /// deleted.
    pub fn delete(&mut self, id: u16, len: u16) -> Result<(), Error> {
        self.recover_on_failure(|nv| nv.delete_item(id, len))
    }

    /// Get a whole item.
    ///
    /// Supported types are bool, signed and unsigned integers up to 64-bit width (little endian)
    /// and `Vec<u8>`. The stored length has to match the size of the type.
    pub fn get<R>(&mut self, id: u16) -> Result<R, Error>
    where
        Nv<T>: Get<R>,
    {
        self.recover_on_failure(|nv| Get::get(nv, id))
    }

    /// Set a whole item, creating it if necessary.
    ///
    /// Type support is the same as for [`Nv::get`], plus `&[u8]`. An existing item keeps its
    /// length, writing a value of a different size fails with `LengthMismatch`.
    pub fn set<R>(&mut self, id: u16, value: R) -> Result<(), Error>
    where
        Nv<T>: Set<R>,
    {
        self.recover_on_failure(|nv| Set::set(nv, id, value))
    }

    /// Largest item that fits into a page.
    pub fn max_item_len(&self) -> u16 {
        self.max_payload()
    }

    /// The page table is rebuilt from flash after failures that may leave it out of sync. The
    /// original error is returned in any case.
    fn recover_on_failure<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let result = op(self);
        if let Err(e) = &result {
            if e.requires_rescan() {
                if let Err(_rescan) = self.load_pages() {
                    #[cfg(feature = "defmt")]
                    warn!("rescan after {} failed: {}", e, _rescan);

                    #[cfg(feature = "debug-logs")]
                    println!("lib: rescan after {e:?} failed: {_rescan:?}");
                }
            }
        }
        result
    }

    /// Returns detailed statistics about the partition usage
    pub fn statistics(&self) -> NvStatistics {
        let mut page_stats = PageStatistics {
            reserve: 0,
            in_use: 0,
            compacting: 0,
            target: 0,
            corrupted: 0,
        };

        let end = self.page_end();
        let log_size = (end - PAGE_HEADER_SIZE) as u32;

        let bytes_per_page = self
            .pages
            .iter()
            .map(|page| {
                match page.state {
                    ThinPageState::Reserve => page_stats.reserve += 1,
                    ThinPageState::InUse => page_stats.in_use += 1,
                    ThinPageState::Compacting => page_stats.compacting += 1,
                    ThinPageState::Target => page_stats.target += 1,
                    ThinPageState::Corrupt => page_stats.corrupted += 1,
                }

                match page.state {
                    ThinPageState::Corrupt => ByteStatistics {
                        live: 0,
                        lost: log_size,
                        free: 0,
                    },
                    ThinPageState::Reserve => ByteStatistics {
                        live: 0,
                        lost: 0,
                        free: log_size,
                    },
                    _ => ByteStatistics {
                        live: page.live() as u32,
                        lost: page.lost as u32,
                        free: page.free(end) as u32,
                    },
                }
            })
            .collect::<Vec<_>>();

        let bytes_overall = bytes_per_page.iter().fold(
            ByteStatistics {
                live: 0,
                lost: 0,
                free: 0,
            },
            |acc, x| ByteStatistics {
                live: acc.live + x.live,
                lost: acc.lost + x.lost,
                free: acc.free + x.free,
            },
        );

        NvStatistics {
            pages: page_stats,
            bytes_per_page,
            bytes_overall,
        }
    }
}
