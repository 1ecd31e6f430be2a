use thiserror::Error;

/// Errors that can occur during storage operations. Marked as non-exhaustive to allow for future
/// additions without breaking the API. A caller would usually only need to handle `ItemNotFound`,
/// `RangeInvalid` and `FlashFull`; everything else means the operation failed and the engine
/// already resynchronised its in-memory state with the flash.
#[derive(Error, Debug, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the erase size of the flash
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition size has to be a multiple of the erase size and hold at least two pages
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// The erase or write size of the flash is not supported by the page layout
    #[error("unsupported flash geometry")]
    UnsupportedGeometry,

    /// The internal error value is returned from the provided `NorFlash`
    #[error("internal flash error")]
    FlashError,

    /// The supply monitor reported an unhealthy voltage and a flash mutation was skipped.
    #[error("supply voltage too low")]
    LowVoltage,

    /// The item has not been initialized (or was lost to corruption and silently cleaned up).
    #[error("item not found")]
    ItemNotFound,

    /// `0x0000` and `0xFFFF` are reserved by the on-flash format.
    #[error("invalid item id")]
    InvalidItemId,

    /// Items must be at least one byte and fit into a single page.
    #[error("invalid item length")]
    InvalidLength,

    /// The stored item has a different length than requested.
    #[error("item length mismatch")]
    LengthMismatch,

    /// `index + len` exceeds the stored item length.
    #[error("range exceeds item length")]
    RangeInvalid,

    /// Flash is full and compaction doesn't help.
    #[error("flash full")]
    FlashFull,

    /// A freshly written record did not read back with a matching checksum.
    #[error("write verification failed")]
    VerificationFailed,

    /// The hardware identifier is write-once.
    #[error("hardware identifier already written")]
    AlreadyWritten,
}

impl Error {
    /// Failures after which flash may be ahead of the page table.
    pub(crate) fn requires_rescan(&self) -> bool {
        matches!(
            self,
            Error::FlashError | Error::LowVoltage | Error::VerificationFailed | Error::FlashFull
        )
    }
}
