use thiserror::Error;

/// Failure of a page-table operation.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum MapError {
    /// Misaligned or non-canonical address.
    #[error("misaligned or non-canonical address")]
    InvalidArg,
    /// No frame for a missing table level or a new root.
    #[error("out of memory for page tables")]
    OutOfMemory,
    /// The leaf (or a huge leaf on the walk) is already in use.
    #[error("address already mapped")]
    AlreadyMapped,
    #[error("address not mapped")]
    NotMapped,
    /// E.g. a huge mapping not aligned to 2 MiB.
    #[error("unsupported mapping request")]
    Unsupported,
}
