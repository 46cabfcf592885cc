use crate::frame_alloc::FrameError;
use crate::heap::HeapError;
use kernel_vmem::MapError;
use thiserror::Error;

/// Errors surfaced by the memory core to its callers.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum MemoryError {
    /// Misaligned, zero or out-of-range address or size.
    #[error("invalid argument")]
    InvalidArg,
    /// No frame, no heap block, and growth failed.
    #[error("out of memory")]
    OutOfMemory,
    #[error("already mapped")]
    AlreadyMapped,
    #[error("not mapped")]
    NotMapped,
    /// E.g. a huge-page request misaligned to huge-page granularity.
    #[error("unsupported request")]
    Unsupported,
    /// Heap metadata failed validation.
    #[error("heap corruption")]
    Corruption,
}

impl From<FrameError> for MemoryError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::InvalidArg => Self::InvalidArg,
            FrameError::OutOfMemory | FrameError::TooManyReferences => Self::OutOfMemory,
        }
    }
}

impl From<MapError> for MemoryError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::InvalidArg => Self::InvalidArg,
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::AlreadyMapped => Self::AlreadyMapped,
            MapError::NotMapped => Self::NotMapped,
            MapError::Unsupported => Self::Unsupported,
        }
    }
}

impl From<HeapError> for MemoryError {
    fn from(e: HeapError) -> Self {
        match e {
            HeapError::InvalidArg => Self::InvalidArg,
            HeapError::OutOfMemory => Self::OutOfMemory,
            HeapError::Corrupted { .. } => Self::Corruption,
        }
    }
}
