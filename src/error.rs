//! Crate-wide error type for ChronoFS

use thiserror::Error;

use crate::alloc::AllocError;
use crate::blockdev::BlockDeviceError;
use crate::format::FormatError;
use crate::journal::JournalError;
use crate::layout::LayoutError;
use crate::snapshot::SnapshotError;

/// Top-level error type
#[derive(Error, Debug)]
pub enum Error {
    /// Block device failure
    #[error("Block device error: {0}")]
    Io(#[from] BlockDeviceError),
    /// On-disk format failure
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    /// Layout computation failure
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),
    /// Allocator failure
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
    /// Journal failure
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
    /// Snapshot engine failure
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    /// The volume is read-only (journal aborted or opened read-only)
    #[error("Volume is read-only")]
    ReadOnly,
    /// Snapshot metadata outgrew its reserved area
    #[error("Snapshot metadata too large: {0} bytes")]
    MetadataOverflow(usize),
    /// Metadata (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;
