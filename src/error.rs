use crate::diag::Diagnostic;
use crate::types::{DirId, SectorId};
use thiserror::Error;

/// Fatal failure modes of the compound file engine.
///
/// Recoverable conditions never surface here; they go to the
/// [`DiagnosticSink`](crate::diag::DiagnosticSink) instead, unless the
/// installed sink escalates them (then they arrive as [`Escalated`]).
///
/// [`Escalated`]: CompoundError::Escalated
#[derive(Debug, Error)]
pub enum CompoundError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("invalid magic number in header")]
    InvalidMagic,

    #[error("compound document is not little-endian")]
    InvalidBom,

    #[error("master FAT error: {0}")]
    MasterFat(String),

    #[error("normal FAT error: {0}")]
    NormalFat(String),

    #[error("mini FAT error: {0}")]
    MiniFat(String),

    #[error("FAT chain entry {0} exceeds the sector count")]
    LargeNormalFat(SectorId),

    #[error("mini FAT chain entry {0} exceeds the mini sector count")]
    LargeMiniFat(SectorId),

    #[error("no mini FAT in compound document")]
    NoMiniFat,

    #[error("cyclic master FAT chain found at sector {0}")]
    MasterLoop(SectorId),

    #[error("cyclic FAT chain found starting at sector {0}")]
    NormalLoop(SectorId),

    #[error("loop detected in directory hierarchy at entry {0}")]
    DirLoop(DirId),

    #[error("invalid directory entry: {0}")]
    DirEntry(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a stream: {0}")]
    NotStream(String),

    #[error("not a storage: {0}")]
    NotStorage(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("container is read-only")]
    ReadOnly,

    #[error("container is closed")]
    Closed,

    #[error("diagnostic escalated to an error: {0}")]
    Escalated(Diagnostic),
}

/// Result alias using [`CompoundError`].
pub type Result<T> = std::result::Result<T, CompoundError>;

impl From<CompoundError> for std::io::Error {
    fn from(err: CompoundError) -> Self {
        match err {
            CompoundError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
