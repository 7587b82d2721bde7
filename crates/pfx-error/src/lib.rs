#![forbid(unsafe_code)]
//! Unified error type for PlusFix.
//!
//! The variants form the closed error-code set the collaborator contracts
//! speak: `NotFound`/`DuplicateRecord`/`TreeFull`/`Io` from the B-tree
//! primitives, `DiskFull` from the allocator, `Format` from the record
//! codec, `Internal` for violated engine preconditions, and `Cancelled`
//! for a user abort observed at a phase boundary.

use pfx_types::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum PfxError {
    /// Device read/write failure. Fatal to the enclosing repair phase.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Access past the end of the device.
    #[error("device access out of range: offset {offset}, len {len}, device holds {device_len}")]
    OutOfRange {
        offset: u64,
        len: u64,
        device_len: u64,
    },

    /// The allocator could not find a contiguous free run.
    #[error("volume is full")]
    DiskFull,

    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// An insert collided with an existing key.
    #[error("duplicate record")]
    DuplicateRecord,

    /// The tree file has no free nodes left.
    #[error("b-tree is full")]
    TreeFull,

    /// An on-disk structure failed shape validation.
    #[error("malformed structure: {0}")]
    Format(String),

    /// A precondition the engine itself should have guaranteed was violated.
    /// Fatal to the containing pass.
    #[error("internal consistency error: {0}")]
    Internal(String),

    /// The user requested an abort; partial repairs committed so far stay valid.
    #[error("repair interrupted by user")]
    Cancelled,
}

impl From<ParseError> for PfxError {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Structural equality. `std::io::Error` is not `PartialEq`, so `Io`
/// variants are compared by their `ErrorKind`.
impl PartialEq for PfxError {
    fn eq(&self, other: &Self) -> bool {
        use PfxError::*;
        match (self, other) {
            (Io(a), Io(b)) => a.kind() == b.kind(),
            (
                OutOfRange {
                    offset: oa,
                    len: la,
                    device_len: da,
                },
                OutOfRange {
                    offset: ob,
                    len: lb,
                    device_len: db,
                },
            ) => oa == ob && la == lb && da == db,
            (DiskFull, DiskFull) => true,
            (NotFound, NotFound) => true,
            (DuplicateRecord, DuplicateRecord) => true,
            (TreeFull, TreeFull) => true,
            (Format(a), Format(b)) => a == b,
            (Internal(a), Internal(b)) => a == b,
            (Cancelled, Cancelled) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PfxError>;
