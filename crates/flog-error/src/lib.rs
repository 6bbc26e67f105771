#![forbid(unsafe_code)]
//! Error types for FLogFS.
//!
//! Defines [`FlogError`] and a `Result<T>` alias used throughout the
//! workspace. Public operations surface exactly one error type; the
//! parse layer's `ParseError` and the geometry validator's
//! `GeometryError` convert into it at the crate boundary.

use flog_types::{GeometryError, ParseError};
use thiserror::Error;

/// Unified error type for all FLogFS operations.
#[derive(Debug, Error)]
pub enum FlogError {
    /// The flash driver refused an operation. An erase refusal marks
    /// the block bad; other refusals abort the operation.
    #[error("flash {op} failed at block {block}")]
    Flash { op: &'static str, block: u16 },

    /// On-media state contradicts the format; the block is treated as
    /// bad for the rest of the session.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u16, detail: String },

    /// The driver's ECC engine detected unrecoverable bit errors in a
    /// page read; the block is quarantined for the session.
    #[error("uncorrectable bit errors at block {block}")]
    Uncorrectable { block: u16 },

    /// The media does not carry a mountable FLogFS image.
    #[error("invalid on-media format: {0}")]
    Format(String),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("no free blocks or inode slots left on media")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name too long")]
    NameTooLong,

    #[error("file is already open: {0}")]
    AlreadyOpen(String),

    #[error("filesystem is not mounted")]
    NotMounted,

    #[error("handle is closed or stale")]
    ClosedHandle,
}

impl From<ParseError> for FlogError {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using [`FlogError`].
pub type Result<T> = std::result::Result<T, FlogError>;
