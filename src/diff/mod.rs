//! Delta computation and wire codecs

use crate::DiffFormat;
use bytes::Bytes;
use thiserror::Error;

pub mod binary;
pub mod json;
pub mod similar;

pub use binary::BinaryDiffCodec;
pub use json::{Edit, JsonEditCodec};
pub use similar::SimilarDiffEngine;

/// Errors that can occur during diff operations
#[derive(Debug, Error)]
pub enum DiffError {
    /// Delta bytes could not be decoded
    #[error("Invalid diff format: {0}")]
    InvalidFormat(String),

    /// Edit script cannot be represented in the wire format
    #[error("Cannot encode edits: {0}")]
    Unencodable(String),

    /// Patch application failed
    #[error("Patch application failed: {0}")]
    PatchFailed(String),
}

/// Format-independent edit operation, replayed sequentially over the previous snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOperation {
    /// Copy the next bytes of the previous snapshot
    Copy {
        /// Number of bytes to copy
        length: usize,
    },
    /// Insert new data
    Insert(Vec<u8>),
    /// Skip the next bytes of the previous snapshot
    Delete {
        /// Number of bytes to skip
        length: usize,
    },
}

/// Trait for engines that compute and apply snapshot deltas
pub trait DiffEngine: Send + Sync {
    /// Wire format produced by [`DiffEngine::compute_diff`]
    fn format(&self) -> DiffFormat;

    /// Compute the encoded delta turning `old` into `new`
    ///
    /// # Errors
    /// Returns [`DiffError::Unencodable`] if the edit script cannot be encoded
    fn compute_diff(&self, old: &[u8], new: &[u8]) -> Result<Bytes, DiffError>;

    /// Apply an encoded delta to base content
    ///
    /// # Errors
    /// Returns [`DiffError`] if the delta is malformed or does not fit `base`
    fn apply_diff(&self, base: &[u8], diff: &[u8]) -> Result<Bytes, DiffError> {
        apply_delta(self.format(), base, diff)
    }
}

/// Encode operations in the given wire format
pub fn encode_delta(format: DiffFormat, operations: &[DiffOperation]) -> Result<Bytes, DiffError> {
    match format {
        DiffFormat::BinaryDelta => BinaryDiffCodec::encode_diff(operations),
        DiffFormat::JsonEdits => JsonEditCodec::encode_diff(operations),
    }
}

/// Apply a delta encoded in the given wire format
pub fn apply_delta(format: DiffFormat, base: &[u8], diff: &[u8]) -> Result<Bytes, DiffError> {
    match format {
        DiffFormat::BinaryDelta => BinaryDiffCodec::apply_diff(base, diff),
        DiffFormat::JsonEdits => JsonEditCodec::apply_diff(base, diff),
    }
}
