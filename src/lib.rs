//! # checkpoint-delta
//!
//! Incremental checkpoint synchronization: persists successive snapshots of a
//! large, frequently changing state document to a remote backend by sending
//! line-based deltas instead of the whole document, whenever the documents are
//! large enough for a delta to pay off.
//!
//! ## Core Components
//!
//! - [`DiffState`] - Per-deployment tracker of the last saved snapshot and sequence number
//! - [`DiffEngine`] - Delta computation and application
//! - [`DiffHeuristic`] - Decides whether a delta is worth computing
//! - [`CheckpointPersister`] - Drives the update cycle against a [`CheckpointBackend`]
//! - [`SyncConfig`] - Configuration options
//!
//! ## Example Usage
//!
//! ```rust
//! use bytes::Bytes;
//! use checkpoint_delta::{DiffState, SyncConfig};
//!
//! # async fn example() -> Result<(), checkpoint_delta::SyncError> {
//! let mut state = DiffState::builder()
//!     .config(SyncConfig { minimal_diff_size: 8, ..SyncConfig::default() })
//!     .build();
//!
//! state.saved(Bytes::from_static(b"{\n  \"resources\": []\n}\n"));
//!
//! let candidate = Bytes::from_static(b"{\n  \"resources\": [\"bucket\"]\n}\n");
//! if state.should_diff(&candidate) {
//!     let diff = state.diff(candidate.clone()).await?;
//!     assert_eq!(diff.sequence_number, 2);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

pub mod diff;
pub mod heuristic;
pub mod persister;
pub mod protocol;
pub mod state;

pub use diff::{DiffEngine, DiffError};
pub use heuristic::{DiffHeuristic, MinimalSizeHeuristic};
pub use persister::{
    BackendError, CheckpointBackend, CheckpointOutcome, CheckpointPersister,
    InMemoryCheckpointBackend,
};
pub use protocol::{CheckpointUpdate, DeltaCheckpoint, FullCheckpoint};
pub use state::{DiffResult, DiffState, DiffStateBuilder, InMemoryStateManager, StateManager};

/// Identifier of a synchronized entity, one tracker each
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Create a new deployment ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowercase hex SHA-256 digest of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointHash(String);

impl CheckpointHash {
    /// Hash the raw bytes of a snapshot
    pub fn from_content(content: &[u8]) -> Self {
        let _span = tracing::trace_span!("compute_hash", size = content.len()).entered();
        Self(hex::encode(Sha256::digest(content)))
    }

    /// Borrow the hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CheckpointHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported delta wire formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiffFormat {
    /// Binary opcode stream, valid for arbitrary bytes
    #[default]
    BinaryDelta,
    /// JSON edit script, valid for UTF-8 snapshots
    JsonEdits,
}

impl DiffFormat {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BinaryDelta => "binary-delta",
            Self::JsonEdits => "json-edits",
        }
    }
}

impl FromStr for DiffFormat {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary-delta" => Ok(Self::BinaryDelta),
            "json-edits" => Ok(Self::JsonEdits),
            other => Err(DiffError::InvalidFormat(format!(
                "Unknown diff format: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DiffFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronization configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Snapshots smaller than this many bytes are always sent in full
    pub minimal_diff_size: usize,
    /// Wire format of computed deltas
    pub diff_format: DiffFormat,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            minimal_diff_size: 32 * 1024, // 32KB
            diff_format: DiffFormat::BinaryDelta,
        }
    }
}

/// Main synchronization errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Delta requested before any snapshot was saved
    #[error("Diff() cannot be called before Saved()")]
    DiffBeforeSaved,

    /// Edit script could not be serialized
    #[error("Cannot marshal the edits: {0}")]
    Encoding(#[source] DiffError),

    /// Hash or delta task did not run to completion
    #[error("Diff task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// Backend refused or could not take the update
    #[error("Backend rejected checkpoint: {0}")]
    Backend(#[from] BackendError),
}
