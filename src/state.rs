//! Per-deployment diff state tracking

use crate::{
    CheckpointHash, DeploymentId, DiffFormat, SyncConfig, SyncError,
    diff::{DiffEngine, SimilarDiffEngine},
    heuristic::{DiffHeuristic, MinimalSizeHeuristic},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, field, info_span};

/// Delta of a candidate snapshot against the last saved one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult {
    /// Sequence number the candidate becomes once saved
    pub sequence_number: u64,
    /// Hash the backend must find after applying `delta`
    pub checkpoint_hash: CheckpointHash,
    /// Encoded edit script from the last saved snapshot to the candidate
    pub delta: Bytes,
    /// Wire format of `delta`
    pub format: DiffFormat,
}

/// Tracks the last snapshot confirmed by the backend and the sequence number.
///
/// Single writer: [`DiffState::saved`] needs `&mut self`, so it cannot run
/// while a [`DiffState::diff`] borrow is in flight. Share a tracker between
/// tasks by wrapping it in a mutex, as [`InMemoryStateManager`] does.
pub struct DiffState {
    last_saved: Option<Bytes>,
    sequence_number: u64,
    heuristic: Arc<dyn DiffHeuristic>,
    diff_engine: Arc<dyn DiffEngine>,
}

impl DiffState {
    /// Create tracker with the fixed-size heuristic and the default engine
    pub fn new(minimal_diff_size: usize) -> Self {
        Self::builder()
            .config(SyncConfig {
                minimal_diff_size,
                ..SyncConfig::default()
            })
            .build()
    }

    /// Create a new tracker builder
    pub fn builder() -> DiffStateBuilder {
        DiffStateBuilder::new()
    }

    /// Sequence number the next saved snapshot will get
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Whether a baseline exists to diff against
    pub fn can_diff(&self) -> bool {
        self.last_saved.is_some()
    }

    /// Last snapshot confirmed by the backend
    pub fn last_saved(&self) -> Option<&Bytes> {
        self.last_saved.as_ref()
    }

    /// Wire format of deltas produced by this tracker
    pub fn format(&self) -> DiffFormat {
        self.diff_engine.format()
    }

    /// Size-based estimate of whether a delta beats sending `candidate` whole
    pub fn should_diff(&self, candidate: &[u8]) -> bool {
        self.heuristic
            .should_diff(self.last_saved.as_ref().map(Bytes::len), candidate.len())
    }

    /// Compute the delta from the last saved snapshot to `candidate`.
    ///
    /// Hashing and diffing run concurrently on the blocking pool and are joined
    /// before returning. State is left untouched, so the same delta can be
    /// recomputed after a failed transmission.
    ///
    /// # Errors
    /// - [`SyncError::DiffBeforeSaved`] if nothing was saved yet
    /// - [`SyncError::Encoding`] if the edit script cannot be encoded
    /// - [`SyncError::TaskFailed`] if a worker task panicked
    pub async fn diff(&self, candidate: Bytes) -> Result<DiffResult, SyncError> {
        let before = self.last_saved.clone().ok_or(SyncError::DiffBeforeSaved)?;
        let after = candidate;

        let span = info_span!(
            "diff",
            sequence_number = self.sequence_number,
            before = before.len(),
            after = after.len(),
            delta = field::Empty,
            compression = field::Empty,
            hash = field::Empty,
        );

        let hash_task = tokio::task::spawn_blocking({
            let after = after.clone();
            let span = span.clone();
            move || span.in_scope(|| CheckpointHash::from_content(&after))
        });

        let delta_task = tokio::task::spawn_blocking({
            let after = after.clone();
            let span = span.clone();
            let engine = Arc::clone(&self.diff_engine);
            move || span.in_scope(|| engine.compute_diff(&before, &after))
        });

        let (checkpoint_hash, delta) = tokio::try_join!(hash_task, delta_task)?;
        let delta = delta.map_err(SyncError::Encoding)?;

        let compression = if after.is_empty() {
            0.0
        } else {
            100.0 * delta.len() as f64 / after.len() as f64
        };
        span.record("delta", delta.len());
        span.record("compression", compression);
        span.record("hash", checkpoint_hash.as_str());
        debug!(parent: &span, "computed checkpoint delta");

        Ok(DiffResult {
            sequence_number: self.sequence_number,
            checkpoint_hash,
            delta,
            format: self.diff_engine.format(),
        })
    }

    /// Record that `snapshot` was durably accepted by the backend.
    ///
    /// The snapshot is not checked against earlier [`DiffState::diff`] calls;
    /// passing bytes the backend did not store desynchronizes every later delta.
    pub fn saved(&mut self, snapshot: Bytes) {
        self.last_saved = Some(snapshot);
        self.sequence_number += 1;
    }
}

/// Builder for configuring a [`DiffState`]
pub struct DiffStateBuilder {
    config: Option<SyncConfig>,
    heuristic: Option<Arc<dyn DiffHeuristic>>,
    diff_engine: Option<Arc<dyn DiffEngine>>,
}

impl DiffStateBuilder {
    fn new() -> Self {
        Self {
            config: None,
            heuristic: None,
            diff_engine: None,
        }
    }

    /// Set synchronization configuration
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the fixed-size heuristic
    pub fn heuristic(mut self, heuristic: Arc<dyn DiffHeuristic>) -> Self {
        self.heuristic = Some(heuristic);
        self
    }

    /// Set diff engine implementation
    pub fn diff_engine(mut self, diff_engine: Arc<dyn DiffEngine>) -> Self {
        self.diff_engine = Some(diff_engine);
        self
    }

    /// Build the tracker, filling unset parts from the configuration
    pub fn build(self) -> DiffState {
        let config = self.config.unwrap_or_default();

        let heuristic: Arc<dyn DiffHeuristic> = match self.heuristic {
            Some(heuristic) => heuristic,
            None => Arc::new(MinimalSizeHeuristic::new(config.minimal_diff_size)),
        };
        let diff_engine: Arc<dyn DiffEngine> = match self.diff_engine {
            Some(diff_engine) => diff_engine,
            None => Arc::new(SimilarDiffEngine::with_format(config.diff_format)),
        };

        DiffState {
            last_saved: None,
            sequence_number: 1,
            heuristic,
            diff_engine,
        }
    }
}

/// Trait for handing out one tracker per deployment
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Get the tracker of a deployment, creating a fresh one on first use.
    ///
    /// Trackers are never dropped: the backend keeps counting from the last
    /// sequence number it accepted, so a fresh tracker would be rejected.
    async fn get_or_create(&self, deployment: &DeploymentId) -> Arc<Mutex<DiffState>>;
}

/// In-memory state manager implementation
pub struct InMemoryStateManager {
    trackers: DashMap<DeploymentId, Arc<Mutex<DiffState>>>,
    config: SyncConfig,
    diff_engine: Arc<dyn DiffEngine>,
}

impl InMemoryStateManager {
    /// Create new in-memory state manager
    pub fn new(config: SyncConfig) -> Self {
        let diff_engine = Arc::new(SimilarDiffEngine::with_format(config.diff_format));
        Self {
            trackers: DashMap::new(),
            config,
            diff_engine,
        }
    }

    /// Number of tracked deployments
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Whether no deployment is tracked
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[async_trait]
impl StateManager for InMemoryStateManager {
    async fn get_or_create(&self, deployment: &DeploymentId) -> Arc<Mutex<DiffState>> {
        self.trackers
            .entry(deployment.clone())
            .or_insert_with(|| {
                debug!(%deployment, "tracking new deployment");
                Arc::new(Mutex::new(
                    DiffState::builder()
                        .config(self.config.clone())
                        .diff_engine(Arc::clone(&self.diff_engine))
                        .build(),
                ))
            })
            .value()
            .clone()
    }
}
