//! Checkpoint persistence: runs the diff-or-full update cycle against a backend

use crate::{
    CheckpointHash, DeploymentId, SyncError,
    diff::{DiffError, apply_delta},
    protocol::{CheckpointUpdate, DeltaCheckpoint, FullCheckpoint},
    state::{DiffState, StateManager},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info_span, warn};

/// Reasons a backend refuses an update
#[derive(Debug, Error)]
pub enum BackendError {
    /// Delta sent for a deployment the backend holds no snapshot of
    #[error("No baseline stored for deployment {deployment}")]
    NoBaseline {
        /// Deployment identifier
        deployment: DeploymentId,
    },

    /// Update is stale or skips a version
    #[error("Sequence number mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// Sequence number the backend expects next
        expected: u64,
        /// Sequence number carried by the update
        actual: u64,
    },

    /// Patched snapshot does not hash to the announced checkpoint hash
    #[error("Checkpoint hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch {
        /// Hash carried by the update
        expected: CheckpointHash,
        /// Hash of the patched snapshot
        actual: CheckpointHash,
    },

    /// Delta could not be applied
    #[error("Cannot apply delta: {0}")]
    Patch(#[from] DiffError),

    /// Backend could not be reached
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Trait for the remote side that stores checkpoints
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Deliver an update; `Ok` means it was durably accepted
    async fn send(&self, update: CheckpointUpdate) -> Result<(), BackendError>;
}

/// What a successful [`CheckpointPersister::save`] put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Delta update was accepted
    Delta {
        /// Version the snapshot became
        sequence_number: u64,
        /// Size of the transmitted delta
        delta_size: usize,
        /// Size of the snapshot
        snapshot_size: usize,
    },
    /// Full update was accepted
    Full {
        /// Version the snapshot became
        sequence_number: u64,
        /// Size of the snapshot
        snapshot_size: usize,
    },
}

impl CheckpointOutcome {
    /// Check if a delta was sent
    pub fn is_delta(&self) -> bool {
        matches!(self, Self::Delta { .. })
    }

    /// Version the snapshot became
    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Delta {
                sequence_number, ..
            }
            | Self::Full {
                sequence_number, ..
            } => *sequence_number,
        }
    }
}

/// Persists successive snapshots of one deployment.
///
/// Holds the tracker mutex for a whole cycle, so calls to
/// [`CheckpointPersister::save`] on the same deployment are serialized.
pub struct CheckpointPersister<B: ?Sized> {
    deployment: DeploymentId,
    state: Arc<Mutex<DiffState>>,
    backend: Arc<B>,
}

impl<B: CheckpointBackend + ?Sized> CheckpointPersister<B> {
    /// Create persister around an existing tracker
    pub fn new(deployment: DeploymentId, state: Arc<Mutex<DiffState>>, backend: Arc<B>) -> Self {
        Self {
            deployment,
            state,
            backend,
        }
    }

    /// Create persister using the tracker a state manager keeps for `deployment`
    pub async fn from_manager(
        manager: &dyn StateManager,
        deployment: DeploymentId,
        backend: Arc<B>,
    ) -> Self {
        let state = manager.get_or_create(&deployment).await;
        Self::new(deployment, state, backend)
    }

    /// Deployment this persister writes to
    pub fn deployment(&self) -> &DeploymentId {
        &self.deployment
    }

    /// Tracker shared with the state manager
    pub fn state(&self) -> &Arc<Mutex<DiffState>> {
        &self.state
    }

    /// Send `snapshot` as a delta when worthwhile, in full otherwise, and
    /// advance the tracker once the backend accepted it.
    ///
    /// A rejected update leaves the tracker untouched, so the call can be
    /// retried with the same snapshot.
    pub async fn save(&self, snapshot: Bytes) -> Result<CheckpointOutcome, SyncError> {
        let span = info_span!(
            "save_checkpoint",
            deployment = %self.deployment,
            size = snapshot.len()
        );
        self.save_locked(snapshot).instrument(span).await
    }

    async fn save_locked(&self, snapshot: Bytes) -> Result<CheckpointOutcome, SyncError> {
        let mut state = self.state.lock().await;
        let sequence_number = state.sequence_number();

        let mut update = None;
        if state.should_diff(&snapshot) {
            match state.diff(snapshot.clone()).await {
                Ok(diff) => {
                    update = Some(CheckpointUpdate::delta(self.deployment.clone(), diff));
                }
                Err(SyncError::Encoding(e)) => {
                    warn!(error = %e, "delta not encodable, sending full checkpoint");
                    metrics::counter!("checkpoint_diff_fallbacks_total").increment(1);
                }
                Err(e) => return Err(e),
            }
        }
        let update = update.unwrap_or_else(|| {
            CheckpointUpdate::full(self.deployment.clone(), sequence_number, snapshot.clone())
        });

        let body_size = update.body_size();
        let outcome = if update.is_delta() {
            CheckpointOutcome::Delta {
                sequence_number,
                delta_size: body_size,
                snapshot_size: snapshot.len(),
            }
        } else {
            CheckpointOutcome::Full {
                sequence_number,
                snapshot_size: snapshot.len(),
            }
        };

        self.backend.send(update).await?;
        state.saved(snapshot);
        metrics::histogram!("checkpoint_update_bytes").record(body_size as f64);

        match outcome {
            CheckpointOutcome::Delta {
                delta_size,
                snapshot_size,
                ..
            } => {
                metrics::counter!("checkpoint_delta_updates_total").increment(1);
                if snapshot_size > 0 {
                    metrics::histogram!("checkpoint_delta_compression_ratio")
                        .record(delta_size as f64 / snapshot_size as f64);
                }
            }
            CheckpointOutcome::Full { .. } => {
                metrics::counter!("checkpoint_full_updates_total").increment(1);
            }
        }
        debug!(sequence_number, delta = outcome.is_delta(), "checkpoint saved");

        Ok(outcome)
    }
}

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    sequence_number: u64,
    snapshot: Bytes,
}

/// In-memory backend: applies deltas and verifies them like a remote service would
pub struct InMemoryCheckpointBackend {
    checkpoints: DashMap<DeploymentId, StoredCheckpoint>,
    deltas_applied: AtomicUsize,
    full_stored: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryCheckpointBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            checkpoints: DashMap::new(),
            deltas_applied: AtomicUsize::new(0),
            full_stored: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Current snapshot of a deployment
    pub fn snapshot(&self, deployment: &DeploymentId) -> Option<Bytes> {
        self.checkpoints
            .get(deployment)
            .map(|entry| entry.value().snapshot.clone())
    }

    /// Sequence number of the current snapshot of a deployment
    pub fn sequence_number(&self, deployment: &DeploymentId) -> Option<u64> {
        self.checkpoints
            .get(deployment)
            .map(|entry| entry.value().sequence_number)
    }

    /// Number of accepted delta updates
    pub fn deltas_applied(&self) -> usize {
        self.deltas_applied.load(Ordering::Relaxed)
    }

    /// Number of accepted full updates
    pub fn full_stored(&self) -> usize {
        self.full_stored.load(Ordering::Relaxed)
    }

    /// Make every following `send` fail with [`BackendError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn store_full(&self, update: FullCheckpoint) -> Result<(), BackendError> {
        let stored = StoredCheckpoint {
            sequence_number: update.sequence_number,
            snapshot: update.snapshot,
        };

        match self.checkpoints.entry(update.deployment) {
            Entry::Occupied(mut entry) => {
                check_sequence(entry.get().sequence_number, stored.sequence_number)?;
                entry.insert(stored);
            }
            Entry::Vacant(entry) => {
                entry.insert(stored);
            }
        }

        self.full_stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn patch(&self, update: DeltaCheckpoint) -> Result<(), BackendError> {
        let Entry::Occupied(mut entry) = self.checkpoints.entry(update.deployment.clone()) else {
            return Err(BackendError::NoBaseline {
                deployment: update.deployment,
            });
        };

        check_sequence(entry.get().sequence_number, update.sequence_number)?;

        let patched = apply_delta(update.format, &entry.get().snapshot, &update.delta)?;
        let actual = CheckpointHash::from_content(&patched);
        if actual != update.checkpoint_hash {
            return Err(BackendError::HashMismatch {
                expected: update.checkpoint_hash,
                actual,
            });
        }

        entry.insert(StoredCheckpoint {
            sequence_number: update.sequence_number,
            snapshot: patched,
        });
        self.deltas_applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for InMemoryCheckpointBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_sequence(stored: u64, actual: u64) -> Result<(), BackendError> {
    let expected = stored + 1;
    if actual != expected {
        return Err(BackendError::SequenceMismatch { expected, actual });
    }
    Ok(())
}

#[async_trait]
impl CheckpointBackend for InMemoryCheckpointBackend {
    async fn send(&self, update: CheckpointUpdate) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(BackendError::Unavailable(
                "backend switched off".to_string(),
            ));
        }

        match update {
            CheckpointUpdate::Full(full) => self.store_full(full),
            CheckpointUpdate::Delta(delta) => self.patch(delta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DiffFormat, InMemoryStateManager, SyncConfig,
        diff::{DiffEngine, DiffOperation, SimilarDiffEngine, encode_delta},
        state::DiffResult,
    };
    use serde_json::json;

    fn deployment_state(resources: usize, version: u64) -> Bytes {
        let resources: Vec<_> = (0..resources)
            .map(|i| {
                json!({
                    "urn": format!("urn:pulumi:dev::app::aws:s3/bucket:Bucket::bucket-{}", i),
                    "type": "aws:s3/bucket:Bucket",
                    "outputs": {"arn": format!("arn:aws:s3:::bucket-{}", i), "version": version},
                })
            })
            .collect();
        let document = json!({"version": 3, "deployment": {"resources": resources}});
        Bytes::from(serde_json::to_vec_pretty(&document).unwrap())
    }

    fn persister(
        config: SyncConfig,
    ) -> (
        CheckpointPersister<InMemoryCheckpointBackend>,
        Arc<InMemoryCheckpointBackend>,
    ) {
        let backend = Arc::new(InMemoryCheckpointBackend::new());
        let state = Arc::new(Mutex::new(DiffState::builder().config(config).build()));
        let persister =
            CheckpointPersister::new(DeploymentId::new("org/app/dev"), state, Arc::clone(&backend));
        (persister, backend)
    }

    fn small_threshold() -> SyncConfig {
        SyncConfig {
            minimal_diff_size: 256,
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_save_is_full_then_deltas() {
        let (persister, backend) = persister(small_threshold());
        let deployment = persister.deployment().clone();

        let first = persister.save(deployment_state(10, 1)).await.unwrap();
        assert_eq!(
            first,
            CheckpointOutcome::Full {
                sequence_number: 1,
                snapshot_size: deployment_state(10, 1).len(),
            }
        );

        let second_snapshot = deployment_state(11, 1);
        let second = persister.save(second_snapshot.clone()).await.unwrap();
        assert!(second.is_delta());
        assert_eq!(second.sequence_number(), 2);
        let expected_delta = SimilarDiffEngine::new()
            .compute_diff(&deployment_state(10, 1), &second_snapshot)
            .unwrap();
        assert_eq!(
            second,
            CheckpointOutcome::Delta {
                sequence_number: 2,
                delta_size: expected_delta.len(),
                snapshot_size: second_snapshot.len(),
            }
        );
        assert!(expected_delta.len() < second_snapshot.len());

        assert_eq!(backend.snapshot(&deployment), Some(second_snapshot));
        assert_eq!(backend.sequence_number(&deployment), Some(2));
        assert_eq!(backend.full_stored(), 1);
        assert_eq!(backend.deltas_applied(), 1);
        assert_eq!(persister.state().lock().await.sequence_number(), 3);
    }

    #[tokio::test]
    async fn test_many_cycles_keep_backend_in_sync() {
        for format in [DiffFormat::BinaryDelta, DiffFormat::JsonEdits] {
            let (persister, backend) = persister(SyncConfig {
                minimal_diff_size: 256,
                diff_format: format,
            });
            let deployment = persister.deployment().clone();

            for round in 0..6u64 {
                let snapshot = deployment_state(5 + round as usize, round / 2);
                let outcome = persister.save(snapshot.clone()).await.unwrap();
                assert_eq!(outcome.sequence_number(), round + 1);
                assert_eq!(backend.snapshot(&deployment), Some(snapshot));
            }

            assert_eq!(backend.full_stored(), 1);
            assert_eq!(backend.deltas_applied(), 5);
        }
    }

    #[tokio::test]
    async fn test_small_snapshots_are_sent_full() {
        let (persister, backend) = persister(SyncConfig::default());

        for round in 0..3u64 {
            let outcome = persister.save(deployment_state(2, round)).await.unwrap();
            assert!(!outcome.is_delta());
        }
        assert_eq!(backend.full_stored(), 3);
        assert_eq!(backend.deltas_applied(), 0);
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_tracker_untouched() {
        let (persister, backend) = persister(small_threshold());
        let deployment = persister.deployment().clone();
        persister.save(deployment_state(10, 1)).await.unwrap();

        backend.set_unavailable(true);
        let result = persister.save(deployment_state(12, 1)).await;
        assert!(matches!(
            result,
            Err(SyncError::Backend(BackendError::Unavailable(_)))
        ));
        {
            let state = persister.state().lock().await;
            assert_eq!(state.sequence_number(), 2);
            assert_eq!(state.last_saved(), Some(&deployment_state(10, 1)));
        }

        backend.set_unavailable(false);
        let outcome = persister.save(deployment_state(12, 1)).await.unwrap();
        assert!(outcome.is_delta());
        assert_eq!(outcome.sequence_number(), 2);
        assert_eq!(backend.snapshot(&deployment), Some(deployment_state(12, 1)));
    }

    #[tokio::test]
    async fn test_unencodable_delta_falls_back_to_full() {
        let (persister, backend) = persister(SyncConfig {
            minimal_diff_size: 4,
            diff_format: DiffFormat::JsonEdits,
        });

        persister
            .save(Bytes::from_static(b"{\"a\": 1}\n"))
            .await
            .unwrap();
        let outcome = persister
            .save(Bytes::from_static(b"{\"a\": 1}\n\xff\xfe\n"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CheckpointOutcome::Full {
                sequence_number: 2,
                snapshot_size: 12,
            }
        );
        assert_eq!(backend.full_stored(), 2);
    }

    #[tokio::test]
    async fn test_persisters_from_manager_share_tracker() {
        let manager = InMemoryStateManager::new(small_threshold());
        let backend = Arc::new(InMemoryCheckpointBackend::new());
        let deployment = DeploymentId::new("org/app/prod");

        let first =
            CheckpointPersister::from_manager(&manager, deployment.clone(), Arc::clone(&backend))
                .await;
        first.save(deployment_state(10, 1)).await.unwrap();

        let second =
            CheckpointPersister::from_manager(&manager, deployment.clone(), Arc::clone(&backend))
                .await;
        let outcome = second.save(deployment_state(10, 2)).await.unwrap();

        assert!(outcome.is_delta());
        assert_eq!(backend.sequence_number(&deployment), Some(2));
    }

    #[tokio::test]
    async fn test_reacquired_tracker_keeps_numbering() {
        let manager = InMemoryStateManager::new(small_threshold());
        let backend = Arc::new(InMemoryCheckpointBackend::new());
        let deployment = DeploymentId::new("org/app/prod");

        {
            let persister = CheckpointPersister::from_manager(
                &manager,
                deployment.clone(),
                Arc::clone(&backend),
            )
            .await;
            persister.save(deployment_state(10, 1)).await.unwrap();
            persister.save(deployment_state(10, 2)).await.unwrap();
        }

        let persister =
            CheckpointPersister::from_manager(&manager, deployment.clone(), Arc::clone(&backend))
                .await;
        let outcome = persister.save(deployment_state(10, 3)).await.unwrap();

        assert!(outcome.is_delta());
        assert_eq!(outcome.sequence_number(), 3);
        assert_eq!(backend.sequence_number(&deployment), Some(3));
        assert_eq!(backend.snapshot(&deployment), Some(deployment_state(10, 3)));
    }

    #[tokio::test]
    async fn test_backend_rejects_overflowing_json_delta() {
        let backend = InMemoryCheckpointBackend::new();
        let deployment = DeploymentId::new("org/app/dev");
        backend
            .send(CheckpointUpdate::full(deployment.clone(), 1, Bytes::from_static(b"ab")))
            .await
            .unwrap();

        let script = json!([
            {"op": "equal", "old_start": 0, "new_start": 0, "len": 1},
            {"op": "delete", "old_start": 1, "len": usize::MAX},
            {"op": "equal", "old_start": 0, "new_start": 1, "len": 2},
        ]);
        let diff = DiffResult {
            sequence_number: 2,
            checkpoint_hash: CheckpointHash::from_content(b"bab"),
            delta: Bytes::from(serde_json::to_vec(&script).unwrap()),
            format: DiffFormat::JsonEdits,
        };

        let err = backend
            .send(CheckpointUpdate::delta(deployment.clone(), diff))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Patch(_)));
        assert_eq!(backend.snapshot(&deployment), Some(Bytes::from_static(b"ab")));
    }

    fn forged_delta(sequence_number: u64, after: &[u8]) -> DiffResult {
        let ops = [
            DiffOperation::Delete { length: 3 },
            DiffOperation::Insert(after.to_vec()),
        ];
        DiffResult {
            sequence_number,
            checkpoint_hash: CheckpointHash::from_content(after),
            delta: encode_delta(DiffFormat::BinaryDelta, &ops).unwrap(),
            format: DiffFormat::BinaryDelta,
        }
    }

    #[tokio::test]
    async fn test_backend_rejects_delta_without_baseline() {
        let backend = InMemoryCheckpointBackend::new();
        let deployment = DeploymentId::new("org/app/unknown");
        let diff = forged_delta(2, b"new");

        let err = backend
            .send(CheckpointUpdate::delta(deployment.clone(), diff))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NoBaseline { .. }));
    }

    #[tokio::test]
    async fn test_backend_rejects_out_of_order_updates() {
        let backend = InMemoryCheckpointBackend::new();
        let deployment = DeploymentId::new("org/app/dev");
        backend
            .send(CheckpointUpdate::full(deployment.clone(), 1, Bytes::from_static(b"old")))
            .await
            .unwrap();

        let stale = forged_delta(1, b"new");
        let err = backend
            .send(CheckpointUpdate::delta(deployment.clone(), stale))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::SequenceMismatch {
                expected: 2,
                actual: 1
            }
        ));

        let err = backend
            .send(CheckpointUpdate::full(deployment.clone(), 5, Bytes::from_static(b"x")))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SequenceMismatch { expected: 2, .. }));

        let ok = forged_delta(2, b"new");
        backend
            .send(CheckpointUpdate::delta(deployment.clone(), ok))
            .await
            .unwrap();
        assert_eq!(backend.snapshot(&deployment), Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_backend_rejects_hash_mismatch() {
        let backend = InMemoryCheckpointBackend::new();
        let deployment = DeploymentId::new("org/app/dev");
        backend
            .send(CheckpointUpdate::full(deployment.clone(), 1, Bytes::from_static(b"old")))
            .await
            .unwrap();

        let mut diff = forged_delta(2, b"new");
        diff.checkpoint_hash = CheckpointHash::from_content(b"something else");
        let err = backend
            .send(CheckpointUpdate::delta(deployment.clone(), diff))
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::HashMismatch { .. }));
        assert_eq!(backend.snapshot(&deployment), Some(Bytes::from_static(b"old")));
        assert_eq!(backend.sequence_number(&deployment), Some(1));
    }

    #[tokio::test]
    async fn test_backend_rejects_delta_for_wrong_baseline() {
        let backend = InMemoryCheckpointBackend::new();
        let deployment = DeploymentId::new("org/app/dev");
        backend
            .send(CheckpointUpdate::full(deployment.clone(), 1, Bytes::from_static(b"longer base")))
            .await
            .unwrap();

        let diff = forged_delta(2, b"new");
        let err = backend
            .send(CheckpointUpdate::delta(deployment.clone(), diff))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Patch(DiffError::PatchFailed(_))));
    }
}
