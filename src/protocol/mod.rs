//! Checkpoint update messages and wire format definitions

use crate::{CheckpointHash, DeploymentId, DiffFormat, state::DiffResult};
use bytes::Bytes;

pub mod wire;

/// Delta update: applies to the backend's copy of the previous version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaCheckpoint {
    /// Destination deployment
    pub deployment: DeploymentId,
    /// Version this update becomes once applied
    pub sequence_number: u64,
    /// Hash the backend must compute over the patched snapshot
    pub checkpoint_hash: CheckpointHash,
    /// Wire format of `delta`
    pub format: DiffFormat,
    /// Encoded edit script
    pub delta: Bytes,
}

impl DeltaCheckpoint {
    /// Address a computed diff to a deployment
    pub fn new(deployment: DeploymentId, diff: DiffResult) -> Self {
        Self {
            deployment,
            sequence_number: diff.sequence_number,
            checkpoint_hash: diff.checkpoint_hash,
            format: diff.format,
            delta: diff.delta,
        }
    }
}

/// Full update: replaces the backend's copy outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullCheckpoint {
    /// Destination deployment
    pub deployment: DeploymentId,
    /// Version this update becomes once stored
    pub sequence_number: u64,
    /// Complete snapshot
    pub snapshot: Bytes,
}

/// Message sent to a checkpoint backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointUpdate {
    /// Delta against the previous version
    Delta(DeltaCheckpoint),
    /// Complete snapshot
    Full(FullCheckpoint),
}

impl CheckpointUpdate {
    /// Create a full update
    pub fn full(deployment: DeploymentId, sequence_number: u64, snapshot: Bytes) -> Self {
        Self::Full(FullCheckpoint {
            deployment,
            sequence_number,
            snapshot,
        })
    }

    /// Create a delta update from a computed diff
    pub fn delta(deployment: DeploymentId, diff: DiffResult) -> Self {
        Self::Delta(DeltaCheckpoint::new(deployment, diff))
    }

    /// Destination deployment
    pub fn deployment(&self) -> &DeploymentId {
        match self {
            Self::Delta(update) => &update.deployment,
            Self::Full(update) => &update.deployment,
        }
    }

    /// Version this update becomes
    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Delta(update) => update.sequence_number,
            Self::Full(update) => update.sequence_number,
        }
    }

    /// Size of the payload put on the wire
    pub fn body_size(&self) -> usize {
        match self {
            Self::Delta(update) => update.delta.len(),
            Self::Full(update) => update.snapshot.len(),
        }
    }

    /// Check if update carries a delta
    pub fn is_delta(&self) -> bool {
        matches!(self, Self::Delta(_))
    }
}
