//! Diff implementation using the `similar` crate for computing edits and the
//! configured codec for the wire format

use super::{DiffEngine, DiffError, DiffOperation, encode_delta};
use crate::DiffFormat;
use bytes::Bytes;
use similar::{Algorithm, ChangeTag, TextDiff};
use tracing::trace_span;

/// Diff engine using the `similar` crate with line-based Myers diffing.
///
/// Lines are diffed as raw bytes, so snapshots do not need to be valid UTF-8
/// for the binary format.
pub struct SimilarDiffEngine {
    format: DiffFormat,
}

impl SimilarDiffEngine {
    /// Create new diff engine producing binary deltas
    pub fn new() -> Self {
        Self::with_format(DiffFormat::BinaryDelta)
    }

    /// Create new diff engine producing deltas in `format`
    pub fn with_format(format: DiffFormat) -> Self {
        Self { format }
    }

    /// Compute the coalesced edit operations turning `old` into `new`
    pub fn compute_operations(old: &[u8], new: &[u8]) -> Vec<DiffOperation> {
        if old == new {
            return if old.is_empty() {
                Vec::new()
            } else {
                vec![DiffOperation::Copy { length: old.len() }]
            };
        }

        let diff = TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_lines(old, new);

        let mut ops: Vec<DiffOperation> = Vec::new();
        for change in diff.iter_all_changes() {
            let bytes: &[u8] = change.value();
            if bytes.is_empty() {
                continue;
            }

            match (change.tag(), ops.last_mut()) {
                (ChangeTag::Equal, Some(DiffOperation::Copy { length }))
                | (ChangeTag::Delete, Some(DiffOperation::Delete { length })) => {
                    *length += bytes.len();
                }
                (ChangeTag::Insert, Some(DiffOperation::Insert(data))) => {
                    data.extend_from_slice(bytes);
                }
                (ChangeTag::Equal, _) => ops.push(DiffOperation::Copy {
                    length: bytes.len(),
                }),
                (ChangeTag::Delete, _) => ops.push(DiffOperation::Delete {
                    length: bytes.len(),
                }),
                (ChangeTag::Insert, _) => ops.push(DiffOperation::Insert(bytes.to_vec())),
            }
        }

        ops
    }
}

impl Default for SimilarDiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffEngine for SimilarDiffEngine {
    fn format(&self) -> DiffFormat {
        self.format
    }

    fn compute_diff(&self, old: &[u8], new: &[u8]) -> Result<Bytes, DiffError> {
        let _span = trace_span!("compute_edits", format = self.format.as_str()).entered();
        let ops = Self::compute_operations(old, new);
        encode_delta(self.format, &ops)
    }
}
