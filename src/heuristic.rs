//! Size-based heuristics deciding whether a delta is worth computing

/// Policy deciding, from sizes alone, whether to diff or send the full snapshot
pub trait DiffHeuristic: Send + Sync {
    /// Decide whether to compute a delta
    ///
    /// # Arguments
    /// * `baseline_len` - Size of the last saved snapshot, `None` if nothing was saved yet
    /// * `candidate_len` - Size of the snapshot about to be persisted
    fn should_diff(&self, baseline_len: Option<usize>, candidate_len: usize) -> bool;
}

/// Skips diffing when either snapshot is below a fixed size.
///
/// Below the threshold, running the diff and encoding the result costs more
/// than the bandwidth it saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimalSizeHeuristic {
    minimal_diff_size: usize,
}

impl MinimalSizeHeuristic {
    /// Create heuristic with the given threshold in bytes
    pub fn new(minimal_diff_size: usize) -> Self {
        Self { minimal_diff_size }
    }

    /// Threshold in bytes
    pub fn minimal_diff_size(&self) -> usize {
        self.minimal_diff_size
    }
}

impl DiffHeuristic for MinimalSizeHeuristic {
    fn should_diff(&self, baseline_len: Option<usize>, candidate_len: usize) -> bool {
        match baseline_len {
            None => false,
            Some(baseline_len) => {
                baseline_len >= self.minimal_diff_size && candidate_len >= self.minimal_diff_size
            }
        }
    }
}
