//! JSON edit-script format
//!
//! A delta is a JSON array of tagged edits carrying byte positions in the
//! previous (`old_*`) and the new (`new_*`) snapshot:
//!
//! ```json
//! [{"op":"equal","old_start":0,"new_start":0,"len":9},
//!  {"op":"delete","old_start":9,"len":3},
//!  {"op":"insert","new_start":9,"text":"Robert"},
//!  {"op":"equal","old_start":12,"new_start":15,"len":2}]
//! ```
//!
//! Positions are checked against the replay cursor, so an edit script that
//! was computed against a different baseline is rejected instead of
//! silently producing garbage.

use super::{DiffError, DiffOperation};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// One edit of a JSON edit script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Edit {
    /// Run present in both snapshots
    Equal {
        /// Start of the run in the previous snapshot
        old_start: usize,
        /// Start of the run in the new snapshot
        new_start: usize,
        /// Run length in bytes
        len: usize,
    },
    /// Run removed from the previous snapshot
    Delete {
        /// Start of the run in the previous snapshot
        old_start: usize,
        /// Run length in bytes
        len: usize,
    },
    /// Run added in the new snapshot
    Insert {
        /// Start of the run in the new snapshot
        new_start: usize,
        /// Inserted text
        text: String,
    },
}

/// JSON edit-script encoder/decoder
pub struct JsonEditCodec;

impl JsonEditCodec {
    /// Convert diff operations to positioned edits
    ///
    /// # Errors
    /// Returns [`DiffError::Unencodable`] if inserted data is not valid UTF-8
    pub fn to_edits(operations: &[DiffOperation]) -> Result<Vec<Edit>, DiffError> {
        let mut edits = Vec::with_capacity(operations.len());
        let (mut old_pos, mut new_pos) = (0, 0);

        for op in operations {
            match op {
                DiffOperation::Copy { length } => {
                    edits.push(Edit::Equal {
                        old_start: old_pos,
                        new_start: new_pos,
                        len: *length,
                    });
                    old_pos += length;
                    new_pos += length;
                }
                DiffOperation::Delete { length } => {
                    edits.push(Edit::Delete {
                        old_start: old_pos,
                        len: *length,
                    });
                    old_pos += length;
                }
                DiffOperation::Insert(data) => {
                    let text = String::from_utf8(data.clone()).map_err(|e| {
                        DiffError::Unencodable(format!(
                            "Insert at byte {} is not valid UTF-8: {}",
                            new_pos,
                            e.utf8_error()
                        ))
                    })?;
                    edits.push(Edit::Insert {
                        new_start: new_pos,
                        text,
                    });
                    new_pos += data.len();
                }
            }
        }

        Ok(edits)
    }

    /// Encode diff operations as a JSON edit script
    pub fn encode_diff(operations: &[DiffOperation]) -> Result<Bytes, DiffError> {
        let edits = Self::to_edits(operations)?;
        let encoded = serde_json::to_vec(&edits)
            .map_err(|e| DiffError::Unencodable(format!("Cannot marshal the edits: {}", e)))?;
        Ok(Bytes::from(encoded))
    }

    /// Decode a JSON edit script
    pub fn decode_diff(diff_data: &[u8]) -> Result<Vec<Edit>, DiffError> {
        serde_json::from_slice(diff_data)
            .map_err(|e| DiffError::InvalidFormat(format!("Malformed edit script: {}", e)))
    }

    /// Replay positioned edits over base content
    pub fn apply_edits(base: &[u8], edits: &[Edit]) -> Result<Bytes, DiffError> {
        let mut result = BytesMut::with_capacity(base.len());
        let mut base_pos = 0;

        for edit in edits {
            match edit {
                Edit::Equal {
                    old_start,
                    new_start,
                    len,
                } => {
                    check_position("old", *old_start, base_pos)?;
                    check_position("new", *new_start, result.len())?;
                    let end_pos = run_end("Equal", base_pos, *len, base.len())?;
                    result.put_slice(&base[base_pos..end_pos]);
                    base_pos = end_pos;
                }
                Edit::Delete { old_start, len } => {
                    check_position("old", *old_start, base_pos)?;
                    base_pos = run_end("Delete", base_pos, *len, base.len())?;
                }
                Edit::Insert { new_start, text } => {
                    check_position("new", *new_start, result.len())?;
                    result.put_slice(text.as_bytes());
                }
            }
        }

        if base_pos != base.len() {
            return Err(DiffError::PatchFailed(format!(
                "Edit script leaves {} base bytes unaccounted for",
                base.len() - base_pos
            )));
        }

        Ok(result.freeze())
    }

    /// Decode a JSON edit script and apply it to base content
    pub fn apply_diff(base: &[u8], diff_data: &[u8]) -> Result<Bytes, DiffError> {
        let edits = Self::decode_diff(diff_data)?;
        Self::apply_edits(base, &edits)
    }
}

fn run_end(
    edit: &str,
    base_pos: usize,
    len: usize,
    base_len: usize,
) -> Result<usize, DiffError> {
    base_pos
        .checked_add(len)
        .filter(|end_pos| *end_pos <= base_len)
        .ok_or_else(|| {
            DiffError::PatchFailed(format!("{} edit exceeds base content length", edit))
        })
}

fn check_position(side: &str, declared: usize, cursor: usize) -> Result<(), DiffError> {
    if declared != cursor {
        return Err(DiffError::PatchFailed(format!(
            "Edit expects {} position {} but replay is at {}",
            side, declared, cursor
        )));
    }
    Ok(())
}
