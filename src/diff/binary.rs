//! Binary delta format
//!
//! Wire Format:
//! ```text
//! +--------+-----------+----------------+
//! | Op(1B) | Len(4B BE)| Data           |
//! +--------+-----------+----------------+
//! ```
//!
//! Operations:
//! - 0x01: COPY(length: u32) - copy the next bytes of the previous snapshot
//! - 0x02: INSERT(length: u32, data: [u8]) - insert new data
//! - 0x03: DELETE(length: u32) - skip the next bytes of the previous snapshot
//! - 0x04: END - end of delta stream
//!
//! Copies are sequential, so no offset is transmitted. A delta must consume
//! the whole previous snapshot and must end with END.
//!
//! # Example
//! ```
//! use checkpoint_delta::diff::{BinaryDiffCodec, DiffOperation};
//!
//! let operations = vec![
//!     DiffOperation::Copy { length: 9 },
//!     DiffOperation::Delete { length: 3 },
//!     DiffOperation::Insert(b"Robert".to_vec()),
//!     DiffOperation::Copy { length: 2 },
//! ];
//!
//! let encoded = BinaryDiffCodec::encode_diff(&operations).unwrap();
//! let base = br#"{"name":"Bob"}"#;
//! let result = BinaryDiffCodec::apply_diff(base, &encoded).unwrap();
//! assert_eq!(result.as_ref(), br#"{"name":"Robert"}"#);
//! ```

use super::{DiffError, DiffOperation};
use crate::protocol::wire::DiffOp;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Binary delta encoder/decoder
pub struct BinaryDiffCodec;

impl BinaryDiffCodec {
    /// Encode diff operations to the binary wire format
    ///
    /// # Errors
    /// Returns [`DiffError::Unencodable`] if a run is longer than `u32::MAX` bytes
    pub fn encode_diff(operations: &[DiffOperation]) -> Result<Bytes, DiffError> {
        let payload: usize = operations
            .iter()
            .map(|op| match op {
                DiffOperation::Insert(data) => data.len(),
                _ => 0,
            })
            .sum();
        let mut buf =
            BytesMut::with_capacity(payload + operations.len() * (1 + DiffOp::LENGTH_WIDTH) + 1);

        for op in operations {
            match op {
                DiffOperation::Copy { length } => {
                    buf.put_u8(DiffOp::Copy.as_u8());
                    buf.put_u32(wire_length("Copy", *length)?);
                }
                DiffOperation::Insert(data) => {
                    buf.put_u8(DiffOp::Insert.as_u8());
                    buf.put_u32(wire_length("Insert", data.len())?);
                    buf.put_slice(data);
                }
                DiffOperation::Delete { length } => {
                    buf.put_u8(DiffOp::Delete.as_u8());
                    buf.put_u32(wire_length("Delete", *length)?);
                }
            }
        }

        buf.put_u8(DiffOp::End.as_u8());
        Ok(buf.freeze())
    }

    /// Decode binary delta data to operations
    pub fn decode_diff(diff_data: &[u8]) -> Result<Vec<DiffOperation>, DiffError> {
        let mut operations = Vec::new();
        let mut cursor = diff_data;

        loop {
            if !cursor.has_remaining() {
                return Err(DiffError::InvalidFormat(
                    "Delta ended without END marker".to_string(),
                ));
            }

            let op_byte = cursor.get_u8();
            let op = DiffOp::from_u8(op_byte).ok_or_else(|| {
                DiffError::InvalidFormat(format!("Unknown operation: 0x{:02x}", op_byte))
            })?;

            // END is the only operation without a length
            if !op.requires_length() {
                break;
            }

            if cursor.remaining() < DiffOp::LENGTH_WIDTH {
                return Err(DiffError::InvalidFormat(format!(
                    "Insufficient data for {:?} operation length",
                    op
                )));
            }
            let length = cursor.get_u32() as usize;

            let operation = if op.requires_data() {
                if cursor.remaining() < length {
                    return Err(DiffError::InvalidFormat(format!(
                        "Insufficient data for {:?} operation payload",
                        op
                    )));
                }
                let data = cursor[..length].to_vec();
                cursor.advance(length);
                DiffOperation::Insert(data)
            } else if op == DiffOp::Delete {
                DiffOperation::Delete { length }
            } else {
                DiffOperation::Copy { length }
            };
            operations.push(operation);
        }

        if cursor.has_remaining() {
            return Err(DiffError::InvalidFormat(format!(
                "{} trailing bytes after END marker",
                cursor.remaining()
            )));
        }

        Ok(operations)
    }

    /// Replay diff operations over base content
    pub fn apply_operations(base: &[u8], operations: &[DiffOperation]) -> Result<Bytes, DiffError> {
        let mut result = BytesMut::with_capacity(base.len());
        let mut base_pos = 0;

        for op in operations {
            match op {
                DiffOperation::Copy { length } => {
                    let end_pos = run_end("Copy", base_pos, *length, base.len())?;
                    result.put_slice(&base[base_pos..end_pos]);
                    base_pos = end_pos;
                }
                DiffOperation::Insert(data) => result.put_slice(data),
                DiffOperation::Delete { length } => {
                    base_pos = run_end("Delete", base_pos, *length, base.len())?;
                }
            }
        }

        if base_pos != base.len() {
            return Err(DiffError::PatchFailed(format!(
                "Delta leaves {} base bytes unaccounted for",
                base.len() - base_pos
            )));
        }

        Ok(result.freeze())
    }

    /// Decode a binary delta and apply it to base content
    pub fn apply_diff(base: &[u8], diff_data: &[u8]) -> Result<Bytes, DiffError> {
        let operations = Self::decode_diff(diff_data)?;
        Self::apply_operations(base, &operations)
    }
}

fn run_end(
    op: &str,
    base_pos: usize,
    length: usize,
    base_len: usize,
) -> Result<usize, DiffError> {
    base_pos
        .checked_add(length)
        .filter(|end_pos| *end_pos <= base_len)
        .ok_or_else(|| {
            DiffError::PatchFailed(format!("{} operation exceeds base content length", op))
        })
}

fn wire_length(op: &str, length: usize) -> Result<u32, DiffError> {
    u32::try_from(length).map_err(|_| {
        DiffError::Unencodable(format!("{} length too large: {} bytes (max u32)", op, length))
    })
}
