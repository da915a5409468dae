//! Binary delta wire format definitions

/// Binary delta operation codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    /// Copy bytes from the previous snapshot
    Copy = 0x01,
    /// Insert new data
    Insert = 0x02,
    /// Skip bytes of the previous snapshot
    Delete = 0x03,
    /// End of delta stream
    End = 0x04,
}

impl DiffOp {
    /// Width in bytes of the big-endian length that follows every opcode except END
    pub const LENGTH_WIDTH: usize = 4;

    /// Convert from byte value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Copy),
            0x02 => Some(Self::Insert),
            0x03 => Some(Self::Delete),
            0x04 => Some(Self::End),
            _ => None,
        }
    }

    /// Convert to byte value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if operation is followed by a length
    pub fn requires_length(self) -> bool {
        matches!(self, Self::Copy | Self::Insert | Self::Delete)
    }

    /// Check if operation carries a data payload
    pub fn requires_data(self) -> bool {
        matches!(self, Self::Insert)
    }
}
