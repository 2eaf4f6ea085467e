//! Fixed-size message header.

use crate::error::{WireError, WireResult};

/// Size of the standard message header in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest message the driver will read or write (48 MB).
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Wire opcode carried in every header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Legacy server reply.
    Reply,
    /// Legacy client query. Never sent by this driver and rejected when read.
    Query,
    /// Extensible message used for every command in both directions.
    Msg,
}

impl OpCode {
    /// Numeric value written on the wire.
    pub fn code(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Query => 2004,
            OpCode::Msg => 2013,
        }
    }
}

impl TryFrom<i32> for OpCode {
    type Error = WireError;

    fn try_from(value: i32) -> WireResult<Self> {
        match value {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Msg),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpCode::Reply => write!(f, "OP_REPLY"),
            OpCode::Query => write!(f, "OP_QUERY"),
            OpCode::Msg => write!(f, "OP_MSG"),
        }
    }
}

/// The 16-byte header preceding every message.
///
/// `response_to` is 0 for client-originated messages and echoes the
/// request's `request_id` on server replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length including this header.
    pub message_length: i32,
    /// Sender-assigned identifier, unique per connection while outstanding.
    pub request_id: i32,
    /// Correlation id of the request this message answers.
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Append the little-endian encoding of this header to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&self.op_code.code().to_le_bytes());
    }

    /// Parse a header from the first [`HEADER_LEN`] bytes of `bytes`.
    ///
    /// Validates that the advertised length is within
    /// `[HEADER_LEN, MAX_MESSAGE_SIZE]`.
    pub fn parse(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let field = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let message_length = field(0);
        if message_length < HEADER_LEN as i32 || message_length as i64 > MAX_MESSAGE_SIZE as i64 {
            return Err(WireError::InvalidLength(message_length as i64));
        }

        Ok(Self {
            message_length,
            request_id: field(4),
            response_to: field(8),
            op_code: OpCode::try_from(field(12))?,
        })
    }

    /// Number of body bytes following the header.
    pub fn body_len(&self) -> usize {
        self.message_length as usize - HEADER_LEN
    }
}
