//! Message framing: header + body, in both directions.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{WireError, WireResult};
use crate::header::{HEADER_LEN, MAX_MESSAGE_SIZE, MessageHeader, OpCode};

/// `flag_bits` (u32) + section kind byte.
const MSG_PREFIX_LEN: usize = 5;

/// `response_flags` + `cursor_id` + `starting_from` + `number_returned`.
const REPLY_PREFIX_LEN: usize = 20;

const CHECKSUM_PRESENT: u32 = 1;

/// A decoded message: its header plus the encoded document it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    /// Codec-encoded document bytes (section payload).
    pub document: Vec<u8>,
}

/// Frame an encoded command document as a `Msg` message.
///
/// The resulting header's `message_length` always equals the total frame
/// length, i.e. `HEADER_LEN` plus the body (flag bits, section kind,
/// document).
pub fn encode_message(request_id: i32, response_to: i32, document: &[u8]) -> WireResult<Vec<u8>> {
    let total = HEADER_LEN + MSG_PREFIX_LEN + document.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(WireError::InvalidLength(total as i64));
    }

    let header = MessageHeader {
        message_length: total as i32,
        request_id,
        response_to,
        op_code: OpCode::Msg,
    };

    let mut buf = Vec::with_capacity(total);
    header.write_to(&mut buf);
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.push(0);
    buf.extend_from_slice(document);
    Ok(buf)
}

/// Split a complete frame into its header and document bytes.
pub fn decode_message(frame: &[u8]) -> WireResult<Message> {
    let header = MessageHeader::parse(frame)?;
    let expected = header.message_length as usize;
    if frame.len() < expected {
        return Err(WireError::Truncated {
            needed: expected,
            available: frame.len(),
        });
    }
    if frame.len() > expected {
        return Err(WireError::InvalidLength(frame.len() as i64));
    }

    let body = &frame[HEADER_LEN..];
    let document = match header.op_code {
        OpCode::Msg => {
            if body.len() < MSG_PREFIX_LEN {
                return Err(WireError::Truncated {
                    needed: HEADER_LEN + MSG_PREFIX_LEN,
                    available: frame.len(),
                });
            }
            let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            if flags & CHECKSUM_PRESENT != 0 {
                tracing::debug!(
                    request_id = header.request_id,
                    flags,
                    "rejecting checksummed message"
                );
                return Err(WireError::Unsupported("checksummed messages".into()));
            }
            if body[4] != 0 {
                tracing::debug!(
                    request_id = header.request_id,
                    kind = body[4],
                    "rejecting section kind"
                );
                return Err(WireError::Unsupported(format!("section kind {}", body[4])));
            }
            body[MSG_PREFIX_LEN..].to_vec()
        }
        OpCode::Reply => {
            if body.len() < REPLY_PREFIX_LEN {
                return Err(WireError::Truncated {
                    needed: HEADER_LEN + REPLY_PREFIX_LEN,
                    available: frame.len(),
                });
            }
            body[REPLY_PREFIX_LEN..].to_vec()
        }
        OpCode::Query => {
            tracing::debug!(request_id = header.request_id, "rejecting legacy query frame");
            return Err(WireError::Unsupported(format!("{} frames", header.op_code)));
        }
    };

    Ok(Message { header, document })
}

/// Read exactly one frame from `reader`.
///
/// Reads the header, validates the advertised length, then reads the
/// remaining body bytes. Returns the whole frame including the header.
pub async fn read_frame<R>(reader: &mut R) -> WireResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut frame = vec![0u8; HEADER_LEN];
    reader.read_exact(&mut frame).await?;
    let header = MessageHeader::parse(&frame)?;
    tracing::trace!(
        request_id = header.request_id,
        response_to = header.response_to,
        op_code = %header.op_code,
        length = header.message_length,
        "frame header read"
    );

    frame.resize(header.message_length as usize, 0);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(frame)
}
