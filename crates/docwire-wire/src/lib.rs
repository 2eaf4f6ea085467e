//! docwire-wire: framing contract and document codec for the docwire driver.
//!
//! Every message on the wire is a 16-byte little-endian header followed by a
//! body. Outbound commands use the `Msg` opcode with a single kind-0 section
//! carrying the codec-encoded command document:
//!
//! ```text
//! [message_length i32][request_id i32][response_to i32][op_code i32]
//! [flag_bits u32][section kind u8 = 0][document bytes ...]
//! ```
//!
//! The document encoding itself is pluggable through [`DocumentCodec`];
//! [`JsonCodec`] is the default implementation.

pub mod codec;
pub mod error;
pub mod header;
pub mod message;

pub use codec::{Document, DocumentCodec, JsonCodec};
pub use error::{WireError, WireResult};
pub use header::{HEADER_LEN, MAX_MESSAGE_SIZE, MessageHeader, OpCode};
pub use message::{Message, decode_message, encode_message, read_frame};
