//! Messages exchanged between endpoints and the header that frames them.
//!
//! Every logical message travels as two parts:
//!
//! ```text
//! part 0: [u8 code][u64 BE body size][i32 BE sequence number]   (HEADER_MSG_SIZE bytes)
//! part 1: [body size bytes of opaque payload]
//! ```
//!
//! The delivery status is never on the wire. It is derived from what the
//! socket reported: a timeout, a termination, a malformed header, or a message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Header code for messages that carry no request type (sync replies).
pub const NO_HEADER: u8 = 0;

/// Header code reserved for server shutdown.
pub const SHUTDOWN_HEADER: u8 = 220;

/// Payload sent along with [`SHUTDOWN_HEADER`].
pub const SHUTDOWN_PAYLOAD: [u8; 4] = [0, 0, 1, 1];

/// Sequence number for messages without in-order delivery.
pub const NO_SEQUENCE_NUM: i32 = -1;

/// Encoded size of a [`MessageHeader`].
pub const HEADER_MSG_SIZE: usize = 1 + 8 + 4;

/// Delivery status of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Success,
    Timeout,
    Term,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Success => "SUCCESS",
            MessageStatus::Timeout => "TIMEOUT",
            MessageStatus::Term => "TERM",
            MessageStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Owned message body plus the metadata recovered from its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    code: u8,
    sequence_num: i32,
    data: Bytes,
    status: MessageStatus,
}

impl Message {
    /// A successfully received message.
    pub fn new(code: u8, data: Bytes, sequence_num: i32) -> Self {
        Self {
            code,
            sequence_num,
            data,
            status: MessageStatus::Success,
        }
    }

    /// An empty message carrying only a status.
    pub fn empty(status: MessageStatus) -> Self {
        Self {
            code: NO_HEADER,
            sequence_num: NO_SEQUENCE_NUM,
            data: Bytes::new(),
            status,
        }
    }

    pub fn timeout() -> Self {
        Self::empty(MessageStatus::Timeout)
    }

    pub fn term() -> Self {
        Self::empty(MessageStatus::Term)
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn sequence_num(&self) -> i32 {
        self.sequence_num
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Interpret the payload as UTF-8, for logging and tests.
    pub fn data_as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Decode the payload as JSON.
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Fixed-size header preceding every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub code: u8,
    pub body_size: u64,
    pub sequence_num: i32,
}

impl MessageHeader {
    pub fn new(code: u8, body_size: usize, sequence_num: i32) -> Self {
        Self {
            code,
            body_size: body_size as u64,
            sequence_num,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_MSG_SIZE);
        buf.put_u8(self.code);
        buf.put_u64(self.body_size);
        buf.put_i32(self.sequence_num);
        buf.freeze()
    }

    /// Decode a header part. Returns `None` if the part has the wrong size.
    pub fn decode(mut part: &[u8]) -> Option<Self> {
        if part.len() != HEADER_MSG_SIZE {
            return None;
        }
        let code = part.get_u8();
        let body_size = part.get_u64();
        let sequence_num = part.get_i32();
        Some(Self {
            code,
            body_size,
            sequence_num,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.code == SHUTDOWN_HEADER
    }
}
