//! Length-prefixed frame codec.
//!
//! Wire format: a 4-byte big-endian payload length followed by the payload.
//! Used by the `kiln-echo` demo binary and the end-to-end tests.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use protocol_echo::Frame;
//!
//! let mut buf = BytesMut::new();
//! Frame::new(b"abc".to_vec()).encode(&mut buf);
//! assert_eq!(&buf[..], b"\x00\x00\x00\x03abc");
//!
//! let (frame, consumed) = Frame::parse(&buf).unwrap();
//! assert_eq!(frame.payload(), b"abc");
//! assert_eq!(consumed, 7);
//! ```

use bytes::{BufMut, BytesMut};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a peer may send. Larger prefixes are treated as a
/// framing error rather than a reason to buffer without bound.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Parse error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    #[error("incomplete")]
    Incomplete,
    /// Declared payload length exceeds [`MAX_PAYLOAD`].
    #[error("frame of {0} bytes exceeds maximum")]
    Oversize(usize),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    /// Wrap a payload in a frame.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// The frame payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Parse one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Incomplete);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(ParseError::Oversize(len));
        }
        if data.len() < HEADER_LEN + len {
            return Err(ParseError::Incomplete);
        }
        let frame = Frame {
            payload: data[HEADER_LEN..HEADER_LEN + len].to_vec(),
        };
        Ok((frame, HEADER_LEN + len))
    }

    /// Append the encoded frame to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(HEADER_LEN + self.payload.len());
        out.put_u32(self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
    }

    /// Returns the encoded length of this frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}
