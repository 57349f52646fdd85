//! Length-prefixed message framing.
//!
//! Every message after the handshake is `[4-byte big-endian length][id][payload]`,
//! where the length counts the id byte plus the payload. A length of zero is a
//! keep-alive and carries no id byte.

use super::error::PeerError;
use super::message::Handshake;
use crate::constants::{HANDSHAKE_LEN, LENGTH_PREFIX_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One protocol message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The zero-length frame.
    KeepAlive,
    /// A command byte and its payload. `length` is the declared frame length,
    /// which is `1 + payload.len()` for every frame this module produces.
    Message { id: u8, length: u32, payload: Bytes },
}

impl Frame {
    pub fn new(id: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Frame::Message {
            id,
            length: 1 + payload.len() as u32,
            payload,
        }
    }

    /// The command byte, or `None` for a keep-alive.
    pub fn id(&self) -> Option<u8> {
        match self {
            Frame::KeepAlive => None,
            Frame::Message { id, .. } => Some(*id),
        }
    }

    /// The declared frame length (0 for a keep-alive).
    pub fn length(&self) -> u32 {
        match self {
            Frame::KeepAlive => 0,
            Frame::Message { length, .. } => *length,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::KeepAlive => &[],
            Frame::Message { payload, .. } => payload,
        }
    }

    /// Bytes this frame occupies on the wire, including the length prefix.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN + self.length() as usize
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::KeepAlive => buf.put_u32(0),
            Frame::Message { id, payload, .. } => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }
}

/// Reads the declared frame length, if the 4-byte prefix is buffered.
pub fn declared_length(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; 4] = buf.get(..LENGTH_PREFIX_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Parses one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it consumed, or `None` when the
/// buffer holds less than one complete frame. A partial frame is not an error;
/// the caller keeps the bytes and tries again after the next read.
///
/// ```
/// use peerwire::peer::{try_parse_one, Frame};
///
/// assert_eq!(try_parse_one(&[0, 0, 0, 0, 9]), Some((Frame::KeepAlive, 4)));
/// assert_eq!(try_parse_one(&[0, 0, 0, 5, 4, 0]), None);
/// ```
pub fn try_parse_one(buf: &[u8]) -> Option<(Frame, usize)> {
    let length = declared_length(buf)?;
    let total = LENGTH_PREFIX_LEN + length;
    if buf.len() < total {
        return None;
    }
    let frame = parse_complete(Bytes::copy_from_slice(&buf[LENGTH_PREFIX_LEN..total]));
    Some((frame, total))
}

/// `body` is exactly the declared length worth of bytes after the prefix.
fn parse_complete(mut body: Bytes) -> Frame {
    if body.is_empty() {
        return Frame::KeepAlive;
    }
    let length = body.len() as u32;
    let id = body.get_u8();
    Frame::Message {
        id,
        length,
        payload: body,
    }
}

/// Reassembly buffer for one connection's inbound byte stream.
///
/// Bytes are appended as the transport yields them; complete frames are split
/// off the front without copying and the unconsumed tail waits for more data.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The underlying buffer, for transports that read straight into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the peer's handshake off the front of the stream once all 68 bytes
    /// are buffered. A wrong protocol prefix fails as soon as it is visible.
    pub fn take_handshake(&mut self) -> Result<Option<Handshake>, PeerError> {
        Handshake::check_prefix(&self.buf)?;
        if self.buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let raw = self.buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&raw).map(Some)
    }

    /// Splits the next complete frame off the buffer.
    ///
    /// A declared length above the configured maximum is fatal: waiting for it
    /// would let a peer grow the buffer without bound.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, PeerError> {
        let Some(length) = declared_length(&self.buf) else {
            return Ok(None);
        };
        if length > self.max_frame_len {
            return Err(PeerError::FrameTooLarge(length));
        }
        if self.buf.len() < LENGTH_PREFIX_LEN + length {
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX_LEN);
        let body = self.buf.split_to(length).freeze();
        Ok(Some(parse_complete(body)))
    }
}
