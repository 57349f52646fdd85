use super::error::PeerError;
use super::frame::Frame;
use super::piece::{Block, BlockRequest};
use crate::constants::{
    DHT_BIT, EXTENSION_PROTOCOL_BIT, EXTENSION_PROTOCOL_BYTE, FAST_EXTENSION_BIT,
    FAST_EXTENSION_BYTE, HANDSHAKE_LEN, PROTOCOL_STRING, PROTOCOL_STRING_LEN,
};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    /// Fails with the raw byte when it is not a known command. Unknown bytes
    /// are still valid on the wire; extensions may claim them.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            other => Err(other),
        }
    }
}

/// The 68-byte opening exchange of every peer connection.
///
/// `[19]["BitTorrent protocol"][8 reserved][20 info hash][20 peer id]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(reserved: [u8; 8], info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_BIT) != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        (self.reserved[FAST_EXTENSION_BYTE] & FAST_EXTENSION_BIT) != 0
    }

    pub fn supports_dht(&self) -> bool {
        (self.reserved[FAST_EXTENSION_BYTE] & DHT_BIT) != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING_LEN);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Checks the bytes received so far against the fixed protocol prefix.
    ///
    /// Lets a connection reject a foreign protocol as soon as the first
    /// mismatching byte arrives instead of waiting for all 68 bytes.
    pub fn check_prefix(data: &[u8]) -> Result<(), PeerError> {
        if let Some(&len) = data.first() {
            if len != PROTOCOL_STRING_LEN {
                return Err(PeerError::UnsupportedProtocol);
            }
        }
        let literal = &data[1.min(data.len())..data.len().min(1 + PROTOCOL_STRING.len())];
        if !PROTOCOL_STRING.starts_with(literal) {
            return Err(PeerError::UnsupportedProtocol);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        Self::check_prefix(data)?;

        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::MalformedPayload(format!(
                "handshake needs {} bytes, got {}",
                HANDSHAKE_LEN,
                data.len()
            )));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

/// An outbound protocol message.
///
/// Inbound traffic is parsed by the framer and the message handlers into
/// [`PeerEvent`](super::PeerEvent)s; this type only builds frames to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Port(u16),
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject(BlockRequest),
    AllowedFast { piece: u32 },
    // Extension protocol
    Extended { id: u8, payload: Bytes },
}

impl Message {
    pub fn to_frame(&self) -> Frame {
        let (id, payload) = match self {
            Message::KeepAlive => return Frame::KeepAlive,
            Message::Choke => (MessageId::Choke, Bytes::new()),
            Message::Unchoke => (MessageId::Unchoke, Bytes::new()),
            Message::Interested => (MessageId::Interested, Bytes::new()),
            Message::NotInterested => (MessageId::NotInterested, Bytes::new()),
            Message::Have { piece } => (MessageId::Have, piece_payload(*piece)),
            Message::Bitfield(bits) => (MessageId::Bitfield, bits.clone()),
            Message::Request(req) => (MessageId::Request, request_payload(req)),
            Message::Piece(block) => {
                let mut buf = BytesMut::with_capacity(8 + block.data.len());
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.put_slice(&block.data);
                (MessageId::Piece, buf.freeze())
            }
            Message::Cancel(req) => (MessageId::Cancel, request_payload(req)),
            Message::Port(port) => (MessageId::Port, Bytes::copy_from_slice(&port.to_be_bytes())),
            Message::Suggest { piece } => (MessageId::Suggest, piece_payload(*piece)),
            Message::HaveAll => (MessageId::HaveAll, Bytes::new()),
            Message::HaveNone => (MessageId::HaveNone, Bytes::new()),
            Message::Reject(req) => (MessageId::Reject, request_payload(req)),
            Message::AllowedFast { piece } => (MessageId::AllowedFast, piece_payload(*piece)),
            Message::Extended { id, payload } => {
                let mut buf = BytesMut::with_capacity(1 + payload.len());
                buf.put_u8(*id);
                buf.put_slice(payload);
                (MessageId::Extended, buf.freeze())
            }
        };
        Frame::new(id as u8, payload)
    }

    pub fn encode(&self) -> Bytes {
        self.to_frame().encode()
    }
}

fn piece_payload(piece: u32) -> Bytes {
    Bytes::copy_from_slice(&piece.to_be_bytes())
}

fn request_payload(req: &BlockRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u32(req.index);
    buf.put_u32(req.begin);
    buf.put_u32(req.length);
    buf.freeze()
}
