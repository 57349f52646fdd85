use bytes::Bytes;

use super::bitfield::Bitfield;
use super::extension::ExtensionHandshake;
use super::peer_id::PeerId;
use super::pex::PexMessage;
use super::piece::{Block, BlockRequest};

/// Something that happened on a peer connection.
///
/// [`PeerConnection::process`](super::PeerConnection::process) queues one event
/// per inbound protocol message, in wire order. Callers drain them with
/// [`PeerConnection::next_event`](super::PeerConnection::next_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer's 68-byte handshake arrived and was accepted.
    HandshakeComplete { peer_id: PeerId, reserved: [u8; 8] },
    /// The connection was torn down. Raised exactly once.
    DroppedConnection,
    /// A poll found nothing to read.
    NoData,
    KeepAlive,
    Choke,
    UnChoke,
    Interested,
    NotInterested,
    Have(u32),
    BitField(Bitfield),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Port(u16),
    // Fast extension (BEP-6)
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(BlockRequest),
    AllowedFast(u32),
    // Extension protocol (BEP-10) and its sub-protocols
    ExtendedHandshake(ExtensionHandshake),
    /// Metadata fetched over ut_metadata, verified against the info hash.
    MetadataReceived(Bytes),
    /// The peer refused a ut_metadata piece request.
    MetadataRejected(u32),
    Pex(PexMessage),
}
