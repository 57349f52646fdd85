//! peerwire - the BitTorrent peer wire protocol engine
//!
//! This library implements the per-connection half of BitTorrent: the wire
//! codec, handshake, message dispatch, and extension negotiation. Trackers,
//! DHT, storage, and piece selection are left to the caller, which consumes the
//! [`PeerEvent`]s a connection raises.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`peer`] - BEP-3/6/9/10/11 peer wire protocol, fast extension, extension protocol
//! - [`constants`] - Wire constants and defaults

pub mod bencode;
pub mod constants;
pub mod peer;

pub use bencode::{decode, decode_prefix, encode, BencodeError, Dict, Value};
pub use peer::{
    Bitfield, Block, BlockRequest, ExtensionHandshake, ExtensionProtocol, FastExtension, Frame,
    Handshake, Message, PeerConfig, PeerConnection, PeerError, PeerEvent, PeerExtension, PeerId,
    PeerState, PeerTransport, SubProtocol, TcpTransport, UtMetadata, UtPex,
};
