//! Peer wire protocol (BEP-3, BEP-6, BEP-9, BEP-10, BEP-11)
//!
//! A [`PeerConnection`] drives one peer over any [`PeerTransport`]: it frames
//! the byte stream, validates base messages, and hands the commands it does not
//! own to its capability modules. The BEP-10 [`ExtensionProtocol`] module in
//! turn multiplexes named sub-protocols such as [`UtMetadata`] and [`UtPex`].

mod bitfield;
mod capability;
mod choking;
mod config;
mod connection;
mod error;
mod event;
mod extension;
mod fast;
mod frame;
mod handlers;
mod message;
mod metadata;
mod peer_id;
mod pex;
mod piece;
mod state;
mod transport;

pub use bitfield::Bitfield;
pub use capability::{ExtensionContext, ExtensionDescriptor, PeerExtension};
pub use choking::ChokingState;
pub use config::PeerConfig;
pub use connection::PeerConnection;
pub use error::PeerError;
pub use event::PeerEvent;
pub use extension::{ExtensionHandshake, ExtensionProtocol, SubProtocol, SubProtocolContext};
pub use fast::{generate_allowed_fast_set, FastExtension, FastExtensionState};
pub use frame::{declared_length, try_parse_one, Frame, FrameBuffer};
pub use handlers::{dispatch, handler_for, HandlerOutcome, MessageHandler};
pub use message::{Handshake, Message, MessageId};
pub use metadata::{
    metadata_piece_count, metadata_piece_size, MetadataMessage, MetadataMessageType, UtMetadata,
};
pub use peer_id::PeerId;
pub use pex::{PexFlags, PexMessage, PexPeer, UtPex};
pub use piece::{Block, BlockRequest};
pub use state::{ConnectionState, PeerState};
pub use transport::{PeerTransport, TcpTransport};

#[cfg(test)]
mod tests;
