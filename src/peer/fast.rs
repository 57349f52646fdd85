use std::any::Any;
use std::collections::HashSet;
use std::net::IpAddr;

use bytes::{Buf, Bytes};
use sha1::{Digest, Sha1};
use tracing::trace;

use super::capability::{ExtensionContext, ExtensionDescriptor, PeerExtension};
use super::error::PeerError;
use super::event::PeerEvent;
use super::message::{Message, MessageId};
use super::piece::BlockRequest;
use crate::constants::{ALLOWED_FAST_SET_SIZE, FAST_EXTENSION_BIT, FAST_EXTENSION_BYTE};

/// Fast Extension (BEP-6) bookkeeping for one peer.
#[derive(Debug, Clone, Default)]
pub struct FastExtensionState {
    /// Pieces the remote peer has allowed us to download while choked.
    pub allowed_fast_incoming: HashSet<u32>,
    /// Pieces we have allowed the remote peer to download while choked.
    pub allowed_fast_outgoing: HashSet<u32>,
    /// Pieces the remote peer has suggested, oldest first.
    pub suggested_pieces: Vec<u32>,
    pub peer_has_all: bool,
    pub peer_has_none: bool,
}

impl FastExtensionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_request_while_choked(&self, piece: u32) -> bool {
        self.allowed_fast_incoming.contains(&piece)
    }

    pub fn should_serve_choked_request(&self, piece: u32) -> bool {
        self.allowed_fast_outgoing.contains(&piece)
    }

    fn add_suggested(&mut self, piece: u32) {
        if !self.suggested_pieces.contains(&piece) {
            self.suggested_pieces.push(piece);
        }
    }

    fn set_have_all(&mut self) {
        self.peer_has_all = true;
        self.peer_has_none = false;
    }

    fn set_have_none(&mut self) {
        self.peer_has_none = true;
        self.peer_has_all = false;
    }

    pub fn clear(&mut self) {
        self.allowed_fast_incoming.clear();
        self.allowed_fast_outgoing.clear();
        self.suggested_pieces.clear();
        self.peer_has_all = false;
        self.peer_has_none = false;
    }
}

/// Generates the canonical allowed fast set for a peer (BEP-6).
///
/// The set depends only on the peer's address (masked to /24 for IPv4) and the
/// info hash, so both sides can compute it. At most `num_pieces` indices are
/// returned.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    let set_size = set_size.min(num_pieces as usize);
    let mut allowed_set = Vec::with_capacity(set_size);
    if set_size == 0 {
        return allowed_set;
    }

    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], octets[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip_bytes);
    x.extend_from_slice(info_hash);

    while allowed_set.len() < set_size {
        let hash = Sha1::digest(&x);

        for chunk in hash.chunks(4) {
            if allowed_set.len() >= set_size {
                break;
            }

            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;

            if !allowed_set.contains(&index) {
                allowed_set.push(index);
            }
        }

        x = hash.to_vec();
    }

    allowed_set
}

/// The Fast Extension as a capability module.
///
/// Sets reserved bit 0x04 of byte 7 and claims commands 13 to 17 (Suggest,
/// HaveAll, HaveNone, Reject, AllowedFast).
#[derive(Debug, Default)]
pub struct FastExtension {
    state: FastExtensionState,
}

impl FastExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &FastExtensionState {
        &self.state
    }

    /// Computes the allowed fast set for a peer at `peer_ip` and sends an
    /// AllowedFast message for each piece in it.
    pub fn grant_allowed_fast(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        peer_ip: IpAddr,
        num_pieces: u32,
    ) -> Result<Vec<u32>, PeerError> {
        let info_hash = ctx
            .state()
            .info_hash
            .ok_or_else(|| PeerError::Extension("no info hash before handshake".into()))?;

        let pieces =
            generate_allowed_fast_set(&info_hash, peer_ip, num_pieces, ALLOWED_FAST_SET_SIZE);
        for &piece in &pieces {
            if self.state.allowed_fast_outgoing.insert(piece) {
                ctx.send(&Message::AllowedFast { piece });
            }
        }
        Ok(pieces)
    }
}

fn piece_index(payload: &Bytes, what: &str) -> Result<u32, PeerError> {
    if payload.len() < 4 {
        return Err(PeerError::MalformedPayload(format!(
            "{} needs 4 bytes, got {}",
            what,
            payload.len()
        )));
    }
    Ok(payload.clone().get_u32())
}

impl PeerExtension for FastExtension {
    fn descriptor(&self) -> ExtensionDescriptor {
        let mut reserved = [0u8; 8];
        reserved[FAST_EXTENSION_BYTE] = FAST_EXTENSION_BIT;
        ExtensionDescriptor {
            name: "fast",
            reserved,
            commands: &[
                MessageId::Suggest as u8,
                MessageId::HaveAll as u8,
                MessageId::HaveNone as u8,
                MessageId::Reject as u8,
                MessageId::AllowedFast as u8,
            ],
        }
    }

    fn on_command(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        id: u8,
        payload: &Bytes,
    ) -> Result<bool, PeerError> {
        let Ok(id) = MessageId::try_from(id) else {
            return Ok(false);
        };

        let event = match id {
            MessageId::Suggest => {
                let piece = piece_index(payload, "suggest")?;
                self.state.add_suggested(piece);
                PeerEvent::Suggest(piece)
            }
            MessageId::HaveAll => {
                self.state.set_have_all();
                PeerEvent::HaveAll
            }
            MessageId::HaveNone => {
                self.state.set_have_none();
                PeerEvent::HaveNone
            }
            MessageId::Reject => {
                if payload.len() < 12 {
                    return Err(PeerError::MalformedPayload(format!(
                        "reject needs 12 bytes, got {}",
                        payload.len()
                    )));
                }
                let mut buf = payload.clone();
                PeerEvent::Reject(BlockRequest::new(buf.get_u32(), buf.get_u32(), buf.get_u32()))
            }
            MessageId::AllowedFast => {
                let piece = piece_index(payload, "allowed fast")?;
                self.state.allowed_fast_incoming.insert(piece);
                PeerEvent::AllowedFast(piece)
            }
            _ => return Ok(false),
        };

        trace!(?event, "fast extension message");
        ctx.emit(event);
        Ok(true)
    }

    fn on_teardown(&mut self) {
        self.state.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
