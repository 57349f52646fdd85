use super::bitfield::Bitfield;
use super::choking::ChokingState;
use super::event::PeerEvent;
use super::peer_id::PeerId;

/// The lifecycle phase of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Transport not open yet.
    Connecting,
    /// Transport open, our handshake not sent.
    Connected,
    /// Our handshake is queued, the peer's has not arrived.
    HandshakeSent,
    /// Both handshakes exchanged.
    Established,
    /// Connection has been closed.
    Disconnected,
}

/// Mutable record of one peer connection.
///
/// Owned by exactly one [`PeerConnection`](super::PeerConnection). The
/// extension ID tables live in the registered
/// [`ExtensionProtocol`](super::ExtensionProtocol), which is owned the same way.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub phase: PeerState,
    pub local_peer_id: Option<PeerId>,
    pub remote_peer_id: Option<PeerId>,
    pub info_hash: Option<[u8; 20]>,
    /// Our reserved bytes, the OR of every registered extension's bits.
    pub reserved: [u8; 8],
    pub remote_reserved: Option<[u8; 8]>,
    /// Pieces the peer has told us about via Bitfield, Have, HaveAll and
    /// HaveNone. Sized to `piece_count` when that is known, otherwise it grows
    /// to cover the highest piece announced.
    pub remote_bitfield: Option<Bitfield>,
    /// Set by HaveAll until the piece count is known.
    pub remote_has_all: bool,
    /// Number of pieces in the torrent, if the caller has told us.
    pub piece_count: Option<usize>,
    pub handshake_sent: bool,
    pub handshake_received: bool,
    pub choking: ChokingState,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            phase: PeerState::Connecting,
            local_peer_id: None,
            remote_peer_id: None,
            info_hash: None,
            reserved: [0u8; 8],
            remote_reserved: None,
            remote_bitfield: None,
            remote_has_all: false,
            piece_count: None,
            handshake_sent: false,
            handshake_received: false,
            choking: ChokingState::default(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }

    /// The info hash as 40 lowercase hex characters.
    pub fn info_hash_hex(&self) -> Option<String> {
        self.info_hash.map(hex::encode)
    }

    /// Folds an inbound event into the connection record.
    pub(crate) fn observe(&mut self, event: &PeerEvent) {
        match event {
            PeerEvent::Choke => self.choking.peer_choking = true,
            PeerEvent::UnChoke => self.choking.peer_choking = false,
            PeerEvent::Interested => self.choking.peer_interested = true,
            PeerEvent::NotInterested => self.choking.peer_interested = false,
            PeerEvent::Have(index) => self.observe_have(*index as usize),
            PeerEvent::BitField(bitfield) => {
                let mut bitfield = bitfield.clone();
                if let Some(count) = self.piece_count {
                    bitfield.resize(count);
                }
                self.remote_bitfield = Some(bitfield);
                self.remote_has_all = false;
            }
            PeerEvent::HaveAll => {
                self.remote_has_all = self.piece_count.is_none();
                self.remote_bitfield = self.piece_count.map(Bitfield::full);
            }
            PeerEvent::HaveNone => {
                self.remote_has_all = false;
                self.remote_bitfield = Some(Bitfield::new(self.piece_count.unwrap_or(0)));
            }
            PeerEvent::Piece(block) => self.bytes_downloaded += block.data.len() as u64,
            _ => {}
        }
    }

    /// Records the torrent's piece count and sizes the peer's bitfield to it.
    /// A pending HaveAll becomes a full bitfield.
    pub fn set_piece_count(&mut self, piece_count: usize) {
        self.piece_count = Some(piece_count);
        if self.remote_has_all {
            self.remote_has_all = false;
            self.remote_bitfield = Some(Bitfield::full(piece_count));
        } else if let Some(bitfield) = self.remote_bitfield.as_mut() {
            bitfield.resize(piece_count);
        }
    }

    /// Whether the peer has announced `piece`.
    pub fn peer_has(&self, piece: usize) -> bool {
        self.remote_has_all
            || self
                .remote_bitfield
                .as_ref()
                .is_some_and(|bitfield| bitfield.has(piece))
    }

    fn observe_have(&mut self, piece: usize) {
        if self.remote_has_all {
            return;
        }
        let count = self.piece_count;
        let bitfield = self
            .remote_bitfield
            .get_or_insert_with(|| Bitfield::new(count.unwrap_or(0)));
        if count.is_none() && piece >= bitfield.len() {
            bitfield.resize(piece + 1);
        }
        bitfield.set(piece);
    }

    /// Moves to `Established` once both handshakes are through.
    pub(crate) fn advance_phase(&mut self) {
        if self.phase == PeerState::Disconnected {
            return;
        }
        self.phase = match (self.handshake_sent, self.handshake_received) {
            (true, true) => PeerState::Established,
            (true, false) => PeerState::HandshakeSent,
            _ => self.phase,
        };
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
