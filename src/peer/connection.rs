use std::io;
use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::bitfield::Bitfield;
use super::capability::{ExtensionContext, Outbox, PeerExtension};
use super::config::PeerConfig;
use super::error::PeerError;
use super::event::PeerEvent;
use super::extension::{ExtensionProtocol, SubProtocol, SubProtocolContext};
use super::frame::{Frame, FrameBuffer};
use super::handlers::{self, HandlerOutcome};
use super::message::{Handshake, Message, MessageId};
use super::peer_id::PeerId;
use super::piece::{Block, BlockRequest};
use super::state::{ConnectionState, PeerState};
use super::transport::PeerTransport;
use crate::constants::{INFO_HASH_LEN, MIN_OBFUSCATION_PIECES, OBFUSCATED_PIECES};

/// One peer connection, driven by repeated calls to [`process`](Self::process).
///
/// The connection never spawns tasks or blocks. Each `process` call reads what
/// the transport has, dispatches every complete frame in wire order, and writes
/// out whatever is queued. Inbound messages become [`PeerEvent`]s, which the
/// caller drains with [`next_event`](Self::next_event).
///
/// Capability modules ([`ExtensionProtocol`], [`FastExtension`](super::FastExtension))
/// are registered before the handshake and belong to this connection alone.
///
/// # Examples
///
/// ```no_run
/// use peerwire::peer::{
///     ExtensionProtocol, PeerConfig, PeerConnection, PeerEvent, PeerId, TcpTransport, UtMetadata,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = ExtensionProtocol::new().with(UtMetadata::new())?;
/// let mut conn = PeerConnection::new(TcpTransport::new(), PeerConfig::default())
///     .extension(registry);
///
/// conn.connect("192.168.1.100:6881".parse()?).await?;
/// conn.handshake(
///     "0123456789abcdef0123456789abcdef01234567",
///     PeerId::generate().as_bytes(),
/// )?;
///
/// while conn.process() {
///     while let Some(event) = conn.next_event() {
///         if let PeerEvent::MetadataReceived(info) = event {
///             println!("got {} bytes of metadata", info.len());
///         }
///     }
///     conn.transport().readable().await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct PeerConnection<T: PeerTransport> {
    transport: T,
    config: PeerConfig,
    state: ConnectionState,
    extensions: Vec<Box<dyn PeerExtension>>,
    outbox: Outbox,
    frames: FrameBuffer,
    rng: SmallRng,
    last_keep_alive: Instant,
    remote_info_hash: Option<[u8; INFO_HASH_LEN]>,
}

impl<T: PeerTransport> PeerConnection<T> {
    pub fn new(transport: T, config: PeerConfig) -> Self {
        let mut state = ConnectionState::new();
        if transport.is_connected() {
            state.phase = PeerState::Connected;
        }
        let rng = match config.obfuscation_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_rng(&mut rand::rng()),
        };

        Self {
            frames: FrameBuffer::new(config.max_frame_len),
            transport,
            config,
            state,
            extensions: Vec::new(),
            outbox: Outbox::default(),
            rng,
            last_keep_alive: Instant::now(),
            remote_info_hash: None,
        }
    }

    /// Registers a capability module.
    pub fn extension(mut self, extension: impl PeerExtension) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    /// Registers a capability module. Modules must be in place before our
    /// handshake goes out, since their reserved bits are part of it.
    pub fn add_extension(&mut self, extension: Box<dyn PeerExtension>) -> Result<(), PeerError> {
        if self.state.handshake_sent {
            return Err(PeerError::InvalidArgument(
                "extensions must be registered before the handshake".into(),
            ));
        }
        self.extensions.push(extension);
        Ok(())
    }

    /// Opens the transport. The handshake is a separate step.
    pub async fn connect(&mut self, addr: SocketAddr) -> Result<(), PeerError> {
        if self.state.phase == PeerState::Disconnected {
            return Err(PeerError::ConnectionClosed);
        }
        self.transport.connect(addr).await?;
        self.state.phase = PeerState::Connected;
        debug!(%addr, "transport connected");
        Ok(())
    }

    /// Queues our 68-byte handshake, then lets each capability module send
    /// whatever it needs to (the extension protocol sends its own handshake
    /// dictionary here).
    ///
    /// `info_hash` is 40 hex characters and `peer_id` exactly 20 bytes; anything
    /// else fails with [`PeerError::InvalidArgument`] before anything is queued.
    pub fn handshake(&mut self, info_hash: &str, peer_id: &[u8]) -> Result<(), PeerError> {
        let mut hash = [0u8; INFO_HASH_LEN];
        if info_hash.len() != INFO_HASH_LEN * 2 {
            return Err(PeerError::InvalidArgument(format!(
                "info hash must be {} hex characters, got {}",
                INFO_HASH_LEN * 2,
                info_hash.len()
            )));
        }
        hex::decode_to_slice(info_hash, &mut hash)
            .map_err(|e| PeerError::InvalidArgument(format!("info hash: {}", e)))?;
        let peer_id = PeerId::try_from(peer_id)?;

        if self.state.phase == PeerState::Disconnected {
            return Err(PeerError::ConnectionClosed);
        }
        if self.state.handshake_sent {
            return Err(PeerError::InvalidArgument("handshake already sent".into()));
        }
        if self.remote_info_hash.is_some_and(|remote| remote != hash) {
            self.teardown();
            return Err(PeerError::InfoHashMismatch);
        }

        let reserved = self
            .extensions
            .iter()
            .map(|ext| ext.descriptor().reserved)
            .fold([0u8; 8], |mut acc, bits| {
                for (a, b) in acc.iter_mut().zip(bits) {
                    *a |= b;
                }
                acc
            });

        self.state.info_hash = Some(hash);
        self.state.local_peer_id = Some(peer_id);
        self.state.reserved = reserved;

        let handshake = Handshake::new(reserved, hash, peer_id.0);
        self.outbox.frames.push_back(handshake.encode());
        self.state.handshake_sent = true;
        self.state.advance_phase();
        debug!(info_hash = %info_hash, "handshake queued");

        for ext in self.extensions.iter_mut() {
            let mut ctx = ExtensionContext::new(&self.state, &mut self.outbox);
            if let Err(e) = ext.on_handshake(&mut ctx, &handshake) {
                debug!(extension = ext.descriptor().name, error = %e, "extension handshake failed");
                self.teardown();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Runs one non-blocking poll. Returns `false` once the connection is down.
    ///
    /// Never fails: transport faults and protocol violations tear the
    /// connection down and raise [`PeerEvent::DroppedConnection`].
    pub fn process(&mut self) -> bool {
        if self.state.phase == PeerState::Disconnected {
            return false;
        }
        if !self.transport.is_connected() {
            if self.state.phase == PeerState::Connecting {
                return true;
            }
            debug!("transport lost");
            self.teardown();
            return false;
        }

        match self.poll() {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "dropping peer connection");
                self.teardown();
                false
            }
        }
    }

    fn poll(&mut self) -> Result<(), PeerError> {
        self.maybe_keep_alive();
        let received = self.read_available()?;
        self.consume()?;
        self.flush()?;
        if received == 0 && self.config.emit_no_data {
            self.outbox.events.push_back(PeerEvent::NoData);
        }
        Ok(())
    }

    fn maybe_keep_alive(&mut self) {
        if self.state.handshake_received
            && self.last_keep_alive.elapsed() > self.config.keep_alive_interval
        {
            trace!("queuing keep-alive");
            self.outbox.push_frame(&Frame::KeepAlive);
            self.last_keep_alive = Instant::now();
        }
    }

    fn read_available(&mut self) -> Result<usize, PeerError> {
        let mut total = 0;
        while total < self.config.read_chunk_size {
            let buf = self.frames.buffer_mut();
            buf.reserve(self.config.read_chunk_size - total);
            match self.transport.try_read(buf) {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if total > 0 {
            trace!(bytes = total, buffered = self.frames.len(), "read from peer");
        }
        Ok(total)
    }

    fn consume(&mut self) -> Result<(), PeerError> {
        if !self.state.handshake_received {
            let Some(handshake) = self.frames.take_handshake()? else {
                return Ok(());
            };
            self.accept_handshake(handshake)?;
        }

        while let Some(frame) = self.frames.next_frame()? {
            self.dispatch(frame)?;
        }
        Ok(())
    }

    fn accept_handshake(&mut self, handshake: Handshake) -> Result<(), PeerError> {
        if let Some(ours) = self.state.info_hash {
            if ours != handshake.info_hash {
                return Err(PeerError::InfoHashMismatch);
            }
        }

        let peer_id = PeerId::from(handshake.peer_id);
        debug!(
            peer_id = %peer_id,
            extension_protocol = handshake.supports_extension_protocol(),
            fast = handshake.supports_fast_extension(),
            "peer handshake received"
        );

        self.remote_info_hash = Some(handshake.info_hash);
        self.state.remote_peer_id = Some(peer_id);
        self.state.remote_reserved = Some(handshake.reserved);
        self.state.handshake_received = true;
        self.state.advance_phase();
        self.outbox.events.push_back(PeerEvent::HandshakeComplete {
            peer_id,
            reserved: handshake.reserved,
        });
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), PeerError> {
        let Frame::Message {
            id,
            length,
            payload,
        } = frame
        else {
            self.push_event(PeerEvent::KeepAlive);
            return Ok(());
        };

        let flag = match MessageId::try_from(id) {
            Ok(MessageId::Choke) => Some(PeerEvent::Choke),
            Ok(MessageId::Unchoke) => Some(PeerEvent::UnChoke),
            Ok(MessageId::Interested) => Some(PeerEvent::Interested),
            Ok(MessageId::NotInterested) => Some(PeerEvent::NotInterested),
            _ => None,
        };
        if let Some(event) = flag {
            self.push_event(event);
            return Ok(());
        }

        let before = self.outbox.events.len();
        match handlers::dispatch(id, length, &payload, &mut self.outbox.events) {
            Some(HandlerOutcome::Handled) => {
                self.observe_from(before);
                return Ok(());
            }
            Some(HandlerOutcome::CloseConnection) => {
                return Err(PeerError::MalformedPayload(format!(
                    "invalid payload for command {}",
                    id
                )));
            }
            None => {}
        }

        for ext in self.extensions.iter_mut() {
            if !ext.descriptor().commands.contains(&id) {
                continue;
            }
            let mut ctx = ExtensionContext::new(&self.state, &mut self.outbox);
            if ext.on_command(&mut ctx, id, &payload)? {
                self.observe_from(before);
                return Ok(());
            }
        }

        trace!(command = id, len = payload.len(), "ignoring unclaimed command");
        Ok(())
    }

    fn push_event(&mut self, event: PeerEvent) {
        self.state.observe(&event);
        self.outbox.events.push_back(event);
    }

    fn observe_from(&mut self, start: usize) {
        for event in self.outbox.events.range(start..) {
            self.state.observe(event);
        }
    }

    fn flush(&mut self) -> Result<(), PeerError> {
        while let Some(front) = self.outbox.frames.front_mut() {
            match self.transport.try_write(front) {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(n) if n >= front.len() => {
                    self.outbox.frames.pop_front();
                }
                Ok(n) => front.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.state.phase == PeerState::Disconnected {
            return;
        }
        self.transport.close();
        for ext in self.extensions.iter_mut() {
            ext.on_teardown();
        }
        self.outbox.frames.clear();
        self.frames.buffer_mut().clear();
        self.state.phase = PeerState::Disconnected;
        self.outbox.events.push_back(PeerEvent::DroppedConnection);
    }

    /// Closes the connection. Raises [`PeerEvent::DroppedConnection`] if it was
    /// still open.
    pub fn disconnect(&mut self) {
        self.teardown();
    }

    /// The next queued event, oldest first.
    pub fn next_event(&mut self) -> Option<PeerEvent> {
        self.outbox.events.pop_front()
    }

    /// Drains every queued event.
    pub fn events(&mut self) -> impl Iterator<Item = PeerEvent> + '_ {
        self.outbox.events.drain(..)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn phase(&self) -> PeerState {
        self.state.phase
    }

    /// Tells the connection how many pieces the torrent has, so the peer's
    /// announced pieces can be sized to it.
    pub fn set_piece_count(&mut self, piece_count: usize) {
        self.state.set_piece_count(piece_count);
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.state.phase != PeerState::Disconnected && self.transport.is_connected()
    }

    /// Frames queued but not yet fully written.
    pub fn pending_frames(&self) -> usize {
        self.outbox.frames.len()
    }

    /// Runs `f` against the registered capability module of type `E`.
    pub fn with_extension<E: PeerExtension, R>(
        &mut self,
        f: impl FnOnce(&mut E, &mut ExtensionContext<'_>) -> R,
    ) -> Option<R> {
        for ext in self.extensions.iter_mut() {
            if let Some(ext) = ext.as_any_mut().downcast_mut::<E>() {
                let mut ctx = ExtensionContext::new(&self.state, &mut self.outbox);
                return Some(f(ext, &mut ctx));
            }
        }
        None
    }

    /// Runs `f` against the BEP-10 sub-protocol of type `S`.
    pub fn with_sub_protocol<S: SubProtocol, R>(
        &mut self,
        f: impl FnOnce(&mut S, &mut SubProtocolContext<'_, '_>) -> R,
    ) -> Option<R> {
        self.with_extension(|ext: &mut ExtensionProtocol, ctx| ext.with_sub_protocol(ctx, f))
            .flatten()
    }

    fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        if self.state.phase == PeerState::Disconnected {
            return Err(PeerError::ConnectionClosed);
        }
        trace!(?message, "queuing message");
        self.outbox.push_frame(&message.to_frame());
        Ok(())
    }

    pub fn send_keep_alive(&mut self) -> Result<(), PeerError> {
        self.send(&Message::KeepAlive)?;
        self.last_keep_alive = Instant::now();
        Ok(())
    }

    pub fn send_choke(&mut self) -> Result<(), PeerError> {
        self.send(&Message::Choke)?;
        self.state.choking.am_choking = true;
        Ok(())
    }

    pub fn send_unchoke(&mut self) -> Result<(), PeerError> {
        self.send(&Message::Unchoke)?;
        self.state.choking.am_choking = false;
        Ok(())
    }

    pub fn send_interested(&mut self) -> Result<(), PeerError> {
        self.send(&Message::Interested)?;
        self.state.choking.am_interested = true;
        Ok(())
    }

    pub fn send_not_interested(&mut self) -> Result<(), PeerError> {
        self.send(&Message::NotInterested)?;
        self.state.choking.am_interested = false;
        Ok(())
    }

    pub fn send_have(&mut self, piece: u32) -> Result<(), PeerError> {
        self.send(&Message::Have { piece })
    }

    /// Sends our bitfield.
    ///
    /// With `obfuscate`, up to 16 random pieces are left out of the bitfield and
    /// announced with Have messages right after it. Bitfields of 32 pieces or
    /// fewer are sent as is.
    pub fn send_bitfield(&mut self, bitfield: &Bitfield, obfuscate: bool) -> Result<(), PeerError> {
        let mut wire = bitfield.clone();
        let mut hidden = Vec::new();

        if obfuscate && bitfield.len() > MIN_OBFUSCATION_PIECES {
            let amount = OBFUSCATED_PIECES.min(bitfield.len());
            for index in rand::seq::index::sample(&mut self.rng, bitfield.len(), amount) {
                if wire.has(index) {
                    wire.clear(index);
                    hidden.push(index as u32);
                }
            }
            hidden.sort_unstable();
        }

        self.send(&Message::Bitfield(wire.to_bytes()))?;
        for piece in hidden {
            self.send(&Message::Have { piece })?;
        }
        Ok(())
    }

    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        self.send(&Message::Request(BlockRequest::new(index, begin, length)))
    }

    pub fn send_piece(
        &mut self,
        index: u32,
        begin: u32,
        data: impl Into<Bytes>,
    ) -> Result<(), PeerError> {
        let block = Block::new(index, begin, data.into());
        let len = block.data.len() as u64;
        self.send(&Message::Piece(block))?;
        self.state.bytes_uploaded += len;
        Ok(())
    }

    pub fn send_cancel(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        self.send(&Message::Cancel(BlockRequest::new(index, begin, length)))
    }

    pub fn send_port(&mut self, port: u16) -> Result<(), PeerError> {
        self.send(&Message::Port(port))
    }

    pub fn send_suggest(&mut self, piece: u32) -> Result<(), PeerError> {
        self.send(&Message::Suggest { piece })
    }

    pub fn send_have_all(&mut self) -> Result<(), PeerError> {
        self.send(&Message::HaveAll)
    }

    pub fn send_have_none(&mut self) -> Result<(), PeerError> {
        self.send(&Message::HaveNone)
    }

    pub fn send_reject(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        self.send(&Message::Reject(BlockRequest::new(index, begin, length)))
    }

    pub fn send_allowed_fast(&mut self, piece: u32) -> Result<(), PeerError> {
        self.send(&Message::AllowedFast { piece })
    }

    /// Sends `payload` to the peer's `name` sub-protocol over BEP-10.
    pub fn send_extended(&mut self, name: &str, payload: impl Into<Bytes>) -> Result<(), PeerError> {
        if self.state.phase == PeerState::Disconnected {
            return Err(PeerError::ConnectionClosed);
        }
        let payload = payload.into();
        self.with_extension(|ext: &mut ExtensionProtocol, ctx| ext.send(ctx, name, payload))
            .ok_or_else(|| PeerError::Extension("extension protocol not registered".into()))?
    }
}
