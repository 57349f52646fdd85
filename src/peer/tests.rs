use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::*;
use crate::bencode::{encode, Dict, Value};

const INFO_HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const LOCAL_ID: [u8; 20] = *b"-PW0001-localpeer001";
const REMOTE_ID: [u8; 20] = *b"-XX0001-remotepeer01";

#[derive(Debug, Default)]
struct Pipe {
    connected: bool,
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    remote_closed: bool,
    fault: Option<io::ErrorKind>,
    write_limit: Option<usize>,
}

/// An in-process transport. The test keeps a clone to feed bytes in and read
/// what the connection wrote.
#[derive(Debug, Clone)]
struct MemoryTransport {
    pipe: Arc<Mutex<Pipe>>,
}

impl MemoryTransport {
    fn new() -> Self {
        let transport = Self::unconnected();
        transport.pipe.lock().unwrap().connected = true;
        transport
    }

    fn unconnected() -> Self {
        Self {
            pipe: Arc::new(Mutex::new(Pipe::default())),
        }
    }

    fn feed(&self, data: &[u8]) {
        self.pipe.lock().unwrap().inbound.extend(data);
    }

    fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.lock().unwrap().outbound)
    }

    fn close_remote(&self) {
        self.pipe.lock().unwrap().remote_closed = true;
    }

    fn fail_with(&self, kind: io::ErrorKind) {
        self.pipe.lock().unwrap().fault = Some(kind);
    }

    fn limit_writes(&self, limit: usize) {
        self.pipe.lock().unwrap().write_limit = Some(limit);
    }
}

impl PeerTransport for MemoryTransport {
    async fn connect(&mut self, _addr: SocketAddr) -> io::Result<()> {
        self.pipe.lock().unwrap().connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pipe.lock().unwrap().connected
    }

    fn try_read(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut pipe = self.pipe.lock().unwrap();
        if let Some(kind) = pipe.fault {
            return Err(kind.into());
        }
        if pipe.inbound.is_empty() {
            return if pipe.remote_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = pipe.inbound.len();
        buf.extend(pipe.inbound.drain(..));
        Ok(n)
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock().unwrap();
        if let Some(kind) = pipe.fault {
            return Err(kind.into());
        }
        let n = pipe.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        pipe.outbound.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        self.pipe.lock().unwrap().connected = false;
    }
}

fn quiet() -> PeerConfig {
    PeerConfig {
        emit_no_data: false,
        obfuscation_seed: Some(7),
        ..PeerConfig::default()
    }
}

fn remote_handshake(reserved: [u8; 8]) -> Bytes {
    Handshake::new(reserved, [0xaa; 20], REMOTE_ID).encode()
}

fn parse_frames(mut data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some((frame, consumed)) = try_parse_one(data) {
        frames.push(frame);
        data = &data[consumed..];
    }
    assert!(data.is_empty(), "trailing partial frame: {:?}", data);
    frames
}

fn extended(id: u8, payload: &[u8]) -> Bytes {
    Message::Extended {
        id,
        payload: Bytes::copy_from_slice(payload),
    }
    .encode()
}

/// Exchanges base handshakes and clears the resulting events and output.
fn establish(conn: &mut PeerConnection<MemoryTransport>, transport: &MemoryTransport) {
    conn.handshake(INFO_HASH, &LOCAL_ID).unwrap();
    transport.feed(&remote_handshake([0; 8]));
    assert!(conn.process());
    assert_eq!(conn.phase(), PeerState::Established);
    conn.events().for_each(drop);
    transport.take_written();
}

fn established() -> (PeerConnection<MemoryTransport>, MemoryTransport) {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet());
    establish(&mut conn, &transport);
    (conn, transport)
}

#[test]
fn test_handshake_rejects_bad_arguments() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet());

    let short_hash = &INFO_HASH[1..];
    let not_hex = "zzaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    assert!(matches!(
        conn.handshake(short_hash, &LOCAL_ID),
        Err(PeerError::InvalidArgument(_))
    ));
    assert!(matches!(
        conn.handshake(not_hex, &LOCAL_ID),
        Err(PeerError::InvalidArgument(_))
    ));
    assert!(matches!(
        conn.handshake(INFO_HASH, &LOCAL_ID[..19]),
        Err(PeerError::InvalidArgument(_))
    ));

    assert!(!conn.state().handshake_sent);
    assert_eq!(conn.pending_frames(), 0);
    assert!(conn.process());
    assert!(transport.take_written().is_empty());
}

#[test]
fn test_handshake_bytes_carry_extension_bits() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet())
        .extension(ExtensionProtocol::new())
        .extension(FastExtension::new());

    conn.handshake(INFO_HASH, &LOCAL_ID).unwrap();
    assert_eq!(conn.phase(), PeerState::HandshakeSent);
    assert!(conn.process());

    let written = transport.take_written();
    assert_eq!(written[0], 19);
    assert_eq!(&written[1..20], b"BitTorrent protocol");
    assert_eq!(&written[20..28], &[0, 0, 0, 0, 0, 0x10, 0, 0x04]);
    assert_eq!(&written[28..48], &[0xaa; 20]);
    assert_eq!(&written[48..68], &LOCAL_ID);

    // The extension protocol's own handshake follows as extended message 0.
    let frames = parse_frames(&written[68..]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id(), Some(20));
    assert_eq!(frames[0].payload()[0], 0);
}

#[test]
fn test_inbound_handshake_completes() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet());
    conn.handshake(INFO_HASH, &LOCAL_ID).unwrap();

    let reserved = [0, 0, 0, 0, 0, 0x10, 0, 0x05];
    let raw = remote_handshake(reserved);
    transport.feed(&raw[..30]);
    assert!(conn.process());
    assert_eq!(conn.next_event(), None);

    transport.feed(&raw[30..]);
    assert!(conn.process());
    assert_eq!(
        conn.next_event(),
        Some(PeerEvent::HandshakeComplete {
            peer_id: PeerId(REMOTE_ID),
            reserved,
        })
    );
    assert_eq!(conn.phase(), PeerState::Established);
    assert_eq!(conn.state().remote_peer_id, Some(PeerId(REMOTE_ID)));
}

#[test]
fn test_wrong_protocol_literal_drops_once() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet());
    conn.handshake(INFO_HASH, &LOCAL_ID).unwrap();

    transport.feed(b"\x13BitTorrent protocoX");
    assert!(!conn.process());
    assert!(!conn.process());

    let events: Vec<_> = conn.events().collect();
    assert_eq!(events, vec![PeerEvent::DroppedConnection]);
    assert_eq!(conn.phase(), PeerState::Disconnected);
    assert!(!transport.is_connected());
}

#[test]
fn test_info_hash_mismatch_drops() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet());
    conn.handshake(INFO_HASH, &LOCAL_ID).unwrap();

    transport.feed(&Handshake::new([0; 8], [0xbb; 20], REMOTE_ID).encode());
    assert!(!conn.process());
    assert_eq!(conn.next_event(), Some(PeerEvent::DroppedConnection));
}

#[test]
fn test_accepting_side_checks_hash_on_reply() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet());

    // Inbound connection: the peer speaks first.
    transport.feed(&remote_handshake([0; 8]));
    assert!(conn.process());
    assert!(matches!(
        conn.next_event(),
        Some(PeerEvent::HandshakeComplete { .. })
    ));

    let other = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    assert!(matches!(
        conn.handshake(other, &LOCAL_ID),
        Err(PeerError::InfoHashMismatch)
    ));
    assert_eq!(conn.next_event(), Some(PeerEvent::DroppedConnection));
}

#[test]
fn test_frames_split_across_reads() {
    let (mut conn, transport) = established();

    let have = Message::Have { piece: 7 }.encode();
    transport.feed(&have[..2]);
    assert!(conn.process());
    transport.feed(&have[2..6]);
    assert!(conn.process());
    assert_eq!(conn.next_event(), None);

    transport.feed(&have[6..]);
    assert!(conn.process());
    assert_eq!(conn.next_event(), Some(PeerEvent::Have(7)));
    assert_eq!(conn.next_event(), None);
}

#[test]
fn test_events_follow_wire_order_and_update_state() {
    let (mut conn, transport) = established();

    let mut wire = Vec::new();
    wire.extend_from_slice(&Message::Unchoke.encode());
    wire.extend_from_slice(&Message::Interested.encode());
    wire.extend_from_slice(&Message::KeepAlive.encode());
    wire.extend_from_slice(&Message::Bitfield(Bytes::from_static(&[0b0000_0001])).encode());
    wire.extend_from_slice(&Message::Have { piece: 3 }.encode());
    wire.extend_from_slice(
        &Message::Piece(Block::new(0, 0, Bytes::from_static(b"abcd"))).encode(),
    );
    transport.feed(&wire);
    assert!(conn.process());

    let events: Vec<_> = conn.events().collect();
    assert_eq!(events.len(), 6);
    assert_eq!(events[0], PeerEvent::UnChoke);
    assert_eq!(events[1], PeerEvent::Interested);
    assert_eq!(events[2], PeerEvent::KeepAlive);
    assert!(matches!(events[3], PeerEvent::BitField(_)));
    assert_eq!(events[4], PeerEvent::Have(3));
    assert_eq!(
        events[5],
        PeerEvent::Piece(Block::new(0, 0, Bytes::from_static(b"abcd")))
    );

    let state = conn.state();
    assert!(!state.choking.peer_choking);
    assert!(state.choking.peer_interested);
    let bits = state.remote_bitfield.as_ref().unwrap();
    assert!(bits.has(0));
    assert!(bits.has(3));
    assert!(!bits.has(1));
    assert_eq!(state.bytes_downloaded, 4);
}

#[test]
fn test_have_without_bitfield_updates_remote_pieces() {
    let (mut conn, transport) = established();

    let mut wire = Vec::new();
    wire.extend_from_slice(&Message::Have { piece: 3 }.encode());
    wire.extend_from_slice(&Message::Have { piece: 9 }.encode());
    transport.feed(&wire);
    assert!(conn.process());

    let events: Vec<_> = conn.events().collect();
    assert_eq!(events, vec![PeerEvent::Have(3), PeerEvent::Have(9)]);

    let state = conn.state();
    let bits = state.remote_bitfield.as_ref().unwrap();
    assert_eq!(bits.available_pieces(), vec![3, 9]);
    assert!(state.peer_has(9));

    conn.set_piece_count(20);
    assert_eq!(conn.state().remote_bitfield.as_ref().unwrap().len(), 20);
}

#[test]
fn test_malformed_payload_stops_processing() {
    let (mut conn, transport) = established();

    let mut wire = vec![0, 0, 0, 3, 4, 0, 1];
    wire.extend_from_slice(&Message::Unchoke.encode());
    transport.feed(&wire);

    assert!(!conn.process());
    let events: Vec<_> = conn.events().collect();
    assert_eq!(events, vec![PeerEvent::DroppedConnection]);
}

#[test]
fn test_unclaimed_commands_are_ignored() {
    let (mut conn, transport) = established();

    let mut wire = Vec::new();
    wire.extend_from_slice(&Frame::new(99, Bytes::from_static(b"future")).encode());
    // Fast extension commands without the module registered.
    wire.extend_from_slice(&Message::HaveAll.encode());
    wire.extend_from_slice(&extended(0, b"de"));
    wire.extend_from_slice(&Message::Choke.encode());
    transport.feed(&wire);

    assert!(conn.process());
    let events: Vec<_> = conn.events().collect();
    assert_eq!(events, vec![PeerEvent::Choke]);
}

#[test]
fn test_fast_extension_claims_its_commands() {
    let transport = MemoryTransport::new();
    let mut conn =
        PeerConnection::new(transport.clone(), quiet()).extension(FastExtension::new());
    establish(&mut conn, &transport);

    let mut wire = Vec::new();
    wire.extend_from_slice(&Message::HaveNone.encode());
    wire.extend_from_slice(&Message::AllowedFast { piece: 4 }.encode());
    transport.feed(&wire);
    assert!(conn.process());

    let events: Vec<_> = conn.events().collect();
    assert_eq!(events, vec![PeerEvent::HaveNone, PeerEvent::AllowedFast(4)]);

    let allowed = conn
        .with_extension(|fast: &mut FastExtension, _| fast.state().can_request_while_choked(4));
    assert_eq!(allowed, Some(true));
}

#[test]
fn test_have_all_fills_remote_pieces() {
    let transport = MemoryTransport::new();
    let mut conn =
        PeerConnection::new(transport.clone(), quiet()).extension(FastExtension::new());
    conn.set_piece_count(12);
    establish(&mut conn, &transport);

    transport.feed(&Message::HaveAll.encode());
    assert!(conn.process());
    assert_eq!(conn.events().collect::<Vec<_>>(), vec![PeerEvent::HaveAll]);

    let bits = conn.state().remote_bitfield.as_ref().unwrap();
    assert_eq!(bits.len(), 12);
    assert!(bits.is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_after_idle_minute() {
    let (mut conn, transport) = established();

    assert!(conn.process());
    assert!(transport.take_written().is_empty());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(conn.process());
    assert_eq!(transport.take_written(), vec![0, 0, 0, 0]);

    assert!(conn.process());
    assert!(transport.take_written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_no_keep_alive_before_remote_handshake() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet());
    conn.handshake(INFO_HASH, &LOCAL_ID).unwrap();
    assert!(conn.process());
    transport.take_written();

    tokio::time::advance(Duration::from_secs(120)).await;
    assert!(conn.process());
    assert!(transport.take_written().is_empty());
}

#[test]
fn test_obfuscated_bitfield_hides_pieces_then_announces_them() {
    let (mut conn, transport) = established();

    let full = Bitfield::full(40);
    conn.send_bitfield(&full, true).unwrap();
    assert!(conn.process());

    let frames = parse_frames(&transport.take_written());
    assert_eq!(frames[0].id(), Some(5));
    let sent = Bitfield::from_bytes(frames[0].payload(), 40);

    let haves: Vec<u32> = frames[1..]
        .iter()
        .map(|f| {
            assert_eq!(f.id(), Some(4));
            u32::from_be_bytes(f.payload().try_into().unwrap())
        })
        .collect();
    assert_eq!(haves.len(), 16);
    assert_eq!(sent.count(), 40 - 16);
    for piece in &haves {
        assert!(!sent.has(*piece as usize));
    }
}

#[test]
fn test_obfuscated_sparse_bitfield_only_announces_held_pieces() {
    let mut even = Bitfield::new(64);
    for piece in (0..64).step_by(2) {
        even.set(piece);
    }

    let mut fewer_than_sampled = false;
    for seed in 0..8 {
        let transport = MemoryTransport::new();
        let config = PeerConfig {
            obfuscation_seed: Some(seed),
            ..quiet()
        };
        let mut conn = PeerConnection::new(transport.clone(), config);
        establish(&mut conn, &transport);

        conn.send_bitfield(&even, true).unwrap();
        assert!(conn.process());

        let frames = parse_frames(&transport.take_written());
        let mut received = Bitfield::from_bytes(frames[0].payload(), 64);
        let haves: Vec<u32> = frames[1..]
            .iter()
            .map(|f| u32::from_be_bytes(f.payload().try_into().unwrap()))
            .collect();

        assert!(haves.len() <= 16);
        assert!(haves.windows(2).all(|w| w[0] < w[1]));
        for &piece in &haves {
            assert_eq!(piece % 2, 0, "announced a piece we do not have");
            assert!(!received.has(piece as usize));
            received.set(piece as usize);
        }
        // The bitfield plus the Haves disclose exactly what we hold.
        assert_eq!(received, even);
        fewer_than_sampled |= haves.len() < 16;
    }
    assert!(fewer_than_sampled);
}

#[test]
fn test_small_bitfield_is_not_obfuscated() {
    let (mut conn, transport) = established();

    conn.send_bitfield(&Bitfield::full(32), true).unwrap();
    assert!(conn.process());

    let frames = parse_frames(&transport.take_written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload(), &[0xFF; 4]);
}

#[test]
fn test_outbound_helpers_queue_in_order() {
    let (mut conn, transport) = established();

    conn.send_interested().unwrap();
    conn.send_unchoke().unwrap();
    conn.send_request(1, 0, 16384).unwrap();
    conn.send_piece(2, 0, Bytes::from_static(b"xyz")).unwrap();
    conn.send_cancel(1, 0, 16384).unwrap();
    conn.send_have(9).unwrap();
    conn.send_port(6881).unwrap();
    assert!(conn.process());

    let ids: Vec<_> = parse_frames(&transport.take_written())
        .iter()
        .map(|f| f.id())
        .collect();
    assert_eq!(
        ids,
        vec![Some(2), Some(1), Some(6), Some(7), Some(8), Some(4), Some(9)]
    );
    assert!(conn.state().choking.am_interested);
    assert!(!conn.state().choking.am_choking);
    assert_eq!(conn.state().bytes_uploaded, 3);
}

#[test]
fn test_partial_writes_resume() {
    let (mut conn, transport) = established();
    transport.limit_writes(3);

    conn.send_request(1, 2, 3).unwrap();
    conn.send_have(5).unwrap();
    for _ in 0..10 {
        assert!(conn.process());
    }

    let mut expected = Message::Request(BlockRequest::new(1, 2, 3)).encode().to_vec();
    expected.extend_from_slice(&Message::Have { piece: 5 }.encode());
    assert_eq!(transport.take_written(), expected);
    assert_eq!(conn.pending_frames(), 0);
}

#[test]
fn test_transport_fault_drops_connection() {
    let (mut conn, transport) = established();
    transport.fail_with(io::ErrorKind::ConnectionReset);

    assert!(!conn.process());
    assert_eq!(conn.next_event(), Some(PeerEvent::DroppedConnection));
    assert!(matches!(conn.send_have(1), Err(PeerError::ConnectionClosed)));
}

#[test]
fn test_remote_close_drops_connection() {
    let (mut conn, transport) = established();
    transport.close_remote();

    assert!(!conn.process());
    assert_eq!(conn.next_event(), Some(PeerEvent::DroppedConnection));
}

#[test]
fn test_disconnect_raises_dropped_once() {
    let (mut conn, _transport) = established();
    conn.disconnect();
    conn.disconnect();
    let events: Vec<_> = conn.events().collect();
    assert_eq!(events, vec![PeerEvent::DroppedConnection]);
    assert!(!conn.is_connected());
}

#[test]
fn test_no_data_on_idle_poll() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), PeerConfig::default());
    assert!(conn.process());
    assert_eq!(conn.next_event(), Some(PeerEvent::NoData));
}

#[tokio::test]
async fn test_connect_opens_transport() {
    let transport = MemoryTransport::unconnected();
    let mut conn = PeerConnection::new(transport.clone(), quiet());
    assert_eq!(conn.phase(), PeerState::Connecting);
    assert!(conn.process());

    conn.connect("127.0.0.1:6881".parse().unwrap()).await.unwrap();
    assert_eq!(conn.phase(), PeerState::Connected);
    assert!(conn.is_connected());
}

#[test]
fn test_extensions_fixed_after_handshake() {
    let (mut conn, _transport) = established();
    assert!(conn.add_extension(Box::new(FastExtension::new())).is_err());
}

fn pex_registry() -> ExtensionProtocol {
    ExtensionProtocol::new()
        .with(UtMetadata::new())
        .unwrap()
        .with(UtPex::new())
        .unwrap()
}

#[test]
fn test_extended_messages_route_by_our_ids() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet()).extension(pex_registry());
    establish(&mut conn, &transport);

    // The peer numbers ut_pex 5; it must address us with our 2.
    transport.feed(&extended(0, b"d1:md6:ut_pexi5eee"));
    let mut pex = PexMessage::new();
    pex.add_peer(PexPeer::new("10.0.0.1:6881".parse().unwrap()));
    transport.feed(&extended(2, &pex.encode()));
    // Our id 9 is not assigned: dropped, connection stays up.
    transport.feed(&extended(9, b"junk"));
    assert!(conn.process());

    let events: Vec<_> = conn.events().collect();
    assert_eq!(events.len(), 2);
    let PeerEvent::ExtendedHandshake(hs) = &events[0] else {
        panic!("expected extended handshake, got {:?}", events[0]);
    };
    assert_eq!(hs.get_extension_id("ut_pex"), Some(5));
    assert_eq!(events[1], PeerEvent::Pex(pex.clone()));
    assert!(conn.is_connected());

    let sent = conn.with_sub_protocol(|ut_pex: &mut UtPex, ctx| ut_pex.send(ctx, &pex));
    assert!(matches!(sent, Some(Ok(()))));
    conn.send_extended("ut_pex", pex.encode()).unwrap();
    assert!(matches!(
        conn.send_extended("ut_metadata", Bytes::new()),
        Err(PeerError::Extension(_))
    ));
    assert!(conn.process());

    let frames = parse_frames(&transport.take_written());
    assert_eq!(frames.len(), 2);
    for frame in frames {
        assert_eq!(frame.id(), Some(20));
        assert_eq!(frame.payload()[0], 5);
    }
}

#[test]
fn test_malformed_extension_handshake_drops() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet()).extension(pex_registry());
    establish(&mut conn, &transport);

    transport.feed(&extended(0, b"d1:md6:ut_pex"));
    assert!(!conn.process());
    assert_eq!(conn.next_event(), Some(PeerEvent::DroppedConnection));
}

/// Moves everything each side wrote into the other side's inbound queue.
fn pump(
    a: &mut PeerConnection<MemoryTransport>,
    a_pipe: &MemoryTransport,
    b: &mut PeerConnection<MemoryTransport>,
    b_pipe: &MemoryTransport,
) {
    for _ in 0..8 {
        a.process();
        b.process();
        b_pipe.feed(&a_pipe.take_written());
        a_pipe.feed(&b_pipe.take_written());
    }
}

fn info_dict(len: usize) -> Bytes {
    let mut info = Dict::new();
    info.insert("name", Value::string("test"));
    info.insert("piece length", Value::Integer(16384));
    info.insert("pieces", Value::Bytes(Bytes::from(vec![7u8; len])));
    Bytes::from(encode(&Value::Dict(info)))
}

#[test]
fn test_metadata_exchange_between_peers() {
    let metadata = info_dict(40_000);
    let info_hash = hex::encode(Sha1::digest(&metadata));

    let seed_pipe = MemoryTransport::new();
    let mut seed = PeerConnection::new(seed_pipe.clone(), quiet()).extension(
        ExtensionProtocol::new()
            .with(UtPex::new())
            .unwrap()
            .with(UtMetadata::with_metadata(metadata.clone()))
            .unwrap(),
    );
    let leech_pipe = MemoryTransport::new();
    let mut leech = PeerConnection::new(leech_pipe.clone(), quiet()).extension(pex_registry());

    seed.handshake(&info_hash, &REMOTE_ID).unwrap();
    leech.handshake(&info_hash, &LOCAL_ID).unwrap();
    pump(&mut seed, &seed_pipe, &mut leech, &leech_pipe);

    let received: Vec<_> = leech
        .events()
        .filter_map(|e| match e {
            PeerEvent::MetadataReceived(info) => Some(info),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![metadata.clone()]);

    let held = leech.with_sub_protocol(|m: &mut UtMetadata, _| m.metadata().cloned());
    assert_eq!(held, Some(Some(metadata)));
    assert!(seed.is_connected());
    assert!(leech.is_connected());
}

#[test]
fn test_metadata_hash_mismatch_drops() {
    let metadata = info_dict(100);
    let seed_pipe = MemoryTransport::new();
    let mut seed = PeerConnection::new(seed_pipe.clone(), quiet()).extension(
        ExtensionProtocol::new()
            .with(UtMetadata::with_metadata(metadata))
            .unwrap(),
    );
    let leech_pipe = MemoryTransport::new();
    let mut leech = PeerConnection::new(leech_pipe.clone(), quiet()).extension(pex_registry());

    seed.handshake(INFO_HASH, &REMOTE_ID).unwrap();
    leech.handshake(INFO_HASH, &LOCAL_ID).unwrap();
    pump(&mut seed, &seed_pipe, &mut leech, &leech_pipe);

    assert!(!leech.is_connected());
    assert!(leech
        .events()
        .any(|e| e == PeerEvent::DroppedConnection));
}

#[test]
fn test_metadata_request_without_metadata_is_rejected() {
    let transport = MemoryTransport::new();
    let mut conn = PeerConnection::new(transport.clone(), quiet()).extension(pex_registry());
    establish(&mut conn, &transport);

    transport.feed(&extended(0, b"d1:md11:ut_metadatai3eee"));
    transport.feed(&extended(1, &MetadataMessage::request(0).encode()));
    transport.feed(&extended(1, &MetadataMessage::reject(4).encode()));
    assert!(conn.process());

    let frames = parse_frames(&transport.take_written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload()[0], 3);
    let reply = MetadataMessage::decode(&Bytes::copy_from_slice(&frames[0].payload()[1..])).unwrap();
    assert_eq!(reply, MetadataMessage::reject(0));

    assert!(conn
        .events()
        .any(|e| e == PeerEvent::MetadataRejected(4)));
}

#[tokio::test]
async fn test_tcp_loopback_handshake() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = PeerConnection::new(TcpTransport::new(), quiet());
    let (connected, accepted) = tokio::join!(client.connect(addr), listener.accept());
    connected.unwrap();
    let (stream, _) = accepted.unwrap();
    let mut server = PeerConnection::new(TcpTransport::from_stream(stream), quiet());

    client.handshake(INFO_HASH, &LOCAL_ID).unwrap();

    let mut server_peer = None;
    let mut client_peer = None;
    for _ in 0..200 {
        assert!(client.process());
        assert!(server.process());

        while let Some(event) = server.next_event() {
            if let PeerEvent::HandshakeComplete { peer_id, .. } = event {
                server_peer = Some(peer_id);
                server.handshake(INFO_HASH, &REMOTE_ID).unwrap();
            }
        }
        while let Some(event) = client.next_event() {
            if let PeerEvent::HandshakeComplete { peer_id, .. } = event {
                client_peer = Some(peer_id);
            }
        }
        if client_peer.is_some() && server_peer.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(server_peer, Some(PeerId(LOCAL_ID)));
    assert_eq!(client_peer, Some(PeerId(REMOTE_ID)));
    assert_eq!(client.phase(), PeerState::Established);
    assert_eq!(server.phase(), PeerState::Established);
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("PW0001"));
}

#[test]
fn test_choking_state_default() {
    let state = ChokingState::default();
    assert!(state.am_choking);
    assert!(!state.am_interested);
    assert!(state.peer_choking);
    assert!(!state.peer_interested);
}
