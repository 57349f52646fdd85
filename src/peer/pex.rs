//! Peer Exchange (ut_pex, BEP-11).

use std::any::Any;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use super::error::PeerError;
use super::event::PeerEvent;
use super::extension::{SubProtocol, SubProtocolContext};
use crate::bencode::{decode, encode, Dict, Value};

const COMPACT_V4_LEN: usize = 6;
const COMPACT_V6_LEN: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

impl PexPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            flags: PexFlags::default(),
        }
    }

    pub fn with_flags(addr: SocketAddr, flags: PexFlags) -> Self {
        Self { addr, flags }
    }
}

/// The per-peer flag byte of `added.f` / `added6.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    pub encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    pub connectable: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: (b & 0x01) != 0,
            seed: (b & 0x02) != 0,
            utp: (b & 0x04) != 0,
            holepunch: (b & 0x08) != 0,
            connectable: (b & 0x10) != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        [
            (self.encryption, 0x01),
            (self.seed, 0x02),
            (self.utp, 0x04),
            (self.holepunch, 0x08),
            (self.connectable, 0x10),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |b, (_, bit)| b | bit)
    }
}

/// One ut_pex message: peers added and dropped since the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub added6: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
    pub dropped6: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, peer: PexPeer) {
        match peer.addr {
            SocketAddr::V4(_) => self.added.push(peer),
            SocketAddr::V6(_) => self.added6.push(peer),
        }
    }

    pub fn drop_peer(&mut self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(_) => self.dropped.push(addr),
            SocketAddr::V6(_) => self.dropped6.push(addr),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    /// Encodes the bencoded dictionary. Empty lists are left out.
    pub fn encode(&self) -> Bytes {
        let mut dict = Dict::new();

        if !self.added.is_empty() {
            dict.insert("added", Value::Bytes(compact(self.added.iter().map(|p| &p.addr))));
            dict.insert("added.f", Value::Bytes(flags(&self.added)));
        }
        if !self.added6.is_empty() {
            dict.insert("added6", Value::Bytes(compact(self.added6.iter().map(|p| &p.addr))));
            dict.insert("added6.f", Value::Bytes(flags(&self.added6)));
        }
        if !self.dropped.is_empty() {
            dict.insert("dropped", Value::Bytes(compact(self.dropped.iter())));
        }
        if !self.dropped6.is_empty() {
            dict.insert("dropped6", Value::Bytes(compact(self.dropped6.iter())));
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    /// Decodes a ut_pex dictionary.
    ///
    /// Missing keys mean empty lists. A trailing partial address is ignored,
    /// and peers without a flag byte get default flags.
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("expected dict".into()))?;

        Ok(Self {
            added: with_flags(parse_v4(field(dict, b"added")), field(dict, b"added.f")),
            added6: with_flags(parse_v6(field(dict, b"added6")), field(dict, b"added6.f")),
            dropped: parse_v4(field(dict, b"dropped")),
            dropped6: parse_v6(field(dict, b"dropped6")),
        })
    }
}

fn field<'a>(dict: &'a Dict, key: &[u8]) -> &'a [u8] {
    dict.get(key)
        .and_then(Value::as_bytes)
        .map(|b| &b[..])
        .unwrap_or_default()
}

fn compact<'a>(addrs: impl Iterator<Item = &'a SocketAddr>) -> Bytes {
    let mut buf = BytesMut::new();
    for addr in addrs {
        match addr {
            SocketAddr::V4(addr) => buf.put_slice(&addr.ip().octets()),
            SocketAddr::V6(addr) => buf.put_slice(&addr.ip().octets()),
        }
        buf.put_u16(addr.port());
    }
    buf.freeze()
}

fn flags(peers: &[PexPeer]) -> Bytes {
    peers.iter().map(|p| p.flags.to_byte()).collect::<Vec<_>>().into()
}

fn parse_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(COMPACT_V4_LEN)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be_bytes([c[4], c[5]])))
        })
        .collect()
}

fn parse_v6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(COMPACT_V6_LEN)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .collect()
}

fn with_flags(addrs: Vec<SocketAddr>, flags: &[u8]) -> Vec<PexPeer> {
    addrs
        .into_iter()
        .enumerate()
        .map(|(i, addr)| {
            let flags = flags.get(i).copied().map(PexFlags::from_byte).unwrap_or_default();
            PexPeer::with_flags(addr, flags)
        })
        .collect()
}

/// The ut_pex sub-protocol. Every message received is raised as
/// [`PeerEvent::Pex`].
#[derive(Debug, Default)]
pub struct UtPex {
    sent: usize,
}

impl UtPex {
    pub const NAME: &'static str = "ut_pex";

    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `message` to the peer. Empty messages are skipped.
    pub fn send(
        &mut self,
        ctx: &mut SubProtocolContext<'_, '_>,
        message: &PexMessage,
    ) -> Result<(), PeerError> {
        if message.is_empty() {
            return Ok(());
        }
        ctx.send(message.encode())?;
        self.sent += 1;
        Ok(())
    }

    /// Messages sent on this connection.
    pub fn messages_sent(&self) -> usize {
        self.sent
    }
}

impl SubProtocol for UtPex {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_extended_message(
        &mut self,
        ctx: &mut SubProtocolContext<'_, '_>,
        payload: &Bytes,
    ) -> Result<(), PeerError> {
        let message = PexMessage::decode(payload)?;
        trace!(
            added = message.added.len() + message.added6.len(),
            dropped = message.dropped.len() + message.dropped6.len(),
            "pex message"
        );
        ctx.emit(PeerEvent::Pex(message));
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
