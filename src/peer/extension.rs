//! Extension protocol (BEP-10).
//!
//! Command byte 20 is shared by any number of named sub-protocols. Each side
//! numbers the sub-protocols it supports in its extension handshake
//! (`{"m": {name: id}}`), and a peer addresses a message with the number the
//! *receiver* chose. So an inbound extended message carries one of our own
//! IDs, and an outbound one carries an ID learned from the peer's handshake.

use std::any::Any;
use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, trace};

use super::capability::{ExtensionContext, ExtensionDescriptor, PeerExtension};
use super::error::PeerError;
use super::event::PeerEvent;
use super::message::{Handshake, Message, MessageId};
use super::state::ConnectionState;
use crate::bencode::{decode, encode, Dict, Value};
use crate::constants::{
    CLIENT_VERSION, DEFAULT_REQUEST_QUEUE, EXTENSION_HANDSHAKE_ID, EXTENSION_PROTOCOL_BIT,
    EXTENSION_PROTOCOL_BYTE,
};

/// The dictionary sent as extended message 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// The `m` dictionary in the order it was built or read. An ID of 0 means
    /// the sender disabled that sub-protocol.
    pub extensions: Vec<(String, u8)>,
    pub client: Option<String>,
    pub yourip: Option<Bytes>,
    pub reqq: Option<i64>,
    pub metadata_size: Option<i64>,
    /// Any other keys, kept as sent.
    pub extra: Dict,
}

impl ExtensionHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extensions(extensions: &[(&str, u8)]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|(name, id)| ((*name).to_string(), *id))
                .collect(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = Dict::new();

        let m: Dict = self
            .extensions
            .iter()
            .map(|(name, id)| (Bytes::copy_from_slice(name.as_bytes()), Value::Integer(*id as i64)))
            .collect();
        dict.insert("m", Value::Dict(m));

        if let Some(ref client) = self.client {
            dict.insert("v", Value::string(client));
        }

        if let Some(ref ip) = self.yourip {
            dict.insert("yourip", Value::Bytes(ip.clone()));
        }

        if let Some(reqq) = self.reqq {
            dict.insert("reqq", Value::Integer(reqq));
        }

        if let Some(size) = self.metadata_size {
            dict.insert("metadata_size", Value::Integer(size));
        }

        for (key, value) in self.extra.iter() {
            if !dict.contains_key(key) {
                dict.insert(key.clone(), value.clone());
            }
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    /// Parses a peer's handshake dictionary.
    ///
    /// A missing `m` key means the peer supports no sub-protocols. An ID that
    /// does not fit in a byte is malformed, not truncated.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let dict = decode(data)?
            .into_dict()
            .ok_or_else(|| PeerError::Extension("expected dict".into()))?;

        let mut hs = Self::new();

        for (key, value) in dict {
            match key.as_ref() {
                b"m" => {
                    let m = value
                        .as_dict()
                        .ok_or_else(|| PeerError::Extension("m is not a dict".into()))?;
                    for (name, id) in m.iter() {
                        let Ok(name) = std::str::from_utf8(name) else {
                            continue;
                        };
                        hs.extensions.push((name.to_string(), id.as_int::<u8>()?));
                    }
                }
                b"v" => hs.client = value.as_str().map(String::from),
                b"yourip" => hs.yourip = value.as_bytes().cloned(),
                b"reqq" => hs.reqq = value.as_integer(),
                b"metadata_size" => hs.metadata_size = value.as_integer(),
                _ => {
                    hs.extra.insert(key, value);
                }
            }
        }

        Ok(hs)
    }

    /// The ID the sender assigned to `name`, unless absent or disabled.
    pub fn get_extension_id(&self, name: &str) -> Option<u8> {
        self.extensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
            .filter(|id| *id != 0)
    }
}

/// A named sub-protocol carried inside extended messages.
pub trait SubProtocol: Any + Send {
    /// The key this sub-protocol is advertised under in `m`.
    fn name(&self) -> &'static str;

    /// Adds top-level keys to our extension handshake (e.g. `metadata_size`).
    fn handshake_fields(&self, _fields: &mut Dict) {}

    /// Called when the peer's extension handshake advertises this sub-protocol.
    fn on_handshake(
        &mut self,
        _ctx: &mut SubProtocolContext<'_, '_>,
        _handshake: &ExtensionHandshake,
    ) -> Result<(), PeerError> {
        Ok(())
    }

    /// Called with the payload of an extended message addressed to us.
    fn on_extended_message(
        &mut self,
        ctx: &mut SubProtocolContext<'_, '_>,
        payload: &Bytes,
    ) -> Result<(), PeerError>;

    fn on_teardown(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A sub-protocol's view of the connection during a callback.
pub struct SubProtocolContext<'c, 'a> {
    inner: &'c mut ExtensionContext<'a>,
    name: &'static str,
    remote_id: Option<u8>,
}

impl<'c, 'a> SubProtocolContext<'c, 'a> {
    pub fn state(&self) -> &ConnectionState {
        self.inner.state()
    }

    /// The ID the peer assigned to this sub-protocol, if it advertised one.
    pub fn remote_id(&self) -> Option<u8> {
        self.remote_id
    }

    /// Queues an extended message for this sub-protocol.
    pub fn send(&mut self, payload: Bytes) -> Result<(), PeerError> {
        let id = self.remote_id.ok_or_else(|| {
            PeerError::Extension(format!("peer does not support {}", self.name))
        })?;
        self.inner.send(&Message::Extended { id, payload });
        Ok(())
    }

    pub fn emit(&mut self, event: PeerEvent) {
        self.inner.emit(event);
    }
}

/// The BEP-10 registry: a capability module that owns the sub-protocols and
/// both ID tables of one connection.
///
/// Outgoing IDs are assigned at registration, in order, starting at 1, and
/// never change. Incoming IDs are unknown until the peer's extension handshake
/// arrives.
///
/// ```
/// use peerwire::peer::{ExtensionProtocol, UtMetadata, UtPex};
///
/// let mut protocol = ExtensionProtocol::new();
/// assert_eq!(protocol.register(Box::new(UtMetadata::new())).unwrap(), 1);
/// assert_eq!(protocol.register(Box::new(UtPex::new())).unwrap(), 2);
/// assert_eq!(protocol.outgoing_id("ut_pex"), Some(2));
/// assert_eq!(protocol.incoming_id("ut_pex"), None);
/// ```
pub struct ExtensionProtocol {
    handlers: Vec<Box<dyn SubProtocol>>,
    outgoing: Vec<(&'static str, u8)>,
    incoming: Option<BTreeMap<String, u8>>,
    client: Option<String>,
    request_queue: Option<i64>,
    remote: Option<ExtensionHandshake>,
}

impl ExtensionProtocol {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            outgoing: Vec::new(),
            incoming: None,
            client: Some(CLIENT_VERSION.to_string()),
            request_queue: Some(DEFAULT_REQUEST_QUEUE),
            remote: None,
        }
    }

    /// Sets the `v` string, or `None` to leave it out.
    pub fn set_client(&mut self, client: Option<String>) {
        self.client = client;
    }

    pub fn set_request_queue(&mut self, reqq: Option<i64>) {
        self.request_queue = reqq;
    }

    /// Registers a sub-protocol and returns the ID we assigned it.
    pub fn register(&mut self, handler: Box<dyn SubProtocol>) -> Result<u8, PeerError> {
        let name = handler.name();
        if self.outgoing_id(name).is_some() {
            return Err(PeerError::InvalidArgument(format!(
                "sub-protocol {} registered twice",
                name
            )));
        }
        let id = u8::try_from(self.handlers.len() + 1).map_err(|_| {
            PeerError::InvalidArgument("no extended message IDs left".into())
        })?;
        self.outgoing.push((name, id));
        self.handlers.push(handler);
        Ok(id)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<S: SubProtocol>(mut self, handler: S) -> Result<Self, PeerError> {
        self.register(Box::new(handler))?;
        Ok(self)
    }

    /// The ID we assigned to `name`. The peer uses it to address us.
    pub fn outgoing_id(&self, name: &str) -> Option<u8> {
        self.outgoing
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    /// The ID the peer assigned to `name`. We use it to address the peer.
    pub fn incoming_id(&self, name: &str) -> Option<u8> {
        self.incoming.as_ref()?.get(name).copied()
    }

    /// The peer's most recent extension handshake.
    pub fn remote_handshake(&self) -> Option<&ExtensionHandshake> {
        self.remote.as_ref()
    }

    /// The handshake we send: every registered sub-protocol in registration order.
    pub fn local_handshake(&self) -> ExtensionHandshake {
        let mut extra = Dict::new();
        for handler in &self.handlers {
            handler.handshake_fields(&mut extra);
        }
        let metadata_size = extra
            .remove(b"metadata_size")
            .and_then(|v| v.as_integer());

        ExtensionHandshake {
            extensions: self
                .outgoing
                .iter()
                .map(|(name, id)| ((*name).to_string(), *id))
                .collect(),
            client: self.client.clone(),
            yourip: None,
            reqq: self.request_queue,
            metadata_size,
            extra,
        }
    }

    /// Queues a message for the sub-protocol `name`, addressed with the ID the
    /// peer assigned to it.
    pub fn send(
        &self,
        ctx: &mut ExtensionContext<'_>,
        name: &str,
        payload: Bytes,
    ) -> Result<(), PeerError> {
        let id = self.incoming_id(name).ok_or_else(|| {
            PeerError::Extension(format!("peer does not support {}", name))
        })?;
        ctx.send(&Message::Extended { id, payload });
        Ok(())
    }

    /// Runs `f` against the registered sub-protocol of type `S`.
    pub fn with_sub_protocol<S: SubProtocol, R>(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        f: impl FnOnce(&mut S, &mut SubProtocolContext<'_, '_>) -> R,
    ) -> Option<R> {
        for handler in self.handlers.iter_mut() {
            let name = handler.name();
            let Some(handler) = handler.as_any_mut().downcast_mut::<S>() else {
                continue;
            };
            let remote_id = self.incoming.as_ref().and_then(|m| m.get(name).copied());
            let mut sub = SubProtocolContext {
                inner: &mut *ctx,
                name,
                remote_id,
            };
            return Some(f(handler, &mut sub));
        }
        None
    }

    fn receive_handshake(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        payload: &[u8],
    ) -> Result<(), PeerError> {
        let hs = ExtensionHandshake::decode(payload)?;

        let incoming = self.incoming.get_or_insert_with(BTreeMap::new);
        for (name, id) in &hs.extensions {
            if *id == 0 {
                incoming.remove(name);
            } else {
                incoming.insert(name.clone(), *id);
            }
        }
        debug!(
            client = hs.client.as_deref().unwrap_or("unknown"),
            extensions = ?hs.extensions,
            "extension handshake received"
        );

        ctx.emit(PeerEvent::ExtendedHandshake(hs.clone()));

        for handler in self.handlers.iter_mut() {
            let name = handler.name();
            let Some(remote_id) = hs.get_extension_id(name) else {
                continue;
            };
            let mut sub = SubProtocolContext {
                inner: &mut *ctx,
                name,
                remote_id: Some(remote_id),
            };
            handler.on_handshake(&mut sub, &hs)?;
        }

        self.remote = Some(hs);
        Ok(())
    }

    fn route(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        id: u8,
        payload: &Bytes,
    ) -> Result<(), PeerError> {
        let index = self
            .outgoing
            .iter()
            .position(|(_, assigned)| *assigned == id)
            .ok_or(PeerError::UnroutableExtendedMessage(id))?;

        let handler = &mut self.handlers[index];
        let name = handler.name();
        let remote_id = self.incoming.as_ref().and_then(|m| m.get(name).copied());
        let mut sub = SubProtocolContext {
            inner: ctx,
            name,
            remote_id,
        };
        handler.on_extended_message(&mut sub, payload)
    }
}

impl Default for ExtensionProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerExtension for ExtensionProtocol {
    fn descriptor(&self) -> ExtensionDescriptor {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_PROTOCOL_BYTE] = EXTENSION_PROTOCOL_BIT;
        ExtensionDescriptor {
            name: "extension_protocol",
            reserved,
            commands: &[MessageId::Extended as u8],
        }
    }

    fn on_handshake(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        _handshake: &Handshake,
    ) -> Result<(), PeerError> {
        let payload = self.local_handshake().encode();
        trace!(len = payload.len(), "sending extension handshake");
        ctx.send(&Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload,
        });
        Ok(())
    }

    fn on_command(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        _id: u8,
        payload: &Bytes,
    ) -> Result<bool, PeerError> {
        let Some(&ext_id) = payload.first() else {
            return Err(PeerError::MalformedPayload(
                "extended message without id".into(),
            ));
        };
        let body = payload.slice(1..);

        if ext_id == EXTENSION_HANDSHAKE_ID {
            self.receive_handshake(ctx, &body)?;
            return Ok(true);
        }

        match self.route(ctx, ext_id, &body) {
            Err(PeerError::UnroutableExtendedMessage(id)) => {
                debug!(id, "dropping extended message for unregistered id");
                Ok(true)
            }
            other => other.map(|()| true),
        }
    }

    fn on_teardown(&mut self) {
        for handler in self.handlers.iter_mut() {
            handler.on_teardown();
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
