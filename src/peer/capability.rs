//! The interface between a connection and its pluggable capability modules.
//!
//! A module contributes reserved handshake bits and may claim base-protocol
//! command bytes the core does not handle itself. The BEP-10
//! [`ExtensionProtocol`](super::ExtensionProtocol) and the BEP-6
//! [`FastExtension`](super::FastExtension) are both modules.

use std::any::Any;
use std::collections::VecDeque;

use bytes::Bytes;

use super::error::PeerError;
use super::event::PeerEvent;
use super::frame::Frame;
use super::message::{Handshake, Message};
use super::state::ConnectionState;

/// Static facts about a capability module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    pub name: &'static str,
    /// OR-ed into the reserved bytes of our handshake.
    pub reserved: [u8; 8],
    /// Base-protocol command bytes this module handles.
    pub commands: &'static [u8],
}

/// A capability module owned by one connection.
///
/// Instances are never shared between connections: each connection is built
/// with fresh modules, so per-connection bookkeeping stays with its peer.
pub trait PeerExtension: Any + Send {
    fn descriptor(&self) -> ExtensionDescriptor;

    /// Called right after our base handshake is queued.
    fn on_handshake(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        _handshake: &Handshake,
    ) -> Result<(), PeerError> {
        Ok(())
    }

    /// Offered a frame whose command byte this module claims.
    ///
    /// Returns `Ok(true)` if the frame was consumed, `Ok(false)` to let the next
    /// claiming module try. An error closes the connection.
    fn on_command(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        id: u8,
        payload: &Bytes,
    ) -> Result<bool, PeerError>;

    /// Called once when the connection is torn down.
    fn on_teardown(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Outbound frames and inbound events waiting on the caller's next poll.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub(crate) frames: VecDeque<Bytes>,
    pub(crate) events: VecDeque<PeerEvent>,
}

impl Outbox {
    pub(crate) fn push_frame(&mut self, frame: &Frame) {
        self.frames.push_back(frame.encode());
    }
}

/// What a module can see and do while handling a callback.
pub struct ExtensionContext<'a> {
    state: &'a ConnectionState,
    outbox: &'a mut Outbox,
}

impl<'a> ExtensionContext<'a> {
    pub(crate) fn new(state: &'a ConnectionState, outbox: &'a mut Outbox) -> Self {
        Self { state, outbox }
    }

    pub fn state(&self) -> &ConnectionState {
        self.state
    }

    /// Queues a message behind everything already queued.
    pub fn send(&mut self, message: &Message) {
        self.outbox.push_frame(&message.to_frame());
    }

    pub fn send_frame(&mut self, frame: &Frame) {
        self.outbox.push_frame(frame);
    }

    /// Raises an event to the caller.
    pub fn emit(&mut self, event: PeerEvent) {
        self.outbox.events.push_back(event);
    }
}
