//! Validators for the data-bearing base messages.
//!
//! Each handler checks the payload against the message's fixed layout and turns
//! it into a [`PeerEvent`]. A payload that is too short, or a bitfield whose
//! length disagrees with its frame header, closes the connection.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};
use tracing::debug;

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::event::PeerEvent;
use super::message::MessageId;
use super::piece::{Block, BlockRequest};

/// What the dispatcher should do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled,
    CloseConnection,
}

/// A base-message handler: `(command, declared frame length, payload)`.
pub type MessageHandler = fn(MessageId, u32, &Bytes) -> Result<PeerEvent, PeerError>;

/// The dispatch table, keyed by command byte.
///
/// Choke, Unchoke, Interested and NotInterested carry no payload and are raised
/// by the connection directly; extension commands belong to their extensions.
pub fn handler_for(id: u8) -> Option<(MessageId, MessageHandler)> {
    let id = MessageId::try_from(id).ok()?;
    let handler: MessageHandler = match id {
        MessageId::Have => handle_have,
        MessageId::Bitfield => handle_bitfield,
        MessageId::Request | MessageId::Cancel => handle_request,
        MessageId::Piece => handle_piece,
        MessageId::Port => handle_port,
        _ => return None,
    };
    Some((id, handler))
}

/// Runs the handler for `id`, queuing its event on success.
///
/// Returns `None` when no base handler owns the command byte.
pub fn dispatch(
    id: u8,
    length: u32,
    payload: &Bytes,
    events: &mut VecDeque<PeerEvent>,
) -> Option<HandlerOutcome> {
    let (message_id, handler) = handler_for(id)?;
    match handler(message_id, length, payload) {
        Ok(event) => {
            events.push_back(event);
            Some(HandlerOutcome::Handled)
        }
        Err(e) => {
            debug!(command = id, error = %e, "closing connection on bad payload");
            Some(HandlerOutcome::CloseConnection)
        }
    }
}

fn require(payload: &Bytes, min: usize, what: &str) -> Result<(), PeerError> {
    if payload.len() < min {
        return Err(PeerError::MalformedPayload(format!(
            "{} needs {} bytes, got {}",
            what,
            min,
            payload.len()
        )));
    }
    Ok(())
}

fn handle_have(_: MessageId, _: u32, payload: &Bytes) -> Result<PeerEvent, PeerError> {
    require(payload, 4, "have")?;
    Ok(PeerEvent::Have(payload.clone().get_u32()))
}

fn handle_bitfield(_: MessageId, length: u32, payload: &Bytes) -> Result<PeerEvent, PeerError> {
    let declared = (length as usize).saturating_sub(1);
    if payload.len() != declared {
        return Err(PeerError::MalformedPayload(format!(
            "bitfield declared {} bytes, got {}",
            declared,
            payload.len()
        )));
    }
    Ok(PeerEvent::BitField(Bitfield::from_payload(payload)))
}

fn handle_request(id: MessageId, _: u32, payload: &Bytes) -> Result<PeerEvent, PeerError> {
    require(payload, 12, "request")?;
    let mut buf = payload.clone();
    let request = BlockRequest::new(buf.get_u32(), buf.get_u32(), buf.get_u32());
    Ok(match id {
        MessageId::Cancel => PeerEvent::Cancel(request),
        _ => PeerEvent::Request(request),
    })
}

fn handle_piece(_: MessageId, _: u32, payload: &Bytes) -> Result<PeerEvent, PeerError> {
    require(payload, 8, "piece")?;
    let mut buf = payload.clone();
    let index = buf.get_u32();
    let begin = buf.get_u32();
    Ok(PeerEvent::Piece(Block::new(index, begin, buf)))
}

fn handle_port(_: MessageId, _: u32, payload: &Bytes) -> Result<PeerEvent, PeerError> {
    require(payload, 2, "port")?;
    Ok(PeerEvent::Port(payload.clone().get_u16()))
}
