//! Metadata exchange extension (ut_metadata, BEP-9).
//!
//! Lets a peer that only knows an info hash fetch the info dictionary from
//! peers that have it, 16 KiB at a time.

use std::any::Any;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use super::error::PeerError;
use super::event::PeerEvent;
use super::extension::{ExtensionHandshake, SubProtocol, SubProtocolContext};
use crate::bencode::{decode_prefix, encode, Dict, Value};
use crate::constants::{MAX_METADATA_SIZE, METADATA_PIECE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

/// A ut_metadata message: a bencoded dictionary, followed by the raw piece for
/// data messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    /// Only present in data messages.
    pub total_size: Option<u32>,
    /// Only present in data messages.
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: u32, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = Dict::with_capacity(3);
        dict.insert("msg_type", Value::Integer(self.msg_type.as_byte() as i64));
        dict.insert("piece", Value::Integer(self.piece as i64));
        if let Some(total_size) = self.total_size {
            dict.insert("total_size", Value::Integer(total_size as i64));
        }

        let mut out = encode(&Value::Dict(dict));
        if let Some(ref data) = self.data {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    /// Decodes a message. The piece data of a data message is everything after
    /// the dictionary and shares the payload's buffer.
    pub fn decode(payload: &Bytes) -> Result<Self, PeerError> {
        let (value, dict_end) = decode_prefix(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("expected dict".into()))?;

        let msg_type = dict
            .get(b"msg_type")
            .ok_or_else(|| PeerError::Extension("missing msg_type".into()))?
            .as_int::<u8>()?;
        let msg_type = MetadataMessageType::from_byte(msg_type)
            .ok_or_else(|| PeerError::Extension(format!("invalid msg_type {}", msg_type)))?;

        let piece = dict
            .get(b"piece")
            .ok_or_else(|| PeerError::Extension("missing piece".into()))?
            .as_int::<u32>()?;

        let total_size = dict
            .get(b"total_size")
            .map(|v| v.as_int::<u32>())
            .transpose()?;

        let data = (msg_type == MetadataMessageType::Data).then(|| payload.slice(dict_end..));

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

/// The size of piece `piece` of a `total_size` byte info dictionary.
pub fn metadata_piece_size(piece: u32, total_size: usize) -> usize {
    let offset = piece as usize * METADATA_PIECE_SIZE;
    if offset >= total_size {
        0
    } else {
        (total_size - offset).min(METADATA_PIECE_SIZE)
    }
}

#[derive(Debug)]
struct MetadataDownload {
    total_size: usize,
    pieces: Vec<Option<Bytes>>,
}

impl MetadataDownload {
    fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    fn assemble(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.total_size);
        for piece in self.pieces.iter().flatten() {
            out.extend_from_slice(piece);
        }
        Bytes::from(out)
    }
}

/// The ut_metadata sub-protocol.
///
/// Built with [`UtMetadata::with_metadata`] it serves an info dictionary and
/// advertises its size. Built with [`UtMetadata::new`] it fetches one: when a
/// peer's extension handshake carries `metadata_size`, every piece is
/// requested, and once all have arrived and hash to the connection's info
/// hash a [`PeerEvent::MetadataReceived`] is raised.
#[derive(Debug, Default)]
pub struct UtMetadata {
    metadata: Option<Bytes>,
    download: Option<MetadataDownload>,
}

impl UtMetadata {
    pub const NAME: &'static str = "ut_metadata";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(metadata: impl Into<Bytes>) -> Self {
        Self {
            metadata: Some(metadata.into()),
            download: None,
        }
    }

    /// The info dictionary, once known.
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Indices of pieces requested but not yet received.
    pub fn missing_pieces(&self) -> Vec<u32> {
        self.download
            .as_ref()
            .map(|d| {
                d.pieces
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.is_none())
                    .map(|(i, _)| i as u32)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn serve(
        &self,
        ctx: &mut SubProtocolContext<'_, '_>,
        piece: u32,
    ) -> Result<(), PeerError> {
        let reply = match &self.metadata {
            Some(metadata) if (piece as usize) < metadata_piece_count(metadata.len()) => {
                let start = piece as usize * METADATA_PIECE_SIZE;
                let end = start + metadata_piece_size(piece, metadata.len());
                MetadataMessage::data(piece, metadata.len() as u32, metadata.slice(start..end))
            }
            _ => MetadataMessage::reject(piece),
        };
        ctx.send(reply.encode())
    }

    fn receive_piece(
        &mut self,
        ctx: &mut SubProtocolContext<'_, '_>,
        piece: u32,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let Some(download) = self.download.as_mut() else {
            trace!(piece, "ignoring unsolicited metadata piece");
            return Ok(());
        };

        let expected = metadata_piece_size(piece, download.total_size);
        let slot = download
            .pieces
            .get_mut(piece as usize)
            .ok_or_else(|| PeerError::Extension(format!("metadata piece {} out of range", piece)))?;
        if data.len() != expected {
            return Err(PeerError::Extension(format!(
                "metadata piece {} is {} bytes, expected {}",
                piece,
                data.len(),
                expected
            )));
        }
        *slot = Some(data);

        if !download.is_complete() {
            return Ok(());
        }

        let metadata = download.assemble();
        let info_hash = ctx
            .state()
            .info_hash
            .ok_or_else(|| PeerError::Extension("no info hash to verify metadata".into()))?;
        if Sha1::digest(&metadata).as_slice() != &info_hash[..] {
            self.download = None;
            return Err(PeerError::Extension("metadata hash mismatch".into()));
        }

        debug!(size = metadata.len(), "metadata verified");
        self.download = None;
        self.metadata = Some(metadata.clone());
        ctx.emit(PeerEvent::MetadataReceived(metadata));
        Ok(())
    }
}

impl SubProtocol for UtMetadata {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handshake_fields(&self, fields: &mut Dict) {
        if let Some(ref metadata) = self.metadata {
            fields.insert("metadata_size", Value::Integer(metadata.len() as i64));
        }
    }

    fn on_handshake(
        &mut self,
        ctx: &mut SubProtocolContext<'_, '_>,
        handshake: &ExtensionHandshake,
    ) -> Result<(), PeerError> {
        if self.metadata.is_some() || self.download.is_some() {
            return Ok(());
        }
        let Some(size) = handshake.metadata_size else {
            return Ok(());
        };
        let total_size = match usize::try_from(size) {
            Ok(s) if s > 0 && s <= MAX_METADATA_SIZE => s,
            _ => {
                debug!(size, "peer advertised unusable metadata_size");
                return Ok(());
            }
        };

        let count = metadata_piece_count(total_size);
        debug!(total_size, pieces = count, "requesting metadata");
        for piece in 0..count as u32 {
            ctx.send(MetadataMessage::request(piece).encode())?;
        }
        self.download = Some(MetadataDownload {
            total_size,
            pieces: vec![None; count],
        });
        Ok(())
    }

    fn on_extended_message(
        &mut self,
        ctx: &mut SubProtocolContext<'_, '_>,
        payload: &Bytes,
    ) -> Result<(), PeerError> {
        let message = MetadataMessage::decode(payload)?;
        match message.msg_type {
            MetadataMessageType::Request => self.serve(ctx, message.piece),
            MetadataMessageType::Data => {
                let data = message.data.unwrap_or_default();
                self.receive_piece(ctx, message.piece, data)
            }
            MetadataMessageType::Reject => {
                ctx.emit(PeerEvent::MetadataRejected(message.piece));
                Ok(())
            }
        }
    }

    fn on_teardown(&mut self) {
        self.download = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
