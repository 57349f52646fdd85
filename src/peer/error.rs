use thiserror::Error;

/// Errors that can occur during peer communication.
///
/// Argument and send errors are returned to the caller. Errors that arise
/// inside [`PeerConnection::process`](super::PeerConnection::process) are not:
/// the connection logs them, tears itself down and raises
/// [`PeerEvent::DroppedConnection`](super::PeerEvent::DroppedConnection).
#[derive(Debug, Error)]
pub enum PeerError {
    /// The transport failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller passed an out-of-contract argument. Raised before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer's handshake did not announce "BitTorrent protocol".
    #[error("unsupported protocol")]
    UnsupportedProtocol,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A message payload was shorter than its fixed layout, or its length
    /// disagreed with the frame header.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The peer declared a frame larger than we accept.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// No sub-protocol is registered under this extended message ID.
    #[error("unroutable extended message id: {0}")]
    UnroutableExtendedMessage(u8),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Extension protocol error.
    #[error("extension error: {0}")]
    Extension(String),

    /// Error decoding bencode in extension messages.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
