//! Protocol constants and tuning parameters.
//!
//! Wire values come from BEP-3, BEP-6, BEP-9 and BEP-10. Tuning values are the
//! defaults behind [`PeerConfig`](crate::peer::PeerConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-PW0001-";

/// Client name advertised in the extension handshake's `v` key
pub const CLIENT_VERSION: &str = "peerwire/0.1.0";

// ============================================================================
// Handshake
// ============================================================================

/// BitTorrent protocol string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length byte that precedes the protocol string
pub const PROTOCOL_STRING_LEN: u8 = 19;

/// Full handshake length: length byte, protocol string, reserved, info hash, peer id
pub const HANDSHAKE_LEN: usize = 68;

/// Info hash length in bytes
pub const INFO_HASH_LEN: usize = 20;

/// Peer ID length in bytes
pub const PEER_ID_LEN: usize = 20;

// ============================================================================
// Reserved capability bits
// ============================================================================

/// Reserved byte carrying the extension protocol bit (BEP-10)
pub const EXTENSION_PROTOCOL_BYTE: usize = 5;

/// Extension protocol bit (BEP-10)
pub const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

/// Reserved byte carrying the fast extension and DHT bits
pub const FAST_EXTENSION_BYTE: usize = 7;

/// Fast extension bit (BEP-6)
pub const FAST_EXTENSION_BIT: u8 = 0x04;

/// DHT support bit (BEP-5)
pub const DHT_BIT: u8 = 0x01;

// ============================================================================
// Framing
// ============================================================================

/// Length prefix size of every frame
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame length accepted from a peer (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Bytes pulled from the transport per read attempt
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Idle time after which a keep-alive is sent
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Bitfield obfuscation
// ============================================================================

/// Pieces withheld from an obfuscated bitfield and sent as Have instead
pub const OBFUSCATED_PIECES: usize = 16;

/// Bitfields this small are never obfuscated
pub const MIN_OBFUSCATION_PIECES: usize = 32;

// ============================================================================
// Extension protocol
// ============================================================================

/// Extended message ID reserved for the extension handshake
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Default `reqq` advertised in the extension handshake
pub const DEFAULT_REQUEST_QUEUE: i64 = 250;

/// Size of a metadata piece (BEP-9)
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Largest metadata_size we agree to fetch from a peer (8MB)
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// Allowed fast set size (BEP-6)
pub const ALLOWED_FAST_SET_SIZE: usize = 10;
