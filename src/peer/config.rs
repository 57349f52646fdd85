use std::time::Duration;

use crate::constants::{KEEP_ALIVE_INTERVAL, MAX_MESSAGE_SIZE, READ_CHUNK_SIZE};

/// Per-connection tuning.
///
/// ```
/// use peerwire::peer::PeerConfig;
/// use std::time::Duration;
///
/// let config = PeerConfig {
///     keep_alive_interval: Duration::from_secs(30),
///     obfuscation_seed: Some(7),
///     ..PeerConfig::default()
/// };
/// assert_eq!(config.max_frame_len, 16 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Idle time after which a keep-alive is queued.
    pub keep_alive_interval: Duration,
    /// Largest frame length accepted from the peer.
    pub max_frame_len: usize,
    /// Upper bound on bytes pulled from the transport in one poll.
    pub read_chunk_size: usize,
    /// Seed for the bitfield obfuscation RNG. The RNG is not cryptographic;
    /// obfuscation only deters passive observers. `None` seeds from the OS.
    pub obfuscation_seed: Option<u64>,
    /// Queue [`PeerEvent::NoData`](super::PeerEvent::NoData) on idle polls.
    pub emit_no_data: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            max_frame_len: MAX_MESSAGE_SIZE,
            read_chunk_size: READ_CHUNK_SIZE,
            obfuscation_seed: None,
            emit_no_data: true,
        }
    }
}
