use std::fmt;

use rand::Rng as _;

use super::error::PeerError;
use crate::constants::{CLIENT_PREFIX, PEER_ID_LEN};

/// A 20-byte peer identifier.
///
/// Generated IDs follow the Azureus-style format `-PW0001-<12 random bytes>`.
///
/// ```
/// use peerwire::peer::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert_eq!(peer_id.as_bytes().len(), 20);
/// assert_eq!(peer_id.client_id(), Some("PW0001"));
///
/// assert!(PeerId::try_from(&b"too short"[..]).is_err());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a new random peer ID with this library's client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; PEER_ID_LEN];
        id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
        rand::rng().fill(&mut id[CLIENT_PREFIX.len()..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Extracts the client identifier if using Azureus-style format.
    ///
    /// Returns the 6-character client ID (e.g., "UT3500") if the peer ID
    /// follows the `-XXXXXX-` format, otherwise `None`.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = PeerError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let id: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| {
            PeerError::InvalidArgument(format!(
                "peer id must be {} bytes, got {}",
                PEER_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(id))
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(id: [u8; 20]) -> Self {
        Self(id)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({})", client),
            None => write!(f, "PeerId({})", hex::encode(&self.0[..8])),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_alphanumeric() || *byte == b'-' {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{:02x}", byte)?;
            }
        }
        Ok(())
    }
}
