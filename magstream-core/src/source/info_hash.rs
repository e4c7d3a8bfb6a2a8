//! BitTorrent info hashes extracted from content identifiers.

use std::fmt;

use sha1::{Digest, Sha1};

use super::{ContentId, EngineError};

/// 20-byte SHA-1 hash identifying a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Hashes arbitrary bytes into an info hash.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    /// - `EngineError::InvalidIdentifier` - Wrong length or non-hex characters
    pub fn from_hex(value: &str) -> Result<Self, EngineError> {
        if value.len() != 40 {
            return Err(EngineError::InvalidIdentifier {
                identifier: value.to_string(),
                reason: format!("invalid hash length: {} (expected 40)", value.len()),
            });
        }

        let mut hash = [0u8; 20];
        hex::decode_to_slice(value, &mut hash).map_err(|e| EngineError::InvalidIdentifier {
            identifier: value.to_string(),
            reason: format!("invalid hex in hash: {e}"),
        })?;
        Ok(Self(hash))
    }

    /// Extracts the info hash from a magnet URI or a bare hex hash.
    ///
    /// # Errors
    /// - `EngineError::InvalidIdentifier` - Malformed magnet URI or missing `btih` topic
    pub fn from_identifier(identifier: &ContentId) -> Result<Self, EngineError> {
        let raw = identifier.as_str();
        if !raw.starts_with("magnet:") {
            return Self::from_hex(raw);
        }

        magnet_url::Magnet::new(raw).map_err(|e| EngineError::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason: format!("invalid magnet link: {e}"),
        })?;

        let query = raw.split_once('?').map(|(_, q)| q).unwrap_or_default();
        query
            .split('&')
            .find_map(|param| param.strip_prefix("xt=urn:btih:"))
            .ok_or_else(|| EngineError::InvalidIdentifier {
                identifier: identifier.to_string(),
                reason: "missing btih exact topic".to_string(),
            })
            .and_then(Self::from_hex)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
