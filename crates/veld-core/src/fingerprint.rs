//! Content fingerprints — the primary key of the cache.

use std::fmt;
use std::str::FromStr;

/// BLAKE3 hash of a blob's bytes. Equality implies byte-identical
/// content; ordering is by digest bytes. The textual form is lowercase
/// hexadecimal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of the given content.
    pub fn of(data: &[u8]) -> Self {
        Fingerprint(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First two hex characters — the subdirectory key of the disk tier.
    pub fn hex_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}…)", hex::encode(&self.0[..4]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint: expected 64 lowercase hex characters")]
pub struct InvalidFingerprint;

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(InvalidFingerprint);
        }
        let raw = hex::decode(s).map_err(|_| InvalidFingerprint)?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Fingerprint(bytes))
    }
}
