//! Media distribution manifests (C9): content-addressed binding between a
//! record and the blob(s) it describes, plus distribution hints so a
//! client knows where to actually fetch the bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content-addressed pointer to a piece of media, plus operator-supplied
/// hints about where it can be retrieved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageManifest {
    /// Lowercase hex SHA-256 of the raw media bytes.
    pub content_hash: String,
    pub size_bytes: u64,
    pub mime_type: String,
    #[serde(default)]
    pub distribution: Vec<DistributionHint>,
}

impl StorageManifest {
    /// Builds a manifest from raw bytes, computing `content_hash` directly
    /// rather than trusting a caller-supplied digest.
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            content_hash: hash_hex(bytes),
            size_bytes: bytes.len() as u64,
            mime_type: mime_type.into(),
            distribution: Vec::new(),
        }
    }

    /// True if `bytes` hashes to this manifest's `content_hash`. Used to
    /// verify media fetched from an untrusted distribution hint before it
    /// is served or cached.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        hash_hex(bytes) == self.content_hash
    }
}

/// One way to retrieve the media this manifest describes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionHint {
    pub kind: HintKind,
    pub location: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    /// Direct HTTPS URL served by the publishing node or a mirror.
    Http,
    /// An IPFS content identifier.
    Ipfs,
    /// A BitTorrent magnet link.
    Bittorrent,
    /// An Arweave transaction id carrying the raw bytes.
    Arweave,
}

fn hash_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic_sha256() {
        let manifest = StorageManifest::from_bytes(b"hello world", "text/plain");
        assert_eq!(
            manifest.content_hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde"
        );
        assert_eq!(manifest.size_bytes, 11);
    }

    #[test]
    fn verify_rejects_tampered_bytes() {
        let manifest = StorageManifest::from_bytes(b"hello world", "text/plain");
        assert!(manifest.verify(b"hello world"));
        assert!(!manifest.verify(b"hello world!"));
    }
}
