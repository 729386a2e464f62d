//! Transaction ids.
//!
//! When an operation produces a snapshot, the id is derived from the new
//! manifest's content hash, so concurrent clients attempting the same
//! logical commit collide onto the same id instead of stacking distinct
//! half-finished transactions. Operations without a snapshot (clone) get a
//! timestamp-plus-randomness id.

use std::fmt;

use strata_utils_hash::Sha256;

const CONTENT_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxId(String);

impl TxId {
    /// Content-derived id: the first 8 hex characters of the manifest hash.
    pub fn from_manifest_hash(hash: &Sha256) -> TxId {
        TxId(hash.hex_prefix(CONTENT_PREFIX_LEN))
    }

    /// Fallback id for operations that commit no snapshot.
    pub fn random() -> TxId {
        let seconds = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut noise = [0u8; 4];
        if getrandom::fill(&mut noise).is_err() {
            // Degraded uniqueness beats failing the operation.
            noise = std::process::id().to_be_bytes();
        }
        TxId(format!(
            "{seconds:x}-{:02x}{:02x}{:02x}{:02x}",
            noise[0], noise[1], noise[2], noise[3]
        ))
    }

    pub fn from_string(id: String) -> TxId {
        TxId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod unittests {
    use super::*;

    #[test]
    fn content_ids_are_deterministic() {
        let hash = Sha256::digest("same manifest");
        assert_eq!(
            TxId::from_manifest_hash(&hash),
            TxId::from_manifest_hash(&hash)
        );
        assert_eq!(TxId::from_manifest_hash(&hash).as_str().len(), 8);
    }

    #[test]
    fn different_manifests_differ() {
        let a = TxId::from_manifest_hash(&Sha256::digest("one"));
        let b = TxId::from_manifest_hash(&Sha256::digest("two"));
        assert_ne!(a, b);
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(TxId::random(), TxId::random());
    }
}
