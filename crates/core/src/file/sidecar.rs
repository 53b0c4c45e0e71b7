//! The persistent sidecar written at logout.
//!
//! Holds the last known digest of every file plus the public-key cache, so
//! the next login can reconcile changes made while offline. The file name is
//! a disk-format constant shared across implementations.

use crate::error::CoreError;
use meshvault_crypto::{ContentDigest, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const SIDECAR_FILE: &str = ".H2H_meta";

/// State carried across offline periods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentMetadata {
    /// Root-relative path → digest at logout time.
    pub file_tree: BTreeMap<String, ContentDigest>,
    /// user id → public key, to skip DHT lookups after login.
    pub public_key_cache: BTreeMap<String, PublicKey>,
}

/// Write the sidecar under `root`.
pub fn write_sidecar(root: &Path, metadata: &PersistentMetadata) -> Result<(), CoreError> {
    let bytes = serde_json::to_vec_pretty(metadata)?;
    std::fs::write(root.join(SIDECAR_FILE), bytes)?;
    Ok(())
}

/// Read the sidecar under `root`; a missing sidecar is an empty one (first
/// login on this machine).
pub fn read_sidecar(root: &Path) -> Result<PersistentMetadata, CoreError> {
    let path = root.join(SIDECAR_FILE);
    if !path.exists() {
        return Ok(PersistentMetadata::default());
    }
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_crypto::KeyPair;

    #[test]
    fn test_sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = PersistentMetadata::default();
        metadata
            .file_tree
            .insert("docs/a.txt".to_string(), ContentDigest::from_data(b"a"));
        metadata.public_key_cache.insert(
            "bob".to_string(),
            KeyPair::generate(1024).unwrap().public().clone(),
        );

        write_sidecar(dir.path(), &metadata).unwrap();
        let restored = read_sidecar(dir.path()).unwrap();

        assert_eq!(restored.file_tree, metadata.file_tree);
        assert_eq!(
            restored.public_key_cache.get("bob"),
            metadata.public_key_cache.get("bob")
        );
    }

    #[test]
    fn test_missing_sidecar_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = read_sidecar(dir.path()).unwrap();
        assert!(metadata.file_tree.is_empty());
        assert!(metadata.public_key_cache.is_empty());
    }
}
