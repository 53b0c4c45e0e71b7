//! Per-file metadata stored in the DHT.

use meshvault_crypto::{ContentDigest, KeyPair, LocationKey, PublicKey};
use serde::{Deserialize, Serialize};

/// Reference to one stored chunk of a file version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaChunk {
    /// DHT location key of the chunk record.
    pub chunk_id: LocationKey,
    /// 0-based position within the version.
    pub order: usize,
    /// MD5 of the plaintext chunk.
    pub chunk_hash: ContentDigest,
}

/// One encrypted slice of a file's bytes, stored independently in the DHT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub order: usize,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// One version of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub index: usize,
    pub size: u64,
    pub timestamp_ms: u64,
    pub chunks: Vec<MetaChunk>,
}

/// The per-file index in the DHT: versions, chunk references and the keypair
/// every chunk of every version is hybrid-encrypted under.
///
/// Versions are kept sorted ascending by `index`; the newest is the tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFile {
    id: PublicKey,
    versions: Vec<FileVersion>,
    chunk_keys: KeyPair,
}

impl MetaFile {
    pub fn new(id: PublicKey, chunk_keys: KeyPair, first_version: FileVersion) -> Self {
        Self {
            id,
            versions: vec![first_version],
            chunk_keys,
        }
    }

    pub fn id(&self) -> &PublicKey {
        &self.id
    }

    pub fn chunk_keys(&self) -> &KeyPair {
        &self.chunk_keys
    }

    pub fn versions(&self) -> &[FileVersion] {
        &self.versions
    }

    pub fn newest_version(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    pub fn version_by_index(&self, index: usize) -> Option<&FileVersion> {
        self.versions.iter().find(|v| v.index == index)
    }

    /// The index the next version should carry. Indices never repeat, even
    /// after eviction of old versions.
    pub fn next_version_index(&self) -> usize {
        self.newest_version().map(|v| v.index + 1).unwrap_or(0)
    }

    /// Append a version, keeping the ascending order.
    pub fn add_version(&mut self, version: FileVersion) {
        self.versions.push(version);
        self.versions.sort_by_key(|v| v.index);
    }

    /// Remove a specific version (rollback path).
    pub fn remove_version(&mut self, index: usize) -> Option<FileVersion> {
        let position = self.versions.iter().position(|v| v.index == index)?;
        Some(self.versions.remove(position))
    }

    /// Evict the oldest version. Callers enforce the keep-at-least-one rule.
    pub fn remove_oldest(&mut self) -> Option<FileVersion> {
        if self.versions.is_empty() {
            None
        } else {
            Some(self.versions.remove(0))
        }
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Sum of the sizes of all kept versions.
    pub fn total_size(&self) -> u64 {
        self.versions.iter().map(|v| v.size).sum()
    }

    /// Chunk references of every kept version, oldest first.
    pub fn all_chunks(&self) -> Vec<MetaChunk> {
        self.versions
            .iter()
            .flat_map(|v| v.chunks.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_millis;

    fn version(index: usize, size: u64) -> FileVersion {
        FileVersion {
            index,
            size,
            timestamp_ms: now_millis(),
            chunks: Vec::new(),
        }
    }

    fn meta_file() -> MetaFile {
        let keys = KeyPair::generate(1024).unwrap();
        let chunk_keys = KeyPair::generate(1024).unwrap();
        MetaFile::new(keys.public().clone(), chunk_keys, version(0, 100))
    }

    #[test]
    fn test_versions_stay_sorted() {
        let mut meta = meta_file();
        meta.add_version(version(2, 10));
        meta.add_version(version(1, 20));

        let indices: Vec<usize> = meta.versions().iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(meta.newest_version().unwrap().index, 2);
    }

    #[test]
    fn test_next_index_survives_eviction() {
        let mut meta = meta_file();
        meta.add_version(version(1, 10));
        meta.add_version(version(2, 10));
        meta.remove_oldest();
        meta.remove_oldest();

        // Only version 2 is left; the next index must not reuse 0 or 1.
        assert_eq!(meta.next_version_index(), 3);
    }

    #[test]
    fn test_total_size_sums_versions() {
        let mut meta = meta_file();
        meta.add_version(version(1, 50));
        assert_eq!(meta.total_size(), 150);
    }
}
