//! Splitting files into independently encrypted chunks.
//!
//! A file of length L with chunk size C produces ⌈L/C⌉ chunks in strict
//! offset order. Each chunk is hybrid-encrypted under the meta file's chunk
//! key and stored under a fresh random location key; the meta chunk list
//! carries the mapping back.

use crate::error::CoreError;
use crate::model::meta_file::{Chunk, MetaChunk};
use meshvault_crypto::{
    decrypt_hybrid, encrypt_hybrid, ContentDigest, HybridEncryptedContent, KeyPair, LocationKey,
    PublicKey,
};
use rand_core::{OsRng, RngCore};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read a file into ordered chunks.
pub fn split_file(path: &Path, chunk_size: usize) -> Result<Vec<Chunk>, CoreError> {
    if chunk_size == 0 {
        return Err(CoreError::IllegalFileLocation(
            "chunk size must be positive".to_string(),
        ));
    }

    let mut file = File::open(path)?;
    let mut chunks = Vec::new();
    let mut order = 0usize;
    loop {
        let mut data = vec![0u8; chunk_size];
        let mut filled = 0usize;
        while filled < chunk_size {
            let read = file.read(&mut data[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            break;
        }
        data.truncate(filled);
        chunks.push(Chunk { order, data });
        order += 1;
        if filled < chunk_size {
            break;
        }
    }
    Ok(chunks)
}

/// A chunk ready for upload: its fresh location key, the meta reference and
/// the encrypted envelope.
pub struct PreparedChunk {
    pub meta: MetaChunk,
    pub envelope: HybridEncryptedContent,
}

fn random_chunk_id() -> LocationKey {
    let mut id = [0u8; 32];
    OsRng.fill_bytes(&mut id);
    id
}

/// Encrypt chunks for upload under the file's chunk key. Chunk ids are fresh
/// random keys: chunks are write-once, new versions never reuse ids.
pub fn prepare_chunks(
    chunks: &[Chunk],
    chunk_public: &PublicKey,
) -> Result<Vec<PreparedChunk>, CoreError> {
    let mut prepared = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let chunk_hash = ContentDigest::from_data(&chunk.data);
        let plaintext = serde_json::to_vec(chunk)?;
        let envelope = encrypt_hybrid(&plaintext, chunk_public)?;
        prepared.push(PreparedChunk {
            meta: MetaChunk {
                chunk_id: random_chunk_id(),
                order: chunk.order,
                chunk_hash,
            },
            envelope,
        });
    }
    Ok(prepared)
}

/// Open a downloaded chunk envelope with the file's chunk key.
pub fn decrypt_chunk(
    envelope: &HybridEncryptedContent,
    chunk_keys: &KeyPair,
) -> Result<Chunk, CoreError> {
    let plaintext = decrypt_hybrid(envelope, chunk_keys)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn test_split_exact_multiple() {
        let file = write_temp(&[1u8; 4096]);
        let chunks = split_file(file.path(), 1024).unwrap();

        assert_eq!(chunks.len(), 4);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.order, i);
            assert_eq!(chunk.data.len(), 1024);
        }
    }

    #[test]
    fn test_split_with_remainder() {
        let file = write_temp(&[2u8; 2500]);
        let chunks = split_file(file.path(), 1024).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].data.len(), 2500 - 2048);
    }

    #[test]
    fn test_split_empty_file() {
        let file = write_temp(&[]);
        let chunks = split_file(file.path(), 1024).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_split_then_join_is_identity() {
        let content: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let file = write_temp(&content);
        let chunks = split_file(file.path(), 999).unwrap();

        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(joined, content);
    }

    #[test]
    fn test_prepared_chunks_decrypt_back() {
        let keys = KeyPair::generate(1024).unwrap();
        let file = write_temp(&[7u8; 3000]);
        let chunks = split_file(file.path(), 1024).unwrap();

        let prepared = prepare_chunks(&chunks, keys.public()).unwrap();
        assert_eq!(prepared.len(), 3);

        for (original, prepared) in chunks.iter().zip(&prepared) {
            let decrypted = decrypt_chunk(&prepared.envelope, &keys).unwrap();
            assert_eq!(&decrypted, original);
            assert_eq!(
                prepared.meta.chunk_hash,
                ContentDigest::from_data(&original.data)
            );
        }
    }

    #[test]
    fn test_chunk_ids_are_unique() {
        let keys = KeyPair::generate(1024).unwrap();
        let file = write_temp(&[1u8; 4096]);
        let chunks = split_file(file.path(), 1024).unwrap();

        let prepared = prepare_chunks(&chunks, keys.public()).unwrap();
        let mut ids: Vec<LocationKey> = prepared.iter().map(|p| p.meta.chunk_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), prepared.len());
    }
}
