//! Local file handling: chunk codec, ordered downloads, the logout sidecar
//! and disk digests.

pub mod chunking;
pub mod disk;
pub mod download;
pub mod sidecar;

pub use chunking::{decrypt_chunk, prepare_chunks, split_file, PreparedChunk};
pub use disk::digest_tree;
pub use download::{precheck_destination, DownloadPrecheck, OrderedChunkWriter};
pub use sidecar::{read_sidecar, write_sidecar, PersistentMetadata, SIDECAR_FILE};
