//! Ordered reassembly of downloaded chunks.

use crate::error::CoreError;
use crate::model::meta_file::Chunk;
use meshvault_crypto::ContentDigest;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of the pre-flight check against an existing destination file.
#[derive(Debug, PartialEq, Eq)]
pub enum DownloadPrecheck {
    /// The file on disk already matches the expected digest.
    AlreadyPresent,
    /// Download (and overwrite, if the file exists).
    Proceed,
}

/// Compare the destination against the index digest before downloading.
pub fn precheck_destination(
    destination: &Path,
    expected: &ContentDigest,
) -> Result<DownloadPrecheck, CoreError> {
    if destination.exists() {
        let on_disk = ContentDigest::from_file(destination)?;
        if &on_disk == expected {
            return Ok(DownloadPrecheck::AlreadyPresent);
        }
        warn!(destination = %destination.display(), "file exists with different content, overwriting");
    }
    Ok(DownloadPrecheck::Proceed)
}

/// Writes chunks to disk in strictly ascending order.
///
/// Chunks may arrive in any order; out-of-turn chunks wait in the buffer and
/// are drained greedily whenever the next expected order shows up. On
/// completion the buffer must be empty and exactly `expected` chunks must
/// have been written, otherwise the transfer violated the chunk contract.
pub struct OrderedChunkWriter {
    destination: PathBuf,
    file: Option<File>,
    current_order: usize,
    buffer: Vec<Chunk>,
}

impl OrderedChunkWriter {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            file: None,
            current_order: 0,
            buffer: Vec::new(),
        }
    }

    /// The next in-order chunk index expected on disk.
    pub fn current_order(&self) -> usize {
        self.current_order
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Accept a chunk and flush everything that became writable.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), CoreError> {
        self.buffer.push(chunk);
        self.drain()
    }

    fn drain(&mut self) -> Result<(), CoreError> {
        loop {
            let Some(position) = self
                .buffer
                .iter()
                .position(|c| c.order == self.current_order)
            else {
                return Ok(());
            };
            let chunk = self.buffer.swap_remove(position);

            // The first chunk truncates a possibly pre-existing file.
            if self.file.is_none() {
                self.file = Some(
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&self.destination)?,
                );
            }
            if let Some(file) = self.file.as_mut() {
                file.write_all(&chunk.data)?;
            }
            self.current_order += 1;
        }
    }

    /// Verify the completion invariants and close the file.
    pub fn finish(mut self, expected_chunks: usize) -> Result<(), CoreError> {
        if expected_chunks == 0 && self.file.is_none() {
            // Zero-length file: still create it.
            self.file = Some(File::create(&self.destination)?);
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        if !self.buffer.is_empty() || self.current_order != expected_chunks {
            return Err(CoreError::GetFailed(format!(
                "chunk transfer incomplete: stuck at chunk {}, {} left in buffer",
                self.current_order,
                self.buffer.len()
            )));
        }
        debug!(destination = %self.destination.display(), chunks = expected_chunks, "download complete");
        Ok(())
    }
}
