//! Helpers shared by the operation pipelines.

use crate::error::CoreError;
use crate::file::chunking::{decrypt_chunk, PreparedChunk};
use crate::file::download::OrderedChunkWriter;
use crate::model::meta_file::{Chunk, FileVersion, MetaChunk, MetaFile};
use crate::model::profile::UserProfile;
use crate::model::tree::NodeId;
use crate::network::content::{content_keys, NetworkContent};
use crate::network::data_manager::{put_unblocked, DataManager};
use crate::network::parameters::Parameters;
use crate::notify::{notify_process, MessageFactory};
use crate::session::Session;
use meshvault_crypto::{
    decrypt_hybrid, encrypt_hybrid, KeyPair, LocationKey, PublicKey,
};
use meshvault_process::{execute_blocking, CancelToken, ProcessStep, StepError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolve `path` against the session root, rejecting locations outside it.
pub(crate) fn relative_to_root(root: &Path, path: &Path) -> Result<PathBuf, CoreError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    match absolute.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => Ok(relative.to_path_buf()),
        _ => Err(CoreError::IllegalFileLocation(format!(
            "'{}' is not inside the root '{}'",
            path.display(),
            root.display()
        ))),
    }
}

/// Root-relative path with `/` separators, as used in tasks and sidecars.
pub(crate) fn path_string(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// The DHT location of a node's meta file.
pub(crate) fn meta_location(public: &PublicKey) -> Result<LocationKey, CoreError> {
    Ok(public.fingerprint()?)
}

/// Fetch and open a meta file with the node keys.
pub(crate) fn fetch_meta_file(
    data_manager: &Arc<dyn DataManager>,
    node_keys: &KeyPair,
) -> Result<MetaFile, CoreError> {
    let params = Parameters::new(meta_location(node_keys.public())?, content_keys::META_FILE);
    let record = data_manager
        .get(&params)?
        .ok_or_else(|| CoreError::GetFailed("meta file not found".to_string()))?;
    let envelope = record.content.into_hybrid()?;
    let plaintext = decrypt_hybrid(&envelope, node_keys)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Encrypt and store a meta file under the node's public key. Passing
/// `new_protection` rotates the record's write ACL.
pub(crate) fn store_meta_file(
    data_manager: &Arc<dyn DataManager>,
    meta_file: &MetaFile,
    node_public: &PublicKey,
    protection: &KeyPair,
    new_protection: Option<&KeyPair>,
    ttl: Duration,
) -> Result<(), CoreError> {
    let plaintext = serde_json::to_vec(meta_file)?;
    let envelope = encrypt_hybrid(&plaintext, node_public)?;
    let mut params = Parameters::new(meta_location(node_public)?, content_keys::META_FILE)
        .with_data(NetworkContent::Hybrid(envelope))
        .with_protection_keys(protection.clone())
        .with_ttl(ttl);
    if let Some(new_protection) = new_protection {
        params = params.with_new_protection_keys(new_protection.clone());
    }
    data_manager.put(&params)
}

pub(crate) fn remove_meta_file(
    data_manager: &Arc<dyn DataManager>,
    node_public: &PublicKey,
    protection: &KeyPair,
) -> Result<(), CoreError> {
    let params = Parameters::new(meta_location(node_public)?, content_keys::META_FILE)
        .with_protection_keys(protection.clone());
    data_manager.remove(&params)
}

/// Upload prepared chunks concurrently through non-blocking puts, awaiting
/// every handle. Fails on the first failed put.
pub(crate) fn upload_chunks(
    data_manager: &Arc<dyn DataManager>,
    prepared: Vec<PreparedChunk>,
    protection: &KeyPair,
    ttl: Duration,
) -> Result<Vec<MetaChunk>, CoreError> {
    let mut metas = Vec::with_capacity(prepared.len());
    let mut futures = Vec::with_capacity(prepared.len());
    for chunk in prepared {
        let params = Parameters::new(chunk.meta.chunk_id, content_keys::FILE_CHUNK)
            .with_data(NetworkContent::Hybrid(chunk.envelope))
            .with_protection_keys(protection.clone())
            .with_ttl(ttl);
        futures.push(put_unblocked(data_manager.clone(), params));
        metas.push(chunk.meta);
    }
    for future in &futures {
        future.await_result()?;
    }
    debug!(chunks = metas.len(), "uploaded chunks");
    Ok(metas)
}

/// Best-effort deletion of stored chunks (eviction and rollback paths).
pub(crate) fn delete_chunks(
    data_manager: &Arc<dyn DataManager>,
    chunks: &[MetaChunk],
    protection: &KeyPair,
) {
    for chunk in chunks {
        let params = Parameters::new(chunk.chunk_id, content_keys::FILE_CHUNK)
            .with_protection_keys(protection.clone());
        if let Err(e) = data_manager.remove(&params) {
            warn!(order = chunk.order, error = %e, "could not delete chunk");
        }
    }
}

/// Fetch one chunk and open it with the file's chunk keys.
pub(crate) fn fetch_and_decrypt_chunk(
    data_manager: &Arc<dyn DataManager>,
    meta: &MetaChunk,
    chunk_keys: &KeyPair,
) -> Result<Chunk, CoreError> {
    let params = Parameters::new(meta.chunk_id, content_keys::FILE_CHUNK);
    let record = data_manager.get(&params)?.ok_or_else(|| {
        CoreError::GetFailed(format!("chunk {} not found", meta.order))
    })?;
    let envelope = record.content.into_hybrid()?;
    decrypt_chunk(&envelope, chunk_keys)
}

/// Download one version's chunks to `destination`, tolerating out-of-order
/// arrival.
pub(crate) fn download_version(
    data_manager: &Arc<dyn DataManager>,
    meta_file: &MetaFile,
    version: &FileVersion,
    destination: &Path,
) -> Result<(), CoreError> {
    let mut writer = OrderedChunkWriter::new(destination);
    let total = version.chunks.len();
    for (number, meta) in version.chunks.iter().enumerate() {
        debug!(
            destination = %destination.display(),
            chunk = number + 1,
            total,
            "downloading chunk"
        );
        let chunk = fetch_and_decrypt_chunk(data_manager, meta, meta_file.chunk_keys())?;
        writer.push(chunk)?;
    }
    writer.finish(total)
}

/// Protection keys and notification recipients of a node, resolved from its
/// sharing state: inside a shared folder the share keys protect the DHT
/// objects and all participants are notified, otherwise the user's default
/// protection keys apply and only the own peers are notified.
pub(crate) struct ResolvedShare {
    pub protection: KeyPair,
    pub recipients: BTreeSet<String>,
    pub shared: bool,
}

pub(crate) fn resolve_share(
    profile: &UserProfile,
    node: NodeId,
) -> Result<ResolvedShare, CoreError> {
    let mut recipients = BTreeSet::new();
    recipients.insert(profile.user_id().to_string());

    let tree = profile.tree();
    if let Some(shared_folder) = tree.shared_folder_of(node) {
        let folder = tree
            .node(shared_folder)
            .ok_or_else(|| CoreError::IllegalFileLocation("dangling share folder".to_string()))?;
        for permission in folder.permissions() {
            recipients.insert(permission.user_id.clone());
        }
        let share_keys = match &folder.kind {
            crate::model::tree::IndexKind::Folder { share_keys, .. } => share_keys.clone(),
            _ => None,
        };
        let protection = share_keys.ok_or_else(|| {
            CoreError::IllegalFileLocation("shared folder has no share keys".to_string())
        })?;
        Ok(ResolvedShare {
            protection,
            recipients,
            shared: true,
        })
    } else {
        Ok(ResolvedShare {
            protection: profile.protection_keys().clone(),
            recipients,
            shared: false,
        })
    }
}

/// Final pipeline step: fan out the notification round. Notification
/// failures are logged, never compensated — the operation itself already
/// committed.
pub(crate) struct NotifyStep<F>
where
    F: Fn() -> Option<(Arc<dyn MessageFactory>, BTreeSet<String>)> + Send,
{
    pub session: Arc<Session>,
    pub prepare: F,
}

impl<F> ProcessStep for NotifyStep<F>
where
    F: Fn() -> Option<(Arc<dyn MessageFactory>, BTreeSet<String>)> + Send,
{
    fn name(&self) -> &str {
        "notify"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let Some((factory, recipients)) = (self.prepare)() else {
            return Ok(());
        };
        let mut process = notify_process(self.session.clone(), factory, recipients);
        let outcome = execute_blocking(&mut process);
        if let Err(e) = outcome.into_result() {
            warn!(error = %e, "notification round failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::meta_file::FileVersion;
    use crate::model::now_millis;
    use crate::network::memory::MemoryDataManager;

    /// The meta chunk list is not required to be in chunk order; the
    /// download buffer reorders on disk.
    #[test]
    fn test_download_version_tolerates_shuffled_chunk_list() {
        let overlay: Arc<dyn DataManager> = Arc::new(MemoryDataManager::new());
        let node_keys = KeyPair::generate(1024).unwrap();
        let chunk_keys = KeyPair::generate(1024).unwrap();
        let protection = KeyPair::generate(1024).unwrap();

        let content: Vec<u8> = (0..5u8).flat_map(|b| vec![b; 100]).collect();
        let chunks: Vec<crate::model::meta_file::Chunk> = content
            .chunks(100)
            .enumerate()
            .map(|(order, data)| crate::model::meta_file::Chunk {
                order,
                data: data.to_vec(),
            })
            .collect();
        let prepared =
            crate::file::chunking::prepare_chunks(&chunks, chunk_keys.public()).unwrap();
        let mut metas =
            upload_chunks(&overlay, prepared, &protection, Duration::from_secs(60)).unwrap();

        // Overlay hands chunks back in list order [3, 1, 0, 2, 4].
        let shuffled: Vec<_> = [3usize, 1, 0, 2, 4]
            .iter()
            .map(|i| metas.remove(metas.iter().position(|m| m.order == *i).unwrap()))
            .collect();
        let version = FileVersion {
            index: 0,
            size: content.len() as u64,
            timestamp_ms: now_millis(),
            chunks: shuffled,
        };
        let meta_file = MetaFile::new(node_keys.public().clone(), chunk_keys, version.clone());

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("restored.bin");
        download_version(&overlay, &meta_file, &version, &destination).unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), content);
    }
}
