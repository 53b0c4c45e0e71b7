//! Downloading the newest version of a file to its place in the root.

use crate::file::download::{precheck_destination, DownloadPrecheck};
use crate::processes::common::{download_version, fetch_meta_file, relative_to_root};
use crate::session::Session;
use meshvault_crypto::{ContentDigest, KeyPair};
use meshvault_process::{CancelToken, ProcessStep, SequentialProcess, StepError};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
struct DownloadContext {
    relative: PathBuf,
    digest: Option<ContentDigest>,
    node_keys: Option<KeyPair>,
}

/// Build the download pipeline: locate the index, then fetch the meta file
/// and reassemble the newest version (skipping when the disk content already
/// matches).
pub fn download_file_process(session: Arc<Session>, path: PathBuf) -> SequentialProcess {
    let context = Arc::new(Mutex::new(DownloadContext::default()));

    let mut process = SequentialProcess::new("download file");
    process
        .add_step(FindIndexStep {
            session: session.clone(),
            path,
            context: context.clone(),
        })
        .add_step(DownloadChunksStep { session, context });
    process
}

struct FindIndexStep {
    session: Arc<Session>,
    path: PathBuf,
    context: Arc<Mutex<DownloadContext>>,
}

impl ProcessStep for FindIndexStep {
    fn name(&self) -> &str {
        "find index"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let relative = relative_to_root(self.session.root(), &self.path)
            .map_err(|e| StepError::with_source("invalid path", e))?;

        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let profile = manager
            .get_user_profile(pid, false)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;
        let node_id = profile.tree().find_by_path(&relative).ok_or_else(|| {
            StepError::new(format!("'{}' is not in the network", relative.display()))
        })?;
        let node = profile
            .tree()
            .node(node_id)
            .ok_or_else(|| StepError::new("index node disappeared"))?;
        if !node.is_file() {
            return Err(StepError::new("only files can be downloaded"));
        }

        let mut ctx = self.context.lock();
        ctx.relative = relative;
        ctx.digest = node.file_digest();
        ctx.node_keys = Some(node.keys.clone());
        Ok(())
    }
}

struct DownloadChunksStep {
    session: Arc<Session>,
    context: Arc<Mutex<DownloadContext>>,
}

impl ProcessStep for DownloadChunksStep {
    fn name(&self) -> &str {
        "download chunks"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (relative, digest, node_keys) = {
            let ctx = self.context.lock();
            (
                ctx.relative.clone(),
                ctx.digest,
                ctx.node_keys
                    .clone()
                    .ok_or_else(|| StepError::new("node keys missing"))?,
            )
        };
        let destination = self.session.root().join(&relative);

        if let Some(digest) = digest {
            let precheck = precheck_destination(&destination, &digest)
                .map_err(|e| StepError::with_source("cannot check destination", e))?;
            if precheck == DownloadPrecheck::AlreadyPresent {
                info!(file = %relative.display(), "content already present, skipping download");
                return Ok(());
            }
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StepError::with_source("cannot create parent folders", e))?;
        }

        let meta_file = fetch_meta_file(self.session.data_manager(), &node_keys)
            .map_err(|e| StepError::with_source("cannot fetch meta file", e))?;
        let version = meta_file
            .newest_version()
            .ok_or_else(|| StepError::new("meta file has no versions"))?;
        download_version(
            self.session.data_manager(),
            &meta_file,
            version,
            &destination,
        )
        .map_err(|e| StepError::with_source("chunk download failed", e))
    }
}
