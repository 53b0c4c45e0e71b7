//! Uploading a new version of an existing file.

use crate::file::chunking::{prepare_chunks, split_file};
use crate::model::meta_file::{FileVersion, MetaChunk, MetaFile};
use crate::model::message_queue::ProfileTask;
use crate::model::now_millis;
use crate::model::tree::IndexKind;
use crate::network::messages::NotificationPayload;
use crate::notify::SimpleMessageFactory;
use crate::processes::common::{
    delete_chunks, fetch_meta_file, path_string, relative_to_root, resolve_share,
    store_meta_file, upload_chunks, NotifyStep,
};
use crate::session::Session;
use meshvault_crypto::{ContentDigest, KeyPair};
use meshvault_process::{
    CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct UpdateContext {
    relative: PathBuf,
    size: u64,
    digest: Option<ContentDigest>,
    old_digest: Option<ContentDigest>,
    node_keys: Option<KeyPair>,
    protection: Option<KeyPair>,
    recipients: BTreeSet<String>,
    shared: bool,
    meta_file: Option<MetaFile>,
    original_meta: Option<MetaFile>,
    uploaded: Vec<MetaChunk>,
    new_version_index: Option<usize>,
    evicted: Vec<FileVersion>,
    chunks_to_delete: Vec<MetaChunk>,
}

/// Build the update pipeline: validate, fetch the meta file, upload the new
/// chunks, append the version and apply retention, store meta file and
/// profile, delete evicted chunks, notify.
pub fn update_file_process(session: Arc<Session>, path: PathBuf) -> SequentialProcess {
    let context = Arc::new(Mutex::new(UpdateContext::default()));

    let mut process = SequentialProcess::new("update file");
    process
        .add_step(ValidateStep {
            session: session.clone(),
            path,
            context: context.clone(),
        })
        .add_step(GetMetaFileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(ChunkUploadStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(CreateNewVersionStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(PutMetaFileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(UpdateProfileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(DeleteEvictedChunksStep {
            session: session.clone(),
            context: context.clone(),
        });

    let notify_context = context;
    let notify_session = session.clone();
    process.add_step(NotifyStep {
        session,
        prepare: move || {
            let ctx = notify_context.lock();
            let own_user = notify_session.user_id().to_string();
            let task = match (ctx.shared, ctx.digest) {
                (true, Some(digest)) => Some(ProfileTask::IndexUpdated {
                    from_user: own_user.clone(),
                    path: path_string(&ctx.relative),
                    digest,
                }),
                _ => None,
            };
            let factory = SimpleMessageFactory::new(
                own_user,
                NotificationPayload::FileUpdated {
                    path: path_string(&ctx.relative),
                },
                task,
            );
            Some((
                Arc::new(factory) as Arc<dyn crate::notify::MessageFactory>,
                ctx.recipients.clone(),
            ))
        },
    });
    process
}

struct ValidateStep {
    session: Arc<Session>,
    path: PathBuf,
    context: Arc<Mutex<UpdateContext>>,
}

impl ProcessStep for ValidateStep {
    fn name(&self) -> &str {
        "validate update"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let session = &self.session;
        let relative = relative_to_root(session.root(), &self.path)
            .map_err(|e| StepError::with_source("invalid path", e))?;
        let absolute = session.root().join(&relative);
        if !absolute.is_file() {
            return Err(StepError::new(format!(
                "'{}' is not a file on disk",
                absolute.display()
            )));
        }
        let size = std::fs::metadata(&absolute)
            .map_err(|e| StepError::with_source("cannot stat file", e))?
            .len();
        if size > session.config().max_file_size {
            return Err(StepError::new(format!(
                "file exceeds the maximum size of {} bytes",
                session.config().max_file_size
            )));
        }
        let digest = ContentDigest::from_file(&absolute)
            .map_err(|e| StepError::with_source("cannot digest file", e))?;

        let manager = session.profile_manager();
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
            return Err(StepError::new("only files can be updated"));
        }
        let share = resolve_share(&profile, node_id)
            .map_err(|e| StepError::with_source("cannot resolve sharing state", e))?;

        let mut ctx = self.context.lock();
        ctx.relative = relative;
        ctx.size = size;
        ctx.digest = Some(digest);
        ctx.old_digest = node.file_digest();
        ctx.node_keys = Some(node.keys.clone());
        ctx.protection = Some(share.protection);
        ctx.recipients = share.recipients;
        ctx.shared = share.shared;
        Ok(())
    }
}

struct GetMetaFileStep {
    session: Arc<Session>,
    context: Arc<Mutex<UpdateContext>>,
}

impl ProcessStep for GetMetaFileStep {
    fn name(&self) -> &str {
        "get meta file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let node_keys = self
            .context
            .lock()
            .node_keys
            .clone()
            .ok_or_else(|| StepError::new("node keys missing"))?;
        let meta_file = fetch_meta_file(self.session.data_manager(), &node_keys)
            .map_err(|e| StepError::with_source("cannot fetch meta file", e))?;

        let mut ctx = self.context.lock();
        ctx.original_meta = Some(meta_file.clone());
        ctx.meta_file = Some(meta_file);
        Ok(())
    }
}

struct ChunkUploadStep {
    session: Arc<Session>,
    context: Arc<Mutex<UpdateContext>>,
}

impl ProcessStep for ChunkUploadStep {
    fn name(&self) -> &str {
        "upload chunks"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (relative, chunk_public, protection) = {
            let ctx = self.context.lock();
            let meta = ctx
                .meta_file
                .as_ref()
                .ok_or_else(|| StepError::new("meta file missing"))?;
            (
                ctx.relative.clone(),
                meta.chunk_keys().public().clone(),
                ctx.protection
                    .clone()
                    .ok_or_else(|| StepError::new("protection keys missing"))?,
            )
        };

        let absolute = self.session.root().join(&relative);
        let chunks = split_file(&absolute, self.session.config().chunk_size)
            .map_err(|e| StepError::with_source("cannot split file", e))?;
        let prepared = prepare_chunks(&chunks, &chunk_public)
            .map_err(|e| StepError::with_source("cannot encrypt chunks", e))?;
        let uploaded = upload_chunks(
            self.session.data_manager(),
            prepared,
            &protection,
            self.session.ttl().chunk,
        )
        .map_err(|e| StepError::with_source("chunk upload failed", e))?;

        self.context.lock().uploaded = uploaded;
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let (uploaded, protection) = {
            let mut ctx = self.context.lock();
            (std::mem::take(&mut ctx.uploaded), ctx.protection.clone())
        };
        if let Some(protection) = protection {
            delete_chunks(self.session.data_manager(), &uploaded, &protection);
        }
    }
}

struct CreateNewVersionStep {
    session: Arc<Session>,
    context: Arc<Mutex<UpdateContext>>,
}

impl ProcessStep for CreateNewVersionStep {
    fn name(&self) -> &str {
        "create new version"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let config = self.session.config().clone();
        let mut ctx = self.context.lock();
        let size = ctx.size;
        let uploaded = ctx.uploaded.clone();
        let meta_file = ctx
            .meta_file
            .as_mut()
            .ok_or_else(|| StepError::new("meta file missing"))?;

        let version = FileVersion {
            index: meta_file.next_version_index(),
            size,
            timestamp_ms: now_millis(),
            chunks: uploaded,
        };
        let new_index = version.index;
        meta_file.add_version(version);

        // Retention: evict the oldest while either limit is violated, but
        // always keep at least one version. Size eviction triggers only on
        // strictly exceeding the limit.
        let mut evicted = Vec::new();
        while meta_file.version_count() > config.max_num_of_versions
            || meta_file.total_size() > config.max_size_all_versions
        {
            if meta_file.version_count() == 1 {
                break;
            }
            if let Some(version) = meta_file.remove_oldest() {
                evicted.push(version);
            }
        }
        debug!(evicted = evicted.len(), "old versions scheduled for removal");

        ctx.new_version_index = Some(new_index);
        ctx.chunks_to_delete = evicted.iter().flat_map(|v| v.chunks.clone()).collect();
        ctx.evicted = evicted;
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let mut ctx = self.context.lock();
        let new_index = ctx.new_version_index.take();
        let evicted = std::mem::take(&mut ctx.evicted);
        ctx.chunks_to_delete.clear();
        if let Some(meta_file) = ctx.meta_file.as_mut() {
            if let Some(index) = new_index {
                meta_file.remove_version(index);
            }
            for version in evicted {
                meta_file.add_version(version);
            }
        }
    }
}

struct PutMetaFileStep {
    session: Arc<Session>,
    context: Arc<Mutex<UpdateContext>>,
}

impl ProcessStep for PutMetaFileStep {
    fn name(&self) -> &str {
        "put meta file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let ctx = self.context.lock();
        let meta_file = ctx
            .meta_file
            .as_ref()
            .ok_or_else(|| StepError::new("meta file missing"))?;
        let node_keys = ctx
            .node_keys
            .as_ref()
            .ok_or_else(|| StepError::new("node keys missing"))?;
        let protection = ctx
            .protection
            .as_ref()
            .ok_or_else(|| StepError::new("protection keys missing"))?;

        store_meta_file(
            self.session.data_manager(),
            meta_file,
            node_keys.public(),
            protection,
            None,
            self.session.ttl().meta_file,
        )
        .map_err(|e| StepError::with_source("cannot store meta file", e))
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        // Restore the pre-update meta file record.
        let ctx = self.context.lock();
        if let (Some(original), Some(node_keys), Some(protection)) = (
            ctx.original_meta.as_ref(),
            ctx.node_keys.as_ref(),
            ctx.protection.as_ref(),
        ) {
            if let Err(e) = store_meta_file(
                self.session.data_manager(),
                original,
                node_keys.public(),
                protection,
                None,
                self.session.ttl().meta_file,
            ) {
                warn!(error = %e, "could not restore meta file during rollback");
            }
        }
    }
}

struct UpdateProfileStep {
    session: Arc<Session>,
    context: Arc<Mutex<UpdateContext>>,
}

impl UpdateProfileStep {
    fn set_digest(&self, digest: ContentDigest) -> Result<(), StepError> {
        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let mut profile = manager
            .get_user_profile(pid, true)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;

        let relative = self.context.lock().relative.clone();
        let node = profile
            .tree()
            .find_by_path(&relative)
            .ok_or_else(|| StepError::new("file disappeared from the profile"))?;
        if let Some(node) = profile.tree_mut().node_mut(node) {
            if let IndexKind::File { digest: current } = &mut node.kind {
                *current = digest;
            }
        }
        manager
            .ready_to_put(profile, pid)
            .map_err(|e| StepError::with_source("cannot store profile", e))
    }
}

impl ProcessStep for UpdateProfileStep {
    fn name(&self) -> &str {
        "update profile"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let digest = self
            .context
            .lock()
            .digest
            .ok_or_else(|| StepError::new("digest missing"))?;
        self.set_digest(digest)
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let old_digest = self.context.lock().old_digest;
        if let Some(old_digest) = old_digest {
            if let Err(e) = self.set_digest(old_digest) {
                warn!(error = %e, "could not restore digest during rollback");
            }
        }
    }
}

struct DeleteEvictedChunksStep {
    session: Arc<Session>,
    context: Arc<Mutex<UpdateContext>>,
}

impl ProcessStep for DeleteEvictedChunksStep {
    fn name(&self) -> &str {
        "delete evicted chunks"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (chunks, protection) = {
            let ctx = self.context.lock();
            (ctx.chunks_to_delete.clone(), ctx.protection.clone())
        };
        if chunks.is_empty() {
            return Ok(());
        }
        let protection = protection.ok_or_else(|| StepError::new("protection keys missing"))?;
        // Irreversible, so this runs only after every put committed.
        delete_chunks(self.session.data_manager(), &chunks, &protection);
        Ok(())
    }
}
