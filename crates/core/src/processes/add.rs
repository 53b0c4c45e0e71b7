//! Adding a file or folder to the network.

use crate::file::chunking::{prepare_chunks, split_file};
use crate::model::meta_file::{FileVersion, MetaChunk, MetaFile};
use crate::model::message_queue::ProfileTask;
use crate::model::now_millis;
use crate::model::tree::NodeId;
use crate::network::messages::NotificationPayload;
use crate::notify::SimpleMessageFactory;
use crate::processes::common::{
    delete_chunks, path_string, relative_to_root, remove_meta_file, resolve_share,
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
struct AddContext {
    relative: PathBuf,
    is_folder: bool,
    size: u64,
    digest: Option<ContentDigest>,
    file_keys: Option<KeyPair>,
    chunk_keys: Option<KeyPair>,
    uploaded: Vec<MetaChunk>,
    meta_file: Option<MetaFile>,
    protection: Option<KeyPair>,
    recipients: BTreeSet<String>,
    shared: bool,
    inserted: Option<NodeId>,
}

/// Build the add pipeline: validate, chunk and upload, create and store the
/// meta file, insert the index, notify.
pub fn add_file_process(session: Arc<Session>, path: PathBuf) -> SequentialProcess {
    let context = Arc::new(Mutex::new(AddContext::default()));

    let mut process = SequentialProcess::new("add file");
    process
        .add_step(ValidateStep {
            session: session.clone(),
            path,
            context: context.clone(),
        })
        .add_step(ChunkUploadStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(CreateMetaFileStep {
            context: context.clone(),
        })
        .add_step(PutMetaFileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(UpdateProfileStep {
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
            let task = if !ctx.shared {
                None
            } else if ctx.is_folder {
                ctx.file_keys.clone().map(|keys| ProfileTask::FolderAdded {
                    from_user: own_user.clone(),
                    path: path_string(&ctx.relative),
                    keys,
                })
            } else {
                match (ctx.file_keys.clone(), ctx.digest) {
                    (Some(keys), Some(digest)) => Some(ProfileTask::IndexAdded {
                        from_user: own_user.clone(),
                        path: path_string(&ctx.relative),
                        keys,
                        digest,
                    }),
                    _ => None,
                }
            };
            let payload = NotificationPayload::FileAdded {
                path: path_string(&ctx.relative),
            };
            let factory = SimpleMessageFactory::new(own_user, payload, task);
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
    context: Arc<Mutex<AddContext>>,
}

impl ProcessStep for ValidateStep {
    fn name(&self) -> &str {
        "validate file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let session = &self.session;
        let relative = relative_to_root(session.root(), &self.path)
            .map_err(|e| StepError::with_source("invalid path", e))?;
        let absolute = session.root().join(&relative);
        if !absolute.exists() {
            return Err(StepError::new(format!(
                "'{}' does not exist on disk",
                absolute.display()
            )));
        }

        let is_folder = absolute.is_dir();
        let mut size = 0u64;
        let mut digest = None;
        if !is_folder {
            size = std::fs::metadata(&absolute)
                .map_err(|e| StepError::with_source("cannot stat file", e))?
                .len();
            if size > session.config().max_file_size {
                return Err(StepError::new(format!(
                    "file exceeds the maximum size of {} bytes",
                    session.config().max_file_size
                )));
            }
            digest = Some(
                ContentDigest::from_file(&absolute)
                    .map_err(|e| StepError::with_source("cannot digest file", e))?,
            );
        }

        // Resolve tree position, sharing state and protection keys.
        let manager = session.profile_manager();
        let pid = manager.new_process_id();
        let profile = manager
            .get_user_profile(pid, false)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;
        if profile.tree().find_by_path(&relative).is_some() {
            return Err(StepError::new(format!(
                "'{}' is already in the network",
                relative.display()
            )));
        }
        let parent = match relative.parent() {
            Some(parent) => profile.tree().find_by_path(parent).ok_or_else(|| {
                StepError::new(format!(
                    "parent folder '{}' is not in the network",
                    parent.display()
                ))
            })?,
            None => profile.tree().root(),
        };
        let share = resolve_share(&profile, parent)
            .map_err(|e| StepError::with_source("cannot resolve sharing state", e))?;

        let config = session.config();
        let file_keys = KeyPair::generate(config.rsa_file_key_bits)
            .map_err(|e| StepError::with_source("node key generation failed", e))?;
        let chunk_keys = if is_folder {
            None
        } else {
            Some(
                KeyPair::generate(config.rsa_chunk_key_bits)
                    .map_err(|e| StepError::with_source("chunk key generation failed", e))?,
            )
        };

        let mut ctx = self.context.lock();
        ctx.relative = relative;
        ctx.is_folder = is_folder;
        ctx.size = size;
        ctx.digest = digest;
        ctx.file_keys = Some(file_keys);
        ctx.chunk_keys = chunk_keys;
        ctx.protection = Some(share.protection);
        ctx.recipients = share.recipients;
        ctx.shared = share.shared;
        Ok(())
    }
}

struct ChunkUploadStep {
    session: Arc<Session>,
    context: Arc<Mutex<AddContext>>,
}

impl ProcessStep for ChunkUploadStep {
    fn name(&self) -> &str {
        "upload chunks"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (relative, chunk_public, protection) = {
            let ctx = self.context.lock();
            if ctx.is_folder {
                return Ok(());
            }
            let chunk_keys = ctx
                .chunk_keys
                .as_ref()
                .ok_or_else(|| StepError::new("chunk keys missing"))?;
            (
                ctx.relative.clone(),
                chunk_keys.public().clone(),
                ctx.protection.clone().ok_or_else(|| {
                    StepError::new("protection keys missing")
                })?,
            )
        };

        let absolute = self.session.root().join(&relative);
        let chunks = split_file(&absolute, self.session.config().chunk_size)
            .map_err(|e| StepError::with_source("cannot split file", e))?;
        debug!(file = %relative.display(), chunks = chunks.len(), "uploading file chunks");
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

struct CreateMetaFileStep {
    context: Arc<Mutex<AddContext>>,
}

impl ProcessStep for CreateMetaFileStep {
    fn name(&self) -> &str {
        "create meta file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let mut ctx = self.context.lock();
        if ctx.is_folder {
            return Ok(());
        }
        let file_keys = ctx
            .file_keys
            .as_ref()
            .ok_or_else(|| StepError::new("file keys missing"))?;
        let chunk_keys = ctx
            .chunk_keys
            .clone()
            .ok_or_else(|| StepError::new("chunk keys missing"))?;

        let version = FileVersion {
            index: 0,
            size: ctx.size,
            timestamp_ms: now_millis(),
            chunks: ctx.uploaded.clone(),
        };
        let meta_file = MetaFile::new(file_keys.public().clone(), chunk_keys, version);
        ctx.meta_file = Some(meta_file);
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        self.context.lock().meta_file = None;
    }
}

struct PutMetaFileStep {
    session: Arc<Session>,
    context: Arc<Mutex<AddContext>>,
}

impl ProcessStep for PutMetaFileStep {
    fn name(&self) -> &str {
        "put meta file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let ctx = self.context.lock();
        if ctx.is_folder {
            return Ok(());
        }
        let meta_file = ctx
            .meta_file
            .as_ref()
            .ok_or_else(|| StepError::new("meta file missing"))?;
        let file_keys = ctx
            .file_keys
            .as_ref()
            .ok_or_else(|| StepError::new("file keys missing"))?;
        let protection = ctx
            .protection
            .as_ref()
            .ok_or_else(|| StepError::new("protection keys missing"))?;

        store_meta_file(
            self.session.data_manager(),
            meta_file,
            file_keys.public(),
            protection,
            None,
            self.session.ttl().meta_file,
        )
        .map_err(|e| StepError::with_source("cannot store meta file", e))
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let ctx = self.context.lock();
        if ctx.is_folder {
            return;
        }
        if let (Some(file_keys), Some(protection)) =
            (ctx.file_keys.as_ref(), ctx.protection.as_ref())
        {
            if let Err(e) =
                remove_meta_file(self.session.data_manager(), file_keys.public(), protection)
            {
                warn!(error = %e, "could not remove meta file during rollback");
            }
        }
    }
}

struct UpdateProfileStep {
    session: Arc<Session>,
    context: Arc<Mutex<AddContext>>,
}

impl ProcessStep for UpdateProfileStep {
    fn name(&self) -> &str {
        "update profile"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let mut profile = manager
            .get_user_profile(pid, true)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;

        let inserted = {
            let ctx = self.context.lock();
            let parent = match ctx.relative.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    profile.tree().find_by_path(parent).ok_or_else(|| {
                        StepError::new("parent folder disappeared from the profile")
                    })?
                }
                _ => profile.tree().root(),
            };
            let name = ctx
                .relative
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| StepError::new("path has no file name"))?;
            let file_keys = ctx
                .file_keys
                .clone()
                .ok_or_else(|| StepError::new("file keys missing"))?;

            let result = if ctx.is_folder {
                profile.tree_mut().add_folder(parent, name, file_keys)
            } else {
                let digest = ctx.digest.ok_or_else(|| StepError::new("digest missing"))?;
                profile.tree_mut().add_file(parent, name, file_keys, digest)
            };
            result.map_err(|e| StepError::with_source("cannot insert index", e))?
        };

        manager
            .ready_to_put(profile, pid)
            .map_err(|e| StepError::with_source("cannot store profile", e))?;
        self.context.lock().inserted = Some(inserted);
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        if self.context.lock().inserted.is_none() {
            return;
        }
        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let result = manager.get_user_profile(pid, true).and_then(|mut profile| {
            let relative = self.context.lock().relative.clone();
            if let Some(node) = profile.tree().find_by_path(&relative) {
                profile.tree_mut().remove(node)?;
            }
            manager.ready_to_put(profile, pid)
        });
        if let Err(e) = result {
            warn!(error = %e, "could not remove index during rollback");
        }
    }
}
