//! Removing a file (or empty folder) from the network.

use crate::model::meta_file::MetaFile;
use crate::model::message_queue::ProfileTask;
use crate::model::tree::IndexNode;
use crate::network::messages::NotificationPayload;
use crate::notify::SimpleMessageFactory;
use crate::processes::common::{
    delete_chunks, fetch_meta_file, path_string, relative_to_root, remove_meta_file,
    resolve_share, store_meta_file, NotifyStep,
};
use crate::session::Session;
use meshvault_crypto::KeyPair;
use meshvault_process::{
    CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Default)]
struct DeleteContext {
    relative: PathBuf,
    is_folder: bool,
    node_keys: Option<KeyPair>,
    removed_node: Option<IndexNode>,
    meta_file: Option<MetaFile>,
    protection: Option<KeyPair>,
    recipients: BTreeSet<String>,
    shared: bool,
}

/// Build the delete pipeline: validate, fetch the meta file, remove the
/// index from the profile, delete the meta file and all chunks, notify.
pub fn delete_file_process(session: Arc<Session>, path: PathBuf) -> SequentialProcess {
    let context = Arc::new(Mutex::new(DeleteContext::default()));

    let mut process = SequentialProcess::new("delete file");
    process
        .add_step(ValidateStep {
            session: session.clone(),
            path,
            context: context.clone(),
        })
        .add_step(DeleteLocalFileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(GetMetaFileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(RemoveFromProfileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(RemoveMetaFileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(DeleteChunksStep {
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
            let task = if ctx.shared {
                Some(ProfileTask::IndexRemoved {
                    from_user: own_user.clone(),
                    path: path_string(&ctx.relative),
                })
            } else {
                None
            };
            let factory = SimpleMessageFactory::new(
                own_user,
                NotificationPayload::FileDeleted {
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
    context: Arc<Mutex<DeleteContext>>,
}

impl ProcessStep for ValidateStep {
    fn name(&self) -> &str {
        "validate delete"
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
        if node.is_folder() && !node.children().is_empty() {
            return Err(StepError::new("cannot delete a non-empty folder"));
        }
        let share = resolve_share(&profile, node_id)
            .map_err(|e| StepError::with_source("cannot resolve sharing state", e))?;

        let mut ctx = self.context.lock();
        ctx.relative = relative;
        ctx.is_folder = node.is_folder();
        ctx.node_keys = Some(node.keys.clone());
        ctx.protection = Some(share.protection);
        ctx.recipients = share.recipients;
        ctx.shared = share.shared;
        Ok(())
    }
}

struct DeleteLocalFileStep {
    session: Arc<Session>,
    context: Arc<Mutex<DeleteContext>>,
}

impl ProcessStep for DeleteLocalFileStep {
    fn name(&self) -> &str {
        "delete local file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let ctx = self.context.lock();
        let absolute = self.session.root().join(&ctx.relative);
        if !absolute.exists() {
            return Ok(());
        }
        let result = if ctx.is_folder {
            std::fs::remove_dir(&absolute)
        } else {
            std::fs::remove_file(&absolute)
        };
        result.map_err(|e| StepError::with_source("cannot delete local file", e))
    }
}

struct GetMetaFileStep {
    session: Arc<Session>,
    context: Arc<Mutex<DeleteContext>>,
}

impl ProcessStep for GetMetaFileStep {
    fn name(&self) -> &str {
        "get meta file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (is_folder, node_keys) = {
            let ctx = self.context.lock();
            (ctx.is_folder, ctx.node_keys.clone())
        };
        if is_folder {
            return Ok(());
        }
        let node_keys = node_keys.ok_or_else(|| StepError::new("node keys missing"))?;
        let meta_file = fetch_meta_file(self.session.data_manager(), &node_keys)
            .map_err(|e| StepError::with_source("cannot fetch meta file", e))?;
        self.context.lock().meta_file = Some(meta_file);
        Ok(())
    }
}

struct RemoveFromProfileStep {
    session: Arc<Session>,
    context: Arc<Mutex<DeleteContext>>,
}

impl ProcessStep for RemoveFromProfileStep {
    fn name(&self) -> &str {
        "remove from profile"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
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
        let removed = profile
            .tree_mut()
            .remove(node)
            .map_err(|e| StepError::with_source("cannot remove index", e))?;

        manager
            .ready_to_put(profile, pid)
            .map_err(|e| StepError::with_source("cannot store profile", e))?;
        self.context.lock().removed_node = Some(removed);
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let removed = self.context.lock().removed_node.take();
        let Some(removed) = removed else {
            return;
        };
        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let result = manager.get_user_profile(pid, true).and_then(|mut profile| {
            let relative = self.context.lock().relative.clone();
            let parent = match relative.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => profile
                    .tree()
                    .find_by_path(parent)
                    .unwrap_or(profile.tree().root()),
                _ => profile.tree().root(),
            };
            match removed.kind {
                crate::model::tree::IndexKind::File { digest } => {
                    profile
                        .tree_mut()
                        .add_file(parent, removed.name.clone(), removed.keys.clone(), digest)?;
                }
                crate::model::tree::IndexKind::Folder { .. } => {
                    profile.tree_mut().add_folder(
                        parent,
                        removed.name.clone(),
                        removed.keys.clone(),
                    )?;
                }
            }
            manager.ready_to_put(profile, pid)
        });
        if let Err(e) = result {
            warn!(error = %e, "could not restore index during rollback");
        }
    }
}

struct RemoveMetaFileStep {
    session: Arc<Session>,
    context: Arc<Mutex<DeleteContext>>,
}

impl ProcessStep for RemoveMetaFileStep {
    fn name(&self) -> &str {
        "remove meta file"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let ctx = self.context.lock();
        if ctx.is_folder {
            return Ok(());
        }
        let node_keys = ctx
            .node_keys
            .as_ref()
            .ok_or_else(|| StepError::new("node keys missing"))?;
        let protection = ctx
            .protection
            .as_ref()
            .ok_or_else(|| StepError::new("protection keys missing"))?;
        remove_meta_file(self.session.data_manager(), node_keys.public(), protection)
            .map_err(|e| StepError::with_source("cannot remove meta file", e))
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        // Re-put the fetched meta file.
        let ctx = self.context.lock();
        if let (Some(meta_file), Some(node_keys), Some(protection)) = (
            ctx.meta_file.as_ref(),
            ctx.node_keys.as_ref(),
            ctx.protection.as_ref(),
        ) {
            if let Err(e) = store_meta_file(
                self.session.data_manager(),
                meta_file,
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

struct DeleteChunksStep {
    session: Arc<Session>,
    context: Arc<Mutex<DeleteContext>>,
}

impl ProcessStep for DeleteChunksStep {
    fn name(&self) -> &str {
        "delete chunks"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let ctx = self.context.lock();
        let Some(meta_file) = ctx.meta_file.as_ref() else {
            return Ok(());
        };
        let protection = ctx
            .protection
            .as_ref()
            .ok_or_else(|| StepError::new("protection keys missing"))?;
        // Irreversible, so this is the last destructive step.
        delete_chunks(
            self.session.data_manager(),
            &meta_file.all_chunks(),
            protection,
        );
        Ok(())
    }
}
