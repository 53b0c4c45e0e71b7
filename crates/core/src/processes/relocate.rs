//! Moving or renaming a file within the tree. The DHT objects themselves
//! are untouched; only the profile and the disk change.

use crate::model::message_queue::ProfileTask;
use crate::network::messages::NotificationPayload;
use crate::notify::SimpleMessageFactory;
use crate::processes::common::{path_string, relative_to_root, resolve_share, NotifyStep};
use crate::session::Session;
use meshvault_process::{
    CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Default)]
struct MoveContext {
    from_relative: PathBuf,
    to_relative: PathBuf,
    moved_on_disk: bool,
    moved_in_profile: bool,
    recipients: BTreeSet<String>,
    shared: bool,
}

/// Build the move pipeline: validate, rename on disk, re-parent in the
/// profile, notify source and destination participants.
pub fn move_file_process(
    session: Arc<Session>,
    source: PathBuf,
    destination: PathBuf,
) -> SequentialProcess {
    let context = Arc::new(Mutex::new(MoveContext::default()));

    let mut process = SequentialProcess::new("move file");
    process
        .add_step(ValidateStep {
            session: session.clone(),
            source,
            destination,
            context: context.clone(),
        })
        .add_step(MoveOnDiskStep {
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
            let task = if ctx.shared {
                Some(ProfileTask::IndexMoved {
                    from_user: own_user.clone(),
                    from_path: path_string(&ctx.from_relative),
                    to_path: path_string(&ctx.to_relative),
                })
            } else {
                None
            };
            let factory = SimpleMessageFactory::new(
                own_user,
                NotificationPayload::FileMoved {
                    from_path: path_string(&ctx.from_relative),
                    to_path: path_string(&ctx.to_relative),
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
    source: PathBuf,
    destination: PathBuf,
    context: Arc<Mutex<MoveContext>>,
}

impl ProcessStep for ValidateStep {
    fn name(&self) -> &str {
        "validate move"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let root = self.session.root();
        let from_relative = relative_to_root(root, &self.source)
            .map_err(|e| StepError::with_source("invalid source path", e))?;
        let to_relative = relative_to_root(root, &self.destination)
            .map_err(|e| StepError::with_source("invalid destination path", e))?;
        if from_relative == to_relative {
            return Err(StepError::new("source and destination are identical"));
        }

        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let profile = manager
            .get_user_profile(pid, false)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;
        let tree = profile.tree();
        let node = tree.find_by_path(&from_relative).ok_or_else(|| {
            StepError::new(format!(
                "'{}' is not in the network",
                from_relative.display()
            ))
        })?;
        let new_parent = match to_relative.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tree.find_by_path(parent).ok_or_else(|| {
                    StepError::new(format!(
                        "destination folder '{}' is not in the network",
                        parent.display()
                    ))
                })?
            }
            _ => tree.root(),
        };
        if tree.find_by_path(&to_relative).is_some() {
            return Err(StepError::new("destination already exists in the network"));
        }

        // Both the old and the new sharing scope get notified.
        let mut recipients = BTreeSet::new();
        let mut shared = false;
        for scope in [node, new_parent] {
            let share = resolve_share(&profile, scope)
                .map_err(|e| StepError::with_source("cannot resolve sharing state", e))?;
            shared |= share.shared;
            recipients.extend(share.recipients);
        }

        let mut ctx = self.context.lock();
        ctx.from_relative = from_relative;
        ctx.to_relative = to_relative;
        ctx.recipients = recipients;
        ctx.shared = shared;
        Ok(())
    }
}

struct MoveOnDiskStep {
    session: Arc<Session>,
    context: Arc<Mutex<MoveContext>>,
}

impl ProcessStep for MoveOnDiskStep {
    fn name(&self) -> &str {
        "move on disk"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (from, to) = {
            let ctx = self.context.lock();
            (
                self.session.root().join(&ctx.from_relative),
                self.session.root().join(&ctx.to_relative),
            )
        };
        if !from.exists() {
            // Watcher-driven moves already happened on disk.
            return Ok(());
        }
        std::fs::rename(&from, &to)
            .map_err(|e| StepError::with_source("cannot move file on disk", e))?;
        self.context.lock().moved_on_disk = true;
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let ctx = self.context.lock();
        if !ctx.moved_on_disk {
            return;
        }
        let from = self.session.root().join(&ctx.from_relative);
        let to = self.session.root().join(&ctx.to_relative);
        if let Err(e) = std::fs::rename(&to, &from) {
            warn!(error = %e, "could not move file back during rollback");
        }
    }
}

struct UpdateProfileStep {
    session: Arc<Session>,
    context: Arc<Mutex<MoveContext>>,
}

impl UpdateProfileStep {
    fn relocate(&self, from: &PathBuf, to: &PathBuf) -> Result<(), StepError> {
        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let mut profile = manager
            .get_user_profile(pid, true)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;

        let node = profile
            .tree()
            .find_by_path(from)
            .ok_or_else(|| StepError::new("source disappeared from the profile"))?;
        let new_parent = match to.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => profile
                .tree()
                .find_by_path(parent)
                .ok_or_else(|| StepError::new("destination folder disappeared"))?,
            _ => profile.tree().root(),
        };
        let new_name = to.file_name().map(|n| n.to_string_lossy().to_string());
        profile
            .tree_mut()
            .move_node(node, new_parent, new_name)
            .map_err(|e| StepError::with_source("cannot move index", e))?;

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
        let (from, to) = {
            let ctx = self.context.lock();
            (ctx.from_relative.clone(), ctx.to_relative.clone())
        };
        self.relocate(&from, &to)?;
        self.context.lock().moved_in_profile = true;
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let (from, to, moved) = {
            let ctx = self.context.lock();
            (
                ctx.from_relative.clone(),
                ctx.to_relative.clone(),
                ctx.moved_in_profile,
            )
        };
        if !moved {
            return;
        }
        if let Err(e) = self.relocate(&to, &from) {
            warn!(error = %e.message, "could not move index back during rollback");
        }
    }
}
