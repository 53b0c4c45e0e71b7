//! Sharing a folder with another user.
//!
//! The folder gains the friend in its permission set and a share-protection
//! keypair; the DHT objects of the subtree are rotated onto those keys so
//! every participant can write them. The friend receives the subtree (with
//! its node keys) as a durable profile task.

use crate::model::message_queue::ProfileTask;
use crate::model::tree::{FileTree, IndexKind, PermissionType, UserPermission};
use crate::network::messages::NotificationPayload;
use crate::notify::SimpleMessageFactory;
use crate::processes::common::{
    fetch_meta_file, path_string, relative_to_root, store_meta_file, NotifyStep,
};
use crate::network::content::{content_keys, NetworkContent};
use crate::network::parameters::Parameters;
use crate::session::Session;
use meshvault_crypto::KeyPair;
use meshvault_process::{
    CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct ShareContext {
    relative: PathBuf,
    folder_name: String,
    friend: String,
    permission: Option<PermissionType>,
    created_keys: bool,
    share_keys: Option<KeyPair>,
    default_protection: Option<KeyPair>,
    subtree: Option<FileTree>,
    recipients: BTreeSet<String>,
}

/// Build the share pipeline: validate, extend the folder's permission set,
/// rotate the subtree's DHT objects onto the share keys, hand the subtree to
/// the friend.
pub fn share_folder_process(
    session: Arc<Session>,
    path: PathBuf,
    friend_id: String,
    permission: PermissionType,
) -> SequentialProcess {
    let context = Arc::new(Mutex::new(ShareContext {
        friend: friend_id,
        permission: Some(permission),
        ..ShareContext::default()
    }));

    let mut process = SequentialProcess::new("share folder");
    process
        .add_step(ValidateStep {
            session: session.clone(),
            path,
            context: context.clone(),
        })
        .add_step(UpdateProfileStep {
            session: session.clone(),
            context: context.clone(),
        })
        .add_step(ReprotectSubtreeStep {
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
            let subtree = ctx.subtree.clone()?;
            let factory = SimpleMessageFactory::new(
                own_user.clone(),
                NotificationPayload::FileAdded {
                    path: path_string(&ctx.relative),
                },
                Some(ProfileTask::ShareFolder {
                    from_user: own_user,
                    folder_name: ctx.folder_name.clone(),
                    folder: subtree,
                }),
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
    context: Arc<Mutex<ShareContext>>,
}

impl ProcessStep for ValidateStep {
    fn name(&self) -> &str {
        "validate share"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let relative = relative_to_root(self.session.root(), &self.path)
            .map_err(|e| StepError::with_source("invalid path", e))?;
        let friend = self.context.lock().friend.clone();
        if friend == self.session.user_id() {
            return Err(StepError::new("cannot share a folder with oneself"));
        }
        // The lookup both verifies the friend exists and warms the cache.
        self.session
            .public_key(&friend)
            .map_err(|e| StepError::with_source(format!("unknown user '{friend}'"), e))?;

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
        if !node.is_folder() {
            return Err(StepError::new("only folders can be shared"));
        }
        if node.permissions().iter().any(|p| p.user_id == friend) {
            return Err(StepError::new(format!(
                "folder is already shared with '{friend}'"
            )));
        }

        let mut ctx = self.context.lock();
        ctx.folder_name = node.name.clone();
        ctx.relative = relative;
        ctx.default_protection = Some(profile.protection_keys().clone());
        ctx.recipients = BTreeSet::from([
            self.session.user_id().to_string(),
            friend,
        ]);
        Ok(())
    }
}

struct UpdateProfileStep {
    session: Arc<Session>,
    context: Arc<Mutex<ShareContext>>,
}

impl ProcessStep for UpdateProfileStep {
    fn name(&self) -> &str {
        "update profile"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let share_key_bits = self.session.config().rsa_user_key_bits;
        // Generate outside the modification window, key generation is slow.
        let fresh_keys = KeyPair::generate(share_key_bits)
            .map_err(|e| StepError::with_source("share key generation failed", e))?;

        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let mut profile = manager
            .get_user_profile(pid, true)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;

        let (relative, friend, permission) = {
            let ctx = self.context.lock();
            (
                ctx.relative.clone(),
                ctx.friend.clone(),
                ctx.permission.ok_or_else(|| StepError::new("permission missing"))?,
            )
        };
        let node_id = profile
            .tree()
            .find_by_path(&relative)
            .ok_or_else(|| StepError::new("folder disappeared from the profile"))?;

        let own_user = self.session.user_id().to_string();
        let (share_keys, created) = {
            let node = profile
                .tree_mut()
                .node_mut(node_id)
                .ok_or_else(|| StepError::new("folder disappeared from the profile"))?;
            match &mut node.kind {
                IndexKind::Folder {
                    permissions,
                    share_keys,
                    ..
                } => {
                    // The owner is a participant too; every adopted copy of
                    // the subtree must name the full set.
                    if !permissions.iter().any(|p| p.user_id == own_user) {
                        permissions.push(UserPermission {
                            user_id: own_user,
                            permission: PermissionType::Write,
                        });
                    }
                    permissions.push(UserPermission {
                        user_id: friend,
                        permission,
                    });
                    match share_keys {
                        Some(existing) => (existing.clone(), false),
                        None => {
                            *share_keys = Some(fresh_keys.clone());
                            (fresh_keys, true)
                        }
                    }
                }
                IndexKind::File { .. } => {
                    return Err(StepError::new("only folders can be shared"))
                }
            }
        };
        let subtree = profile
            .tree()
            .extract_subtree(node_id)
            .map_err(|e| StepError::with_source("cannot extract subtree", e))?;

        manager
            .ready_to_put(profile, pid)
            .map_err(|e| StepError::with_source("cannot store profile", e))?;

        let mut ctx = self.context.lock();
        ctx.share_keys = Some(share_keys);
        ctx.created_keys = created;
        ctx.subtree = Some(subtree);
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let (relative, friend, created, had_subtree) = {
            let ctx = self.context.lock();
            (
                ctx.relative.clone(),
                ctx.friend.clone(),
                ctx.created_keys,
                ctx.subtree.is_some(),
            )
        };
        if !had_subtree {
            return;
        }
        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        let result = manager.get_user_profile(pid, true).and_then(|mut profile| {
            if let Some(node_id) = profile.tree().find_by_path(&relative) {
                if let Some(node) = profile.tree_mut().node_mut(node_id) {
                    if let IndexKind::Folder {
                        permissions,
                        share_keys,
                        ..
                    } = &mut node.kind
                    {
                        permissions.retain(|p| p.user_id != friend);
                        if created {
                            // First share: the set was empty before.
                            permissions.clear();
                            *share_keys = None;
                        }
                    }
                }
            }
            manager.ready_to_put(profile, pid)
        });
        if let Err(e) = result {
            warn!(error = %e, "could not revert share during rollback");
        }
    }
}

struct ReprotectSubtreeStep {
    session: Arc<Session>,
    context: Arc<Mutex<ShareContext>>,
}

impl ReprotectSubtreeStep {
    /// Rotate every meta file and chunk of the subtree from `from` to `to`.
    fn rotate(&self, subtree: &FileTree, from: &KeyPair, to: &KeyPair) -> Result<(), StepError> {
        let data_manager = self.session.data_manager();
        for file_id in subtree.files_in_subtree(subtree.root()) {
            let Some(node) = subtree.node(file_id) else {
                continue;
            };
            let meta_file = fetch_meta_file(data_manager, &node.keys)
                .map_err(|e| StepError::with_source("cannot fetch meta file", e))?;

            store_meta_file(
                data_manager,
                &meta_file,
                node.keys.public(),
                from,
                Some(to),
                self.session.ttl().meta_file,
            )
            .map_err(|e| StepError::with_source("cannot rotate meta file", e))?;

            for chunk in meta_file.all_chunks() {
                let params = Parameters::new(chunk.chunk_id, content_keys::FILE_CHUNK);
                let Some(record) = data_manager
                    .get(&params)
                    .map_err(|e| StepError::with_source("cannot fetch chunk", e))?
                else {
                    continue;
                };
                let NetworkContent::Hybrid(envelope) = record.content else {
                    continue;
                };
                let rotate = Parameters::new(chunk.chunk_id, content_keys::FILE_CHUNK)
                    .with_data(NetworkContent::Hybrid(envelope))
                    .with_protection_keys(from.clone())
                    .with_new_protection_keys(to.clone())
                    .with_ttl(self.session.ttl().chunk);
                data_manager
                    .put(&rotate)
                    .map_err(|e| StepError::with_source("cannot rotate chunk", e))?;
            }
            debug!(file = %node.name, "rotated protection keys");
        }
        Ok(())
    }
}

impl ProcessStep for ReprotectSubtreeStep {
    fn name(&self) -> &str {
        "re-protect subtree"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (subtree, share_keys, default_protection, created) = {
            let ctx = self.context.lock();
            (
                ctx.subtree.clone(),
                ctx.share_keys.clone(),
                ctx.default_protection.clone(),
                ctx.created_keys,
            )
        };
        // Already-shared folders are already on their share keys.
        if !created {
            return Ok(());
        }
        let subtree = subtree.ok_or_else(|| StepError::new("subtree missing"))?;
        let share_keys = share_keys.ok_or_else(|| StepError::new("share keys missing"))?;
        let default_protection =
            default_protection.ok_or_else(|| StepError::new("protection keys missing"))?;
        self.rotate(&subtree, &default_protection, &share_keys)
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let (subtree, share_keys, default_protection, created) = {
            let ctx = self.context.lock();
            (
                ctx.subtree.clone(),
                ctx.share_keys.clone(),
                ctx.default_protection.clone(),
                ctx.created_keys,
            )
        };
        if !created {
            return;
        }
        if let (Some(subtree), Some(share_keys), Some(default_protection)) =
            (subtree, share_keys, default_protection)
        {
            if let Err(e) = self.rotate(&subtree, &share_keys, &default_protection) {
                warn!(error = %e.message, "could not rotate keys back during rollback");
            }
        }
    }
}
