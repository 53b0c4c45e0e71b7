//! Opening a session: profile fetch, location registration and the
//! reconciliation of changes made while offline.

use crate::file::disk::digest_tree;
use crate::file::sidecar::read_sidecar;
use crate::model::now_millis;
use crate::model::locations::Locations;
use crate::model::profile::UserProfile;
use crate::notify::{fetch_locations, process_message_queue, store_locations};
use crate::processes::{add, delete, download, update};
use crate::session::Session;
use meshvault_crypto::ContentDigest;
use meshvault_process::{
    execute_blocking, CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Build the login pipeline.
pub fn login_process(session: Arc<Session>) -> SequentialProcess {
    let mut process = SequentialProcess::new("login");
    process
        .add_step(FetchProfileStep {
            session: session.clone(),
        })
        .add_step(AddToLocationsStep {
            session: session.clone(),
            added: false,
        })
        .add_step(SynchronizeStep { session });
    process
}

struct FetchProfileStep {
    session: Arc<Session>,
}

impl ProcessStep for FetchProfileStep {
    fn name(&self) -> &str {
        "fetch profile"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        // Validates the credentials and warms the protection-key cache.
        let manager = self.session.profile_manager();
        let pid = manager.new_process_id();
        manager
            .get_user_profile(pid, false)
            .map_err(|e| StepError::with_source("cannot fetch profile", e))?;
        Ok(())
    }
}

struct AddToLocationsStep {
    session: Arc<Session>,
    added: bool,
}

impl ProcessStep for AddToLocationsStep {
    fn name(&self) -> &str {
        "add to locations"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let data_manager = self.session.data_manager();
        let user_id = self.session.user_id();
        let mut locations = fetch_locations(data_manager, user_id)
            .map_err(|e| StepError::with_source("cannot fetch locations", e))?
            .unwrap_or_else(|| Locations::new(user_id));

        locations.add_peer(self.session.address().clone(), now_millis());

        let protection = self
            .session
            .profile_manager()
            .protection_keys()
            .map_err(|e| StepError::with_source("cannot load protection keys", e))?;
        store_locations(
            data_manager,
            &locations,
            &protection,
            self.session.ttl().locations,
        )
        .map_err(|e| StepError::with_source("cannot store locations", e))?;
        self.added = true;
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        if !self.added {
            return;
        }
        let data_manager = self.session.data_manager();
        let result = fetch_locations(data_manager, self.session.user_id()).and_then(
            |locations| match locations {
                Some(mut locations) => {
                    locations.remove_peer(self.session.address());
                    let protection = self.session.profile_manager().protection_keys()?;
                    store_locations(
                        data_manager,
                        &locations,
                        &protection,
                        self.session.ttl().locations,
                    )
                }
                None => Ok(()),
            },
        );
        if let Err(e) = result {
            warn!(error = %e, "could not leave locations during rollback");
        }
    }
}

/// What the offline reconciliation decided to do, path by path.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncActions {
    /// New local files (and their folders) to upload.
    pub upload_new: Vec<String>,
    /// Locally changed files to upload as new versions.
    pub upload_updated: Vec<String>,
    /// Remotely added or changed files to download.
    pub download: Vec<String>,
    /// Files deleted locally while offline, to delete from the network.
    pub delete_remote: Vec<String>,
    /// Files deleted remotely while offline, to delete from disk.
    pub delete_local: Vec<String>,
}

/// Three-way diff between the disk, the sidecar written at last logout and
/// the fetched profile. When both sides changed the same file, the local
/// version wins (the remote versions stay recoverable through the version
/// history).
pub fn compute_sync_actions(
    disk: &BTreeMap<String, ContentDigest>,
    sidecar: &BTreeMap<String, ContentDigest>,
    profile: &BTreeMap<String, ContentDigest>,
) -> SyncActions {
    let mut actions = SyncActions::default();
    let mut paths: Vec<&String> = disk
        .keys()
        .chain(sidecar.keys())
        .chain(profile.keys())
        .collect();
    paths.sort();
    paths.dedup();

    for path in paths {
        let d = disk.get(path);
        let s = sidecar.get(path);
        let p = profile.get(path);
        match (d, s, p) {
            // New on disk, unknown anywhere else.
            (Some(_), None, None) => actions.upload_new.push(path.clone()),
            // Known at logout, gone from the profile: deleted remotely.
            (Some(_), Some(_), None) => actions.delete_local.push(path.clone()),
            // Added on both sides independently.
            (Some(d), None, Some(p)) => {
                if d != p {
                    actions.upload_updated.push(path.clone());
                }
            }
            (Some(d), Some(s), Some(p)) => {
                if d == p {
                    // In sync.
                } else if d == s {
                    // Only the remote side moved.
                    actions.download.push(path.clone());
                } else {
                    // Local change, possibly on both sides: local wins.
                    actions.upload_updated.push(path.clone());
                }
            }
            // Known at logout, gone from disk: deleted locally.
            (None, Some(_), Some(_)) => actions.delete_remote.push(path.clone()),
            // New in the profile.
            (None, None, Some(_)) => actions.download.push(path.clone()),
            // Deleted on both sides, or never existed.
            (None, Some(_), None) | (None, None, None) => {}
        }
    }
    actions
}

fn profile_digests(profile: &UserProfile) -> BTreeMap<String, ContentDigest> {
    let tree = profile.tree();
    let mut digests = BTreeMap::new();
    for file_id in tree.files_in_subtree(tree.root()) {
        if let (Some(path), Some(node)) = (tree.path_of(file_id), tree.node(file_id)) {
            if let Some(digest) = node.file_digest() {
                let key = path
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                digests.insert(key, digest);
            }
        }
    }
    digests
}

struct SynchronizeStep {
    session: Arc<Session>,
}

impl SynchronizeStep {
    /// Upload a new file, creating missing ancestor folders in the profile
    /// first.
    fn upload_with_folders(&self, path: &str, profile_paths: &BTreeMap<String, ContentDigest>) {
        let relative = PathBuf::from(path);
        let mut ancestors: Vec<PathBuf> = relative
            .ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();
        ancestors.reverse();
        for ancestor in ancestors {
            let key = ancestor.to_string_lossy().replace('\\', "/");
            if profile_paths.keys().any(|p| p.starts_with(&key)) {
                continue;
            }
            let mut process = add::add_file_process(self.session.clone(), ancestor);
            if let Err(e) = execute_blocking(&mut process).into_result() {
                debug!(error = %e, "folder upload skipped");
            }
        }
        let mut process = add::add_file_process(self.session.clone(), relative);
        if let Err(e) = execute_blocking(&mut process).into_result() {
            warn!(file = path, error = %e, "offline upload failed");
        }
    }
}

impl ProcessStep for SynchronizeStep {
    fn name(&self) -> &str {
        "synchronize files"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let session = &self.session;

        // Sidecar from the last logout on this machine.
        let sidecar = read_sidecar(session.root())
            .map_err(|e| StepError::with_source("cannot read sidecar", e))?;
        session.key_cache().preload(sidecar.public_key_cache);

        let disk = digest_tree(session.root())
            .map_err(|e| StepError::with_source("cannot digest local files", e))?;

        let manager = session.profile_manager();
        let pid = manager.new_process_id();
        let profile = manager
            .get_user_profile(pid, false)
            .map_err(|e| StepError::with_source("cannot read profile", e))?;
        let profile_paths = profile_digests(&profile);

        let actions = compute_sync_actions(&disk, &sidecar.file_tree, &profile_paths);
        info!(
            new = actions.upload_new.len(),
            updated = actions.upload_updated.len(),
            download = actions.download.len(),
            delete_remote = actions.delete_remote.len(),
            delete_local = actions.delete_local.len(),
            "reconciling offline changes"
        );

        // Failures on individual files must not abort the login.
        for path in &actions.upload_new {
            self.upload_with_folders(path, &profile_paths);
        }
        for path in &actions.upload_updated {
            let mut process = update::update_file_process(session.clone(), PathBuf::from(path));
            if let Err(e) = execute_blocking(&mut process).into_result() {
                warn!(file = %path, error = %e, "offline update failed");
            }
        }
        for path in &actions.download {
            let mut process = download::download_file_process(session.clone(), PathBuf::from(path));
            if let Err(e) = execute_blocking(&mut process).into_result() {
                warn!(file = %path, error = %e, "download failed");
            }
        }
        for path in &actions.delete_remote {
            let mut process = delete::delete_file_process(session.clone(), PathBuf::from(path));
            if let Err(e) = execute_blocking(&mut process).into_result() {
                warn!(file = %path, error = %e, "remote delete failed");
            }
        }
        for path in &actions.delete_local {
            let absolute = session.root().join(path);
            if absolute.exists() {
                if let Err(e) = std::fs::remove_file(&absolute) {
                    warn!(file = %path, error = %e, "local delete failed");
                }
            }
        }

        // Tasks that queued up while this user was offline.
        if let Err(e) = process_message_queue(session) {
            warn!(error = %e, "could not process the message queue");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(data: &[u8]) -> ContentDigest {
        ContentDigest::from_data(data)
    }

    fn map(entries: &[(&str, &[u8])]) -> BTreeMap<String, ContentDigest> {
        entries
            .iter()
            .map(|(path, data)| (path.to_string(), digest(data)))
            .collect()
    }

    #[test]
    fn test_new_local_file_is_uploaded() {
        let actions = compute_sync_actions(&map(&[("a.txt", b"x")]), &map(&[]), &map(&[]));
        assert_eq!(actions.upload_new, vec!["a.txt"]);
    }

    #[test]
    fn test_local_change_is_uploaded() {
        let actions = compute_sync_actions(
            &map(&[("a.txt", b"new")]),
            &map(&[("a.txt", b"old")]),
            &map(&[("a.txt", b"old")]),
        );
        assert_eq!(actions.upload_updated, vec!["a.txt"]);
        assert!(actions.download.is_empty());
    }

    #[test]
    fn test_remote_change_is_downloaded() {
        let actions = compute_sync_actions(
            &map(&[("a.txt", b"old")]),
            &map(&[("a.txt", b"old")]),
            &map(&[("a.txt", b"new")]),
        );
        assert_eq!(actions.download, vec!["a.txt"]);
    }

    #[test]
    fn test_conflicting_change_prefers_local() {
        let actions = compute_sync_actions(
            &map(&[("a.txt", b"local")]),
            &map(&[("a.txt", b"old")]),
            &map(&[("a.txt", b"remote")]),
        );
        assert_eq!(actions.upload_updated, vec!["a.txt"]);
        assert!(actions.download.is_empty());
    }

    #[test]
    fn test_local_delete_propagates() {
        let actions = compute_sync_actions(
            &map(&[]),
            &map(&[("a.txt", b"x")]),
            &map(&[("a.txt", b"x")]),
        );
        assert_eq!(actions.delete_remote, vec!["a.txt"]);
    }

    #[test]
    fn test_remote_delete_removes_local_file() {
        let actions = compute_sync_actions(
            &map(&[("a.txt", b"x")]),
            &map(&[("a.txt", b"x")]),
            &map(&[]),
        );
        assert_eq!(actions.delete_local, vec!["a.txt"]);
    }

    #[test]
    fn test_remote_addition_is_downloaded() {
        let actions = compute_sync_actions(&map(&[]), &map(&[]), &map(&[("b/c.txt", b"x")]));
        assert_eq!(actions.download, vec!["b/c.txt"]);
    }

    #[test]
    fn test_unchanged_file_is_untouched() {
        let actions = compute_sync_actions(
            &map(&[("a.txt", b"x")]),
            &map(&[("a.txt", b"x")]),
            &map(&[("a.txt", b"x")]),
        );
        assert_eq!(actions, SyncActions::default());
    }
}
