//! Durable tasks queued for a user who may be offline.
//!
//! Notifications to peers of a foreign user are transient; the durable part
//! of the change travels as a profile task appended to the recipient's queue
//! slot in the DHT. The recipient drains the queue when pinged or at the
//! next login and applies each task to its own profile.

use crate::model::tree::FileTree;
use meshvault_crypto::{ContentDigest, KeyPair};
use serde::{Deserialize, Serialize};

/// A pending change another user handed to this user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProfileTask {
    /// A folder was shared with this user; the subtree carries the node and
    /// share-protection keys required to use it.
    ShareFolder {
        from_user: String,
        folder_name: String,
        folder: FileTree,
    },
    /// A file appeared inside a shared folder. Carries the node keys so the
    /// recipient can reach the meta file.
    IndexAdded {
        from_user: String,
        path: String,
        keys: KeyPair,
        digest: ContentDigest,
    },
    /// A folder appeared inside a shared folder.
    FolderAdded {
        from_user: String,
        path: String,
        keys: KeyPair,
    },
    /// A file inside a shared folder changed.
    IndexUpdated {
        from_user: String,
        path: String,
        digest: ContentDigest,
    },
    /// A file inside a shared folder was removed.
    IndexRemoved { from_user: String, path: String },
    /// A file inside a shared folder moved.
    IndexMoved {
        from_user: String,
        from_path: String,
        to_path: String,
    },
}

/// The DHT-stored task queue of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessageQueue {
    user_id: String,
    tasks: Vec<ProfileTask>,
}

impl UserMessageQueue {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tasks: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn push(&mut self, task: ProfileTask) {
        self.tasks.push(task);
    }

    /// Take all queued tasks, oldest first.
    pub fn drain(&mut self) -> Vec<ProfileTask> {
        std::mem::take(&mut self.tasks)
    }
}
