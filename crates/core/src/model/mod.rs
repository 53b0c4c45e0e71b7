//! Data model: credentials, profile, file tree, meta files, locations.

pub mod credentials;
pub mod locations;
pub mod message_queue;
pub mod meta_file;
pub mod profile;
pub mod tree;

pub use credentials::UserCredentials;
pub use locations::{LocationEntry, Locations};
pub use message_queue::{ProfileTask, UserMessageQueue};
pub use meta_file::{Chunk, FileVersion, MetaChunk, MetaFile};
pub use profile::UserProfile;
pub use tree::{FileTree, IndexKind, IndexNode, NodeId, PermissionType, UserPermission};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
