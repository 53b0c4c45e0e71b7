//! The encrypted user profile.

use crate::model::tree::FileTree;
use crate::network::parameters::VersionKey;
use meshvault_crypto::KeyPair;
use serde::{Deserialize, Serialize};

/// The user's profile: identity keys, default protection keys and the
/// virtual file tree. Stored in the DHT encrypted with the AES key derived
/// from the credentials; mutated only through the profile manager's
/// serialized put path.
///
/// The version keys are record metadata, not profile content: they are set
/// from the fetched DHT record and the chain invariant is that every put
/// carries `based_on = previously fetched version key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    user_id: String,
    user_keys: KeyPair,
    protection_keys: KeyPair,
    tree: FileTree,
    #[serde(skip)]
    version_key: Option<VersionKey>,
    #[serde(skip)]
    based_on_key: Option<VersionKey>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, user_keys: KeyPair, protection_keys: KeyPair) -> Self {
        let root_keys = user_keys.clone();
        Self {
            user_id: user_id.into(),
            user_keys,
            protection_keys,
            tree: FileTree::new(root_keys),
            version_key: None,
            based_on_key: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_keys(&self) -> &KeyPair {
        &self.user_keys
    }

    /// Default write-ACL keypair for this user's DHT records.
    pub fn protection_keys(&self) -> &KeyPair {
        &self.protection_keys
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut FileTree {
        &mut self.tree
    }

    pub fn version_key(&self) -> Option<VersionKey> {
        self.version_key
    }

    pub fn based_on_key(&self) -> Option<VersionKey> {
        self.based_on_key
    }

    /// Attach the version metadata of the record this profile was read from.
    pub fn set_version_info(&mut self, version_key: Option<VersionKey>, based_on: Option<VersionKey>) {
        self.version_key = version_key;
        self.based_on_key = based_on;
    }
}
