//! The tagged content envelope stored under a DHT address.

use crate::error::CoreError;
use crate::model::locations::Locations;
use crate::model::message_queue::UserMessageQueue;
use meshvault_crypto::{AesEncryptedContent, HybridEncryptedContent, PublicKey};
use serde::{Deserialize, Serialize};

/// The conventional content-key slot names at each location key. These are
/// wire constants shared by all implementations.
pub mod content_keys {
    pub const USER_PROFILE: &str = "USER_PROFILE";
    pub const FILE_CHUNK: &str = "FILE_CHUNK";
    pub const LOCATIONS: &str = "LOCATIONS";
    pub const META_FILE: &str = "META_FILE";
    pub const USER_MESSAGE_QUEUE: &str = "USER_MESSAGE_QUEUE";
    pub const USER_PUBLIC_KEY: &str = "USER_PUBLIC_KEY";
}

/// A value stored in the overlay. The variant is part of the record: a
/// reader asking for the wrong kind gets an explicit error instead of a
/// failed downcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkContent {
    /// AES envelope (the user profile).
    EncryptedProfile(AesEncryptedContent),
    /// Hybrid envelope (meta files, chunks).
    Hybrid(HybridEncryptedContent),
    Locations(Locations),
    MessageQueue(UserMessageQueue),
    UserPublicKey(PublicKey),
}

impl NetworkContent {
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkContent::EncryptedProfile(_) => "encrypted profile",
            NetworkContent::Hybrid(_) => "hybrid envelope",
            NetworkContent::Locations(_) => "locations",
            NetworkContent::MessageQueue(_) => "message queue",
            NetworkContent::UserPublicKey(_) => "user public key",
        }
    }

    fn mismatch(&self, expected: &str) -> CoreError {
        CoreError::GetFailed(format!(
            "unexpected content kind: expected {expected}, got {}",
            self.kind()
        ))
    }

    pub fn into_encrypted_profile(self) -> Result<AesEncryptedContent, CoreError> {
        match self {
            NetworkContent::EncryptedProfile(content) => Ok(content),
            other => Err(other.mismatch("encrypted profile")),
        }
    }

    pub fn into_hybrid(self) -> Result<HybridEncryptedContent, CoreError> {
        match self {
            NetworkContent::Hybrid(content) => Ok(content),
            other => Err(other.mismatch("hybrid envelope")),
        }
    }

    pub fn into_locations(self) -> Result<Locations, CoreError> {
        match self {
            NetworkContent::Locations(locations) => Ok(locations),
            other => Err(other.mismatch("locations")),
        }
    }

    pub fn into_message_queue(self) -> Result<UserMessageQueue, CoreError> {
        match self {
            NetworkContent::MessageQueue(queue) => Ok(queue),
            other => Err(other.mismatch("message queue")),
        }
    }

    pub fn into_user_public_key(self) -> Result<PublicKey, CoreError> {
        match self {
            NetworkContent::UserPublicKey(key) => Ok(key),
            other => Err(other.mismatch("user public key")),
        }
    }
}
