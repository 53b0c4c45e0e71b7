//! Direct peer-to-peer messages.

use serde::{Deserialize, Serialize};

/// Overlay address of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The transient payload of a direct notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationPayload {
    /// A file appeared in the sender's tree.
    FileAdded { path: String },
    /// A file gained a new version.
    FileUpdated { path: String },
    /// A file disappeared from the sender's tree.
    FileDeleted { path: String },
    /// A file moved within the sender's tree.
    FileMoved { from_path: String, to_path: String },
    /// The recipient's durable message queue has pending tasks.
    CheckMessageQueue { from_user: String },
}

/// A message sent directly to one peer, outside the DHT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub sender: PeerAddress,
    pub sender_user: String,
    pub payload: NotificationPayload,
}
