//! The overlay façade: parameters, content envelope, data manager contract
//! and the in-process overlay used by tests and the demo node.

pub mod content;
pub mod data_manager;
pub mod memory;
pub mod messages;
pub mod parameters;

pub use content::{content_keys, NetworkContent};
pub use data_manager::{
    put_unblocked, AcceptanceReply, DataManager, FetchedContent, MessageHandler, PutFuture,
};
pub use memory::MemoryDataManager;
pub use messages::{DirectMessage, NotificationPayload, PeerAddress};
pub use parameters::{Parameters, VersionKey};
