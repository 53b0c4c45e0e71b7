//! meshvault core
//!
//! The peer-side engine of meshvault: the encrypted user profile and its
//! virtual file tree, the chunk codec, the serialized profile-access queue,
//! the location registry with peer notifications, and the rollback-capable
//! operation pipelines built on `meshvault-process`.
//!
//! The DHT overlay itself is an external collaborator: everything here talks
//! to it through the `network::DataManager` contract.

pub mod config;
pub mod error;
pub mod file;
pub mod model;
pub mod network;
pub mod notify;
pub mod processes;
pub mod profile_manager;
pub mod session;

pub use config::{FileConfiguration, TimeToLive};
pub use error::CoreError;
pub use session::{Client, Session};
