//! Shared helpers for the integration suites.
#![allow(dead_code)]

use meshvault_core::config::{FileConfiguration, TimeToLive};
use meshvault_core::model::credentials::UserCredentials;
use meshvault_core::model::profile::UserProfile;
use meshvault_core::network::content::{content_keys, NetworkContent};
use meshvault_core::network::data_manager::DataManager;
use meshvault_core::network::memory::MemoryDataManager;
use meshvault_core::network::messages::PeerAddress;
use meshvault_core::network::parameters::{Parameters, VersionKey};
use meshvault_core::session::Client;
use meshvault_crypto::KeyPair;
use std::path::Path;
use std::sync::Arc;

/// Small keys and chunks keep the suites fast.
pub fn test_config() -> FileConfiguration {
    FileConfiguration {
        chunk_size: 1024,
        rsa_user_key_bits: 1024,
        rsa_file_key_bits: 1024,
        rsa_chunk_key_bits: 1024,
        ..FileConfiguration::default()
    }
}

pub fn credentials(user: &str) -> UserCredentials {
    UserCredentials::new(user, format!("{user}-password"), "1234")
}

/// A client of `peer` on the shared in-process overlay.
pub fn client(overlay: &MemoryDataManager, peer: &str, config: &FileConfiguration) -> Client {
    Client::new(
        Arc::new(overlay.clone()),
        PeerAddress::new(peer),
        config.clone(),
        TimeToLive::default(),
    )
}

pub fn write_file(root: &Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Store a fresh, empty profile for `credentials` directly in the overlay,
/// bypassing the register pipeline. Returns the stored version key.
pub fn store_profile(overlay: &MemoryDataManager, credentials: &UserCredentials) -> VersionKey {
    let user_keys = KeyPair::generate(1024).unwrap();
    let protection_keys = KeyPair::generate(1024).unwrap();
    let profile = UserProfile::new(credentials.user_id(), user_keys, protection_keys);

    let plaintext = serde_json::to_vec(&profile).unwrap();
    let key = credentials.profile_encryption_key(256).unwrap();
    let encrypted = key.encrypt(&plaintext).unwrap();

    let version = VersionKey::random();
    let params = Parameters::new(
        credentials.profile_location_key(),
        content_keys::USER_PROFILE,
    )
    .with_data(NetworkContent::EncryptedProfile(encrypted))
    .with_version_key(version)
    .with_protection_keys(profile.protection_keys().clone());
    overlay.put(&params).unwrap();
    version
}

/// The current profile record version in the overlay.
pub fn stored_profile_version(
    overlay: &MemoryDataManager,
    credentials: &UserCredentials,
) -> Option<VersionKey> {
    overlay
        .get(&Parameters::new(
            credentials.profile_location_key(),
            content_keys::USER_PROFILE,
        ))
        .unwrap()
        .and_then(|record| record.version_key)
}
