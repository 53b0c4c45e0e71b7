//! Configuration for file handling and DHT record lifetimes.
//!
//! Both structs are immutable and passed by reference during construction;
//! there is no process-wide configuration state.

use std::time::Duration;

/// File handling configuration.
#[derive(Debug, Clone)]
pub struct FileConfiguration {
    /// Size of a single file chunk in bytes.
    pub chunk_size: usize,
    /// Maximum size of a single file in bytes.
    pub max_file_size: u64,
    /// Maximum number of versions kept per file.
    pub max_num_of_versions: usize,
    /// Maximum total size of all kept versions in bytes. Eviction triggers
    /// only when the sum strictly exceeds this limit.
    pub max_size_all_versions: u64,
    /// Polling interval of the local file observer.
    pub file_observer_interval: Duration,
    /// Window a modifier gets between profile delivery and `ready_to_put`.
    pub max_modification_time: Duration,
    /// AES key length for the profile encryption, in bits.
    pub aes_key_bits: u32,
    /// RSA modulus size for user and protection keys.
    pub rsa_user_key_bits: usize,
    /// RSA modulus size for per-file node keys.
    pub rsa_file_key_bits: usize,
    /// RSA modulus size for per-file chunk encryption keys.
    pub rsa_chunk_key_bits: usize,
}

impl Default for FileConfiguration {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_file_size: 25 * 1024 * 1024,
            max_num_of_versions: 10,
            max_size_all_versions: 100 * 1024 * 1024,
            file_observer_interval: Duration::from_secs(1),
            max_modification_time: Duration::from_millis(1000),
            aes_key_bits: 256,
            rsa_user_key_bits: 2048,
            rsa_file_key_bits: 1024,
            rsa_chunk_key_bits: 1024,
        }
    }
}

/// One record lifetime per content kind, surfaced verbatim on every put.
#[derive(Debug, Clone)]
pub struct TimeToLive {
    pub user_profile: Duration,
    pub meta_file: Duration,
    pub chunk: Duration,
    pub locations: Duration,
    pub user_message_queue: Duration,
    pub user_public_key: Duration,
}

impl Default for TimeToLive {
    fn default() -> Self {
        const DAY: u64 = 24 * 60 * 60;
        Self {
            user_profile: Duration::from_secs(365 * DAY),
            meta_file: Duration::from_secs(365 * DAY),
            chunk: Duration::from_secs(180 * DAY),
            locations: Duration::from_secs(DAY),
            user_message_queue: Duration::from_secs(30 * DAY),
            user_public_key: Duration::from_secs(365 * DAY),
        }
    }
}
