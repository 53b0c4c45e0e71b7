//! Addressing and metadata for overlay operations.

use crate::network::content::NetworkContent;
use meshvault_crypto::{KeyPair, LocationKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of one write in a record's version chain. The overlay rejects
/// puts whose based-on key does not match the stored current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey(pub [u8; 32]);

impl VersionKey {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Parameters of a single overlay operation: the record address plus the
/// optional version chain, protection and lifetime metadata.
#[derive(Debug, Clone)]
pub struct Parameters {
    location_key: LocationKey,
    content_key: &'static str,
    version_key: Option<VersionKey>,
    based_on_key: Option<VersionKey>,
    protection_keys: Option<KeyPair>,
    /// Rotate the record's protection to these keys on a successful put.
    new_protection_keys: Option<KeyPair>,
    ttl: Option<Duration>,
    data: Option<NetworkContent>,
}

impl Parameters {
    pub fn new(location_key: LocationKey, content_key: &'static str) -> Self {
        Self {
            location_key,
            content_key,
            version_key: None,
            based_on_key: None,
            protection_keys: None,
            new_protection_keys: None,
            ttl: None,
            data: None,
        }
    }

    pub fn with_version_key(mut self, version_key: VersionKey) -> Self {
        self.version_key = Some(version_key);
        self
    }

    pub fn with_based_on(mut self, based_on: VersionKey) -> Self {
        self.based_on_key = Some(based_on);
        self
    }

    pub fn with_protection_keys(mut self, keys: KeyPair) -> Self {
        self.protection_keys = Some(keys);
        self
    }

    pub fn with_new_protection_keys(mut self, keys: KeyPair) -> Self {
        self.new_protection_keys = Some(keys);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_data(mut self, data: NetworkContent) -> Self {
        self.data = Some(data);
        self
    }

    pub fn location_key(&self) -> &LocationKey {
        &self.location_key
    }

    pub fn content_key(&self) -> &'static str {
        self.content_key
    }

    pub fn version_key(&self) -> Option<VersionKey> {
        self.version_key
    }

    pub fn based_on_key(&self) -> Option<VersionKey> {
        self.based_on_key
    }

    pub fn protection_keys(&self) -> Option<&KeyPair> {
        self.protection_keys.as_ref()
    }

    pub fn new_protection_keys(&self) -> Option<&KeyPair> {
        self.new_protection_keys.as_ref()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn data(&self) -> Option<&NetworkContent> {
        self.data.as_ref()
    }

    pub fn take_data(&mut self) -> Option<NetworkContent> {
        self.data.take()
    }
}
