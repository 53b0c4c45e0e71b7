//! In-process overlay for tests, demos and single-node deployments.
//!
//! Implements the full `DataManager` contract against a local map: version
//! chaining, protection-key ownership with rotation, direct messages routed
//! to registered receivers, and an injectable artificial latency so
//! scheduling behavior (reader piggy-backing, modification windows) can be
//! exercised deterministically.

use crate::error::CoreError;
use crate::network::data_manager::{
    AcceptanceReply, DataManager, FetchedContent, MessageHandler,
};
use crate::network::messages::{DirectMessage, PeerAddress};
use crate::network::parameters::{Parameters, VersionKey};
use crate::network::content::NetworkContent;
use meshvault_crypto::LocationKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// Record lifetimes are accepted but not enforced: the in-process overlay
// never outlives its tests.
struct StoredRecord {
    content: NetworkContent,
    version_key: Option<VersionKey>,
    based_on_key: Option<VersionKey>,
    /// Fingerprint of the protection public key owning this slot.
    protection: Option<LocationKey>,
}

struct Inner {
    records: Mutex<HashMap<(LocationKey, String), StoredRecord>>,
    handlers: Mutex<HashMap<PeerAddress, Arc<dyn MessageHandler>>>,
    connected: AtomicBool,
    get_count: AtomicU64,
    latency: Option<Duration>,
}

/// In-memory `DataManager`. Cloning shares the same overlay, so several
/// local "peers" of one test observe the same records.
#[derive(Clone)]
pub struct MemoryDataManager {
    inner: Arc<Inner>,
}

impl MemoryDataManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Overlay whose get/put round-trips take at least `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(Some(latency))
    }

    fn build(latency: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(true),
                get_count: AtomicU64::new(0),
                latency,
            }),
        }
    }

    /// Simulate leaving / rejoining the overlay.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of `get` round-trips issued so far.
    pub fn get_count(&self) -> u64 {
        self.inner.get_count.load(Ordering::SeqCst)
    }

    /// Number of stored records under a content key (for tests and
    /// debugging).
    pub fn count_records(&self, content_key: &str) -> usize {
        self.inner
            .records
            .lock()
            .keys()
            .filter(|(_, key)| key == content_key)
            .count()
    }

    fn simulate_round_trip(&self) -> Result<(), CoreError> {
        if let Some(latency) = self.inner.latency {
            std::thread::sleep(latency);
        }
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(CoreError::NoPeerConnection);
        }
        Ok(())
    }

    fn record_key(params: &Parameters) -> (LocationKey, String) {
        (*params.location_key(), params.content_key().to_string())
    }

    fn check_protection(
        record: &StoredRecord,
        params: &Parameters,
    ) -> Result<(), CoreError> {
        let Some(owner) = record.protection else {
            return Ok(());
        };
        let presented = params
            .protection_keys()
            .ok_or_else(|| CoreError::PutFailed("record is protected".to_string()))?;
        let fingerprint = presented
            .fingerprint()
            .map_err(|e| CoreError::PutFailed(format!("invalid protection keys: {e}")))?;
        if fingerprint != owner {
            return Err(CoreError::PutFailed(
                "protection keys do not match".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryDataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DataManager for MemoryDataManager {
    fn get(&self, params: &Parameters) -> Result<Option<FetchedContent>, CoreError> {
        self.simulate_round_trip()
            .map_err(|e| match e {
                CoreError::NoPeerConnection => CoreError::NoPeerConnection,
                other => CoreError::GetFailed(other.to_string()),
            })?;
        self.inner.get_count.fetch_add(1, Ordering::SeqCst);

        let records = self.inner.records.lock();
        Ok(records.get(&Self::record_key(params)).map(|record| {
            FetchedContent {
                content: record.content.clone(),
                version_key: record.version_key,
                based_on_key: record.based_on_key,
            }
        }))
    }

    fn put(&self, params: &Parameters) -> Result<(), CoreError> {
        self.simulate_round_trip().map_err(|e| match e {
            CoreError::NoPeerConnection => CoreError::NoPeerConnection,
            other => CoreError::PutFailed(other.to_string()),
        })?;

        let data = params
            .data()
            .cloned()
            .ok_or_else(|| CoreError::PutFailed("no data to put".to_string()))?;

        let mut records = self.inner.records.lock();
        let key = Self::record_key(params);

        let existing_protection = match records.get(&key) {
            Some(existing) => {
                Self::check_protection(existing, params)?;
                // Version chaining applies whenever the writer claims a
                // based-on version.
                if let Some(based_on) = params.based_on_key() {
                    if existing.version_key != Some(based_on) {
                        return Err(CoreError::PutFailed(
                            "version conflict: based-on key is stale".to_string(),
                        ));
                    }
                }
                existing.protection
            }
            None => None,
        };

        // First put claims the slot; a rotation hands it over.
        let protection = if let Some(new_keys) = params.new_protection_keys() {
            Some(
                new_keys
                    .fingerprint()
                    .map_err(|e| CoreError::PutFailed(format!("invalid protection keys: {e}")))?,
            )
        } else if existing_protection.is_some() {
            existing_protection
        } else {
            match params.protection_keys() {
                Some(keys) => Some(keys.fingerprint().map_err(|e| {
                    CoreError::PutFailed(format!("invalid protection keys: {e}"))
                })?),
                None => None,
            }
        };

        debug!(
            location = %hex::encode(&params.location_key()[..4]),
            content = params.content_key(),
            "memory overlay put"
        );
        records.insert(
            key,
            StoredRecord {
                content: data,
                version_key: params.version_key(),
                based_on_key: params.based_on_key(),
                protection,
            },
        );
        Ok(())
    }

    fn remove(&self, params: &Parameters) -> Result<(), CoreError> {
        self.simulate_round_trip().map_err(|e| match e {
            CoreError::NoPeerConnection => CoreError::NoPeerConnection,
            other => CoreError::RemoveFailed(other.to_string()),
        })?;

        let mut records = self.inner.records.lock();
        let key = Self::record_key(params);
        if let Some(existing) = records.get(&key) {
            Self::check_protection(existing, params)
                .map_err(|e| CoreError::RemoveFailed(e.to_string()))?;
            records.remove(&key);
        }
        Ok(())
    }

    fn send_direct(
        &self,
        peer: &PeerAddress,
        message: DirectMessage,
    ) -> Result<AcceptanceReply, CoreError> {
        self.simulate_round_trip().map_err(|e| match e {
            CoreError::NoPeerConnection => CoreError::NoPeerConnection,
            other => CoreError::SendFailed(other.to_string()),
        })?;

        let handler = { self.inner.handlers.lock().get(peer).cloned() };
        match handler {
            Some(handler) => Ok(handler.handle(&message)),
            // Nobody listening on that address: the peer is gone.
            None => Ok(AcceptanceReply::Failure),
        }
    }

    fn register_receiver(&self, peer: &PeerAddress, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.lock().insert(peer.clone(), handler);
    }

    fn unregister_receiver(&self, peer: &PeerAddress) {
        self.inner.handlers.lock().remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::locations::Locations;
    use crate::network::content::content_keys;
    use meshvault_crypto::{location_key, KeyPair};

    fn locations_content(user: &str) -> NetworkContent {
        NetworkContent::Locations(Locations::new(user))
    }

    fn params(seed: &[u8]) -> Parameters {
        Parameters::new(location_key(seed), content_keys::LOCATIONS)
    }

    #[test]
    fn test_put_get_remove() {
        let overlay = MemoryDataManager::new();

        overlay
            .put(&params(b"alice").with_data(locations_content("alice")))
            .unwrap();

        let fetched = overlay.get(&params(b"alice")).unwrap().unwrap();
        assert!(matches!(fetched.content, NetworkContent::Locations(_)));

        overlay.remove(&params(b"alice")).unwrap();
        assert!(overlay.get(&params(b"alice")).unwrap().is_none());
    }

    #[test]
    fn test_version_chain_rejects_stale_put() {
        let overlay = MemoryDataManager::new();
        let v0 = VersionKey::random();
        let v1 = VersionKey::random();

        overlay
            .put(
                &params(b"alice")
                    .with_data(locations_content("alice"))
                    .with_version_key(v0),
            )
            .unwrap();
        overlay
            .put(
                &params(b"alice")
                    .with_data(locations_content("alice"))
                    .with_based_on(v0)
                    .with_version_key(v1),
            )
            .unwrap();

        // Writing against the already-replaced version must fail.
        let stale = overlay.put(
            &params(b"alice")
                .with_data(locations_content("alice"))
                .with_based_on(v0)
                .with_version_key(VersionKey::random()),
        );
        assert!(matches!(stale, Err(CoreError::PutFailed(_))));
    }

    #[test]
    fn test_first_put_claims_protection() {
        let overlay = MemoryDataManager::new();
        let owner = KeyPair::generate(1024).unwrap();
        let attacker = KeyPair::generate(1024).unwrap();

        overlay
            .put(
                &params(b"alice")
                    .with_data(locations_content("alice"))
                    .with_protection_keys(owner.clone()),
            )
            .unwrap();

        let unauthorized = overlay.put(
            &params(b"alice")
                .with_data(locations_content("alice"))
                .with_protection_keys(attacker),
        );
        assert!(matches!(unauthorized, Err(CoreError::PutFailed(_))));

        overlay
            .put(
                &params(b"alice")
                    .with_data(locations_content("alice"))
                    .with_protection_keys(owner),
            )
            .unwrap();
    }

    #[test]
    fn test_protection_rotation_hands_over_the_slot() {
        let overlay = MemoryDataManager::new();
        let owner = KeyPair::generate(1024).unwrap();
        let next_owner = KeyPair::generate(1024).unwrap();

        overlay
            .put(
                &params(b"f").with_data(locations_content("a")).with_protection_keys(owner.clone()),
            )
            .unwrap();
        overlay
            .put(
                &params(b"f")
                    .with_data(locations_content("a"))
                    .with_protection_keys(owner.clone())
                    .with_new_protection_keys(next_owner.clone()),
            )
            .unwrap();

        // The old owner lost write access, the new owner has it.
        assert!(overlay
            .put(&params(b"f").with_data(locations_content("a")).with_protection_keys(owner))
            .is_err());
        assert!(overlay
            .put(&params(b"f").with_data(locations_content("a")).with_protection_keys(next_owner))
            .is_ok());
    }

    #[test]
    fn test_disconnected_overlay_reports_no_connection() {
        let overlay = MemoryDataManager::new();
        overlay.set_connected(false);

        assert!(matches!(
            overlay.get(&params(b"x")),
            Err(CoreError::NoPeerConnection)
        ));
        assert!(matches!(
            overlay.put(&params(b"x").with_data(locations_content("x"))),
            Err(CoreError::NoPeerConnection)
        ));
    }

    #[test]
    fn test_send_direct_to_absent_peer_fails() {
        let overlay = MemoryDataManager::new();
        let reply = overlay
            .send_direct(
                &PeerAddress::new("ghost"),
                DirectMessage {
                    sender: PeerAddress::new("self"),
                    sender_user: "alice".to_string(),
                    payload: crate::network::messages::NotificationPayload::CheckMessageQueue {
                        from_user: "alice".to_string(),
                    },
                },
            )
            .unwrap();
        assert_eq!(reply, AcceptanceReply::Failure);
    }
}
