//! Serialized access to the encrypted user profile.
//!
//! A single worker thread owns the DHT slot of the profile. Readers and
//! modifiers enqueue and block on per-request latches; the worker performs
//! one get per cycle, hands the decrypted profile to the modifier at the
//! head of the modify queue and to every reader currently waiting (they
//! piggy-back on the same round-trip), then gives the modifier a bounded
//! window to hand back the modified profile for the put.
//!
//! Ordering rules: both queues are strict FIFO, modifiers take precedence
//! over readers, and the FIFO order of modifiers determines the version
//! chain order of the profile record.

use crate::config::{FileConfiguration, TimeToLive};
use crate::error::CoreError;
use crate::model::credentials::UserCredentials;
use crate::model::profile::UserProfile;
use crate::network::content::{content_keys, NetworkContent};
use crate::network::data_manager::DataManager;
use crate::network::parameters::{Parameters, VersionKey};
use meshvault_crypto::KeyPair;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Identifier of one operation interacting with the profile manager.
pub type ProcessId = u64;

struct GetEntry {
    pid: ProcessId,
    slot: Mutex<Option<Result<UserProfile, String>>>,
    latch: Condvar,
}

impl GetEntry {
    fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            slot: Mutex::new(None),
            latch: Condvar::new(),
        }
    }

    fn publish(&self, result: Result<UserProfile, String>) {
        *self.slot.lock() = Some(result);
        self.latch.notify_all();
    }

    fn wait(&self) -> Result<UserProfile, String> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.latch.wait(&mut slot);
        }
    }
}

#[derive(Default)]
struct PutState {
    ready: bool,
    aborted: bool,
    profile: Option<UserProfile>,
    result: Option<Result<(), String>>,
}

struct PutEntry {
    get: GetEntry,
    put: Mutex<PutState>,
    put_latch: Condvar,
}

impl PutEntry {
    fn new(pid: ProcessId) -> Self {
        Self {
            get: GetEntry::new(pid),
            put: Mutex::new(PutState::default()),
            put_latch: Condvar::new(),
        }
    }

    fn wait_for_put(&self) -> Result<(), CoreError> {
        let mut state = self.put.lock();
        loop {
            if let Some(result) = state.result.as_ref() {
                return result.clone().map_err(CoreError::PutFailed);
            }
            self.put_latch.wait(&mut state);
        }
    }

    fn finish(&self, result: Result<(), String>) {
        self.put.lock().result = Some(result);
        self.put_latch.notify_all();
    }
}

struct Queues {
    read_queue: VecDeque<Arc<GetEntry>>,
    modify_queue: VecDeque<Arc<PutEntry>>,
    /// The modifier currently holding (or last holding) the put slot. Only
    /// the worker replaces it, and only when the next modifier is selected.
    modifying: Option<Arc<PutEntry>>,
}

struct Shared {
    data_manager: Arc<dyn DataManager>,
    credentials: UserCredentials,
    aes_key_bits: u32,
    max_modification_time: Duration,
    profile_ttl: Duration,
    queues: Mutex<Queues>,
    queue_waiter: Condvar,
    running: AtomicBool,
    protection_keys: Mutex<Option<KeyPair>>,
    pid_counter: AtomicU64,
}

enum Work {
    Modify(Arc<PutEntry>),
    Read,
}

/// Manager of the profile resource. Every get / modify cycle goes through
/// its queue worker.
pub struct UserProfileManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UserProfileManager {
    pub fn new(
        data_manager: Arc<dyn DataManager>,
        credentials: UserCredentials,
        config: &FileConfiguration,
        ttl: &TimeToLive,
    ) -> Result<Self, CoreError> {
        let shared = Arc::new(Shared {
            data_manager,
            credentials,
            aes_key_bits: config.aes_key_bits,
            max_modification_time: config.max_modification_time,
            profile_ttl: ttl.user_profile,
            queues: Mutex::new(Queues {
                read_queue: VecDeque::new(),
                modify_queue: VecDeque::new(),
                modifying: None,
            }),
            queue_waiter: Condvar::new(),
            running: AtomicBool::new(true),
            protection_keys: Mutex::new(None),
            pid_counter: AtomicU64::new(1),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("profile-queue".to_string())
            .spawn(move || worker_loop(worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn user_id(&self) -> &str {
        self.shared.credentials.user_id()
    }

    pub fn credentials(&self) -> &UserCredentials {
        &self.shared.credentials
    }

    /// A fresh process identifier for one operation.
    pub fn new_process_id(&self) -> ProcessId {
        self.shared.pid_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Get the profile, blocking until the worker publishes it. A modifier
    /// (`intends_to_put`) must call `ready_to_put` within the modification
    /// window afterwards.
    pub fn get_user_profile(
        &self,
        pid: ProcessId,
        intends_to_put: bool,
    ) -> Result<UserProfile, CoreError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(CoreError::GetFailed(
                "profile queue worker stopped".to_string(),
            ));
        }

        let result = if intends_to_put {
            let entry = Arc::new(PutEntry::new(pid));
            {
                let mut queues = self.shared.queues.lock();
                queues.modify_queue.push_back(entry.clone());
            }
            self.shared.queue_waiter.notify_one();
            let result = entry.get.wait();
            if result.is_err() {
                // Stop the modification window right away.
                self.abort_modification(pid);
            }
            result
        } else {
            let entry = Arc::new(GetEntry::new(pid));
            {
                let mut queues = self.shared.queues.lock();
                queues.read_queue.push_back(entry.clone());
            }
            self.shared.queue_waiter.notify_one();
            entry.wait()
        };

        result.map_err(CoreError::GetFailed)
    }

    /// Hand the modified profile back for the put. Fails when `pid` is not
    /// the active modifier or its window already lapsed; blocks until the
    /// put outcome is known otherwise.
    pub fn ready_to_put(&self, profile: UserProfile, pid: ProcessId) -> Result<(), CoreError> {
        let entry = {
            let queues = self.shared.queues.lock();
            match queues.modifying.as_ref() {
                Some(entry) if entry.get.pid == pid => entry.clone(),
                _ => {
                    return Err(CoreError::PutFailed(
                        "Not allowed to put anymore".to_string(),
                    ))
                }
            }
        };

        // Claim the put slot atomically against the worker's timeout check.
        {
            let mut state = entry.put.lock();
            if state.aborted {
                return match state.result.as_ref() {
                    Some(Err(message)) => Err(CoreError::PutFailed(message.clone())),
                    _ => Err(CoreError::PutFailed(
                        "Not allowed to put anymore".to_string(),
                    )),
                };
            }
            state.profile = Some(profile);
            state.ready = true;
        }

        entry.wait_for_put()
    }

    /// Abort the modification window of `pid`, if it is the active modifier.
    pub fn abort_modification(&self, pid: ProcessId) {
        let queues = self.shared.queues.lock();
        if let Some(entry) = queues.modifying.as_ref() {
            if entry.get.pid == pid {
                entry.put.lock().aborted = true;
            }
        }
    }

    /// The user's default protection keys, fetched once and memoized.
    pub fn protection_keys(&self) -> Result<KeyPair, CoreError> {
        if let Some(keys) = self.shared.protection_keys.lock().clone() {
            return Ok(keys);
        }
        let pid = self.new_process_id();
        let profile = self.get_user_profile(pid, false)?;
        Ok(profile.protection_keys().clone())
    }

    /// Stop the queue worker. Pending and future requests fail; the manager
    /// is cold after this.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.queue_waiter.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("profile queue worker panicked");
            }
        }
    }
}

impl Drop for UserProfileManager {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.queue_waiter.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let work = {
            let mut queues = shared.queues.lock();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    break None;
                }
                if let Some(modifier) = queues.modify_queue.pop_front() {
                    // Replacing the previous modifier releases its slot.
                    queues.modifying = Some(modifier.clone());
                    break Some(Work::Modify(modifier));
                }
                if !queues.read_queue.is_empty() {
                    break Some(Work::Read);
                }
                shared.queue_waiter.wait(&mut queues);
            }
        };

        match work {
            None => break,
            Some(Work::Read) => {
                let fetched = fetch_profile(&shared);
                let readers: Vec<Arc<GetEntry>> = {
                    let mut queues = shared.queues.lock();
                    queues.read_queue.drain(..).collect()
                };
                debug!(
                    readers = readers.len(),
                    "publishing profile to read-only processes"
                );
                for reader in readers {
                    reader.publish(fetched.clone());
                }
            }
            Some(Work::Modify(modifier)) => {
                debug!(pid = modifier.get.pid, "process waits to modify the profile");
                let fetched = fetch_profile(&shared);

                // Readers enqueued meanwhile piggy-back on this round-trip.
                let readers: Vec<Arc<GetEntry>> = {
                    let mut queues = shared.queues.lock();
                    queues.read_queue.drain(..).collect()
                };
                modifier.get.publish(fetched.clone());
                for reader in readers {
                    reader.publish(fetched.clone());
                }

                // Bounded modification window, polled in ten slices.
                let slice = shared.max_modification_time / 10;
                for _ in 0..10 {
                    {
                        let state = modifier.put.lock();
                        if state.ready || state.aborted {
                            break;
                        }
                    }
                    std::thread::sleep(slice);
                }

                // Decide atomically against `ready_to_put`.
                let profile_to_put = {
                    let mut state = modifier.put.lock();
                    if state.ready {
                        state.profile.take()
                    } else if state.aborted {
                        None
                    } else {
                        state.aborted = true;
                        state.result = Some(Err(format!(
                            "Too long modification. Only {}ms are allowed.",
                            shared.max_modification_time.as_millis()
                        )));
                        warn!(
                            pid = modifier.get.pid,
                            "modification window lapsed, aborting the put"
                        );
                        None
                    }
                };

                if let Some(profile) = profile_to_put {
                    debug!(pid = modifier.get.pid, "uploading the modified profile");
                    let result = put_profile(&shared, &profile).map_err(|e| e.to_string());
                    modifier.finish(result);
                } else {
                    // Wake a waiter that lost the race, if any.
                    modifier.put_latch.notify_all();
                }
            }
        }
    }

    // Cold-fail everything still queued.
    let mut queues = shared.queues.lock();
    for reader in queues.read_queue.drain(..) {
        reader.publish(Err("profile queue worker stopped".to_string()));
    }
    for modifier in queues.modify_queue.drain(..) {
        modifier
            .get
            .publish(Err("profile queue worker stopped".to_string()));
        modifier.finish(Err("profile queue worker stopped".to_string()));
    }
    if let Some(modifier) = queues.modifying.take() {
        let mut state = modifier.put.lock();
        if state.result.is_none() {
            state.aborted = true;
            state.result = Some(Err("profile queue worker stopped".to_string()));
        }
        drop(state);
        modifier.put_latch.notify_all();
    }
    debug!("profile queue worker stopped");
}

/// One blocking get plus decryption.
fn fetch_profile(shared: &Shared) -> Result<UserProfile, String> {
    debug!("getting the user profile from the DHT");
    let params = Parameters::new(
        shared.credentials.profile_location_key(),
        content_keys::USER_PROFILE,
    );
    let record = shared
        .data_manager
        .get(&params)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "User profile not found".to_string())?;

    let encrypted = record
        .content
        .into_encrypted_profile()
        .map_err(|e| e.to_string())?;
    let key = shared
        .credentials
        .profile_encryption_key(shared.aes_key_bits)
        .map_err(|e| e.to_string())?;
    let plaintext = key
        .decrypt(&encrypted)
        .map_err(|_| "Cannot decrypt the user profile".to_string())?;
    let mut profile: UserProfile =
        serde_json::from_slice(&plaintext).map_err(|e| e.to_string())?;
    profile.set_version_info(record.version_key, record.based_on_key);

    // Memoize the protection keys for readers that need only them.
    let mut cached = shared.protection_keys.lock();
    if cached.is_none() {
        *cached = Some(profile.protection_keys().clone());
    }

    Ok(profile)
}

/// Encrypt the modified profile and put it, chaining the version keys.
fn put_profile(shared: &Shared, profile: &UserProfile) -> Result<(), CoreError> {
    debug!("encrypting the user profile with the password-derived key");
    let plaintext = serde_json::to_vec(profile)?;
    let key = shared
        .credentials
        .profile_encryption_key(shared.aes_key_bits)?;
    let encrypted = key.encrypt(&plaintext)?;

    let mut params = Parameters::new(
        shared.credentials.profile_location_key(),
        content_keys::USER_PROFILE,
    )
    .with_data(NetworkContent::EncryptedProfile(encrypted))
    .with_version_key(VersionKey::random())
    .with_protection_keys(profile.protection_keys().clone())
    .with_ttl(shared.profile_ttl);
    if let Some(based_on) = profile.version_key() {
        params = params.with_based_on(based_on);
    }

    shared.data_manager.put(&params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryDataManager;

    fn test_config() -> FileConfiguration {
        FileConfiguration {
            rsa_user_key_bits: 1024,
            rsa_file_key_bits: 1024,
            rsa_chunk_key_bits: 1024,
            ..FileConfiguration::default()
        }
    }

    fn store_profile(
        overlay: &MemoryDataManager,
        credentials: &UserCredentials,
    ) -> UserProfile {
        let user_keys = KeyPair::generate(1024).unwrap();
        let protection_keys = KeyPair::generate(1024).unwrap();
        let profile = UserProfile::new(credentials.user_id(), user_keys, protection_keys);

        let plaintext = serde_json::to_vec(&profile).unwrap();
        let key = credentials.profile_encryption_key(256).unwrap();
        let encrypted = key.encrypt(&plaintext).unwrap();
        let params = Parameters::new(
            credentials.profile_location_key(),
            content_keys::USER_PROFILE,
        )
        .with_data(NetworkContent::EncryptedProfile(encrypted))
        .with_version_key(VersionKey::random())
        .with_protection_keys(profile.protection_keys().clone());
        overlay.put(&params).unwrap();

        profile
    }

    #[test]
    fn test_get_missing_profile_fails() {
        let overlay = MemoryDataManager::new();
        let credentials = UserCredentials::new("alice", "pw", "1234");
        let manager = UserProfileManager::new(
            Arc::new(overlay),
            credentials,
            &test_config(),
            &TimeToLive::default(),
        )
        .unwrap();

        let pid = manager.new_process_id();
        let result = manager.get_user_profile(pid, false);
        assert!(matches!(result, Err(CoreError::GetFailed(_))));
        manager.stop();
    }

    #[test]
    fn test_read_returns_stored_profile() {
        let overlay = MemoryDataManager::new();
        let credentials = UserCredentials::new("alice", "pw", "1234");
        store_profile(&overlay, &credentials);

        let manager = UserProfileManager::new(
            Arc::new(overlay),
            credentials,
            &test_config(),
            &TimeToLive::default(),
        )
        .unwrap();

        let pid = manager.new_process_id();
        let profile = manager.get_user_profile(pid, false).unwrap();
        assert_eq!(profile.user_id(), "alice");
        assert!(profile.version_key().is_some());
        manager.stop();
    }

    #[test]
    fn test_modify_cycle_chains_version_keys() {
        let overlay = MemoryDataManager::new();
        let credentials = UserCredentials::new("alice", "pw", "1234");
        store_profile(&overlay, &credentials);

        let overlay = Arc::new(overlay);
        let manager = UserProfileManager::new(
            overlay.clone(),
            credentials.clone(),
            &test_config(),
            &TimeToLive::default(),
        )
        .unwrap();

        let pid = manager.new_process_id();
        let profile = manager.get_user_profile(pid, true).unwrap();
        let first_version = profile.version_key().unwrap();
        manager.ready_to_put(profile, pid).unwrap();

        // The stored record's based-on must equal the version we read.
        let record = overlay
            .get(&Parameters::new(
                credentials.profile_location_key(),
                content_keys::USER_PROFILE,
            ))
            .unwrap()
            .unwrap();
        assert_eq!(record.based_on_key, Some(first_version));
        assert_ne!(record.version_key, Some(first_version));
        manager.stop();
    }

    #[test]
    fn test_ready_to_put_from_stranger_pid_fails() {
        let overlay = MemoryDataManager::new();
        let credentials = UserCredentials::new("alice", "pw", "1234");
        let profile = store_profile(&overlay, &credentials);

        let manager = UserProfileManager::new(
            Arc::new(overlay),
            credentials,
            &test_config(),
            &TimeToLive::default(),
        )
        .unwrap();

        let result = manager.ready_to_put(profile, 999);
        assert!(matches!(result, Err(CoreError::PutFailed(_))));
        manager.stop();
    }

    #[test]
    fn test_protection_keys_are_memoized() {
        let overlay = MemoryDataManager::new();
        let credentials = UserCredentials::new("alice", "pw", "1234");
        store_profile(&overlay, &credentials);

        let overlay = Arc::new(overlay);
        let manager = UserProfileManager::new(
            overlay.clone(),
            credentials,
            &test_config(),
            &TimeToLive::default(),
        )
        .unwrap();

        let first = manager.protection_keys().unwrap();
        let gets_after_first = overlay.get_count();
        let second = manager.protection_keys().unwrap();

        assert_eq!(first, second);
        assert_eq!(overlay.get_count(), gets_after_first);
        manager.stop();
    }
}
