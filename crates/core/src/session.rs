//! The logged-in session and the peer-facing client façade.

use crate::config::{FileConfiguration, TimeToLive};
use crate::error::CoreError;
use crate::model::credentials::UserCredentials;
use crate::network::content::content_keys;
use crate::network::data_manager::DataManager;
use crate::network::messages::PeerAddress;
use crate::network::parameters::Parameters;
use crate::notify::QueueMessageHandler;
use crate::processes;
use crate::processes::recover::VersionSelector;
use crate::profile_manager::UserProfileManager;
use meshvault_crypto::{location_key, PublicKey};
use meshvault_process::{execute_blocking, ProcessOutcome, WithResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Memoized `user id → public key` map, persisted in the sidecar and
/// consulted before a DHT lookup.
pub struct PublicKeyCache {
    keys: Mutex<BTreeMap<String, PublicKey>>,
}

impl PublicKeyCache {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn preload(&self, keys: BTreeMap<String, PublicKey>) {
        self.keys.lock().extend(keys);
    }

    pub fn get(&self, user_id: &str) -> Option<PublicKey> {
        self.keys.lock().get(user_id).cloned()
    }

    pub fn insert(&self, user_id: impl Into<String>, key: PublicKey) {
        self.keys.lock().insert(user_id.into(), key);
    }

    pub fn snapshot(&self) -> BTreeMap<String, PublicKey> {
        self.keys.lock().clone()
    }
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a logged-in peer holds for one user.
pub struct Session {
    credentials: UserCredentials,
    profile_manager: Arc<UserProfileManager>,
    data_manager: Arc<dyn DataManager>,
    config: FileConfiguration,
    ttl: TimeToLive,
    root: PathBuf,
    address: PeerAddress,
    key_cache: PublicKeyCache,
}

impl Session {
    pub fn new(
        credentials: UserCredentials,
        profile_manager: Arc<UserProfileManager>,
        data_manager: Arc<dyn DataManager>,
        config: FileConfiguration,
        ttl: TimeToLive,
        root: PathBuf,
        address: PeerAddress,
    ) -> Self {
        Self {
            credentials,
            profile_manager,
            data_manager,
            config,
            ttl,
            root,
            address,
            key_cache: PublicKeyCache::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        self.credentials.user_id()
    }

    pub fn credentials(&self) -> &UserCredentials {
        &self.credentials
    }

    pub fn profile_manager(&self) -> &Arc<UserProfileManager> {
        &self.profile_manager
    }

    pub fn data_manager(&self) -> &Arc<dyn DataManager> {
        &self.data_manager
    }

    pub fn config(&self) -> &FileConfiguration {
        &self.config
    }

    pub fn ttl(&self) -> &TimeToLive {
        &self.ttl
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn key_cache(&self) -> &PublicKeyCache {
        &self.key_cache
    }

    /// Resolve a user's public key through the cache, falling back to the
    /// DHT record published at registration.
    pub fn public_key(&self, user_id: &str) -> Result<PublicKey, CoreError> {
        if let Some(key) = self.key_cache.get(user_id) {
            return Ok(key);
        }
        let params = Parameters::new(
            location_key(user_id.as_bytes()),
            content_keys::USER_PUBLIC_KEY,
        );
        let record = self
            .data_manager
            .get(&params)?
            .ok_or_else(|| CoreError::GetFailed(format!("no public key for user '{user_id}'")))?;
        let key = record.content.into_user_public_key()?;
        self.key_cache.insert(user_id, key.clone());
        Ok(key)
    }
}

/// One peer's client: owns the overlay handle and at most one session, and
/// exposes the high-level operations as blocking process executions.
pub struct Client {
    data_manager: Arc<dyn DataManager>,
    address: PeerAddress,
    config: FileConfiguration,
    ttl: TimeToLive,
    session: Mutex<Option<Arc<Session>>>,
}

impl Client {
    pub fn new(
        data_manager: Arc<dyn DataManager>,
        address: PeerAddress,
        config: FileConfiguration,
        ttl: TimeToLive,
    ) -> Self {
        Self {
            data_manager,
            address,
            config,
            ttl,
            session: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// The active session, or `NoSession`.
    pub fn session(&self) -> Result<Arc<Session>, CoreError> {
        self.session.lock().clone().ok_or(CoreError::NoSession)
    }

    /// Create the user: profile, public key and locations records.
    pub fn register(&self, credentials: &UserCredentials) -> Result<ProcessOutcome, CoreError> {
        let mut process = processes::register::register_process(
            self.data_manager.clone(),
            credentials.clone(),
            &self.config,
            &self.ttl,
        );
        Ok(execute_blocking(&mut process))
    }

    /// Open a session: fetch the profile, register this peer in the
    /// locations and reconcile offline changes from the sidecar.
    pub fn login(
        &self,
        credentials: &UserCredentials,
        root: impl Into<PathBuf>,
    ) -> Result<ProcessOutcome, CoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let profile_manager = Arc::new(UserProfileManager::new(
            self.data_manager.clone(),
            credentials.clone(),
            &self.config,
            &self.ttl,
        )?);
        let session = Arc::new(Session::new(
            credentials.clone(),
            profile_manager,
            self.data_manager.clone(),
            self.config.clone(),
            self.ttl.clone(),
            root,
            self.address.clone(),
        ));

        let mut process = processes::login::login_process(session.clone());
        let outcome = execute_blocking(&mut process);

        if outcome.is_succeeded() {
            self.data_manager.register_receiver(
                &self.address,
                Arc::new(QueueMessageHandler::new(session.clone())),
            );
            *self.session.lock() = Some(session.clone());
            info!(user = session.user_id(), peer = %self.address, "logged in");
        } else {
            session.profile_manager().stop();
        }
        Ok(outcome)
    }

    /// Close the session: write the sidecar, leave the locations, stop the
    /// profile queue worker.
    pub fn logout(&self) -> Result<ProcessOutcome, CoreError> {
        let session = self.session()?;
        let mut process = processes::logout::logout_process(session.clone());
        let outcome = execute_blocking(&mut process);

        self.data_manager.unregister_receiver(&self.address);
        session.profile_manager().stop();
        *self.session.lock() = None;
        info!(user = session.user_id(), peer = %self.address, "logged out");
        Ok(outcome)
    }

    /// Add a file or folder under the root to the network.
    pub fn add_file(&self, path: impl Into<PathBuf>) -> Result<ProcessOutcome, CoreError> {
        let session = self.session()?;
        let mut process = processes::add::add_file_process(session, path.into());
        Ok(execute_blocking(&mut process))
    }

    /// Upload a new version of an existing file.
    pub fn update_file(&self, path: impl Into<PathBuf>) -> Result<ProcessOutcome, CoreError> {
        let session = self.session()?;
        let mut process = processes::update::update_file_process(session, path.into());
        Ok(execute_blocking(&mut process))
    }

    /// Remove a file (or empty folder) from the network.
    pub fn delete_file(&self, path: impl Into<PathBuf>) -> Result<ProcessOutcome, CoreError> {
        let session = self.session()?;
        let mut process = processes::delete::delete_file_process(session, path.into());
        Ok(execute_blocking(&mut process))
    }

    /// Move or rename a file within the root.
    pub fn move_file(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<ProcessOutcome, CoreError> {
        let session = self.session()?;
        let mut process =
            processes::relocate::move_file_process(session, source.into(), destination.into());
        Ok(execute_blocking(&mut process))
    }

    /// Share a folder with another user.
    pub fn share_folder(
        &self,
        path: impl Into<PathBuf>,
        friend_id: &str,
        permission: crate::model::tree::PermissionType,
    ) -> Result<ProcessOutcome, CoreError> {
        let session = self.session()?;
        let mut process = processes::share::share_folder_process(
            session,
            path.into(),
            friend_id.to_string(),
            permission,
        );
        Ok(execute_blocking(&mut process))
    }

    /// Download the newest version of a file into the root.
    pub fn download_file(&self, path: impl Into<PathBuf>) -> Result<ProcessOutcome, CoreError> {
        let session = self.session()?;
        let mut process = processes::download::download_file_process(session, path.into());
        Ok(execute_blocking(&mut process))
    }

    /// Restore an old version next to the current file. Returns the path of
    /// the recovered copy on success.
    pub fn recover_file(
        &self,
        path: impl Into<PathBuf>,
        selector: Arc<dyn VersionSelector>,
    ) -> Result<(ProcessOutcome, Option<PathBuf>), CoreError> {
        let session = self.session()?;
        let mut process: WithResult<PathBuf> =
            processes::recover::recover_file_process(session, path.into(), selector);
        let outcome = execute_blocking(&mut process);
        let recovered = process.take_result();
        Ok((outcome, recovered))
    }
}
