//! Creating a new user in the network.

use crate::config::{FileConfiguration, TimeToLive};
use crate::model::credentials::UserCredentials;
use crate::model::locations::Locations;
use crate::model::profile::UserProfile;
use crate::network::content::{content_keys, NetworkContent};
use crate::network::data_manager::DataManager;
use crate::network::parameters::{Parameters, VersionKey};
use meshvault_crypto::{location_key, KeyPair};
use meshvault_process::{
    CancelToken, ProcessStep, RollbackReason, SequentialProcess, StepError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

// Session-independent: registration happens before any login.
struct RegisterContext {
    profile: Option<UserProfile>,
}

/// Build the register pipeline: verify the user id is free, create the
/// profile with fresh keys, publish public key, locations and the encrypted
/// profile.
pub fn register_process(
    data_manager: Arc<dyn DataManager>,
    credentials: UserCredentials,
    config: &FileConfiguration,
    ttl: &TimeToLive,
) -> SequentialProcess {
    let context = Arc::new(Mutex::new(RegisterContext { profile: None }));

    let mut process = SequentialProcess::new("register");
    process
        .add_step(CheckUserExistsStep {
            data_manager: data_manager.clone(),
            credentials: credentials.clone(),
        })
        .add_step(CreateProfileStep {
            credentials: credentials.clone(),
            user_key_bits: config.rsa_user_key_bits,
            context: context.clone(),
        })
        .add_step(PutPublicKeyStep {
            data_manager: data_manager.clone(),
            credentials: credentials.clone(),
            ttl: ttl.clone(),
            context: context.clone(),
        })
        .add_step(PutLocationsStep {
            data_manager: data_manager.clone(),
            credentials: credentials.clone(),
            ttl: ttl.clone(),
            context: context.clone(),
        })
        .add_step(PutProfileStep {
            data_manager,
            credentials,
            aes_key_bits: config.aes_key_bits,
            ttl: ttl.clone(),
            context,
        });
    process
}

struct CheckUserExistsStep {
    data_manager: Arc<dyn DataManager>,
    credentials: UserCredentials,
}

impl ProcessStep for CheckUserExistsStep {
    fn name(&self) -> &str {
        "check user exists"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let params = Parameters::new(
            self.credentials.profile_location_key(),
            content_keys::USER_PROFILE,
        );
        let existing = self
            .data_manager
            .get(&params)
            .map_err(|e| StepError::with_source("cannot check for an existing profile", e))?;
        if existing.is_some() {
            return Err(StepError::new(format!(
                "user '{}' is already registered",
                self.credentials.user_id()
            )));
        }
        Ok(())
    }
}

struct CreateProfileStep {
    credentials: UserCredentials,
    user_key_bits: usize,
    context: Arc<Mutex<RegisterContext>>,
}

impl ProcessStep for CreateProfileStep {
    fn name(&self) -> &str {
        "create profile"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let user_keys = KeyPair::generate(self.user_key_bits)
            .map_err(|e| StepError::with_source("user key generation failed", e))?;
        let protection_keys = KeyPair::generate(self.user_key_bits)
            .map_err(|e| StepError::with_source("protection key generation failed", e))?;
        let profile = UserProfile::new(self.credentials.user_id(), user_keys, protection_keys);
        self.context.lock().profile = Some(profile);
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        self.context.lock().profile = None;
    }
}

struct PutPublicKeyStep {
    data_manager: Arc<dyn DataManager>,
    credentials: UserCredentials,
    ttl: TimeToLive,
    context: Arc<Mutex<RegisterContext>>,
}

impl PutPublicKeyStep {
    fn params(&self) -> Parameters {
        Parameters::new(
            location_key(self.credentials.user_id().as_bytes()),
            content_keys::USER_PUBLIC_KEY,
        )
    }
}

impl ProcessStep for PutPublicKeyStep {
    fn name(&self) -> &str {
        "put public key"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (public_key, protection) = {
            let ctx = self.context.lock();
            let profile = ctx
                .profile
                .as_ref()
                .ok_or_else(|| StepError::new("profile missing"))?;
            (
                profile.user_keys().public().clone(),
                profile.protection_keys().clone(),
            )
        };
        let params = self
            .params()
            .with_data(NetworkContent::UserPublicKey(public_key))
            .with_protection_keys(protection)
            .with_ttl(self.ttl.user_public_key);
        self.data_manager
            .put(&params)
            .map_err(|e| StepError::with_source("cannot publish public key", e))
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let protection = self
            .context
            .lock()
            .profile
            .as_ref()
            .map(|p| p.protection_keys().clone());
        if let Some(protection) = protection {
            let params = self.params().with_protection_keys(protection);
            if let Err(e) = self.data_manager.remove(&params) {
                warn!(error = %e, "could not remove public key during rollback");
            }
        }
    }
}

struct PutLocationsStep {
    data_manager: Arc<dyn DataManager>,
    credentials: UserCredentials,
    ttl: TimeToLive,
    context: Arc<Mutex<RegisterContext>>,
}

impl PutLocationsStep {
    fn params(&self) -> Parameters {
        Parameters::new(
            location_key(self.credentials.user_id().as_bytes()),
            content_keys::LOCATIONS,
        )
    }
}

impl ProcessStep for PutLocationsStep {
    fn name(&self) -> &str {
        "put locations"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let protection = {
            let ctx = self.context.lock();
            ctx.profile
                .as_ref()
                .map(|p| p.protection_keys().clone())
                .ok_or_else(|| StepError::new("profile missing"))?
        };
        let locations = Locations::new(self.credentials.user_id());
        let params = self
            .params()
            .with_data(NetworkContent::Locations(locations))
            .with_protection_keys(protection)
            .with_ttl(self.ttl.locations);
        self.data_manager
            .put(&params)
            .map_err(|e| StepError::with_source("cannot store locations", e))
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let protection = self
            .context
            .lock()
            .profile
            .as_ref()
            .map(|p| p.protection_keys().clone());
        if let Some(protection) = protection {
            let params = self.params().with_protection_keys(protection);
            if let Err(e) = self.data_manager.remove(&params) {
                warn!(error = %e, "could not remove locations during rollback");
            }
        }
    }
}

struct PutProfileStep {
    data_manager: Arc<dyn DataManager>,
    credentials: UserCredentials,
    aes_key_bits: u32,
    ttl: TimeToLive,
    context: Arc<Mutex<RegisterContext>>,
}

impl ProcessStep for PutProfileStep {
    fn name(&self) -> &str {
        "put profile"
    }

    fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
        let (profile, protection) = {
            let ctx = self.context.lock();
            let profile = ctx
                .profile
                .as_ref()
                .ok_or_else(|| StepError::new("profile missing"))?;
            (profile.clone(), profile.protection_keys().clone())
        };

        let plaintext = serde_json::to_vec(&profile)
            .map_err(|e| StepError::with_source("cannot serialize profile", e))?;
        let key = self
            .credentials
            .profile_encryption_key(self.aes_key_bits)
            .map_err(|e| StepError::with_source("cannot derive profile key", e))?;
        let encrypted = key
            .encrypt(&plaintext)
            .map_err(|e| StepError::with_source("cannot encrypt profile", e))?;

        let params = Parameters::new(
            self.credentials.profile_location_key(),
            content_keys::USER_PROFILE,
        )
        .with_data(NetworkContent::EncryptedProfile(encrypted))
        .with_version_key(VersionKey::random())
        .with_protection_keys(protection)
        .with_ttl(self.ttl.user_profile);
        self.data_manager
            .put(&params)
            .map_err(|e| StepError::with_source("cannot store profile", e))?;

        info!(user = self.credentials.user_id(), "user registered");
        Ok(())
    }

    fn undo(&mut self, _reason: &RollbackReason) {
        let protection = self
            .context
            .lock()
            .profile
            .as_ref()
            .map(|p| p.protection_keys().clone());
        if let Some(protection) = protection {
            let params = Parameters::new(
                self.credentials.profile_location_key(),
                content_keys::USER_PROFILE,
            )
            .with_protection_keys(protection);
            if let Err(e) = self.data_manager.remove(&params) {
                warn!(error = %e, "could not remove profile during rollback");
            }
        }
    }
}
