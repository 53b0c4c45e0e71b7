//! User credentials and the keys derived from them.

use crate::error::CoreError;
use meshvault_crypto::{location_key, LocationKey, SymmetricKey};

/// The credential triple identifying a user. The profile location key and the
/// profile encryption key are both derived deterministically from it, so any
/// client holding the credentials finds and opens the profile without a key
/// exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct UserCredentials {
    user_id: String,
    password: String,
    pin: String,
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserCredentials({})", self.user_id)
    }
}

impl UserCredentials {
    pub fn new(
        user_id: impl Into<String>,
        password: impl Into<String>,
        pin: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            pin: pin.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Location of the encrypted profile. Derived from the full credential
    /// triple, so the slot is not discoverable from the public user id.
    pub fn profile_location_key(&self) -> LocationKey {
        let seed = format!("{}:{}:{}", self.user_id, self.password, self.pin);
        location_key(seed.as_bytes())
    }

    /// Location of the user's public records (locations, public key, message
    /// queue). Derived from the user id alone so other users can address it.
    pub fn user_location_key(&self) -> LocationKey {
        location_key(self.user_id.as_bytes())
    }

    /// AES key opening the profile, derived from password and pin.
    pub fn profile_encryption_key(&self, key_bits: u32) -> Result<SymmetricKey, CoreError> {
        Ok(SymmetricKey::from_password(
            &self.password,
            &self.pin,
            key_bits,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_location_depends_on_all_credentials() {
        let a = UserCredentials::new("alice", "password", "1234");
        let b = UserCredentials::new("alice", "password", "4321");
        let c = UserCredentials::new("alice", "other", "1234");

        assert_ne!(a.profile_location_key(), b.profile_location_key());
        assert_ne!(a.profile_location_key(), c.profile_location_key());
        assert_eq!(a.user_location_key(), b.user_location_key());
    }

    #[test]
    fn test_profile_key_is_deterministic() {
        let creds = UserCredentials::new("alice", "password", "1234");
        let k1 = creds.profile_encryption_key(256).unwrap();
        let k2 = creds.profile_encryption_key(256).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }
}
