//! Symmetric encryption with keys derived from user credentials.
//!
//! Provides AES-256-GCM encryption and PBKDF2-HMAC-SHA256 key derivation.
//! The user profile is encrypted with a key derived from password and pin,
//! so any client holding the credentials can open it without a key exchange.

use crate::error::CryptoError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// PBKDF2 round count for password-derived keys. Part of the wire contract:
/// all clients of a user must derive the identical profile key.
pub const PBKDF2_ITERATIONS: u32 = 65_536;

/// An AES-256-GCM encrypted payload together with its nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesEncryptedContent {
    pub nonce: [u8; 12],
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// AES-256-GCM symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey(..)")
    }
}

impl SymmetricKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive a key from password and pin. The pin acts as the salt, so the
    /// derivation is deterministic per credential set.
    pub fn from_password(password: &str, pin: &str, key_bits: u32) -> Result<Self, CryptoError> {
        if key_bits != 256 {
            return Err(CryptoError::UnsupportedKeyLength(key_bits));
        }
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            pin.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Ok(Self(key))
    }

    /// Encrypt data under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<AesEncryptedContent, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("AES-GCM".to_string()))?;

        Ok(AesEncryptedContent { nonce, ciphertext })
    }

    /// Decrypt a payload. Fails on a wrong key or tampered ciphertext.
    pub fn decrypt(&self, content: &AesEncryptedContent) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .decrypt(
                Nonce::from_slice(&content.nonce),
                content.ciphertext.as_slice(),
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::generate();
        let plaintext = b"profile payload";

        let encrypted = key.encrypt(plaintext).unwrap();
        let decrypted = key.decrypt(&encrypted).unwrap();

        assert_eq!(plaintext, &decrypted[..]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = SymmetricKey::generate();
        let other = SymmetricKey::generate();

        let encrypted = key.encrypt(b"secret").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_password_derivation_deterministic() {
        let a = SymmetricKey::from_password("password", "1234", 256).unwrap();
        let b = SymmetricKey::from_password("password", "1234", 256).unwrap();
        let c = SymmetricKey::from_password("password", "4321", 256).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_unsupported_key_length_rejected() {
        assert!(matches!(
            SymmetricKey::from_password("password", "1234", 128),
            Err(CryptoError::UnsupportedKeyLength(128))
        ));
    }
}
