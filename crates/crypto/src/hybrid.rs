//! Hybrid encryption for DHT payloads.
//!
//! Meta files and chunks can be large, so they are encrypted with a fresh
//! AES-256-GCM key per payload and only that key is wrapped with RSA-OAEP
//! under the recipient public key. Whoever holds the matching private key
//! unwraps the AES key and opens the payload.

use crate::error::CryptoError;
use crate::keys::{KeyPair, PublicKey};
use crate::symmetric::SymmetricKey;
use rand_core::OsRng;
use rsa::Oaep;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// A hybrid-encrypted payload: RSA-wrapped AES key, nonce, AES-GCM ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridEncryptedContent {
    #[serde(with = "serde_bytes")]
    pub encrypted_key: Vec<u8>,
    pub nonce: [u8; 12],
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Encrypt a payload for the holder of `receiver`'s private key.
pub fn encrypt_hybrid(
    plaintext: &[u8],
    receiver: &PublicKey,
) -> Result<HybridEncryptedContent, CryptoError> {
    let payload_key = SymmetricKey::generate();
    let encrypted = payload_key.encrypt(plaintext)?;

    let encrypted_key = receiver
        .rsa()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), payload_key.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(format!("RSA-OAEP: {e}")))?;

    Ok(HybridEncryptedContent {
        encrypted_key,
        nonce: encrypted.nonce,
        ciphertext: encrypted.ciphertext,
    })
}

/// Decrypt a hybrid payload with the matching private key.
pub fn decrypt_hybrid(
    content: &HybridEncryptedContent,
    keys: &KeyPair,
) -> Result<Vec<u8>, CryptoError> {
    let key_bytes = keys
        .rsa_private()
        .decrypt(Oaep::new::<Sha256>(), &content.encrypted_key)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    if key_bytes.len() != 32 {
        return Err(CryptoError::DecryptionFailed);
    }
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&key_bytes);

    SymmetricKey::from_bytes(raw).decrypt(&crate::symmetric::AesEncryptedContent {
        nonce: content.nonce,
        ciphertext: content.ciphertext.clone(),
    })
}
