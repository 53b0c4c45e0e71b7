//! RSA key management.
//!
//! Every index node, meta file and user carries an RSA keypair: the public
//! half is the stable identity (and DHT addressing seed), the private half
//! decrypts hybrid envelopes and authorizes protected writes. Keys are
//! serialized as PKCS#8/SPKI DER so they survive the JSON wire format.

use crate::error::CryptoError;
use crate::hashes::{location_key, LocationKey};
use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// RSA public key, the stable identity of users and index nodes.
#[derive(Clone)]
pub struct PublicKey {
    key: RsaPublicKey,
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PublicKey {}

impl PublicKey {
    /// Access the raw RSA key.
    pub fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }

    /// SPKI DER encoding of the key.
    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .key
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Parse from SPKI DER bytes.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// SHA-256 over the DER encoding. Used as the DHT addressing seed and as
    /// the protection-key ownership tag.
    pub fn fingerprint(&self) -> Result<LocationKey, CryptoError> {
        Ok(location_key(&self.to_der()?))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.fingerprint() {
            Ok(fp) => write!(f, "PublicKey({})", hex::encode(&fp[..4])),
            Err(_) => write!(f, "PublicKey(invalid)"),
        }
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let der = self.to_der().map_err(S::Error::custom)?;
        serde_bytes::serialize(der.as_slice(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: serde_bytes::ByteBuf = serde_bytes::deserialize(deserializer)?;
        Self::from_der(&bytes).map_err(D::Error::custom)
    }
}

/// RSA keypair. Serializes as the PKCS#8 private key; the public half is
/// recomputed on load.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: PublicKey,
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        // DER comparison sidesteps key-component normalization differences.
        self.to_der().ok() == other.to_der().ok()
    }
}

impl Eq for KeyPair {}

impl KeyPair {
    /// Generate a fresh keypair with the given modulus size.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
        let public = PublicKey {
            key: RsaPublicKey::from(&private),
        };
        Ok(Self { private, public })
    }

    /// The public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Access the raw private key.
    pub fn rsa_private(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Fingerprint of the public half.
    pub fn fingerprint(&self) -> Result<LocationKey, CryptoError> {
        self.public.fingerprint()
    }

    /// PKCS#8 DER encoding of the private key.
    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Parse from PKCS#8 DER bytes.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let public = PublicKey {
            key: RsaPublicKey::from(&private),
        };
        Ok(Self { private, public })
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.fingerprint() {
            Ok(fp) => write!(f, "KeyPair({})", hex::encode(&fp[..4])),
            Err(_) => write!(f, "KeyPair(invalid)"),
        }
    }
}

impl Serialize for KeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let der = self.to_der().map_err(S::Error::custom)?;
        serde_bytes::serialize(der.as_slice(), serializer)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: serde_bytes::ByteBuf = serde_bytes::deserialize(deserializer)?;
        Self::from_der(&bytes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
pub mod test_keys {
    use super::*;

    /// Small modulus keeps test key generation fast; real deployments use the
    /// sizes from the file configuration.
    pub const TEST_KEY_BITS: usize = 1024;

    pub fn generate() -> KeyPair {
        KeyPair::generate(TEST_KEY_BITS).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys;
    use super::*;

    #[test]
    fn test_keypair_der_roundtrip() {
        let pair = test_keys::generate();
        let der = pair.to_der().unwrap();
        let restored = KeyPair::from_der(&der).unwrap();

        assert_eq!(pair, restored);
        assert_eq!(pair.fingerprint().unwrap(), restored.fingerprint().unwrap());
    }

    #[test]
    fn test_public_key_der_roundtrip() {
        let pair = test_keys::generate();
        let der = pair.public().to_der().unwrap();
        let restored = PublicKey::from_der(&der).unwrap();

        assert_eq!(pair.public(), &restored);
    }

    #[test]
    fn test_fingerprints_are_distinct() {
        let a = test_keys::generate();
        let b = test_keys::generate();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_serde_roundtrip() {
        let pair = test_keys::generate();
        let json = serde_json::to_vec(&pair).unwrap();
        let restored: KeyPair = serde_json::from_slice(&json).unwrap();
        assert_eq!(pair, restored);
    }
}
