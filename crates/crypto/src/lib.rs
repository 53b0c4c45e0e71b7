//! meshvault cryptographic primitives
//!
//! This crate provides the cryptographic building blocks for meshvault.
//! It includes content digests, password-based symmetric encryption, RSA key
//! management and the hybrid (RSA + AES) envelope used for DHT payloads.
//!
//! ## Modules
//! - `hashes`: MD5 content digests (wire contract) and DHT location keys
//! - `symmetric`: AES-256-GCM with keys derived from user credentials
//! - `keys`: RSA keypair generation, DER serialization and fingerprints
//! - `hybrid`: per-payload AES key wrapped under a recipient RSA key

pub mod error;
pub mod hashes;
pub mod hybrid;
pub mod keys;
pub mod symmetric;

pub use error::CryptoError;
pub use hashes::{location_key, ContentDigest, LocationKey};
pub use hybrid::{decrypt_hybrid, encrypt_hybrid, HybridEncryptedContent};
pub use keys::{KeyPair, PublicKey};
pub use symmetric::{AesEncryptedContent, SymmetricKey};
