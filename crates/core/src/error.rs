//! Core errors.

use meshvault_crypto::CryptoError;
use thiserror::Error;

/// Errors surfaced by the core engine and the overlay façade.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Absence, decrypt failure or transport error on a read.
    #[error("Get failed: {0}")]
    GetFailed(String),

    /// Stale version chain, protection mismatch, encrypt failure, transport
    /// error on a write, or a lapsed modification window.
    #[error("Put failed: {0}")]
    PutFailed(String),

    #[error("Remove failed: {0}")]
    RemoveFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The overlay is not joined.
    #[error("No peer connection")]
    NoPeerConnection,

    /// No user is logged in on this peer.
    #[error("No session")]
    NoSession,

    /// Path outside the root, or not a file / not a directory.
    #[error("Illegal file location: {0}")]
    IllegalFileLocation(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
