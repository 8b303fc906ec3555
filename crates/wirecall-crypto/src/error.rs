//! Error types for the crypto engine.

use thiserror::Error;

/// Result alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors from key exchange or symmetric token handling.
///
/// Token failures deliberately carry no detail beyond a coarse reason:
/// distinguishing padding errors from MAC errors hands an attacker an
/// oracle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key generation or asymmetric encryption/decryption failed.
    #[error("key exchange failure: {0}")]
    Exchange(String),

    /// Serialized key material did not parse.
    #[error("malformed key material: {0}")]
    KeyFormat(String),

    /// A symmetric token failed authentication or decryption.
    #[error("invalid token: {0}")]
    Token(&'static str),
}
