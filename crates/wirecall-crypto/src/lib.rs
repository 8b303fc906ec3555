//! Wirecall cryptographic engine.
//!
//! Two building blocks, matching the two phases of an encrypted connection:
//!
//! - [`exchange`]: the RSA-OAEP key exchange. The connecting side generates
//!   an RSA-2048 key pair and publishes the public half as PEM; the
//!   accepting side seals a fresh session key under it.
//! - [`fernet`]: the symmetric layer used for all traffic after the
//!   handshake. Every write becomes one Fernet token: AES-128-CBC with
//!   PKCS7 padding, authenticated by HMAC-SHA-256, carrying a timestamp and
//!   a random IV, encoded as URL-safe base64.
//!
//! Key material is zeroized on drop. Token construction is split into a
//! pure core (explicit timestamp and IV) and thin conveniences that draw
//! from the system clock and thread RNG, so the token layout is testable
//! byte for byte.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
pub mod exchange;
pub mod fernet;

pub use error::{CryptoError, Result};
pub use exchange::ExchangeKeyPair;
pub use fernet::SessionKey;
