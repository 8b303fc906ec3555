//! RSA-OAEP session key exchange.
//!
//! The connecting peer generates an RSA-2048 key pair (public exponent
//! 65537) and sends the public half as PEM-encoded SubjectPublicKeyInfo.
//! The accepting peer seals its freshly generated session key under that
//! key with OAEP (MGF1 + SHA-256, SHA-256 digest, no label) and sends the
//! ciphertext back. Only the holder of the private key can recover it.
//!
//! The private key never leaves this type and is zeroized on drop by the
//! underlying implementation.

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use rand::{CryptoRng, RngCore};
use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding},
};
use sha2::Sha256;

use crate::error::{CryptoError, Result};

/// RSA modulus size for the exchange.
const RSA_BITS: usize = 2048;

/// The connecting peer's half of the key exchange.
pub struct ExchangeKeyPair {
    private: RsaPrivateKey,
    public_pem: String,
}

impl std::fmt::Debug for ExchangeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExchangeKeyPair(..)")
    }
}

impl ExchangeKeyPair {
    /// Generate a fresh RSA-2048 key pair.
    ///
    /// # Errors
    ///
    /// - `CryptoError::Exchange` if key generation or PEM serialization
    ///   fails.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Result<Self> {
        let private = RsaPrivateKey::new(rng, RSA_BITS)
            .map_err(|e| CryptoError::Exchange(e.to_string()))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Exchange(e.to_string()))?;
        Ok(Self { private, public_pem })
    }

    /// PEM-encoded SubjectPublicKeyInfo of the public half.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Recover a session key sealed by the peer with [`seal`].
    ///
    /// # Errors
    ///
    /// - `CryptoError::Exchange` if OAEP decryption fails (wrong key pair or
    ///   corrupted ciphertext).
    pub fn unseal(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::Exchange(e.to_string()))
    }

    /// [`ExchangeKeyPair::unseal`] over base64 ciphertext.
    ///
    /// The handshake carries the sealed key inside a JSON map, which cannot
    /// hold raw bytes, so ciphertext crosses the wire base64-encoded.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyFormat` if the input is not base64.
    /// - `CryptoError::Exchange` if OAEP decryption fails.
    pub fn unseal_encoded(&self, encoded: &str) -> Result<Vec<u8>> {
        let ciphertext = URL_SAFE
            .decode(encoded)
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        self.unseal(&ciphertext)
    }
}

/// Seal `secret` under a peer's PEM-encoded public key.
///
/// # Errors
///
/// - `CryptoError::KeyFormat` if the PEM does not parse.
/// - `CryptoError::Exchange` if OAEP encryption fails (e.g. the secret is
///   too large for the modulus).
pub fn seal(
    rng: &mut (impl RngCore + CryptoRng),
    peer_public_pem: &str,
    secret: &[u8],
) -> Result<Vec<u8>> {
    let public = RsaPublicKey::from_public_key_pem(peer_public_pem)
        .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
    public
        .encrypt(rng, Oaep::new::<Sha256>(), secret)
        .map_err(|e| CryptoError::Exchange(e.to_string()))
}

/// [`seal`] with base64 output, for transport inside a JSON map.
///
/// # Errors
///
/// - See [`seal`].
pub fn seal_encoded(
    rng: &mut (impl RngCore + CryptoRng),
    peer_public_pem: &str,
    secret: &[u8],
) -> Result<String> {
    seal(rng, peer_public_pem, secret).map(|ciphertext| URL_SAFE.encode(ciphertext))
}
