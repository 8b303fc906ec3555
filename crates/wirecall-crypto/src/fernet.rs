//! Fernet symmetric token construction.
//!
//! Token layout before base64:
//!
//! ```text
//! version:u8 = 0x80 | timestamp:u64 BE | iv:[u8;16] | AES-128-CBC/PKCS7 ciphertext | HMAC-SHA-256
//! ```
//!
//! The 32-byte session key splits into a 16-byte signing half and a 16-byte
//! encryption half. The whole token is URL-safe base64 with padding, so it
//! stays printable inside length-prefixed envelopes.
//!
//! # Invariants
//!
//! - The HMAC covers everything before it (version, timestamp, IV,
//!   ciphertext); any bit flip fails verification before unpadding runs.
//! - Timestamps are informational only: no TTL is enforced, because frames
//!   are consumed immediately by the connection that received them.

use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Token format version byte.
const TOKEN_VERSION: u8 = 0x80;
/// AES block / IV size.
const IV_LEN: usize = 16;
/// HMAC-SHA-256 tag size.
const MAC_LEN: usize = 32;
/// Raw session key size (signing half + encryption half).
const KEY_LEN: usize = 32;
/// Smallest possible decoded token: header + one padded block + tag.
const MIN_TOKEN_LEN: usize = 1 + 8 + IV_LEN + IV_LEN + MAC_LEN;

/// Symmetric session key for the post-handshake framing layer.
///
/// Wiped on drop; the encoded form (`encode`) is what crosses the wire
/// inside the RSA-OAEP envelope during the handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    signing: [u8; 16],
    encryption: [u8; 16],
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    /// Generate a fresh random session key.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let mut raw = [0u8; KEY_LEN];
        rng.fill_bytes(&mut raw);
        let key = Self::from_raw(&raw);
        raw.zeroize();
        key
    }

    fn from_raw(raw: &[u8; KEY_LEN]) -> Self {
        let mut signing = [0u8; 16];
        let mut encryption = [0u8; 16];
        signing.copy_from_slice(&raw[..16]);
        encryption.copy_from_slice(&raw[16..]);
        Self { signing, encryption }
    }

    /// URL-safe base64 form of the key, as exchanged during the handshake.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut raw = [0u8; KEY_LEN];
        raw[..16].copy_from_slice(&self.signing);
        raw[16..].copy_from_slice(&self.encryption);
        let encoded = URL_SAFE.encode(raw);
        raw.zeroize();
        encoded
    }

    /// Rebuild a key from its encoded form.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyFormat` if the input is not base64 of 32 bytes.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let raw = URL_SAFE
            .decode(encoded)
            .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
        let raw: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| CryptoError::KeyFormat("session key must be 32 bytes".to_string()))?;
        Ok(Self::from_raw(&raw))
    }

    /// Encrypt `plaintext` into a token using the system clock and RNG.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        self.encrypt_at(plaintext, timestamp, iv)
    }

    /// Encrypt with an explicit timestamp and IV (pure; used by tests).
    #[must_use]
    pub fn encrypt_at(&self, plaintext: &[u8], timestamp: u64, iv: [u8; IV_LEN]) -> Vec<u8> {
        let ciphertext = Aes128CbcEnc::new((&self.encryption).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut token = Vec::with_capacity(1 + 8 + IV_LEN + ciphertext.len() + MAC_LEN);
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let tag = self.mac(&token);
        token.extend_from_slice(&tag);

        URL_SAFE.encode(token).into_bytes()
    }

    /// Verify and decrypt a token.
    ///
    /// # Errors
    ///
    /// - `CryptoError::Token` on bad base64, wrong version, truncation,
    ///   MAC mismatch, or invalid padding. All are fatal to the connection
    ///   that produced the token.
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>> {
        let raw = URL_SAFE.decode(token).map_err(|_| CryptoError::Token("not base64"))?;

        if raw.len() < MIN_TOKEN_LEN {
            return Err(CryptoError::Token("too short"));
        }
        if raw[0] != TOKEN_VERSION {
            return Err(CryptoError::Token("bad version"));
        }

        let (signed, tag) = raw.split_at(raw.len() - MAC_LEN);
        let mut mac = self.mac_state();
        mac.update(signed);
        mac.verify_slice(tag).map_err(|_| CryptoError::Token("authentication failed"))?;

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&signed[9..9 + IV_LEN]);
        let ciphertext = &signed[9 + IV_LEN..];
        if ciphertext.len() % IV_LEN != 0 {
            return Err(CryptoError::Token("ragged ciphertext"));
        }

        Aes128CbcDec::new((&self.encryption).into(), (&iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Token("bad padding"))
    }

    /// Timestamp carried by a token, without decrypting it.
    ///
    /// # Errors
    ///
    /// - `CryptoError::Token` on bad base64 or truncation.
    pub fn token_timestamp(token: &[u8]) -> Result<u64> {
        let raw = URL_SAFE.decode(token).map_err(|_| CryptoError::Token("not base64"))?;
        if raw.len() < 9 {
            return Err(CryptoError::Token("too short"));
        }
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&raw[1..9]);
        Ok(u64::from_be_bytes(stamp))
    }

    fn mac_state(&self) -> HmacSha256 {
        let Ok(mac) = <HmacSha256 as Mac>::new_from_slice(&self.signing) else {
            unreachable!("HMAC accepts any key length");
        };
        mac
    }

    fn mac(&self, data: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = self.mac_state();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn test_key() -> SessionKey {
        SessionKey::from_raw(&[7u8; KEY_LEN])
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = SessionKey::generate(&mut rand::thread_rng());
        let token = key.encrypt(b"frame bytes");
        assert_eq!(key.decrypt(&token).unwrap(), b"frame bytes");
    }

    #[test]
    fn empty_plaintext_round_trip() {
        let key = test_key();
        let token = key.encrypt_at(b"", 0, [0u8; IV_LEN]);
        assert_eq!(key.decrypt(&token).unwrap(), b"");
    }

    #[test]
    fn token_layout_is_stable() {
        let key = test_key();
        let token = key.encrypt_at(b"abc", 1_700_000_000, [3u8; IV_LEN]);

        let raw = URL_SAFE.decode(&token).unwrap();
        assert_eq!(raw[0], TOKEN_VERSION);
        assert_eq!(u64::from_be_bytes(raw[1..9].try_into().unwrap()), 1_700_000_000);
        assert_eq!(&raw[9..25], &[3u8; IV_LEN]);
        // One padded block of ciphertext plus the tag.
        assert_eq!(raw.len(), 1 + 8 + IV_LEN + 16 + MAC_LEN);

        assert_eq!(SessionKey::token_timestamp(&token).unwrap(), 1_700_000_000);
    }

    #[test]
    fn tampered_token_rejected() {
        let key = test_key();
        let token = key.encrypt_at(b"payload", 1, [1u8; IV_LEN]);

        let mut raw = URL_SAFE.decode(&token).unwrap();
        raw[12] ^= 0x01;
        let tampered = URL_SAFE.encode(raw).into_bytes();

        assert_eq!(key.decrypt(&tampered), Err(CryptoError::Token("authentication failed")));
    }

    #[test]
    fn wrong_key_rejected() {
        let token = test_key().encrypt_at(b"payload", 1, [1u8; IV_LEN]);
        let other = SessionKey::from_raw(&[8u8; KEY_LEN]);
        assert_eq!(other.decrypt(&token), Err(CryptoError::Token("authentication failed")));
    }

    #[test]
    fn key_encoding_round_trip() {
        let key = SessionKey::generate(&mut rand::thread_rng());
        let decoded = SessionKey::decode(key.encode().as_bytes()).unwrap();
        assert_eq!(key.signing, decoded.signing);
        assert_eq!(key.encryption, decoded.encryption);
    }

    #[test]
    fn malformed_key_rejected() {
        assert!(SessionKey::decode(b"not base64 !!").is_err());
        assert!(SessionKey::decode(URL_SAFE.encode([1u8; 16]).as_bytes()).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_any_plaintext(
            plaintext in prop::collection::vec(any::<u8>(), 0..2048),
            timestamp in any::<u64>(),
            iv in any::<[u8; IV_LEN]>(),
        ) {
            let key = test_key();
            let token = key.encrypt_at(&plaintext, timestamp, iv);
            prop_assert_eq!(key.decrypt(&token).unwrap(), plaintext);
            prop_assert_eq!(SessionKey::token_timestamp(&token).unwrap(), timestamp);
        }
    }
}
