//! Key-exchange driver for encrypted connections.
//!
//! Runs immediately after TCP connect/accept, before any application
//! traffic. Both sides reserve exactly two correlation slots, so the two
//! handshake frames consume ids `1` then `0` and application calls start at
//! `2` on either end.
//!
//! ```text
//! initiator (dialer)                      acceptor (listener)
//! ------------------                      -------------------
//! reserve 2 slots                         reserve 2 slots
//! generate RSA-2048
//! DataReturn{public_key: PEM}  ───────▶   unseal target
//!                                         generate session key
//!              ◀─────── DataReturn{communication_key: base64(OAEP(key))}
//! unseal + install key                    install key
//! ```
//!
//! From the installation point on, every byte in both directions is a
//! Fernet envelope under the shared session key. Neither side initiates
//! other traffic between its handshake frame and installation, so the
//! plaintext/ciphertext boundary is never ambiguous.

use wirecall_crypto::{ExchangeKeyPair, SessionKey, exchange};
use wirecall_proto::{DataReturn, Packet, PacketBody, Value};

use crate::{
    config::HANDSHAKE_TIMEOUT,
    engine::{Connection, lock},
    error::{Result, RpcError},
};

/// Handshake field carrying the initiator's PEM public key.
const PUBLIC_KEY_FIELD: &str = "public_key";
/// Handshake field carrying the sealed session key.
const COMMUNICATION_KEY_FIELD: &str = "communication_key";

impl Connection {
    /// Run the dialing side of the key exchange.
    ///
    /// # Errors
    ///
    /// - `RpcError::Handshake` on any crypto failure, malformed handshake
    ///   frame, or handshake timeout. The connection must be closed.
    pub async fn exchange_keys_as_initiator(&self) -> Result<()> {
        lock(&self.inner.correlation).reserve_slots(2);

        let pair = ExchangeKeyPair::generate(&mut rand::thread_rng())?;
        let hello = Packet::data_return(DataReturn::with_field(
            PUBLIC_KEY_FIELD,
            Value::Str(pair.public_key_pem().to_string()),
        ));
        self.inner.send_packet(&hello).await?;

        let fields = self.wait_for_handshake_frame().await?;
        let Some(Value::Str(sealed)) = fields.get(COMMUNICATION_KEY_FIELD) else {
            return Err(RpcError::Handshake("peer sent no communication key".to_string()));
        };

        let raw = pair.unseal_encoded(sealed)?;
        let key = SessionKey::decode(&raw)?;
        self.install_session_key(key);

        tracing::info!(connection = self.id(), "encrypted session established (initiator)");
        Ok(())
    }

    /// Run the accepting side of the key exchange.
    ///
    /// # Errors
    ///
    /// - See [`Connection::exchange_keys_as_initiator`].
    pub async fn exchange_keys_as_acceptor(&self) -> Result<()> {
        lock(&self.inner.correlation).reserve_slots(2);

        let fields = self.wait_for_handshake_frame().await?;
        let Some(Value::Str(peer_pem)) = fields.get(PUBLIC_KEY_FIELD) else {
            return Err(RpcError::Handshake("peer sent no public key".to_string()));
        };

        let (key, sealed) = {
            let mut rng = rand::thread_rng();
            let key = SessionKey::generate(&mut rng);
            let sealed = exchange::seal_encoded(&mut rng, peer_pem, key.encode().as_bytes())?;
            (key, sealed)
        };

        let reply = Packet::data_return(DataReturn::with_field(
            COMMUNICATION_KEY_FIELD,
            Value::Str(sealed),
        ));
        self.inner.send_packet(&reply).await?;
        self.install_session_key(key);

        tracing::info!(connection = self.id(), "encrypted session established (acceptor)");
        Ok(())
    }

    /// Wait for the peer's handshake `DataReturn` and return its fields.
    async fn wait_for_handshake_frame(
        &self,
    ) -> Result<std::collections::BTreeMap<String, Value>> {
        let expected = lock(&self.inner.correlation).top().unwrap_or(-1);

        let frame = self
            .wait_for_packet(expected, Some(HANDSHAKE_TIMEOUT))
            .await
            .map_err(|err| match err {
                RpcError::Timeout { elapsed } => RpcError::Handshake(format!(
                    "no handshake frame within {elapsed:?}"
                )),
                other => other,
            })?;

        match frame.body {
            PacketBody::DataReturn(data) => Ok(data.fields),
            _ => Err(RpcError::Handshake("unexpected frame during key exchange".to_string())),
        }
    }
}
