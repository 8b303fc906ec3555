//! Process-wide protocol knobs and per-connection configuration.

use std::time::Duration;

/// Maximum bytes pulled from the socket per read.
pub const CHUNK_SIZE: usize = 4096;

/// Tick used when polling the packet inbox for a response.
pub const POLL_TICK: Duration = Duration::from_millis(300);

/// Fixed delay between connection / reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Deadline for the key-exchange handshake on encrypted connections.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// First connection id of the accepted (server-side) range.
///
/// Client-initiated connectors use ids `0..ACCEPTED_ID_OFFSET`; connections
/// accepted by a server are numbered from the offset upward, so the two
/// populations never collide.
pub const ACCEPTED_ID_OFFSET: i32 = 30;

/// Per-connection engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Run the key-exchange handshake and encrypt all subsequent traffic.
    pub encrypted: bool,
    /// Execute inbound calls on freshly spawned worker tasks.
    ///
    /// Enabled on accepted connections; outbound connections execute inbound
    /// calls only reentrantly, while a local caller is waiting.
    pub auto_execute: bool,
    /// Reconnect with a fixed backoff when an outbound connection drops.
    ///
    /// Ignored on accepted connections, and disabled when `encrypted` is set
    /// (a dropped encrypted connection cannot silently resume its session).
    pub auto_reconnect: bool,
    /// Default per-call timeout; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { encrypted: false, auto_execute: false, auto_reconnect: true, call_timeout: None }
    }
}

impl EngineConfig {
    /// Configuration for an accepted (server-side) connection.
    #[must_use]
    pub fn accepted(encrypted: bool) -> Self {
        Self { encrypted, auto_execute: true, auto_reconnect: false, call_timeout: None }
    }

    /// Configuration for an outbound (client-side) connection.
    #[must_use]
    pub fn outbound(encrypted: bool) -> Self {
        Self { encrypted, auto_execute: false, auto_reconnect: !encrypted, call_timeout: None }
    }
}
