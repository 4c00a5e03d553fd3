//! Wire protocol for inter-terminal state sync.
//!
//! Every synchronized value travels between terminals as a JSON [`Envelope`]
//! published on a topic derived from its logical state key. The envelope is
//! camelCase on the wire, matching the payload shapes the register and
//! kitchen display frontends exchange.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic namespace for all state-sync traffic.
pub const TOPIC_PREFIX: &str = "tillsync/v1";

/// Derive the transport topic for a logical state key.
///
/// At most one topic (and one durable-storage slot) exists per key.
pub fn topic_for_key(key: &str) -> String {
    format!("{TOPIC_PREFIX}/{key}")
}

/// Unit transmitted over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Identity of the originating client instance. Inbound envelopes whose
    /// sender matches the local identity are discarded (echo suppression).
    pub sender_id: String,
    /// The opaque synchronized value.
    pub data: Value,
    /// Send time in ms since epoch. Informational only; never consulted for
    /// conflict resolution.
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(sender_id: &str, data: Value) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

/// Connection lifecycle state for the transport layer.
///
/// Exactly one status is active at a time; transitions are driven solely by
/// transport lifecycle events, never by application logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Connected and subscribed; state flows both ways.
    Syncing,
    Reconnecting,
    Offline,
    /// The broker rejected the credentials. Terminal until a new `connect()`.
    NotAuthorized,
    Error,
}

impl ConnectionStatus {
    /// Authorization failures stop the retry loop.
    pub fn is_fatal(self) -> bool {
        matches!(self, ConnectionStatus::NotAuthorized)
    }
}
