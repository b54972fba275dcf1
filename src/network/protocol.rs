//! Protocol Messages
//!
//! Wire format for host-client communication over the reliable ordered
//! data channel. All messages are JSON with a `type` discriminator so
//! phones and the host can be debugged with plain text dumps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::roster::{CosmeticProfile, PlayerId, ProfilePatch};

// =============================================================================
// CLIENT -> HOST MESSAGES
// =============================================================================

/// Messages sent from a phone client to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Identify (or re-identify after a drop) with a durable uuid.
    Hello {
        /// Client-generated durable identity string.
        uuid: String,
    },

    /// Latency probe reply; echoes the probe timestamp.
    Pong {
        /// Timestamp copied from the matching `PING`.
        ts: u64,
    },

    /// Gameplay input.
    Input {
        /// Action type, e.g. `PRESS`, `RELEASE`, `TOUCH`.
        action: String,
        /// Optional action data (touch coordinates and the like).
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// Self-service profile edit from the phone lobby.
    UpdateProfile {
        /// Cosmetic fields to change.
        payload: ProfilePatch,
    },

    /// High-level request the host application interprets.
    Command {
        /// Action name, e.g. `LEAVE`, `NEXT_ROUND`.
        action: String,
        /// Optional action data.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

// =============================================================================
// HOST -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the host to a phone client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Handshake probe sent on every new connection.
    WhoAreYou,

    /// Handshake confirmation carrying the bound identity.
    Init {
        /// Session-stable player id.
        player_id: PlayerId,
        /// Current cosmetics, so the phone mirrors itself immediately.
        profile: CosmeticProfile,
    },

    /// Latency probe.
    Ping {
        /// Host wall-clock timestamp (ms), echoed back in `PONG`.
        ts: u64,
    },

    /// Session/game state push.
    StateChange {
        /// State discriminator, e.g. `LOBBY`, `GAME`.
        state: String,
        /// Context tag the phone uses to pick its controls, e.g.
        /// `CONTROLLER`, `TOUCHPAD`.
        context: String,
        /// The receiving player's own current cosmetics.
        player: CosmeticProfile,
        /// Caller-supplied extra fields (game catalogue, round info...).
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        extra: serde_json::Map<String, Value>,
    },

    /// Forced disconnect notice, best-effort.
    Kick,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
