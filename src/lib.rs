//! # Partybridge
//!
//! Session & fairness layer for party games that mix keyboard players
//! on a shared display with phone players connected over the network.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PARTYBRIDGE                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  session/         - Deterministic core (no I/O, no clock)    │
//! │  ├── room.rs      - Room codes and derived addressing        │
//! │  ├── registry.rs  - Connection registry + latency aggregate  │
//! │  ├── fairness.rs  - Delayed-dispatch queue for local input   │
//! │  └── engine.rs    - Handshake, heartbeat/reaper, broadcast   │
//! │                                                              │
//! │  network/         - Async transport adapter                  │
//! │  ├── protocol.rs  - JSON wire messages                       │
//! │  └── server.rs    - WebSocket server + single engine task    │
//! │                                                              │
//! │  roster.rs        - Player records (collaborator seam)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fairness Guarantee
//!
//! Phone input pays one network leg before it reaches the host, so the
//! engine measures round-trip times with `PING`/`PONG` probes and holds
//! local keyboard input back by `floor(mean(rtt) / 2)` milliseconds.
//! Two players pressing logically equivalent controls at the same
//! wall-clock instant reach the downstream input pipeline with expected
//! skew no larger than the estimated one-way latency, whichever side of
//! the network they sit on.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod network;
pub mod roster;
pub mod session;

// Re-export commonly used types
pub use network::protocol::{ClientMessage, ServerMessage};
pub use network::server::{HostError, ServerConfig, SessionEvent, SessionEvents, SessionServer};
pub use roster::{
    CosmeticProfile, MemoryRoster, Player, PlayerId, PlayerKind, PlayerRoster, ProfilePatch,
};
pub use session::engine::{Effect, SessionConfig, SessionEngine};
pub use session::fairness::InputEvent;
pub use session::registry::ConnId;
pub use session::room::RoomId;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
