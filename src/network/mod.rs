//! Networking: wire protocol and the WebSocket transport adapter.
//!
//! The adapter funnels every transport event into a single engine task,
//! so session state only ever mutates inside run-to-completion turns.

pub mod protocol;
pub mod server;

pub use protocol::{ClientMessage, ServerMessage};
pub use server::{HostError, ServerConfig, SessionEvent, SessionEvents, SessionServer};
