//! Session & fairness layer (deterministic core).
//!
//! Everything in this module is synchronous and clock-free: callers
//! pass `now_ms` in and get explicit effects back. The async transport
//! adapter in [`crate::network`] drives it.

pub mod engine;
pub mod fairness;
pub mod registry;
pub mod room;

pub use engine::{Effect, SessionConfig, SessionEngine};
pub use fairness::{DelayQueue, InputEvent};
pub use registry::{ConnId, ConnectionEntry, ConnectionRegistry};
pub use room::{RoomId, RoomCodeError};
