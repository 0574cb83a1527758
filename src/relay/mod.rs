//! Session relay
//!
//! Pairs one source connection (a device streaming its screen as binary
//! frames) with any number of observers per session id. Observers receive
//! every frame the source sends while they are attached; their pointer
//! commands travel back to the source.

pub mod connection;
pub mod liveness;
pub mod protocol;
pub mod router;

pub use connection::{serve, Binding, ConnectionHandle, ConnectionId, Outbound};
pub use liveness::{LivenessMonitor, SweepReport};
pub use protocol::{CloseReason, ControlMessage, ProtocolError, Role, StatusKind, StatusMessage};
pub use router::{BindError, FanOut, RouterStats, SessionRouter, SessionSnapshot};
