//! Screen relay
//!
//! A WebSocket relay that pairs a screen-streaming source device with
//! remote observers sharing a session key. Frames flow source to
//! observers; pointer commands flow back.

pub mod config;
pub mod error;
pub mod relay;
pub mod state;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
