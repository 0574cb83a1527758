//! Relay configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then command line / environment overrides applied by the binary.

mod loader;
mod schema;

pub use loader::load_config;
pub use schema::{AppConfig, RelayConfig, WebConfig};
