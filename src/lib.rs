//! RelayMQ – startup and shutdown orchestration for an MQTT broker daemon.
//!
//! This crate exports
//!  * `auth`        – credential store, provider registry, auth manager
//!  * `persistence` – durable-storage binding handed to the server
//!  * `transport`   – listener configuration (TCP, optional TLS)
//!  * `broker`      – server lifecycle and the protocol-engine seam
//!  * `bootstrap`   – the ordered startup pipeline
//!  * `shutdown`    – signal-driven, exactly-once server close
//!  * `config`      – TOML/YAML runtime configuration
//!
//! The protocol engine itself plugs in through [`broker::SessionHandler`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod auth;
pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod diagnostics;
pub mod logging;
pub mod persistence;
pub mod shutdown;
pub mod transport;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use bootstrap::{run, start, BootstrapError, Running, Stage};
pub use config::{load_config, Config};
