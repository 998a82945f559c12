//! blipmqtt – a lightweight MQTT 3.1.1 broker written in Rust.
//!
//! This crate exports
//!  * `core`    – wire codec, topic matching, retained store, session state
//!  * `broker`  – TCP accept loop, per-connection tasks, session registry
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – `tracing` subscriber setup
//!
//! Downstream applications can embed the broker (`start_broker`, or
//! [`broker::Broker::serve`] on their own listener) or build their own
//! binaries on top of the library.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::serve as start_broker;
pub use config::{load_config, Config};
