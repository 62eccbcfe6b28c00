//! Medrelay - streaming relay between a Coze chat bot and browser clients
//!
//! This crate provides a daemon that resolves per-tenant upstream clients,
//! normalizes the provider's event stream, and re-frames it as a
//! heartbeat-augmented server-sent-event stream with optional citation
//! splitting.

pub mod config;
pub mod error;
pub mod models;
pub mod references;
pub mod registry;
pub mod relay;
pub mod server;
pub mod service;
pub mod testing;
pub mod trace;
pub mod upstream;

pub use error::RelayError;
