//! Resolved client configuration.
//!
//! - `config` - endpoint, TLS, reconnect and consumer settings

pub mod config;

pub use config::*;
