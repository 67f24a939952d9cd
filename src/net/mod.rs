//! Networking helpers shared by the broker backends.
//!
//! - `tls` - rustls client configuration from PEM files

pub mod tls;

pub use tls::*;
