//! Operational concerns.
//!
//! - `logging` - tracing subscriber setup driven by `LOG_LEVEL`

pub mod logging;

pub use logging::*;
