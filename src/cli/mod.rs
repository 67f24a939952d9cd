//! jobstats CLI.
//!
//! A single flat command line; `--command` selects the operation:
//! - `checkQueue` - print queue statistics
//! - `purgeQueue` - drop every waiting job
//! - `deleteQueue` - remove an empty, unused queue
//! - `sendToQueue` - enqueue the positional `JOB`
//! - `listQueues` - list queues known to the broker
//! - `consume` - print jobs as they arrive until interrupted

mod args;
pub mod commands;

pub use args::{Cli, OutputFormat, PutArgs, TlsArgs};
