//! Client core: connection lifecycle, channel registry and the consumer loop.

pub mod connection;
pub mod consumer;
pub mod handler;
pub mod registry;

pub use connection::{Connection, ConnectionManager, ConnectionState, ReconnectPolicy};
pub use consumer::{Consumer, ConsumerOptions, ConsumerReport, CycleStage, FailurePolicy};
pub use handler::{handler_fn, FnHandler, JobHandler};
pub use registry::{Channel, ChannelRegistry};
