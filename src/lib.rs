//! LTP Recorder Library
//!
//! Streams binary last-traded-price ticks over a WebSocket, buffers them and
//! periodically appends a timestamped column of last prices to a persisted
//! table.

pub mod aggregator;
pub mod config;
pub mod feed;
pub mod registry;
pub mod store;

pub use aggregator::{Aggregator, LastPriceTable, Snapshotter};
pub use config::RecorderConfig;
pub use registry::{InstrumentMeta, SubscriptionRegistry};
