//! Sample transport and persistence.
//!
//! - [`channel`]: bounded, ordered sample queues with an explicit overflow policy
//! - [`storage`]: the record schema and the sinks that persist it
//! - [`persistence`]: the worker that drains a channel into a sink

pub mod channel;
pub mod persistence;
pub mod storage;

pub use channel::{ChannelStats, DataChannel, OverflowPolicy};
pub use persistence::{PersistReport, PersistenceConfig, PersistenceWorker};
#[cfg(feature = "storage_csv")]
pub use storage::CsvSink;
pub use storage::{JobMetadata, MemorySink, Record, RecordSink, SinkFactory};
