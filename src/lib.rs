//! Kafka to OpenSearch stream indexer.
//!
//! Micro-batches from Kafka topics are decoded into flat records, passed
//! through a pluggable [`pipeline::Transform`] and bulk-written to a fixed
//! index. A bounded [`pool::ProducerPool`] hands out reusable Kafka producer
//! connections for publishing back to the broker.

pub mod config;
pub mod error;
pub mod kafka;
pub mod pipeline;
pub mod pool;
pub mod sink;
pub mod stream;

#[cfg(test)]
mod test_utils;

pub use config::Settings;
pub use error::{Error, Result};
pub use pipeline::{IngestPipeline, PipelineHandle, PipelineState};
pub use pool::{ObjectPool, ProducerPool};
