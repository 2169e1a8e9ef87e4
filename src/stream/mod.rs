//! Micro-batch streaming runtime.
//!
//! A [`BatchSource`] hands out ordered micro-batches of raw messages. The
//! [`StreamingContext`] drives one task per source, passes every batch to a
//! [`BatchHandler`], retries a failed batch within a budget and commits the
//! batch back to its source once the handler succeeds.

pub mod context;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::Result;

pub use context::{BatchHandler, ContextHandle, ContextState, StreamingContext};

/// One message as received from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: String,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
        }
    }
}

/// Messages delivered together for one batch interval.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    pub messages: Vec<RawMessage>,
    pub received_at: DateTime<Utc>,
}

impl MicroBatch {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            received_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Milliseconds since the batch was cut from its source.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.received_at).num_milliseconds()
    }

    /// Highest offset seen per `(topic, partition)`.
    pub fn offsets(&self) -> BTreeMap<(String, i32), i64> {
        let mut offsets = BTreeMap::new();
        for message in &self.messages {
            offsets
                .entry((message.topic.clone(), message.partition))
                .and_modify(|offset: &mut i64| *offset = (*offset).max(message.offset))
                .or_insert(message.offset);
        }
        offsets
    }
}

#[async_trait]
pub trait BatchSource: Send {
    fn name(&self) -> &str;

    /// Waits for the next micro-batch. `None` means the source is exhausted.
    async fn next_batch(&mut self) -> Result<Option<MicroBatch>>;

    /// Marks everything in `batch` as processed.
    async fn commit(&mut self, batch: &MicroBatch) -> Result<()>;
}
