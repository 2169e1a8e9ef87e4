//! Stream ingest pipeline: decode, transform and bulk-write every micro-batch.

pub mod record;
pub mod transform;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::{Settings, SinkConfig, StreamConfig};
use crate::sink::{BulkSummary, IndexSink, Resource, WriteEntry};
use crate::stream::{BatchHandler, BatchSource, MicroBatch, RawMessage, StreamingContext};
use crate::Result;

pub use crate::stream::{ContextHandle as PipelineHandle, ContextState as PipelineState};
pub use record::{decode, encode, Record};
pub use transform::{Identity, Transform};

/// Running totals, updated after every successful bulk write.
#[derive(Debug, Default)]
pub struct PipelineStats {
    batches: AtomicU64,
    records: AtomicU64,
    empty_records: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub records: u64,
    pub empty_records: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            empty_records: self.empty_records.load(Ordering::Relaxed),
        }
    }
}

pub struct IngestPipeline {
    resource: Resource,
    transform: Arc<dyn Transform>,
    sink: Arc<dyn IndexSink>,
    stream_config: StreamConfig,
    stats: Arc<PipelineStats>,
}

impl IngestPipeline {
    pub fn new(resource: Resource, sink: Arc<dyn IndexSink>) -> Self {
        Self {
            resource,
            transform: Arc::new(Identity),
            sink,
            stream_config: StreamConfig::default(),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Resource and batching settings come from `es.*` and `stream.*`.
    pub fn from_settings(settings: &Settings, sink: Arc<dyn IndexSink>) -> Result<Self> {
        let sink_config = SinkConfig::from_settings(settings)?;
        let stream_config = StreamConfig::from_settings(settings)?;
        let resource = Resource::new(sink_config.index, sink_config.mapping);

        Ok(Self::new(resource, sink).with_stream_config(stream_config))
    }

    pub fn with_transform(mut self, transform: impl Transform + 'static) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Decodes, transforms and writes one batch in arrival order.
    ///
    /// No retry happens here; a sink error is returned as-is.
    #[instrument(skip_all, fields(resource = %self.resource, batch_size = messages.len()))]
    pub async fn process_batch(&self, messages: &[RawMessage]) -> Result<BulkSummary> {
        if messages.is_empty() {
            debug!("Empty batch, skipping bulk write");
            return Ok(BulkSummary::default());
        }

        let mut empty_records = 0u64;
        let entries: Vec<WriteEntry> = messages
            .iter()
            .map(|message| {
                let record = decode(&message.payload);
                if record.is_empty() {
                    empty_records += 1;
                }
                WriteEntry::new(self.transform.apply(record))
            })
            .collect();

        let summary = self.sink.bulk_write(&self.resource, entries).await?;

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.records.fetch_add(summary.total as u64, Ordering::Relaxed);
        self.stats.empty_records.fetch_add(empty_records, Ordering::Relaxed);
        debug!(written = summary.total, empty_records, took_ms = ?summary.took_ms, "Batch written");

        Ok(summary)
    }

    /// Starts one task per source and returns at once.
    pub fn start(self, sources: Vec<Box<dyn BatchSource>>) -> PipelineHandle {
        info!(resource = %self.resource, sources = sources.len(), "Starting ingest pipeline");

        let config = self.stream_config.clone();
        let mut context = StreamingContext::new(config, Arc::new(self));
        for source in sources {
            context.add_source(source);
        }
        context.start()
    }

    /// Runs until every source stops or one fails beyond its retry budget.
    pub async fn run(self, sources: Vec<Box<dyn BatchSource>>) -> Result<()> {
        self.start(sources).await_termination().await
    }
}

#[async_trait]
impl BatchHandler for IngestPipeline {
    async fn handle(&self, batch: &MicroBatch) -> Result<()> {
        self.process_batch(&batch.messages).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{committed_offsets, raw, MemorySink, VecSource};
    use crate::Error;
    use std::time::Duration;

    fn pipeline(sink: Arc<MemorySink>) -> IngestPipeline {
        IngestPipeline::new(Resource::new("events", "_doc"), sink).with_stream_config(StreamConfig {
            retry_backoff_ms: 1,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_malformed_message_becomes_empty_entry() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline(sink.clone());

        let summary = pipeline
            .process_batch(&[
                raw("t1", 0, r#"{"id":"1","name":"a"}"#),
                raw("t1", 1, "not json"),
                raw("t1", 2, r#"{"id":"3"}"#),
            ])
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        let writes = sink.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);

        let (resource, entries) = &writes[0];
        assert_eq!(resource.to_string(), "events/_doc");
        assert_eq!(entries[0].document["id"], "1");
        assert!(entries[1].document.is_empty());
        assert_eq!(entries[2].document["id"], "3");
        assert!(entries.iter().all(|entry| entry.id.is_none()));

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.records, 3);
        assert_eq!(stats.empty_records, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_write() {
        let sink = Arc::new(MemorySink::default());
        let summary = pipeline(sink.clone()).process_batch(&[]).await.unwrap();

        assert_eq!(summary.total, 0);
        assert!(sink.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transform_applied_to_every_record() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline(sink.clone()).with_transform(|mut record: Record| {
            record.insert("ingested".to_string(), "true".to_string());
            record
        });

        pipeline
            .process_batch(&[raw("t1", 0, r#"{"id":"1"}"#), raw("t1", 1, "[]")])
            .await
            .unwrap();

        let writes = sink.writes.lock().unwrap();
        assert!(writes[0].1.iter().all(|entry| entry.document["ingested"] == "true"));
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_retried_by_process_batch() {
        let sink = Arc::new(MemorySink::failing(1));
        let result = pipeline(sink.clone()).process_batch(&[raw("t1", 0, "{}")]).await;

        assert!(matches!(result, Err(Error::SinkWrite(_))));
        assert!(sink.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_writes_batches_in_order_and_commits() {
        let sink = Arc::new(MemorySink::default());
        let source = VecSource::new("t1", vec![
            vec![raw("t1", 0, r#"{"n":"1"}"#), raw("t1", 1, r#"{"n":"2"}"#)],
            vec![raw("t1", 2, r#"{"n":"3"}"#)],
        ]);
        let committed = Arc::clone(&source.committed);

        pipeline(sink.clone()).run(vec![Box::new(source)]).await.unwrap();

        let order: Vec<String> = sink
            .documents()
            .into_iter()
            .map(|entry| entry.document["n"].clone())
            .collect();
        assert_eq!(order, vec!["1", "2", "3"]);
        assert_eq!(sink.writes.lock().unwrap().len(), 2);
        assert_eq!(committed_offsets(&committed), vec![vec![0, 1], vec![2]]);
    }

    #[tokio::test]
    async fn test_sink_outage_within_budget_retries_same_batch() {
        let sink = Arc::new(MemorySink::failing(2));
        let source = VecSource::new("t1", vec![vec![raw("t1", 0, r#"{"id":"1"}"#)]]);
        let committed = Arc::clone(&source.committed);

        pipeline(sink.clone()).run(vec![Box::new(source)]).await.unwrap();

        assert_eq!(sink.writes.lock().unwrap().len(), 1);
        assert_eq!(committed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_reports_state_transitions() {
        let sink = Arc::new(MemorySink::default());
        let handle = pipeline(sink).start(vec![Box::new(PendingSource)]);

        let state = handle.subscribe_state();
        assert_eq!(handle.state(), PipelineState::Running);
        handle.stop();

        tokio::time::timeout(Duration::from_secs(5), handle.await_termination())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*state.borrow(), PipelineState::Terminated);
    }

    /// Never produces a batch; only a stop ends it.
    struct PendingSource;

    #[async_trait]
    impl BatchSource for PendingSource {
        fn name(&self) -> &str {
            "pending"
        }

        async fn next_batch(&mut self) -> Result<Option<MicroBatch>> {
            std::future::pending().await
        }

        async fn commit(&mut self, _batch: &MicroBatch) -> Result<()> {
            Ok(())
        }
    }
}
