//! Same doubles as the library's unit-test helpers, for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use kafka_indexer::kafka::{KeyedMessage, ProducerConnection, ProducerFactory};
use kafka_indexer::sink::{BulkSummary, IndexSink, Resource, WriteEntry};
use kafka_indexer::stream::{BatchSource, MicroBatch, RawMessage};
use kafka_indexer::{Error, Result, Settings};
use std::collections::VecDeque;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Settings for tests that talk to a real broker and cluster.
pub fn get_test_settings(topic: &str) -> Settings {
    let brokers = env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    let es_nodes = env::var("TEST_ES_NODES").unwrap_or_else(|_| "localhost".to_string());

    Settings::from_iter([
        ("kafka.brokers", brokers),
        ("kafka.topics", topic.to_string()),
        ("kafka.group", format!("test-group-{}", std::process::id())),
        ("es.nodes", es_nodes),
        ("es.index", format!("test-{}", std::process::id())),
        ("stream.batch.interval.ms", "200".to_string()),
        ("pool.max.size", "2".to_string()),
    ])
}

#[derive(Default)]
pub struct ProducerLog {
    pub created: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub in_use: AtomicUsize,
    pub peak_in_use: AtomicUsize,
    /// `(client_id, message)` per delivered message.
    pub sent: Mutex<Vec<(String, KeyedMessage)>>,
}

pub struct MockProducer {
    client_id: String,
    open: AtomicBool,
    fail_sends: bool,
    log: Arc<ProducerLog>,
}

#[async_trait]
impl ProducerConnection for MockProducer {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, message: KeyedMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed {
                client_id: self.client_id.clone(),
            });
        }
        if self.fail_sends {
            return Err(Error::SendFailure {
                topic: message.topic,
                message: "broker unreachable".to_string(),
            });
        }

        let in_use = self.log.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.peak_in_use.fetch_max(in_use, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.log
            .sent
            .lock()
            .unwrap()
            .push((self.client_id.clone(), message));
        self.log.in_use.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.log.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MockProducerFactory {
    pub log: Arc<ProducerLog>,
    pub fail_sends: bool,
}

impl ProducerFactory for MockProducerFactory {
    type Connection = MockProducer;

    fn new_instance(&self) -> Result<MockProducer> {
        let n = self.log.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockProducer {
            client_id: format!("mock-producer-{}", n),
            open: AtomicBool::new(true),
            fail_sends: self.fail_sends,
            log: Arc::clone(&self.log),
        })
    }
}

/// Records every bulk write; fails the first `failures` calls.
#[derive(Default)]
pub struct MemorySink {
    pub writes: Mutex<Vec<(Resource, Vec<WriteEntry>)>>,
    pub failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MemorySink {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    /// Every written document in write order.
    pub fn documents(&self) -> Vec<WriteEntry> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, entries)| entries.clone())
            .collect()
    }
}

#[async_trait]
impl IndexSink for MemorySink {
    async fn bulk_write(&self, resource: &Resource, entries: Vec<WriteEntry>) -> Result<BulkSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::sink("bulk rejected"));
        }

        let total = entries.len();
        self.writes.lock().unwrap().push((resource.clone(), entries));
        Ok(BulkSummary::new(total))
    }
}

/// Replays prepared batches, then reports end of stream.
pub struct VecSource {
    name: String,
    batches: VecDeque<MicroBatch>,
    pub committed: Arc<Mutex<Vec<MicroBatch>>>,
}

impl VecSource {
    pub fn new(name: &str, batches: Vec<Vec<RawMessage>>) -> Self {
        Self {
            name: name.to_string(),
            batches: batches.into_iter().map(MicroBatch::new).collect(),
            committed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl BatchSource for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_batch(&mut self) -> Result<Option<MicroBatch>> {
        Ok(self.batches.pop_front())
    }

    async fn commit(&mut self, batch: &MicroBatch) -> Result<()> {
        self.committed.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Offsets of each committed batch, in commit order.
pub fn committed_offsets(committed: &Mutex<Vec<MicroBatch>>) -> Vec<Vec<i64>> {
    committed
        .lock()
        .unwrap()
        .iter()
        .map(|batch| batch.messages.iter().map(|m| m.offset).collect())
        .collect()
}

pub fn raw(topic: &str, offset: i64, payload: &str) -> RawMessage {
    RawMessage::new(topic, 0, offset, payload)
}
