use crate::{config::ProducerConfig, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A message bound for a Kafka topic.
///
/// Without a key the record is produced with a null key, so the broker's
/// default partitioner picks the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl KeyedMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// One live connection to the broker cluster.
///
/// A connection starts Open and moves to Closed on `shutdown`; the move is
/// one-way. `send` on a closed connection fails with
/// [`Error::ConnectionClosed`].
#[async_trait]
pub trait ProducerConnection: Send + Sync {
    fn client_id(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, message: KeyedMessage) -> Result<()>;

    /// Releases the transport. Calling it again is a no-op.
    async fn shutdown(&self) -> Result<()>;
}

pub struct KafkaProducer {
    client_id: String,
    producer: RwLock<Option<FutureProducer>>,
    open: AtomicBool,
    sync: bool,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// Builds a producer with a fresh client id.
    ///
    /// No broker round-trip happens here; librdkafka connects lazily.
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        let client_id = format!("kafka-indexer-{}", Uuid::new_v4());
        let producer: FutureProducer = client_config(config, &client_id)
            .create()
            .map_err(Error::Kafka)?;

        debug!(client_id = %client_id, brokers = ?config.brokers, "Created Kafka producer");

        Ok(Self {
            client_id,
            producer: RwLock::new(Some(producer)),
            open: AtomicBool::new(true),
            sync: config.sync,
            send_timeout: config.send_timeout(),
        })
    }
}

#[async_trait]
impl ProducerConnection for KafkaProducer {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    #[instrument(skip(self, message), fields(client_id = %self.client_id, topic = %message.topic))]
    async fn send(&self, message: KeyedMessage) -> Result<()> {
        let producer = match self.producer.read().await.as_ref() {
            Some(producer) => producer.clone(),
            None => {
                return Err(Error::ConnectionClosed {
                    client_id: self.client_id.clone(),
                })
            }
        };

        let record = build_record(&message);

        if self.sync {
            // Resolves once the delivery report arrives, after librdkafka has
            // spent its retries.
            let (partition, offset) = producer
                .send(record, Timeout::After(self.send_timeout))
                .await
                .map_err(|(e, _)| Error::SendFailure {
                    topic: message.topic.clone(),
                    message: e.to_string(),
                })?;
            debug!(partition, offset, "Message delivered");
        } else {
            producer
                .send_result(record)
                .map_err(|(e, _)| Error::SendFailure {
                    topic: message.topic.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(producer) = self.producer.write().await.take() else {
            debug!(client_id = %self.client_id, "Producer already shut down");
            return Ok(());
        };
        self.open.store(false, Ordering::Release);

        let timeout = self.send_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => info!(client_id = %self.client_id, "Producer shut down"),
            Ok(Err(e)) => warn!(
                client_id = %self.client_id,
                error = %e,
                "Producer shut down with undelivered messages"
            ),
            Err(e) => warn!(client_id = %self.client_id, error = %e, "Producer flush task failed"),
        }

        Ok(())
    }
}

/// librdkafka settings for one producer instance.
pub fn client_config(config: &ProducerConfig, client_id: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", client_id)
        .set("acks", config.acks.as_kafka_value())
        .set("message.send.max.retries", config.retries.to_string())
        .set("batch.num.messages", config.batch_size.to_string())
        .set("compression.codec", &config.compression)
        .set("message.timeout.ms", config.send_timeout_ms.to_string());
    client_config
}

pub(crate) fn build_record(message: &KeyedMessage) -> FutureRecord<'_, [u8], [u8]> {
    let record = FutureRecord::to(&message.topic).payload(&message.value[..]);
    match &message.key {
        Some(key) => record.key(&key[..]),
        None => record,
    }
}
