use crate::config::{KafkaConfig, StreamConfig};
use crate::stream::{BatchSource, MicroBatch, RawMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Consumes one topic and cuts the stream into micro-batches.
///
/// Several sources on the same topic share the consumer group, so Kafka
/// spreads the topic's partitions across them. Offsets are committed only
/// through [`BatchSource::commit`].
pub struct KafkaBatchSource {
    name: String,
    consumer: StreamConsumer,
    max_messages: usize,
    interval: Duration,
}

impl KafkaBatchSource {
    pub fn new(kafka: &KafkaConfig, stream: &StreamConfig, topic: &str, replica: usize) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", kafka.brokers.join(","))
            .set("group.id", &kafka.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &kafka.auto_offset_reset)
            .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        consumer.subscribe(&[topic]).map_err(Error::Kafka)?;

        let name = format!("{}#{}", topic, replica);
        info!(
            source = %name,
            brokers = ?kafka.brokers,
            group_id = %kafka.group_id,
            batch_max_messages = stream.batch_max_messages,
            batch_interval_ms = stream.batch_interval_ms,
            "Subscribed Kafka source"
        );

        Ok(Self {
            name,
            consumer,
            max_messages: stream.batch_max_messages,
            interval: stream.batch_interval(),
        })
    }

    /// One source per `(topic, replica)` according to the per-topic parallelism.
    pub fn for_topics(kafka: &KafkaConfig, stream: &StreamConfig) -> Result<Vec<Self>> {
        let mut sources = Vec::new();
        for (topic, threads) in &kafka.topics {
            for replica in 0..*threads {
                sources.push(Self::new(kafka, stream, topic, replica)?);
            }
        }
        Ok(sources)
    }
}

#[async_trait]
impl BatchSource for KafkaBatchSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_batch(&mut self) -> Result<Option<MicroBatch>> {
        let source = self.name.as_str();
        let chunks: std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Vec<RawMessage>> + Send + '_>> = Box::pin(self
            .consumer
            .stream()
            .filter_map(|received| match received {
                Ok(message) => Some(raw_message(&message)),
                Err(e) => {
                    warn!(source = %source, error = %e, "Kafka error while consuming");
                    None
                }
            })
            .chunks_timeout(self.max_messages, self.interval));
        tokio::pin!(chunks);

        match chunks.next().await {
            Some(messages) => {
                debug!(source = %self.name, batch_size = messages.len(), "Received micro-batch");
                Ok(Some(MicroBatch::new(messages)))
            }
            None => Ok(None),
        }
    }

    async fn commit(&mut self, batch: &MicroBatch) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in batch.offsets() {
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                .map_err(Error::Kafka)?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(Error::Kafka)?;
        Ok(())
    }
}

/// Invalid UTF-8 is replaced rather than rejected; a missing payload becomes
/// an empty string, which decodes to an empty record.
fn raw_message(message: &BorrowedMessage<'_>) -> RawMessage {
    let payload = message
        .payload()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default();
    RawMessage::new(message.topic(), message.partition(), message.offset(), payload)
}
