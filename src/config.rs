use crate::{Error, Result};
use config::Source;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "KAFKA_INDEXER";

/// Immutable flat mapping from dotted configuration key to string value.
///
/// Every component reads its knobs from here through the typed
/// `from_settings` constructors below. Missing optional keys fall back to
/// defaults; a key that is present but cannot be parsed is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Loads settings from a TOML file, overlaid with `KAFKA_INDEXER_*`
    /// environment variables (`__` separates key segments).
    ///
    /// A missing file is not an error: environment and defaults still apply.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut values = BTreeMap::new();
        for (key, value) in loaded.collect()? {
            flatten_into(&key, value, &mut values);
        }

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Parses `key` if present, otherwise returns `default`.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    pub fn parse_opt<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                Error::config(format!("invalid value '{}' for '{}': {}", raw, key, e))
            }),
        }
    }

    /// Comma-separated list, trimmed, with empty items dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Per-topic consumer parallelism.
    ///
    /// Every topic in `kafka.topics` gets `kafka.threads` consumers unless
    /// `kafka.topic.<name>.threads` overrides it.
    pub fn topic_parallelism(&self) -> Result<BTreeMap<String, usize>> {
        let threads: usize = self.parse_or("kafka.threads", default_threads())?;
        let mut parallelism = BTreeMap::new();

        for topic in self.get_list("kafka.topics") {
            let per_topic: usize =
                self.parse_or(&format!("kafka.topic.{}.threads", topic), threads)?;
            if per_topic == 0 {
                return Err(Error::config(format!(
                    "topic '{}' must have at least one consumer thread",
                    topic
                )));
            }
            parallelism.insert(topic, per_topic);
        }

        Ok(parallelism)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Settings
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn flatten_into(prefix: &str, value: config::Value, out: &mut BTreeMap<String, String>) {
    if let Ok(table) = value.clone().into_table() {
        for (key, nested) in table {
            flatten_into(&format!("{}.{}", prefix, key), nested, out);
        }
        return;
    }

    if let Ok(items) = value.clone().into_array() {
        let joined: Vec<String> = items
            .into_iter()
            .filter_map(|item| item.into_string().ok())
            .collect();
        out.insert(prefix.to_string(), joined.join(","));
        return;
    }

    if let Ok(s) = value.into_string() {
        out.insert(prefix.to_string(), s);
    }
}

/// Consumer side of the Kafka connection.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topics: BTreeMap<String, usize>,
    pub session_timeout_ms: u64,
    pub auto_offset_reset: String,
}

impl KafkaConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let topics = settings.topic_parallelism()?;
        if topics.is_empty() {
            return Err(Error::config("kafka.topics must name at least one topic"));
        }

        Ok(Self {
            brokers: brokers(settings),
            group_id: settings.get_or("kafka.group", &default_group_id()),
            topics,
            session_timeout_ms: settings
                .parse_or("kafka.session.timeout.ms", default_session_timeout_ms())?,
            auto_offset_reset: settings
                .get_or("kafka.auto.offset.reset", &default_auto_offset_reset()),
        })
    }
}

/// Durability level requested from the broker for each produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckLevel {
    /// Fire and forget.
    None,
    /// Partition leader acknowledges.
    Leader,
    /// Every in-sync replica acknowledges.
    #[default]
    All,
}

impl AckLevel {
    /// Value of the librdkafka `acks` property.
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            AckLevel::None => "0",
            AckLevel::Leader => "1",
            AckLevel::All => "-1",
        }
    }
}

impl FromStr for AckLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(AckLevel::None),
            "1" | "leader" => Ok(AckLevel::Leader),
            "-1" | "all" => Ok(AckLevel::All),
            other => Err(format!("expected one of 0, 1, -1 or all, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub brokers: Vec<String>,
    pub batch_size: usize,
    pub retries: u32,
    pub acks: AckLevel,
    pub compression: String,
    pub sync: bool,
    pub send_timeout_ms: u64,
}

impl ProducerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            brokers: brokers(settings),
            batch_size: settings.parse_or("kafka.producer.batch.size", default_batch_size())?,
            retries: settings.parse_or("kafka.producer.retries", default_retries())?,
            acks: settings.parse_or("kafka.producer.acks", AckLevel::default())?,
            compression: settings.get_or("kafka.producer.compression", &default_compression()),
            sync: settings.parse_or("kafka.producer.sync", true)?,
            send_timeout_ms: settings
                .parse_or("kafka.producer.timeout.ms", default_send_timeout_ms())?,
        })
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: vec![default_brokers()],
            batch_size: default_batch_size(),
            retries: default_retries(),
            acks: AckLevel::default(),
            compression: default_compression(),
            sync: true,
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub max_idle: usize,
    /// `None` blocks until a connection frees up.
    pub max_wait: Option<Duration>,
    /// `None` keeps idle connections forever.
    pub idle_timeout: Option<Duration>,
    pub eviction_interval: Duration,
}

impl PoolConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let max_size: usize = settings.parse_or("pool.max.size", default_pool_max_size())?;
        if max_size == 0 {
            return Err(Error::config("pool.max.size must be at least 1"));
        }
        let max_idle = settings.parse_or("pool.max.idle", max_size)?.min(max_size);
        let max_wait = settings
            .parse_opt::<u64>("pool.max.wait.ms")?
            .map(Duration::from_millis);
        let idle_timeout_ms: u64 =
            settings.parse_or("pool.idle.timeout.ms", default_pool_idle_timeout_ms())?;

        Ok(Self {
            max_size,
            max_idle,
            max_wait,
            idle_timeout: (idle_timeout_ms > 0).then(|| Duration::from_millis(idle_timeout_ms)),
            eviction_interval: Duration::from_millis(
                settings.parse_or("pool.eviction.interval.ms", default_eviction_interval_ms())?,
            ),
        })
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            max_idle: default_pool_max_size(),
            max_wait: None,
            idle_timeout: Some(Duration::from_millis(default_pool_idle_timeout_ms())),
            eviction_interval: Duration::from_millis(default_eviction_interval_ms()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub nodes: String,
    pub port: u16,
    pub scheme: String,
    pub index: String,
    pub mapping: String,
    pub timeout_ms: u64,
}

impl SinkConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            nodes: settings.get_or("es.nodes", "127.0.0.1"),
            port: settings.parse_or("es.port", default_sink_port())?,
            scheme: settings.get_or("es.scheme", "http"),
            index: settings.get_or("es.index", "kafka-indexer"),
            mapping: settings.get_or("es.mapping", "_doc"),
            timeout_ms: settings.parse_or("es.timeout.ms", default_sink_timeout_ms())?,
        })
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.nodes, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub batch_interval_ms: u64,
    pub batch_max_messages: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl StreamConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let batch_max_messages: usize =
            settings.parse_or("stream.batch.max.messages", default_batch_max_messages())?;
        if batch_max_messages == 0 {
            return Err(Error::config("stream.batch.max.messages must be at least 1"));
        }

        Ok(Self {
            batch_interval_ms: settings
                .parse_or("stream.batch.interval.ms", default_batch_interval_ms())?,
            batch_max_messages,
            max_retries: settings.parse_or("stream.batch.max.retries", default_retries())?,
            retry_backoff_ms: settings
                .parse_or("stream.batch.retry.backoff.ms", default_retry_backoff_ms())?,
        })
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            batch_max_messages: default_batch_max_messages(),
            max_retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn brokers(settings: &Settings) -> Vec<String> {
    let brokers = settings.get_list("kafka.brokers");
    if brokers.is_empty() {
        vec![default_brokers()]
    } else {
        brokers
    }
}

fn default_brokers() -> String {
    "127.0.0.1:9092".to_string()
}

fn default_group_id() -> String {
    "kafka-indexer".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_threads() -> usize {
    1
}

fn default_session_timeout_ms() -> u64 {
    6000
}

fn default_batch_size() -> usize {
    200
}

fn default_retries() -> u32 {
    3
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_pool_max_size() -> usize {
    8
}

fn default_pool_idle_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_eviction_interval_ms() -> u64 {
    30_000
}

fn default_sink_port() -> u16 {
    9200
}

fn default_sink_timeout_ms() -> u64 {
    30_000
}

fn default_batch_interval_ms() -> u64 {
    1000
}

fn default_batch_max_messages() -> usize {
    500
}

fn default_retry_backoff_ms() -> u64 {
    1000
}
