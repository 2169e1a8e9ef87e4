use crate::config::{ProducerConfig, Settings};
use crate::kafka::producer::{KafkaProducer, ProducerConnection};
use crate::Result;
use std::sync::Arc;

/// Builds producer connections.
///
/// The pool depends on this trait rather than on [`KafkaProducer`], which
/// lets tests plug in connections that never touch a broker.
pub trait ProducerFactory: Send + Sync + 'static {
    type Connection: ProducerConnection + 'static;

    fn new_instance(&self) -> Result<Self::Connection>;
}

#[derive(Debug, Clone)]
pub struct KafkaProducerFactory {
    config: Arc<ProducerConfig>,
}

impl KafkaProducerFactory {
    pub fn new(config: ProducerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(ProducerConfig::from_settings(settings)?))
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }
}

impl ProducerFactory for KafkaProducerFactory {
    type Connection = KafkaProducer;

    fn new_instance(&self) -> Result<KafkaProducer> {
        KafkaProducer::new(&self.config)
    }
}
