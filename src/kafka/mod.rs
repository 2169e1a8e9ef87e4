pub mod consumer;
pub mod factory;
pub mod producer;


pub use consumer::KafkaBatchSource;
pub use factory::{KafkaProducerFactory, ProducerFactory};
pub use producer::{KafkaProducer, KeyedMessage, ProducerConnection};
