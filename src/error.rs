//! Error types and result handling for kafka-indexer.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use kafka_indexer::{Error, Result};
//!
//! fn send_something() -> Result<()> {
//!     Err(Error::ConnectionClosed {
//!         client_id: "kafka-indexer-1".to_string(),
//!     })
//! }
//!
//! match send_something() {
//!     Ok(()) => println!("Sent"),
//!     Err(Error::ConnectionClosed { client_id }) => eprintln!("{} is closed", client_id),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for kafka-indexer operations.
///
/// Producer-side variants are returned synchronously to the caller of
/// `send`. Sink failures travel up to the streaming runtime, which decides
/// whether the batch is retried or the context is stopped.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically a missing file or an unparsable value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client error outside of a `send` call (consumer, client setup).
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding documents.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be delivered after the transport exhausted its retries.
    #[error("Failed to send to topic '{topic}': {message}")]
    SendFailure {
        /// Destination topic
        topic: String,
        /// Underlying transport error
        message: String,
    },

    /// `send` was called on a producer connection after `shutdown`.
    ///
    /// This is a lifecycle bug in the caller, never a transient condition.
    #[error("Producer connection '{client_id}' is closed")]
    ConnectionClosed {
        /// Client id of the closed connection
        client_id: String,
    },

    /// The indexing sink rejected or failed a bulk write.
    #[error("Sink write error: {0}")]
    SinkWrite(String),

    /// No pooled connection became available within the configured wait.
    #[error("Producer pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted {
        /// How long the borrower waited
        waited_ms: u64,
    },

    /// The pool has been closed and no longer hands out connections.
    #[error("Producer pool is closed")]
    PoolClosed,

    /// A background task panicked or was cancelled.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a sink write error.
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::SinkWrite(msg.into())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<opensearch::Error> for Error {
    fn from(err: opensearch::Error) -> Self {
        Self::SinkWrite(err.to_string())
    }
}

/// A convenient Result type alias for kafka-indexer operations.
///
/// This is equivalent to `std::result::Result<T, kafka_indexer::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
