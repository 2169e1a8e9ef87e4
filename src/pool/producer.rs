use crate::config::PoolConfig;
use crate::kafka::{KeyedMessage, ProducerConnection, ProducerFactory};
use crate::pool::object_pool::{ObjectPool, Pooled, PooledObjectFactory};
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Plugs a [`ProducerFactory`] into the generic [`ObjectPool`].
///
/// Only object lifecycle lives here; sizing, waiting and eviction are the
/// pool's business.
pub struct PooledProducerFactory<F: ProducerFactory> {
    factory: F,
}

impl<F: ProducerFactory> PooledProducerFactory<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    pub fn inner(&self) -> &F {
        &self.factory
    }
}

#[async_trait]
impl<F: ProducerFactory> PooledObjectFactory for PooledProducerFactory<F> {
    type Object = F::Connection;

    async fn create(&self) -> Result<F::Connection> {
        let connection = self.factory.new_instance()?;
        debug!(client_id = %connection.client_id(), "Opened pooled producer");
        Ok(connection)
    }

    async fn validate_object(&self, connection: &F::Connection) -> bool {
        connection.is_open()
    }

    async fn destroy_object(&self, pooled: &Pooled<F::Connection>) -> Result<()> {
        let connection = pooled.object();
        debug!(
            pooled_id = pooled.id(),
            client_id = %connection.client_id(),
            "Shutting down pooled producer"
        );
        connection.shutdown().await
    }
}

/// Pool of Kafka producer connections.
pub type ProducerPool<F> = ObjectPool<PooledProducerFactory<F>>;

impl<F: ProducerFactory> ObjectPool<PooledProducerFactory<F>> {
    pub fn for_producers(factory: F, config: PoolConfig) -> Self {
        ObjectPool::new(PooledProducerFactory::new(factory), config)
    }

    /// Sends one message over a borrowed connection.
    ///
    /// A connection that fails a send is invalidated rather than returned,
    /// so the next borrower gets a fresh transport.
    pub async fn send(&self, message: KeyedMessage) -> Result<()> {
        let connection = self.borrow().await?;

        let result = connection.send(message).await;
        match result {
            Ok(()) => Ok(()),
            Err(e @ (Error::SendFailure { .. } | Error::ConnectionClosed { .. })) => {
                warn!(
                    client_id = %connection.client_id(),
                    error = %e,
                    "Discarding producer after failed send"
                );
                connection.invalidate().await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
