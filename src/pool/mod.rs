pub mod object_pool;
pub mod producer;


pub use object_pool::{ObjectPool, PoolGuard, PoolStatus, Pooled, PooledObjectFactory};
pub use producer::{PooledProducerFactory, ProducerPool};
