//! Bulk-write side of the pipeline.

pub mod opensearch;

use async_trait::async_trait;
use std::fmt;

use crate::pipeline::Record;
use crate::Result;

pub use self::opensearch::OpenSearchSink;

/// Where a batch is written, fixed for the lifetime of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub index: String,
    pub mapping: String,
}

impl Resource {
    pub fn new(index: impl Into<String>, mapping: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            mapping: mapping.into(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.mapping)
    }
}

/// One document for the bulk API.
///
/// `id: None` is the empty key marker: the sink assigns the document id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    pub id: Option<String>,
    pub document: Record,
}

impl WriteEntry {
    pub fn new(document: Record) -> Self {
        Self { id: None, document }
    }

    pub fn with_id(id: impl Into<String>, document: Record) -> Self {
        Self {
            id: Some(id.into()),
            document,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkSummary {
    pub total: usize,
    pub took_ms: Option<u64>,
}

impl BulkSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            took_ms: None,
        }
    }
}

/// Indexing engine bulk-write API.
///
/// An `Err` means the batch as a whole must be treated as not written.
#[async_trait]
pub trait IndexSink: Send + Sync {
    async fn bulk_write(&self, resource: &Resource, entries: Vec<WriteEntry>) -> Result<BulkSummary>;
}
