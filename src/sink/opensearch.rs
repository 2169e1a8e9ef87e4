//! OpenSearch implementation of [`IndexSink`].

use async_trait::async_trait;
use ::opensearch::{
    http::request::JsonBody,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesExistsParts},
    BulkParts, OpenSearch,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::SinkConfig;
use crate::sink::{BulkSummary, IndexSink, Resource, WriteEntry};
use crate::{Error, Result};

/// Writes batches through the `_bulk` endpoint of a single OpenSearch node.
///
/// OpenSearch has no mapping types, so only the index part of the
/// [`Resource`] addresses the request; the mapping name is kept for logs.
pub struct OpenSearchSink {
    client: OpenSearch,
    url: String,
}

impl OpenSearchSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let url = config.url();
        let parsed_url =
            Url::parse(&url).map_err(|e| Error::config(format!("invalid sink url '{}': {}", url, e)))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .timeout(Duration::from_millis(config.timeout_ms))
            .disable_proxy()
            .build()
            .map_err(|e| Error::sink(e.to_string()))?;

        info!(url = %url, "Created OpenSearch sink");

        Ok(Self {
            client: OpenSearch::new(transport),
            url,
        })
    }

    /// Checks the cluster answers and creates the target index if missing.
    pub async fn ensure_ready(&self, resource: &Resource) -> Result<()> {
        let ping = self.client.ping().send().await?;
        if !ping.status_code().is_success() {
            return Err(Error::sink(format!(
                "OpenSearch at {} answered ping with {}",
                self.url,
                ping.status_code()
            )));
        }

        let exists = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[resource.index.as_str()]))
            .send()
            .await?;
        if exists.status_code().is_success() {
            debug!(index = %resource.index, "Index already exists");
            return Ok(());
        }

        let created = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&resource.index))
            .send()
            .await?;
        if !created.status_code().is_success() {
            let text = created
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::sink(format!(
                "Failed to create index '{}': {}",
                resource.index, text
            )));
        }

        info!(index = %resource.index, "Created index");
        Ok(())
    }
}

#[async_trait]
impl IndexSink for OpenSearchSink {
    /// Any rejected item fails the whole batch; a retry resends every entry.
    #[instrument(skip_all, fields(resource = %resource, entry_count = entries.len()))]
    async fn bulk_write(&self, resource: &Resource, entries: Vec<WriteEntry>) -> Result<BulkSummary> {
        let total = entries.len();
        if total == 0 {
            return Ok(BulkSummary::default());
        }

        let body = bulk_body(entries)?;
        let response = self
            .client
            .bulk(BulkParts::Index(&resource.index))
            .body(body)
            .send()
            .await?;

        let status = response.status_code();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, "Bulk request rejected");
            return Err(Error::sink(format!("bulk request failed with {}: {}", status, text)));
        }

        let response_body: BulkResponse = response.json().await?;
        let failed = response_body.failed_items();
        if !failed.is_empty() {
            warn!(failed = failed.len(), total, first_error = %failed[0], "Bulk write partially failed");
            return Err(Error::sink(format!(
                "{} of {} documents rejected: {}",
                failed.len(),
                total,
                failed[0]
            )));
        }

        debug!(total, "Bulk write succeeded");
        Ok(BulkSummary {
            total,
            took_ms: response_body.took,
        })
    }
}

/// Action line plus document line per entry.
fn bulk_body(entries: Vec<WriteEntry>) -> Result<Vec<JsonBody<Value>>> {
    let mut body = Vec::with_capacity(entries.len() * 2);
    for entry in entries {
        let action = match entry.id {
            Some(id) => json!({ "index": { "_id": id } }),
            None => json!({ "index": {} }),
        };
        body.push(JsonBody::new(action));
        body.push(JsonBody::new(serde_json::to_value(&entry.document)?));
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    took: Option<u64>,
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    index: Option<BulkItemResult>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResult {
    error: Option<Value>,
}

impl BulkResponse {
    fn failed_items(&self) -> Vec<String> {
        if !self.errors {
            return Vec::new();
        }

        self.items
            .iter()
            .filter_map(|item| item.index.as_ref()?.error.as_ref())
            .map(Value::to_string)
            .collect()
    }
}
