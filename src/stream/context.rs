use crate::config::StreamConfig;
use crate::stream::{BatchSource, MicroBatch};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Work done for every micro-batch.
///
/// The context may run the same batch more than once (retry after a
/// failure, or redelivery after a restart), so handlers must be safe to
/// re-execute.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: &MicroBatch) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Configured,
    Running,
    Terminated,
}

pub struct StreamingContext {
    config: StreamConfig,
    handler: Arc<dyn BatchHandler>,
    sources: Vec<Box<dyn BatchSource>>,
}

impl StreamingContext {
    pub fn new(config: StreamConfig, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            config,
            handler,
            sources: Vec::new(),
        }
    }

    pub fn add_source(&mut self, source: Box<dyn BatchSource>) {
        self.sources.push(source);
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Spawns one task per source and returns immediately.
    ///
    /// The first source that fails beyond its retry budget stops all the
    /// others; its error is what `await_termination` reports.
    pub fn start(self) -> ContextHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (state_tx, state_rx) = watch::channel(ContextState::Configured);

        let mut tasks = JoinSet::new();
        for source in self.sources {
            let handler = Arc::clone(&self.handler);
            let config = self.config.clone();
            let shutdown = shutdown_tx.subscribe();
            tasks.spawn(drive_source(source, handler, config, shutdown));
        }

        info!(sources = tasks.len(), "Streaming context started");
        let _ = state_tx.send(ContextState::Running);

        let supervisor_shutdown = shutdown_tx.clone();
        let supervisor = tokio::spawn(async move {
            let mut first_error = None;

            while let Some(joined) = tasks.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => Err(Error::Runtime(format!("source task failed: {}", e))),
                };

                if let Err(e) = outcome {
                    error!(error = %e, "Source stopped with error, stopping streaming context");
                    let _ = supervisor_shutdown.send(());
                    first_error.get_or_insert(e);
                }
            }

            let _ = state_tx.send(ContextState::Terminated);
            info!("Streaming context terminated");

            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        });

        ContextHandle {
            shutdown_tx,
            state_rx,
            supervisor,
        }
    }
}

/// Lifecycle handle for a started context.
pub struct ContextHandle {
    shutdown_tx: broadcast::Sender<()>,
    state_rx: watch::Receiver<ContextState>,
    supervisor: JoinHandle<Result<()>>,
}

impl ContextHandle {
    /// Asks every source to stop after its in-flight batch.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn state(&self) -> ContextState {
        *self.state_rx.borrow()
    }

    /// Follows state changes; stays readable after the handle is consumed.
    pub fn subscribe_state(&self) -> watch::Receiver<ContextState> {
        self.state_rx.clone()
    }

    /// A handle that can stop the context from elsewhere, e.g. a signal handler.
    pub fn stopper(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Blocks until every source has stopped.
    pub async fn await_termination(self) -> Result<()> {
        self.supervisor
            .await
            .map_err(|e| Error::Runtime(format!("streaming supervisor failed: {}", e)))?
    }
}

#[instrument(skip_all, fields(source = %source.name()))]
async fn drive_source(
    mut source: Box<dyn BatchSource>,
    handler: Arc<dyn BatchHandler>,
    config: StreamConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => {
                info!("Source received shutdown signal");
                return Ok(());
            }
            next = source.next_batch() => next?,
        };

        let Some(batch) = next else {
            info!("Source exhausted");
            return Ok(());
        };
        if batch.is_empty() {
            continue;
        }

        let mut attempt = 0;
        loop {
            match handler.handle(&batch).await {
                Ok(()) => break,
                Err(e) if attempt < config.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = config.max_retries,
                        batch_size = batch.len(),
                        error = %e,
                        "Batch failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => {
                            // Not committed, so it is redelivered after restart.
                            info!("Shutdown during batch retry, leaving batch uncommitted");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms)) => {}
                    }
                }
                Err(e) => {
                    error!(
                        attempts = attempt + 1,
                        batch_size = batch.len(),
                        error = %e,
                        "Batch failed after exhausting retries"
                    );
                    return Err(e);
                }
            }
        }

        source.commit(&batch).await?;
        debug!(batch_size = batch.len(), latency_ms = batch.age_ms(), "Batch committed");
    }
}
