//! Background service framework
//!
//! Small lifecycle layer for long-running services: a `Service` runs until
//! it receives a shutdown broadcast, reports its status, and declares how
//! the manager should react to failures.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors surfaced by background services
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Service failed while running
    #[error("service failure: {0}")]
    Failure(String),

    /// Service could not start
    #[error("startup error: {0}")]
    Startup(String),
}

/// Current lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Running,
    Failed,
}

/// How the manager reacts when a service returns an error
#[derive(Debug, Clone, Copy)]
pub enum RestartPolicy {
    /// Leave it stopped
    Never,
    /// Retry with a backoff, up to a limit
    OnFailure { max_retries: u32, backoff: Duration },
}

/// A long-running background service
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until completion or shutdown signal
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    fn name(&self) -> &'static str;

    fn status(&self) -> ServiceStatus;

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::Never
    }
}

/// Spawns services on the runtime and owns the shutdown channel
pub struct ServiceManager {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Spawn a service, applying its restart policy on failure
    pub fn spawn(&mut self, service: Arc<dyn Service>) {
        let name = service.name();
        let shutdown_tx = self.shutdown_tx.clone();
        let handle = tokio::spawn(async move {
            let mut retries = 0u32;
            loop {
                let rx = shutdown_tx.subscribe();
                match service.start(rx).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!(service = service.name(), error = %e, "service failed");
                        match service.restart_policy() {
                            RestartPolicy::Never => break,
                            RestartPolicy::OnFailure {
                                max_retries,
                                backoff,
                            } => {
                                if retries >= max_retries {
                                    error!(
                                        service = service.name(),
                                        retries, "giving up on service"
                                    );
                                    break;
                                }
                                retries += 1;
                                tokio::time::sleep(backoff).await;
                            }
                        }
                    }
                }
            }
        });
        info!(service = name, "service spawned");
        self.handles.push((name, handle));
    }

    /// Broadcast shutdown and wait for every service to wind down
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        for (name, handle) in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(service = name, error = %e, "service join failed");
            }
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
