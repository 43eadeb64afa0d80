//! Worker Pool for dispatched batched jobs
//!
//! The coordinator enqueues a [`JobDispatch`] per created job. A fixed set
//! of tokio tasks drains the bounded queue and hands each dispatch to a
//! [`JobHandler`], which executes the job and reports completion.

use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Message carried by the worker queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDispatch {
    pub migration_id: i64,
    pub job_id: i64,
}

/// Consumer side: executes one dispatched job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, dispatch: JobDispatch) -> Result<()>;
}

/// Producer side: hands a job to whatever executes it
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, dispatch: JobDispatch) -> Result<()>;
}

/// Executes dispatched jobs on the caller's task
pub struct InlineDispatcher {
    handler: Arc<dyn JobHandler>,
}

impl InlineDispatcher {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl JobDispatcher for InlineDispatcher {
    async fn dispatch(&self, dispatch: JobDispatch) -> Result<()> {
        self.handler.handle(dispatch).await
    }
}

/// Enqueues onto a [`WorkerPool`]'s channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<JobDispatch>,
}

#[async_trait]
impl JobDispatcher for ChannelDispatcher {
    async fn dispatch(&self, dispatch: JobDispatch) -> Result<()> {
        self.sender.send(dispatch).await.map_err(|e| {
            MigrationError::DispatchError(format!(
                "worker queue closed, job {} not dispatched",
                e.0.job_id
            ))
        })
    }
}

pub struct WorkerPool {
    sender: mpsc::Sender<JobDispatch>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` consumers over a queue of `queue_capacity` dispatches
    pub fn start(handler: Arc<dyn JobHandler>, worker_count: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                tokio::spawn(Self::worker_loop(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&handler),
                    shutdown.subscribe(),
                ))
            })
            .collect::<Vec<_>>();

        info!(
            worker_count = workers.len(),
            queue_capacity = queue_capacity,
            "🚀 Batched job worker pool started"
        );

        Self {
            sender,
            shutdown,
            workers,
        }
    }

    pub fn dispatcher(&self) -> ChannelDispatcher {
        ChannelDispatcher {
            sender: self.sender.clone(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    async fn worker_loop(
        worker_id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<JobDispatch>>>,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    next = receiver.recv() => next,
                }
            };

            let Some(dispatch) = next else {
                break;
            };

            debug!(
                worker_id = worker_id,
                migration_id = dispatch.migration_id,
                job_id = dispatch.job_id,
                "Worker picked up batched job"
            );

            if let Err(e) = handler.handle(dispatch).await {
                error!(
                    worker_id = worker_id,
                    migration_id = dispatch.migration_id,
                    job_id = dispatch.job_id,
                    error = %e,
                    "Batched job handler failed"
                );
            }
        }

        debug!(worker_id = worker_id, "Worker stopped");
    }

    /// Stop taking new dispatches and wait for in-flight jobs to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        drop(self.sender);

        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        info!("🛑 Batched job worker pool stopped");
    }
}
