//! Bloom gateway query workers.
//!
//! Tasks are created by the gateway front end with [`Task::new`], registered in
//! [`PendingTasks`], and pushed onto the shared [`RequestQueue`]. A [`WorkerPool`] runs N
//! [`Worker`]s, each of which dequeues batches, buckets them by day, matches them against the
//! day's bloom blocks and runs one fused query per block. Every task a worker dequeues is closed
//! exactly once, with either its outputs or a single error.

use anyhow::Context;
use bloom_core::{BlockStore, QueueItem, RequestQueue};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod metrics;
pub mod multiplexing;
pub mod partition;
pub mod task;
pub mod worker;

pub use config::GatewayConfig;
pub use metrics::WorkerMetrics;
pub use task::{FilterRequest, PendingTasks, Task, TaskHandle, TaskId};
pub use worker::{Worker, WorkerConfig};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub worker_prefix: String,
    pub worker: WorkerConfig,
}

impl From<&GatewayConfig> for WorkerPoolConfig {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            workers: cfg.workers,
            worker_prefix: cfg.worker_prefix.clone(),
            worker: cfg.worker_config(),
        }
    }
}

/// A running set of workers sharing a queue, a store and a pending-task registry.
pub struct WorkerPool {
    queue: Arc<dyn RequestQueue>,
    pending: Arc<PendingTasks>,
    shutdown: CancellationToken,
    workers: Vec<(String, JoinHandle<bloom_core::Result<()>>)>,
}

impl WorkerPool {
    pub fn start(
        cfg: WorkerPoolConfig,
        queue: Arc<dyn RequestQueue>,
        store: Arc<dyn BlockStore>,
        pending: Arc<PendingTasks>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let workers = (0..cfg.workers)
            .map(|n| {
                let id = format!("{}-{n}", cfg.worker_prefix);
                let worker = Worker::new(
                    id.clone(),
                    cfg.worker,
                    queue.clone(),
                    store.clone(),
                    pending.clone(),
                    metrics.clone(),
                );
                let join = tokio::spawn(worker.run(shutdown.child_token()));
                (id, join)
            })
            .collect();

        tracing::info!(
            event = "bloom_gateway.pool.started",
            workers = cfg.workers,
            max_items = cfg.worker.max_items,
            max_wait_ms = cfg.worker.max_wait_time.as_millis() as u64,
            "worker pool started"
        );

        Self {
            queue,
            pending,
            shutdown,
            workers,
        }
    }

    pub fn pending(&self) -> &Arc<PendingTasks> {
        &self.pending
    }

    /// Register `task` as pending and hand it to the queue.
    pub async fn enqueue(&self, task: Arc<Task>) -> bloom_core::Result<()> {
        self.pending.add(task.clone());
        let tenant = task.tenant.clone();
        let id = task.id;
        let item: QueueItem = task;
        if let Err(err) = self.queue.enqueue(&tenant, item).await {
            self.pending.remove(&id);
            return Err(err.context(format!("enqueue task {id}")));
        }
        Ok(())
    }

    /// Stop every worker and wait for it to exit.
    ///
    /// Returns the first worker error other than the shutdown cancellation itself.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.cancel();

        let mut first_err: Option<anyhow::Error> = None;
        for (id, join) in self.workers {
            let res = join
                .await
                .with_context(|| format!("join worker {id}"))
                .and_then(|res| match res {
                    Err(err) if !err.is_canceled() => {
                        Err(anyhow::Error::new(err).context(format!("worker {id}")))
                    }
                    _ => Ok(()),
                });
            if let Err(err) = res {
                tracing::warn!(
                    event = "bloom_gateway.pool.worker_failed",
                    worker = %id,
                    error = %err,
                    "worker exited with error"
                );
                first_err.get_or_insert(err);
            }
        }

        tracing::info!(event = "bloom_gateway.pool.stopped", "worker pool stopped");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
