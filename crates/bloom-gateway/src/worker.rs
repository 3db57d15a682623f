//! The worker loop: dequeue task batches, split them by day and block, run fused block queries.

use crate::{
    metrics::{self, WorkerMetrics},
    multiplexing::TaskMergeIterator,
    partition::{
        partition_fingerprint_range, partition_tasks_by_day, uncovered_refs, BoundedTask,
        BoundedTasks, DayKey,
    },
    task::{PendingTasks, Task},
};
use anyhow::anyhow;
use bloom_core::{
    day, request_stream, tokenizer::NGramTokenizer, BlockQuerier, BlockRef, BlockStore,
    DequeueBatch, Error, ErrorKind, FingerprintBounds, Output, QueueIndex, QueueItem,
    RequestQueue, Result,
};
use chrono::NaiveDate;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Max time a dequeue waits before returning whatever is available.
    pub max_wait_time: Duration,
    pub max_items: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_wait_time: Duration::from_millis(100),
            max_items: 100,
        }
    }
}

/// One named consumer of the request queue.
pub struct Worker {
    id: String,
    cfg: WorkerConfig,
    queue: Arc<dyn RequestQueue>,
    store: Arc<dyn BlockStore>,
    pending: Arc<PendingTasks>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        cfg: WorkerConfig,
        queue: Arc<dyn RequestQueue>,
        store: Arc<dyn BlockStore>,
        pending: Arc<PendingTasks>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            id: id.into(),
            cfg,
            queue,
            store,
            pending,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` fires or the queue fails terminally.
    ///
    /// The queue connection is registered for the whole run and unregistered on every exit.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.queue.register_consumer_connection(&self.id);
        tracing::debug!(
            event = "bloom_gateway.worker.starting",
            worker = %self.id,
            "starting worker"
        );

        let res = self.running(&shutdown).await;

        self.queue.unregister_consumer_connection(&self.id);
        match &res {
            Ok(()) => tracing::debug!(
                event = "bloom_gateway.worker.stopping",
                worker = %self.id,
                "stopping worker"
            ),
            Err(err) => tracing::debug!(
                event = "bloom_gateway.worker.stopping",
                worker = %self.id,
                error = %err,
                "stopping worker"
            ),
        }
        res
    }

    async fn running(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut idx = QueueIndex::START_WITH_LOCAL_QUEUE;

        loop {
            if shutdown.is_cancelled() {
                return Err(Error::canceled().context(format!("shutting down worker {}", self.id)));
            }

            let started = Instant::now();
            let DequeueBatch {
                items,
                next_index,
                error,
            } = self
                .queue
                .dequeue_many(idx, &self.id, self.cfg.max_items, self.cfg.max_wait_time)
                .await;
            self.metrics
                .dequeue_wait_time
                .with_label_values(&[self.id.as_str()])
                .observe(started.elapsed().as_secs_f64());
            idx = next_index;

            if let Some(err) = error {
                if err.is_stopped() && items.is_empty() {
                    self.queue.release_requests(items);
                    return Err(err.context(format!("dequeue for worker {}", self.id)));
                }
                self.metrics
                    .dequeue_errors
                    .with_label_values(&[self.id.as_str()])
                    .inc();
                tracing::error!(
                    event = "bloom_gateway.worker.dequeue_failed",
                    worker = %self.id,
                    items = items.len(),
                    error = %err,
                    "failed to dequeue tasks"
                );
            }

            if items.is_empty() {
                self.queue.release_requests(items);
                continue;
            }
            self.metrics
                .dequeued_tasks
                .with_label_values(&[self.id.as_str()])
                .inc_by(items.len() as u64);

            self.process_batch(items, shutdown).await?;
        }
    }

    /// Process one dequeued batch. Every task in it is closed and the batch released, whatever
    /// the outcome.
    async fn process_batch(
        &self,
        items: Vec<QueueItem>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut tasks = Vec::with_capacity(items.len());
        let mut invalid = 0usize;
        for item in &items {
            match Arc::clone(item).downcast::<Task>() {
                Ok(task) => tasks.push(task),
                Err(_) => invalid += 1,
            }
        }

        if invalid > 0 {
            let err = Error::new(
                ErrorKind::Invariant,
                anyhow!(
                    "dequeued {invalid} of {} items that are not tasks",
                    items.len()
                ),
            );
            for task in &tasks {
                self.pending.remove(&task.id);
                task.send_error(err.clone());
                task.close();
            }
            self.queue.release_requests(items);
            return Err(err.context(format!("worker {}", self.id)));
        }

        let mut accepted = Vec::with_capacity(tasks.len());
        for task in tasks {
            self.pending.remove(&task.id);
            if let Some(err) = task.err() {
                tracing::debug!(
                    event = "bloom_gateway.worker.task_cancelled",
                    worker = %self.id,
                    task = %task.id,
                    "skipping cancelled task"
                );
                task.send_error(err);
                task.close();
                continue;
            }
            accepted.push(task);
        }

        let by_day = partition_tasks_by_day(accepted.iter().cloned());
        tracing::debug!(
            event = "bloom_gateway.worker.batch",
            worker = %self.id,
            tasks = accepted.len(),
            days = by_day.len(),
            "processing batch"
        );

        for (key, day_tasks) in &by_day {
            if let Err(err) = self.process_day(key, day_tasks, shutdown).await {
                tracing::warn!(
                    event = "bloom_gateway.worker.day_failed",
                    worker = %self.id,
                    tenant = %key.tenant,
                    day = %key.day,
                    tasks = day_tasks.len(),
                    error = %err,
                    "failed to process day"
                );
                for task in day_tasks {
                    task.send_error(err.clone());
                }
            }
        }

        for task in &accepted {
            task.close();
        }
        self.queue.release_requests(items);
        Ok(())
    }

    async fn process_day(
        &self,
        key: &DayKey,
        tasks: &[Arc<Task>],
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let tasks: Vec<Arc<Task>> = tasks
            .iter()
            .filter(|task| match task.err() {
                Some(err) => {
                    task.send_error(err);
                    false
                }
                None => true,
            })
            .cloned()
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }

        let (from, through) = day::day_interval(key.day);
        let started = Instant::now();
        let blocks = self.store.get_block_refs(&key.tenant, from, through).await;
        self.metrics
            .store_access_latency
            .with_label_values(&[self.id.as_str(), metrics::OP_GET_BLOCK_REFS])
            .observe(started.elapsed().as_secs_f64());
        let blocks = blocks.map_err(|err| {
            err.context(format!("get block refs for {} on {}", key.tenant, key.day))
        })?;

        if blocks.is_empty() {
            tracing::warn!(
                event = "bloom_gateway.worker.no_blocks",
                worker = %self.id,
                tenant = %key.tenant,
                day = %key.day,
                tasks = tasks.len(),
                "no blocks found for day"
            );
            for task in &tasks {
                for r in &task.request.refs {
                    task.send_output(Output::unfiltered(r.fingerprint));
                }
            }
            return Ok(());
        }

        for (task, refs) in uncovered_refs(&tasks, &blocks) {
            for r in refs {
                task.send_output(Output::unfiltered(r.fingerprint));
            }
        }

        let partitions = partition_fingerprint_range(&tasks, &blocks);
        tracing::debug!(
            event = "bloom_gateway.worker.day",
            worker = %self.id,
            tenant = %key.tenant,
            day = %key.day,
            tasks = tasks.len(),
            blocks = blocks.len(),
            partitions = partitions.len(),
            "processing day"
        );
        self.process_blocks(key, &partitions, shutdown).await
    }

    async fn process_blocks(
        &self,
        key: &DayKey,
        partitions: &[BoundedTasks],
        shutdown: &CancellationToken,
    ) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        let refs: Vec<BlockRef> = partitions.iter().map(|p| p.block_ref.clone()).collect();

        let mut callback = |querier: &dyn BlockQuerier, bounds: FingerprintBounds| -> Result<()> {
            let partition = partitions
                .iter()
                .find(|p| p.block_ref.bounds == bounds)
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::Invariant,
                        anyhow!("no overlapping blocks for range {bounds}"),
                    )
                })?;
            self.process_block(key.day, querier, &partition.tasks, shutdown)
                .map_err(|err| err.context(format!("block {}", partition.block_ref)))
        };

        let started = Instant::now();
        let res = self.store.fetch(&key.tenant, &refs, &mut callback).await;
        self.metrics
            .store_access_latency
            .with_label_values(&[self.id.as_str(), metrics::OP_FETCH])
            .observe(started.elapsed().as_secs_f64());
        res
    }

    fn process_block(
        &self,
        day: NaiveDate,
        querier: &dyn BlockQuerier,
        tasks: &[BoundedTask],
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let schema = querier
            .schema()
            .map_err(|err| err.context("read block schema"))?;
        let tokenizer = NGramTokenizer::new(schema.ngram_len, schema.ngram_skip);

        // Only the cancelled tasks leave the block, the rest still run (DESIGN.md, decision 5).
        let live: Vec<BoundedTask> = tasks
            .iter()
            .filter(|bounded| match bounded.task.err() {
                Some(err) => {
                    bounded.task.send_error(err);
                    false
                }
                None => true,
            })
            .cloned()
            .collect();
        if live.is_empty() {
            return Ok(());
        }

        let requests = TaskMergeIterator::new(day, tokenizer, &live);
        let mut query = querier.fuse(request_stream(requests));

        if shutdown.is_cancelled() {
            return Err(Error::canceled().context(format!("worker {} shutting down", self.id)));
        }

        let started = Instant::now();
        let res = query.run();
        let status = if res.is_ok() {
            metrics::STATUS_SUCCESS
        } else {
            metrics::STATUS_FAILURE
        };
        self.metrics
            .bloom_query_latency
            .with_label_values(&[self.id.as_str(), status])
            .observe(started.elapsed().as_secs_f64());
        tracing::debug!(
            event = "bloom_gateway.worker.block_queried",
            worker = %self.id,
            day = %day,
            tasks = live.len(),
            status,
            "queried block"
        );
        res
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}
