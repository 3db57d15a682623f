use anyhow::Context;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILURE: &str = "failure";

pub const OP_GET_BLOCK_REFS: &str = "get_block_refs";
pub const OP_FETCH: &str = "fetch";

/// Worker metrics, shared by every worker of a pool and labelled by worker id.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub(crate) dequeued_tasks: IntCounterVec,
    pub(crate) dequeue_errors: IntCounterVec,
    pub(crate) dequeue_wait_time: HistogramVec,
    pub(crate) store_access_latency: HistogramVec,
    pub(crate) bloom_query_latency: HistogramVec,
}

impl WorkerMetrics {
    pub fn new(registry: &Registry, namespace: &str, subsystem: &str) -> anyhow::Result<Self> {
        let labels = ["worker"];

        let dequeued_tasks = IntCounterVec::new(
            Opts::new(
                "dequeued_tasks_total",
                "Total amount of tasks that the worker dequeued from the bloom query queue",
            )
            .namespace(namespace)
            .subsystem(subsystem),
            &labels,
        )
        .context("create dequeued_tasks_total")?;

        let dequeue_errors = IntCounterVec::new(
            Opts::new("dequeue_errors_total", "Total amount of failed dequeue operations")
                .namespace(namespace)
                .subsystem(subsystem),
            &labels,
        )
        .context("create dequeue_errors_total")?;

        let dequeue_wait_time = HistogramVec::new(
            HistogramOpts::new(
                "dequeue_wait_time_seconds",
                "Time spent waiting for dequeuing tasks from queue",
            )
            .namespace(namespace)
            .subsystem(subsystem),
            &labels,
        )
        .context("create dequeue_wait_time_seconds")?;

        let bloom_query_latency = HistogramVec::new(
            HistogramOpts::new(
                "bloom_query_latency_seconds",
                "Latency in seconds of processing bloom blocks",
            )
            .namespace(namespace)
            .subsystem(subsystem),
            &["worker", "status"],
        )
        .context("create bloom_query_latency_seconds")?;

        let store_access_latency = HistogramVec::new(
            HistogramOpts::new(
                "store_latency_seconds",
                "Latency in seconds of accessing the bloom store component",
            )
            .namespace(namespace)
            .subsystem(subsystem),
            &["worker", "operation"],
        )
        .context("create store_latency_seconds")?;

        registry
            .register(Box::new(dequeued_tasks.clone()))
            .context("register dequeued_tasks_total")?;
        registry
            .register(Box::new(dequeue_errors.clone()))
            .context("register dequeue_errors_total")?;
        registry
            .register(Box::new(dequeue_wait_time.clone()))
            .context("register dequeue_wait_time_seconds")?;
        registry
            .register(Box::new(bloom_query_latency.clone()))
            .context("register bloom_query_latency_seconds")?;
        registry
            .register(Box::new(store_access_latency.clone()))
            .context("register store_latency_seconds")?;

        Ok(Self {
            dequeued_tasks,
            dequeue_errors,
            dequeue_wait_time,
            store_access_latency,
            bloom_query_latency,
        })
    }
}
