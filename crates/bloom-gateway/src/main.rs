use anyhow::Context;
use bloom_core::lite::{MemoryQueue, MemoryStore};
use bloom_gateway::{GatewayConfig, PendingTasks, WorkerMetrics, WorkerPool, WorkerPoolConfig};
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bloom_gateway=debug")),
        )
        .init();

    let cfg = GatewayConfig::parse();
    let registry = Registry::new();
    let metrics = WorkerMetrics::new(&registry, &cfg.metrics_namespace, &cfg.metrics_subsystem)
        .context("register worker metrics")?;

    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let pool = WorkerPool::start(
        WorkerPoolConfig::from(&cfg),
        queue.clone(),
        store,
        Arc::new(PendingTasks::default()),
        Arc::new(metrics),
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!(event = "bloom_gateway.shutdown", "bloom gateway shutting down");

    let res = pool.shutdown().await;
    queue.stop();

    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .context("encode metrics")?;
    tracing::debug!(
        event = "bloom_gateway.metrics",
        metrics = %String::from_utf8_lossy(&buf),
        "final metrics"
    );

    res
}
