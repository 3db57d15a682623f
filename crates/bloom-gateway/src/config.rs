use crate::worker::WorkerConfig;
use clap::Parser;
use std::time::Duration;

/// Bloom gateway worker pool configuration.
#[derive(Parser, Debug, Clone)]
pub struct GatewayConfig {
    /// Number of concurrent workers consuming the request queue.
    #[arg(long, env = "BLOOM_GATEWAY_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Prefix of worker ids; workers are named `<prefix>-<n>`.
    #[arg(long, env = "BLOOM_GATEWAY_WORKER_PREFIX", default_value = "bloom-query-worker")]
    pub worker_prefix: String,

    /// Max tasks dequeued per batch.
    #[arg(long, env = "BLOOM_GATEWAY_WORKER_MAX_ITEMS", default_value_t = 100)]
    pub worker_max_items: usize,

    /// Max time a dequeue waits for tasks, in milliseconds.
    #[arg(long, env = "BLOOM_GATEWAY_WORKER_MAX_WAIT_MS", default_value_t = 100)]
    pub worker_max_wait_ms: u64,

    #[arg(long, env = "BLOOM_GATEWAY_METRICS_NAMESPACE", default_value = "loki")]
    pub metrics_namespace: String,

    #[arg(
        long,
        env = "BLOOM_GATEWAY_METRICS_SUBSYSTEM",
        default_value = "bloom_gateway"
    )]
    pub metrics_subsystem: String,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["bloom-gateway"]))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_wait_time: Duration::from_millis(self.worker_max_wait_ms),
            max_items: self.worker_max_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = GatewayConfig::parse_from(["bloom-gateway"]);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.worker_max_items, 100);
        assert_eq!(cfg.worker_config().max_wait_time, Duration::from_millis(100));
        assert_eq!(cfg.metrics_namespace, "loki");
        assert_eq!(cfg.metrics_subsystem, "bloom_gateway");
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = GatewayConfig::parse_from([
            "bloom-gateway",
            "--workers",
            "2",
            "--worker-max-items",
            "8",
            "--worker-max-wait-ms",
            "250",
        ]);
        assert_eq!(cfg.workers, 2);
        let worker = cfg.worker_config();
        assert_eq!(worker.max_items, 8);
        assert_eq!(worker.max_wait_time, Duration::from_millis(250));
    }
}
