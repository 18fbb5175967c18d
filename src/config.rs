//! Frontend server configuration

use std::time::Duration;

/// Maximum tasks an agent may hold at once (drain ceiling per bundle).
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 50;

/// Task lease duration while a drained batch is in flight (seconds).
pub const DEFAULT_MESSAGE_EXPIRY_SECS: u64 = 120;

/// Egress latency budget: if ingest alone took longer than this, the
/// agent has likely timed out and retransmitted, so draining is skipped.
pub const DEFAULT_MAX_RETRANSMISSION_SECS: u64 = 10;

/// Sliding window over which the bundle throttler averages arrivals (seconds).
pub const DEFAULT_THROTTLE_AVERAGE_INTERVAL_SECS: u64 = 60;

/// Lower bound on worker threads for deferred well-known flow work.
pub const MIN_WORKER_THREADS: usize = 2;

#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Upper bound on tasks handed to one agent per exchange.
    pub max_queue_size: usize,
    /// Lease duration applied when tasks are drained for an agent.
    pub message_expiry_time: Duration,
    /// Egress latency budget measured from the end of parcel decoding.
    pub max_retransmission_time: Duration,
    /// Worker threads for deferred flow work. Clamped to MIN_WORKER_THREADS.
    pub threadpool_size: usize,
    /// Well-known flows active on this node (allowlist by handler name).
    pub well_known_flows: Vec<String>,
    /// Sliding window for the bundle throttler.
    pub throttle_average_interval: Duration,
    /// Admission ratio in (0, 1]. None disables bundle throttling.
    pub throttle_ratio: Option<f64>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            message_expiry_time: Duration::from_secs(DEFAULT_MESSAGE_EXPIRY_SECS),
            max_retransmission_time: Duration::from_secs(DEFAULT_MAX_RETRANSMISSION_SECS),
            threadpool_size: MIN_WORKER_THREADS,
            well_known_flows: Vec::new(),
            throttle_average_interval: Duration::from_secs(
                DEFAULT_THROTTLE_AVERAGE_INTERVAL_SECS,
            ),
            throttle_ratio: None,
        }
    }
}

impl FrontendConfig {
    /// Effective worker thread count.
    pub fn worker_threads(&self) -> usize {
        self.threadpool_size.max(MIN_WORKER_THREADS)
    }
}
