//! Sliding-window bundle admission
//!
//! The throttler tracks arrival times over a fixed window and admits a
//! bundle when the time since the last admitted one reaches the recent mean
//! inter-arrival divided by the ratio. At steady state the admitted rate
//! converges to ratio × arrival rate, independent of absolute load.

use crate::metrics;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Floor for the ratio divisor; a zero ratio throttles instead of dividing
/// by zero.
const RATIO_EPSILON: f64 = 1e-7;

/// Seconds since the Unix epoch, fractional.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct BundleThrottler {
    ratio: Option<f64>,
    window: Duration,
    handled: VecDeque<f64>,
    last_admitted: f64,
}

impl BundleThrottler {
    pub fn new(ratio: Option<f64>, window: Duration) -> Self {
        metrics::THROTTLE_RATIO.set(ratio.unwrap_or(-1.0));
        Self {
            ratio,
            window,
            handled: VecDeque::new(),
            last_admitted: 0.0,
        }
    }

    /// Change the ratio. Resets the window; None disables throttling and
    /// drops all state.
    pub fn set_ratio(&mut self, ratio: Option<f64>) {
        self.ratio = ratio;
        self.handled.clear();
        self.last_admitted = 0.0;
        metrics::THROTTLE_RATIO.set(ratio.unwrap_or(-1.0));
    }

    pub fn ratio(&self) -> Option<f64> {
        self.ratio
    }

    /// Record an arrival at `now` (seconds) and decide. Returns true when
    /// the bundle must be answered without tasks.
    pub fn update_and_check(&mut self, now: f64) -> bool {
        let Some(ratio) = self.ratio else {
            return false;
        };

        self.handled.push_back(now);
        let oldest_limit = now - self.window.as_secs_f64();
        while self.handled.front().is_some_and(|&t| t <= oldest_limit) {
            self.handled.pop_front();
        }

        let len = self.handled.len();
        if len <= 1 {
            // Start-up: a window of one admits even at ratio zero. The
            // single slipped bundle is harmless and keeps the decision
            // deterministic.
            return false;
        }

        let interval = (self.handled[len - 1] - self.handled[0]) / (len - 1) as f64;
        let should_throttle = now - self.last_admitted < interval / RATIO_EPSILON.max(ratio);
        if !should_throttle {
            self.last_admitted = now;
        }
        should_throttle
    }
}
