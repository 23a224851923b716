//! AIMD batch window
//!
//! Fast, clean flushes grow the window additively; slow or failing flushes
//! shrink it multiplicatively. Both knobs stay within the configured bounds.

use crate::config::SchedulerConfig;
use std::time::Duration;

/// Direction of the last adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Grew,
    Held,
    Shrunk,
}

#[derive(Debug, Clone)]
pub struct BatchWindow {
    size_threshold: usize,
    max_delay: Duration,
    min_size: usize,
    max_size: usize,
    min_delay: Duration,
    max_delay_bound: Duration,
    target_latency: Duration,
    increase_step: usize,
    decrease_factor: f64,
}

impl BatchWindow {
    /// Start at the smallest window and let fast flushes open it up
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            size_threshold: config.min_batch_size,
            max_delay: config.min_flush_delay(),
            min_size: config.min_batch_size,
            max_size: config.max_batch_size,
            min_delay: config.min_flush_delay(),
            max_delay_bound: config.max_flush_delay(),
            target_latency: config.target_flush_latency(),
            increase_step: config.increase_step,
            decrease_factor: config.decrease_factor,
        }
    }

    pub fn size_threshold(&self) -> usize {
        self.size_threshold
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Feed the outcome of a flush into the controller
    pub fn observe(&mut self, latency: Duration, failed: usize) -> Adjustment {
        if failed > 0 || latency > self.target_latency.saturating_mul(2) {
            self.shrink();
            Adjustment::Shrunk
        } else if latency <= self.target_latency {
            self.grow();
            Adjustment::Grew
        } else {
            Adjustment::Held
        }
    }

    fn grow(&mut self) {
        self.size_threshold = self
            .size_threshold
            .saturating_add(self.increase_step)
            .min(self.max_size);
        // delay grows by one minimum-delay unit per fast flush
        self.max_delay = self
            .max_delay
            .saturating_add(self.min_delay)
            .min(self.max_delay_bound);
    }

    fn shrink(&mut self) {
        let size = (self.size_threshold as f64 * self.decrease_factor).floor() as usize;
        self.size_threshold = size.max(self.min_size);
        self.max_delay = self
            .max_delay
            .mul_f64(self.decrease_factor)
            .max(self.min_delay);
    }
}
