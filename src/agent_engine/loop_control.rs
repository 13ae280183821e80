use std::time::Duration;

use tokio::time::Instant;

use crate::config::{AgentConfig, RetryConfig};

/// Step and wall-clock bounds for one run.
pub struct LoopController {
    max_steps: u32,
    step_count: u32,
    deadline: Option<Instant>,
}

impl LoopController {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            step_count: 0,
            deadline: config
                .max_duration_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        }
    }

    /// Starts the next iteration; `false` once the step budget is spent.
    pub fn begin_step(&mut self) -> bool {
        if self.step_count >= self.max_steps {
            return false;
        }
        self.step_count += 1;
        true
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Exponential backoff for transient model failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
