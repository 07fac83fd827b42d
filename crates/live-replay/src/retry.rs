use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub delay_ms: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self { max_attempts: 3, delay_ms: 1000 }
	}
}

impl RetryConfig {
	pub const fn delay(&self) -> Duration {
		Duration::from_millis(self.delay_ms)
	}
}

/// Fixed-delay retry budget
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	config: RetryConfig,
	attempts: u32,
}

impl RetryPolicy {
	pub const fn new(config: RetryConfig) -> Self {
		Self { config, attempts: 0 }
	}

	/// Consumes one attempt, returning the delay to wait before it, or `None` once exhausted
	pub fn next_delay(&mut self) -> Option<Duration> {
		if self.attempts >= self.config.max_attempts {
			return None;
		}
		self.attempts += 1;
		Some(self.config.delay())
	}

	pub const fn attempts(&self) -> u32 {
		self.attempts
	}

	pub const fn max_attempts(&self) -> u32 {
		self.config.max_attempts
	}
}
