use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one broadcast: where the stream goes and how it is paced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
	/// Live ingest endpoint, e.g. `rtmp://host/app/key`
	pub destination: String,
	/// Output container format
	pub format: String,
	/// Capacity of the time-ordered packet buffer
	pub buffer_size: usize,
	pub pacing: PacingConfig,
	/// Reopen attempts after an output write fault
	pub output_retry: RetryConfig,
	pub decode_retry: DecodeRetryConfig,
	pub watchdog_interval_ms: u64,
	pub probe_timeout_secs: u64,
	/// Packets read ahead by the blocking demux thread
	pub demux_read_ahead: usize,
}

impl Default for BroadcastConfig {
	fn default() -> Self {
		Self {
			destination: String::new(),
			format: "flv".to_string(),
			buffer_size: 600,
			pacing: PacingConfig::default(),
			output_retry: RetryConfig::default(),
			decode_retry: DecodeRetryConfig::default(),
			watchdog_interval_ms: 500,
			probe_timeout_secs: 10,
			demux_read_ahead: 32,
		}
	}
}

impl BroadcastConfig {
	pub fn new(destination: impl Into<String>) -> Self {
		Self {
			destination: destination.into(),
			..Self::default()
		}
	}

	pub fn validate(&self) -> Result<()> {
		if self.destination.trim().is_empty() {
			return Err(Error::Config("destination must not be empty".to_string()));
		}
		if self.format.trim().is_empty() {
			return Err(Error::Config("format must not be empty".to_string()));
		}
		if self.buffer_size == 0 {
			return Err(Error::Config("buffer_size must be greater than 0".to_string()));
		}
		if self.watchdog_interval_ms == 0 {
			return Err(Error::Config("watchdog_interval_ms must be greater than 0".to_string()));
		}
		if self.demux_read_ahead == 0 {
			return Err(Error::Config("demux_read_ahead must be greater than 0".to_string()));
		}
		self.pacing.validate()
	}

	pub const fn watchdog_interval(&self) -> Duration {
		Duration::from_millis(self.watchdog_interval_ms)
	}

	pub const fn probe_timeout(&self) -> Duration {
		Duration::from_secs(self.probe_timeout_secs)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
	/// Lateness absorbed silently
	pub late_tolerance_secs: f64,
	/// Lateness past which the pacing clock is re-anchored
	pub desync_threshold_secs: f64,
	/// Poll period while waiting for output streams
	pub idle_poll_ms: u64,
}

impl Default for PacingConfig {
	fn default() -> Self {
		Self {
			late_tolerance_secs: 0.1,
			desync_threshold_secs: 5.0,
			idle_poll_ms: 100,
		}
	}
}

impl PacingConfig {
	pub fn validate(&self) -> Result<()> {
		if self.late_tolerance_secs.is_nan() || self.late_tolerance_secs < 0.0 {
			return Err(Error::Config("late_tolerance_secs must be non-negative".to_string()));
		}
		if self.desync_threshold_secs.is_nan() || self.desync_threshold_secs <= self.late_tolerance_secs {
			return Err(Error::Config("desync_threshold_secs must exceed late_tolerance_secs".to_string()));
		}
		if self.idle_poll_ms == 0 {
			return Err(Error::Config("idle_poll_ms must be greater than 0".to_string()));
		}
		Ok(())
	}

	pub const fn idle_poll(&self) -> Duration {
		Duration::from_millis(self.idle_poll_ms)
	}
}

/// Retry budget for decode faults in the middle of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeRetryConfig {
	pub max_attempts: u32,
	pub delay_ms: u64,
	/// Packets a pass must have processed before a fault is considered worth retrying
	pub min_packets: usize,
}

impl Default for DecodeRetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			delay_ms: 2000,
			min_packets: 60,
		}
	}
}

impl From<&DecodeRetryConfig> for RetryConfig {
	fn from(config: &DecodeRetryConfig) -> Self {
		Self {
			max_attempts: config.max_attempts,
			delay_ms: config.delay_ms,
		}
	}
}

/// Caption batching and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
	/// Capacity of the displayed window
	pub total_count: usize,
	/// Fresh entries admitted per round
	pub update_count: usize,
	pub update_interval_secs: f64,
	/// Anything above zero keeps displaced entries around to pad short rounds
	pub buffer_time: f64,
	pub watchdog_period_secs: f64,
	/// Identical clock samples in a row that mark playback as stalled
	pub stall_samples: usize,
	pub fetch_timeout_secs: u64,
	pub max_bytes: usize,
}

impl Default for CaptionConfig {
	fn default() -> Self {
		Self {
			total_count: 20,
			update_count: 5,
			update_interval_secs: 3.0,
			buffer_time: 5.0,
			watchdog_period_secs: 20.0,
			stall_samples: 4,
			fetch_timeout_secs: 10,
			max_bytes: 20 << 20,
		}
	}
}

impl CaptionConfig {
	pub fn validate(&self) -> Result<()> {
		if !self.update_interval_secs.is_finite() || self.update_interval_secs < 0.0 {
			return Err(Error::Config("update_interval_secs must be a non-negative number".to_string()));
		}
		if !self.watchdog_period_secs.is_finite() || self.watchdog_period_secs <= 0.0 {
			return Err(Error::Config("watchdog_period_secs must be greater than 0".to_string()));
		}
		if self.stall_samples == 0 {
			return Err(Error::Config("stall_samples must be at least 1".to_string()));
		}
		if self.max_bytes == 0 {
			return Err(Error::Config("max_bytes must be greater than 0".to_string()));
		}
		Ok(())
	}

	/// Per-round quota, never larger than the window itself
	pub fn effective_update_count(&self) -> usize {
		self.update_count.min(self.total_count)
	}

	pub fn stale_reserve_enabled(&self) -> bool {
		self.buffer_time > 0.0
	}

	pub fn update_interval(&self) -> Duration {
		Duration::from_secs_f64(self.update_interval_secs)
	}

	pub fn watchdog_period(&self) -> Duration {
		Duration::from_secs_f64(self.watchdog_period_secs)
	}

	pub const fn fetch_timeout(&self) -> Duration {
		Duration::from_secs(self.fetch_timeout_secs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_live_settings() {
		let config = BroadcastConfig::new("rtmp://localhost/live/key");
		assert_eq!(config.format, "flv");
		assert_eq!(config.buffer_size, 600);
		assert_eq!(config.decode_retry.min_packets, 60);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn empty_destination_is_rejected() {
		assert!(matches!(BroadcastConfig::default().validate(), Err(Error::Config(_))));
	}

	#[test]
	fn desync_threshold_must_exceed_tolerance() {
		let pacing = PacingConfig {
			late_tolerance_secs: 1.0,
			desync_threshold_secs: 0.5,
			idle_poll_ms: 100,
		};
		assert!(pacing.validate().is_err());
	}

	#[test]
	fn update_count_is_clamped_to_window() {
		let config = CaptionConfig {
			total_count: 3,
			update_count: 10,
			..CaptionConfig::default()
		};
		assert_eq!(config.effective_update_count(), 3);
	}

	#[test]
	fn stale_reserve_follows_buffer_time() {
		let mut config = CaptionConfig::default();
		assert!(config.stale_reserve_enabled());
		config.buffer_time = 0.0;
		assert!(!config.stale_reserve_enabled());
	}

	#[test]
	fn partial_json_fills_defaults() {
		let config: CaptionConfig = serde_json::from_str(r#"{"total_count": 8, "update_interval_secs": 1.5}"#).unwrap();
		assert_eq!(config.total_count, 8);
		assert_eq!(config.update_count, 5);
		assert!((config.update_interval_secs - 1.5).abs() < f64::EPSILON);
	}
}
