use clap::Parser;
use live_replay::{BroadcastConfig, CaptionConfig, DecodeRetryConfig, PacingConfig, RetryConfig};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "replay-broadcaster")]
#[command(about = "Replays recordings into a live ingest endpoint as one continuous stream", long_about = None)]
pub struct Config {
	/// Live ingest endpoint, e.g. rtmp://host/app/key
	#[arg(long, env = "REPLAY_DESTINATION")]
	pub destination: String,

	/// Output container format
	#[arg(long, env = "REPLAY_FORMAT", default_value = "flv")]
	pub format: String,

	/// Capacity of the time-ordered packet buffer
	#[arg(long, env = "REPLAY_BUFFER_SIZE", default_value = "600")]
	pub buffer_size: usize,

	/// Lateness in seconds that is written without complaint
	#[arg(long, env = "REPLAY_LATE_TOLERANCE", default_value = "0.1")]
	pub late_tolerance_secs: f64,

	/// Lateness in seconds after which pacing is re-anchored
	#[arg(long, env = "REPLAY_DESYNC_THRESHOLD", default_value = "5.0")]
	pub desync_threshold_secs: f64,

	/// Output reopen attempts after a write fault
	#[arg(long, env = "REPLAY_OUTPUT_RETRIES", default_value = "3")]
	pub output_retries: u32,

	/// Delay between output reopen attempts, in milliseconds
	#[arg(long, env = "REPLAY_OUTPUT_RETRY_DELAY_MS", default_value = "1000")]
	pub output_retry_delay_ms: u64,

	/// Source reopen attempts after a decode fault
	#[arg(long, env = "REPLAY_DECODE_RETRIES", default_value = "3")]
	pub decode_retries: u32,

	/// Delay between source reopen attempts, in milliseconds
	#[arg(long, env = "REPLAY_DECODE_RETRY_DELAY_MS", default_value = "2000")]
	pub decode_retry_delay_ms: u64,

	/// Health check period of the broadcast watchdog, in milliseconds
	#[arg(long, env = "REPLAY_WATCHDOG_INTERVAL_MS", default_value = "500")]
	pub watchdog_interval_ms: u64,

	/// Timeout for source reachability probes, in seconds
	#[arg(long, env = "REPLAY_PROBE_TIMEOUT", default_value = "10")]
	pub probe_timeout_secs: u64,

	/// Caption document (path or http(s) URL) used when a play command names none
	#[arg(long, env = "REPLAY_CAPTIONS")]
	pub captions: Option<String>,

	/// File the caption window is written to; captions are logged when unset
	#[arg(long, env = "REPLAY_CAPTION_FILE")]
	pub caption_file: Option<PathBuf>,

	/// Lines shown in the caption window
	#[arg(long, env = "REPLAY_CAPTION_TOTAL", default_value = "20")]
	pub caption_total: usize,

	/// Fresh lines admitted per caption update
	#[arg(long, env = "REPLAY_CAPTION_UPDATE", default_value = "5")]
	pub caption_update: usize,

	/// Seconds between caption updates
	#[arg(long, env = "REPLAY_CAPTION_INTERVAL", default_value = "3.0")]
	pub caption_interval_secs: f64,

	/// Reuse displaced lines to pad short updates (0 disables)
	#[arg(long, env = "REPLAY_CAPTION_BUFFER_TIME", default_value = "5.0")]
	pub caption_buffer_time: f64,

	/// Sources played in order at startup
	#[arg(long, env = "REPLAY_PLAYLIST", value_delimiter = ',')]
	pub playlist: Vec<String>,

	/// Passes over the last playlist entry and over commands without a count (-1 loops forever)
	#[arg(long, env = "REPLAY_LOOPS", default_value = "-1", allow_hyphen_values = true)]
	pub loops: i64,

	/// Use synthetic sources and discard the output instead of touching real media
	#[arg(long, env = "REPLAY_DRY_RUN")]
	pub dry_run: bool,
}

impl Config {
	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.loops == 0 {
			return Err("loops must not be 0".to_string());
		}

		if self.playlist.iter().any(|entry| entry.trim().is_empty()) {
			return Err("playlist entries must not be empty".to_string());
		}

		self.broadcast_config().validate().map_err(|e| e.to_string())?;
		self.caption_config().validate().map_err(|e| e.to_string())?;

		Ok(())
	}

	pub fn broadcast_config(&self) -> BroadcastConfig {
		BroadcastConfig {
			destination: self.destination.clone(),
			format: self.format.clone(),
			buffer_size: self.buffer_size,
			pacing: PacingConfig {
				late_tolerance_secs: self.late_tolerance_secs,
				desync_threshold_secs: self.desync_threshold_secs,
				..PacingConfig::default()
			},
			output_retry: RetryConfig {
				max_attempts: self.output_retries,
				delay_ms: self.output_retry_delay_ms,
			},
			decode_retry: DecodeRetryConfig {
				max_attempts: self.decode_retries,
				delay_ms: self.decode_retry_delay_ms,
				..DecodeRetryConfig::default()
			},
			watchdog_interval_ms: self.watchdog_interval_ms,
			probe_timeout_secs: self.probe_timeout_secs,
			..BroadcastConfig::default()
		}
	}

	pub fn caption_config(&self) -> CaptionConfig {
		CaptionConfig {
			total_count: self.caption_total,
			update_count: self.caption_update,
			update_interval_secs: self.caption_interval_secs,
			buffer_time: self.caption_buffer_time,
			..CaptionConfig::default()
		}
	}
}
