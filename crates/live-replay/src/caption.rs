//! Time-gated caption overlay.
//!
//! A static list of timed captions is released in batches as playback advances and pushed
//! to an external text target as one newline-joined block.

mod scheduler;
mod sink;
mod source;
mod window;

pub use scheduler::{CaptionScheduler, CaptionStats, CaptionTiming};
pub use sink::{sink_fn, CaptionSink, RoundRobinSink};
pub use source::{load_events, parse_document, CaptionSource, PLACEHOLDER_TEXT};
pub use window::{CaptionWindow, Flush};

use crate::config::CaptionConfig;
use std::sync::Arc;

/// One caption and its offset from the start of the recording
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionEvent {
	pub offset_secs: f64,
	pub text: String,
}

impl CaptionEvent {
	pub fn new(offset_secs: f64, text: impl Into<String>) -> Self {
		Self {
			offset_secs,
			text: text.into(),
		}
	}
}

/// Captions to run alongside a playback request
#[derive(Clone)]
pub struct CaptionRequest {
	pub source: CaptionSource,
	pub sink: Arc<dyn CaptionSink>,
	pub config: CaptionConfig,
}

impl CaptionRequest {
	pub fn new(source: CaptionSource, sink: Arc<dyn CaptionSink>) -> Self {
		Self {
			source,
			sink,
			config: CaptionConfig::default(),
		}
	}

	#[must_use]
	pub fn with_config(mut self, config: CaptionConfig) -> Self {
		self.config = config;
		self
	}
}
