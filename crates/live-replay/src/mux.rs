//! Wall-clock paced multiplexing.

use crate::buffer::{BufferedEntry, TimeOrderedBuffer};
use crate::config::PacingConfig;
use crate::error::{Error, MediaError, Result};
use crate::media::Packet;
use crate::output::{lock_output, SharedOutput};
use crate::retry::{RetryConfig, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decode time of the entry most recently handed to the output container
pub type PlaybackClock = watch::Receiver<Option<f64>>;

/// What pacing decided for one entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pace {
	Wait(f64),
	OnTime,
	Late(f64),
	Desync(f64),
}

/// Pacing anchor: wall time minus decode time of the entry that set it
#[derive(Debug)]
pub struct Pacer {
	origin: Instant,
	start: Option<f64>,
	config: PacingConfig,
}

impl Pacer {
	pub fn new(config: PacingConfig) -> Self {
		Self {
			origin: Instant::now(),
			start: None,
			config,
		}
	}

	fn now(&self) -> f64 {
		self.origin.elapsed().as_secs_f64()
	}

	pub fn reset(&mut self) {
		self.start = None;
	}

	pub const fn is_anchored(&self) -> bool {
		self.start.is_some()
	}

	pub fn pace(&mut self, decode_time: f64) -> Pace {
		let now = self.now();
		let start = *self.start.get_or_insert(now - decode_time);
		let wait = start + decode_time - now;

		if wait > 0.0 {
			Pace::Wait(wait)
		} else if wait < -self.config.desync_threshold_secs {
			self.start = None;
			Pace::Desync(wait)
		} else if wait < -self.config.late_tolerance_secs {
			Pace::Late(wait)
		} else {
			Pace::OnTime
		}
	}
}

/// Keeps output decode times non-decreasing across every kind
#[derive(Debug, Default)]
struct WriteOrder {
	last: Option<f64>,
}

impl WriteOrder {
	fn admit(&mut self, decode_time: f64) -> bool {
		if self.last.is_some_and(|last| decode_time < last) {
			return false;
		}
		self.last = Some(decode_time);
		true
	}
}

pub struct PacedMuxer {
	buffer: Arc<TimeOrderedBuffer>,
	output: SharedOutput,
	generation: watch::Receiver<u64>,
	clock: watch::Sender<Option<f64>>,
	pacing: PacingConfig,
	reopen: RetryConfig,
}

impl PacedMuxer {
	pub fn new(buffer: Arc<TimeOrderedBuffer>, output: SharedOutput, pacing: PacingConfig, reopen: RetryConfig) -> Self {
		let (clock, _) = watch::channel(None);
		let generation = lock_output(&output).subscribe();
		Self {
			buffer,
			output,
			generation,
			clock,
			pacing,
			reopen,
		}
	}

	pub fn clock(&self) -> PlaybackClock {
		self.clock.subscribe()
	}

	pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
		tokio::spawn(self.run(cancel))
	}

	/// Runs until cancelled; an error means the output could not be recovered
	pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
		if !self.wait_for_streams(&cancel).await {
			return Ok(());
		}
		info!("🎬 Output streams ready, pacing started");

		let mut pacer = Pacer::new(self.pacing.clone());
		let mut order = WriteOrder::default();
		self.generation.borrow_and_update();

		loop {
			let entry = tokio::select! {
				() = cancel.cancelled() => break,
				entry = self.buffer.pop() => entry,
			};
			if !order.admit(entry.decode_time) {
				warn!(kind = %entry.kind, decode_time = entry.decode_time, last = order.last, "⚠️ Entry behind the output timeline, dropping");
				continue;
			}

			if self.generation.has_changed().unwrap_or(false) {
				debug!(generation = *self.generation.borrow_and_update(), "Output replaced, re-anchoring pacing");
				pacer.reset();
			}

			match pacer.pace(entry.decode_time) {
				Pace::Wait(wait) => {
					tokio::select! {
						() = cancel.cancelled() => break,
						() = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
					}
				}
				Pace::OnTime => {}
				Pace::Late(wait) => warn!(decode_time = entry.decode_time, late = -wait, "⏱️ Muxing behind schedule"),
				Pace::Desync(wait) => error!(decode_time = entry.decode_time, late = -wait, "❌ Pacing desynchronized, re-anchoring clock"),
			}

			self.clock.send_replace(Some(entry.decode_time));
			if self.write(entry).await? {
				pacer.reset();
				self.generation.borrow_and_update();
			}
		}

		info!("🛑 Muxer stopped");
		Ok(())
	}

	async fn wait_for_streams(&self, cancel: &CancellationToken) -> bool {
		loop {
			if *self.generation.borrow() > 0 {
				return true;
			}
			tokio::select! {
				() = cancel.cancelled() => return false,
				() = tokio::time::sleep(self.pacing.idle_poll()) => {}
			}
		}
	}

	/// Writes one entry; returns true when the output had to be reopened
	async fn write(&self, entry: BufferedEntry) -> Result<bool> {
		let retry = entry.packet.clone();
		match self.blocking_write(entry.packet).await? {
			Ok(()) => Ok(false),
			Err(e) => {
				error!(error = %e, decode_time = entry.decode_time, "❌ Output write failed, reopening");
				self.recover(retry).await?;
				Ok(true)
			}
		}
	}

	async fn blocking_write(&self, packet: Packet) -> Result<std::result::Result<(), MediaError>> {
		let output = Arc::clone(&self.output);
		Ok(tokio::task::spawn_blocking(move || lock_output(&output).write(packet)).await?)
	}

	async fn recover(&self, packet: Packet) -> Result<()> {
		let mut policy = RetryPolicy::new(self.reopen.clone());
		loop {
			let output = Arc::clone(&self.output);
			match tokio::task::spawn_blocking(move || lock_output(&output).reopen()).await? {
				Ok(()) => break,
				Err(e) => {
					let Some(delay) = policy.next_delay() else {
						error!(error = %e, attempts = policy.attempts(), "❌ Output could not be reopened");
						return Err(Error::Media(e));
					};
					warn!(error = %e, attempt = policy.attempts(), max_attempts = policy.max_attempts(), "⚠️ Output reopen failed, retrying");
					tokio::time::sleep(delay).await;
				}
			}
		}

		if let Err(e) = self.blocking_write(packet).await? {
			warn!(error = %e, "⚠️ Dropping packet after reopen");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn entries_behind_the_last_write_are_refused() {
		let mut order = WriteOrder::default();
		assert!(order.admit(1.0));
		assert!(order.admit(1.0));
		assert!(!order.admit(0.98));
		assert!(order.admit(1.02));
		assert_eq!(order.last, Some(1.02));
	}

	#[tokio::test(start_paused = true)]
	async fn pacer_waits_until_due() {
		let mut pacer = Pacer::new(PacingConfig::default());
		assert_eq!(pacer.pace(10.0), Pace::OnTime);
		assert!(matches!(pacer.pace(11.0), Pace::Wait(w) if (w - 1.0).abs() < 1e-6));
	}

	#[tokio::test(start_paused = true)]
	async fn pacer_tolerates_small_lateness() {
		let mut pacer = Pacer::new(PacingConfig::default());
		pacer.pace(0.0);
		tokio::time::advance(Duration::from_millis(1050)).await;
		assert_eq!(pacer.pace(1.0), Pace::OnTime);
		tokio::time::advance(Duration::from_millis(500)).await;
		assert!(matches!(pacer.pace(1.2), Pace::Late(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn desync_reanchors_on_next_entry() {
		let mut pacer = Pacer::new(PacingConfig::default());
		pacer.pace(0.0);
		tokio::time::advance(Duration::from_secs(7)).await;

		assert!(matches!(pacer.pace(1.0), Pace::Desync(_)));
		assert!(!pacer.is_anchored());
		assert_eq!(pacer.pace(1.04), Pace::OnTime);
		assert!(matches!(pacer.pace(2.04), Pace::Wait(w) if (w - 1.0).abs() < 1e-6));
	}
}
