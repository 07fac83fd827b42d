use super::source::load_events;
use super::window::{CaptionWindow, Flush};
use super::{CaptionEvent, CaptionRequest, CaptionSink, CaptionSource};
use crate::config::CaptionConfig;
use crate::error::CaptionError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The two clocks captions follow.
///
/// `offset` carries the segment offset once the leading keyframe is known (start time);
/// `clock` carries the decode time of the latest muxed packet (current time).
#[derive(Clone)]
pub struct CaptionTiming {
	pub offset: watch::Receiver<Option<f64>>,
	pub clock: watch::Receiver<Option<f64>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptionStats {
	pub runs: usize,
	pub delivered: usize,
	pub not_modified: usize,
	pub skipped: usize,
	pub shortfalls: usize,
	pub failures: usize,
}

struct Shared {
	source: CaptionSource,
	sink: Arc<dyn CaptionSink>,
	config: CaptionConfig,
	client: reqwest::Client,
	events: OnceCell<Arc<Vec<CaptionEvent>>>,
	stats: Mutex<CaptionStats>,
}

impl Shared {
	async fn events(&self) -> Arc<Vec<CaptionEvent>> {
		let events = self.events.get_or_init(|| async { Arc::new(load_events(&self.source, &self.client, &self.config).await) }).await;
		Arc::clone(events)
	}

	fn record(&self, f: impl FnOnce(&mut CaptionStats)) {
		f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
	}
}

/// Releases captions in rounds as playback advances.
///
/// Loading starts on construction. Each run waits for both clocks, then walks the events in
/// order; `restart` throws the run away and begins again with empty buffers. Dropping the
/// scheduler stops it.
pub struct CaptionScheduler {
	shared: Arc<Shared>,
	timing: CaptionTiming,
	root: CancellationToken,
	run: CancellationToken,
	task: Option<JoinHandle<()>>,
}

impl CaptionScheduler {
	pub fn new(request: CaptionRequest, timing: CaptionTiming, client: reqwest::Client) -> Self {
		let shared = Arc::new(Shared {
			source: request.source,
			sink: request.sink,
			config: request.config,
			client,
			events: OnceCell::new(),
			stats: Mutex::new(CaptionStats::default()),
		});
		let root = CancellationToken::new();

		// load off the critical path, well before playback reaches the first caption
		let loader = Arc::clone(&shared);
		let loader_cancel = root.clone();
		tokio::spawn(async move {
			tokio::select! {
				() = loader_cancel.cancelled() => {}
				_ = loader.events() => {}
			}
		});

		let run = root.child_token();
		let mut scheduler = Self {
			shared,
			timing,
			root,
			run,
			task: None,
		};
		scheduler.start_run();
		scheduler
	}

	fn start_run(&mut self) {
		self.run = self.root.child_token();

		// only clock values published from now on count for this run
		let mut offset = self.timing.offset.clone();
		offset.borrow_and_update();
		let mut clock = self.timing.clock.clone();
		clock.borrow_and_update();

		let config = &self.shared.config;
		let run = Run {
			name: self.shared.source.to_string(),
			window: CaptionWindow::new(config.total_count, config.effective_update_count(), config.stale_reserve_enabled()),
			shared: Arc::clone(&self.shared),
			offset,
			clock,
			start: None,
			current: watch::channel(None).0,
		};
		self.shared.record(|stats| stats.runs += 1);
		self.task = Some(tokio::spawn(run.execute(self.run.clone())));
	}

	/// Cancels the current run and starts over with cleared buffers and clocks
	pub fn restart(&mut self) {
		self.run.cancel();
		if self.root.is_cancelled() {
			return;
		}
		info!(source = %self.shared.source, "🔄 Restarting captions");
		self.start_run();
	}

	pub fn cancel(&self) {
		self.root.cancel();
	}

	pub fn is_running(&self) -> bool {
		self.task.as_ref().is_some_and(|task| !task.is_finished())
	}

	pub fn stats(&self) -> CaptionStats {
		*self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Drop for CaptionScheduler {
	fn drop(&mut self) {
		self.root.cancel();
	}
}

struct Run {
	name: String,
	window: CaptionWindow,
	shared: Arc<Shared>,
	offset: watch::Receiver<Option<f64>>,
	clock: watch::Receiver<Option<f64>>,
	start: Option<f64>,
	current: watch::Sender<Option<f64>>,
}

impl Run {
	async fn execute(mut self, cancel: CancellationToken) {
		// finishing the run also stops its watchdog
		let _guard = cancel.clone().drop_guard();
		let config = &self.shared.config;
		tokio::spawn(watchdog(self.current.subscribe(), cancel.clone(), config.watchdog_period(), config.stall_samples));

		let name = self.name.clone();
		tokio::select! {
			biased;
			() = cancel.cancelled() => info!(source = %name, "🛑 Caption run cancelled"),
			() = self.advance() => {}
		}
	}

	fn refresh(&mut self) {
		if self.offset.has_changed().unwrap_or(false) {
			if let Some(start) = *self.offset.borrow_and_update() {
				self.start = Some(start);
			}
		}
		if self.clock.has_changed().unwrap_or(false) {
			let current = *self.clock.borrow_and_update();
			if current.is_some() {
				self.current.send_replace(current);
			}
		}
	}

	fn elapsed(&self) -> Option<f64> {
		let current = (*self.current.borrow())?;
		Some(current - self.start?)
	}

	async fn advance(&mut self) {
		let events = self.shared.events().await;
		let interval = self.shared.config.update_interval();

		loop {
			self.refresh();
			if self.elapsed().is_some() {
				break;
			}
			debug!(source = %self.name, "Captions loaded, waiting for playback");
			tokio::time::sleep(interval).await;
		}
		info!(source = %self.name, start = self.start, "💬 Caption streaming started");

		let update_count = i64::try_from(self.window.update_count()).unwrap_or(i64::MAX);
		let mut quota = update_count;
		for event in events.iter() {
			while self.elapsed().is_some_and(|elapsed| event.offset_secs > elapsed) {
				self.deliver(quota).await;
				quota = update_count;
				tokio::time::sleep(interval).await;
				self.refresh();
			}
			self.window.admit(event, &mut quota);
		}
		self.deliver(quota).await;
		info!(source = %self.name, "✅ Caption run finished");
	}

	async fn deliver(&mut self, quota: i64) {
		let (text, shortfall) = match self.window.flush(quota) {
			Flush::Skipped => {
				warn!(source = %self.name, "⚠️ No new captions, skipping round");
				self.shared.record(|stats| stats.skipped += 1);
				return;
			}
			Flush::Deliver { text, shortfall } => (text, shortfall),
		};
		debug!(source = %self.name, shown = self.window.shown(), reserved = self.window.reserved(), "Caption round flushed");
		if shortfall > 0 {
			warn!(source = %self.name, shortfall, update_count = self.window.update_count(), "⚠️ Not enough captions to fill round");
			self.shared.record(|stats| stats.shortfalls += 1);
		}

		match self.shared.sink.deliver(text).await {
			Ok(()) => self.shared.record(|stats| stats.delivered += 1),
			Err(CaptionError::NotModified) => {
				debug!(source = %self.name, "Caption text not modified");
				self.shared.record(|stats| stats.not_modified += 1);
			}
			Err(e) => {
				error!(source = %self.name, error = %e, "❌ Caption delivery failed");
				self.shared.record(|stats| stats.failures += 1);
			}
		}
	}
}

/// Cancels the run once the playback clock has read the same value `samples` times in a row
async fn watchdog(current: watch::Receiver<Option<f64>>, cancel: CancellationToken, period: Duration, samples: usize) {
	let mut history = VecDeque::with_capacity(samples);
	loop {
		let sample = *current.borrow();
		if history.len() == samples {
			history.pop_front();
		}
		history.push_back(sample);
		if history.len() == samples && history.iter().all(|seen| *seen == sample) {
			error!(stalled_for = ?period.saturating_mul(u32::try_from(samples - 1).unwrap_or(u32::MAX)), "❌ Playback clock stalled, stopping captions");
			cancel.cancel();
			return;
		}

		tokio::select! {
			() = cancel.cancelled() => return,
			() = tokio::time::sleep(period) => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::caption::sink_fn;
	use pretty_assertions::assert_eq;

	struct Harness {
		scheduler: CaptionScheduler,
		offset: watch::Sender<Option<f64>>,
		clock: watch::Sender<Option<f64>>,
		delivered: Arc<Mutex<Vec<String>>>,
	}

	fn harness(events: &[(f64, &str)], config: CaptionConfig) -> Harness {
		let (offset, offset_rx) = watch::channel(None);
		let (clock, clock_rx) = watch::channel(None);
		let delivered = Arc::new(Mutex::new(Vec::new()));
		let sink = {
			let delivered = Arc::clone(&delivered);
			sink_fn(move |text: String| {
				let delivered = Arc::clone(&delivered);
				async move {
					delivered.lock().unwrap().push(text);
					Ok(())
				}
			})
		};
		let events = events.iter().map(|(t, text)| CaptionEvent::new(*t, *text)).collect();
		let request = CaptionRequest::new(CaptionSource::Events(events), sink).with_config(config);
		let timing = CaptionTiming { offset: offset_rx, clock: clock_rx };

		Harness {
			scheduler: CaptionScheduler::new(request, timing, reqwest::Client::new()),
			offset,
			clock,
			delivered,
		}
	}

	fn config(total_count: usize, update_count: usize) -> CaptionConfig {
		CaptionConfig {
			total_count,
			update_count,
			update_interval_secs: 1.0,
			..CaptionConfig::default()
		}
	}

	impl Harness {
		/// Clock starts at `base`, then advances 1s every second, half a second out of phase with the rounds
		async fn play(&self, base: f64, seconds: u32) {
			self.offset.send_replace(Some(base));
			self.clock.send_replace(Some(base));
			tokio::time::sleep(Duration::from_millis(500)).await;
			for step in 1..=seconds {
				self.clock.send_replace(Some(base + f64::from(step)));
				tokio::time::sleep(Duration::from_secs(1)).await;
			}
		}

		fn delivered(&self) -> Vec<String> {
			self.delivered.lock().unwrap().clone()
		}
	}

	#[tokio::test(start_paused = true)]
	async fn window_never_exceeds_total_count() {
		let h = harness(&[(0.5, "a"), (1.5, "b"), (2.5, "c"), (3.5, "d"), (4.5, "e")], config(3, 1));
		h.play(10.0, 5).await;

		let delivered = h.delivered();
		assert_eq!(delivered, vec!["a", "a\nb", "a\nb\nc", "b\nc\nd", "c\nd\ne"]);
		assert!(delivered.iter().all(|text| text.lines().count() <= 3));
		assert!(!h.scheduler.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn short_round_is_padded_from_reserve() {
		let h = harness(&[(0.1, "a"), (0.2, "b"), (0.3, "c"), (1.5, "d")], config(10, 2));
		h.play(0.0, 2).await;

		assert_eq!(h.delivered(), vec!["a\nb", "a\nb\nd\nc"]);
		assert_eq!(h.scheduler.stats().shortfalls, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn shortfall_is_recorded_without_reserve() {
		let mut config = config(10, 2);
		config.buffer_time = 0.0;
		let h = harness(&[(0.1, "a"), (0.2, "b"), (0.3, "c"), (1.5, "d")], config);
		h.play(0.0, 2).await;

		assert_eq!(h.delivered(), vec!["a\nb", "a\nb\nd"]);
		assert_eq!(h.scheduler.stats().shortfalls, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn waits_for_both_clocks() {
		let h = harness(&[(0.0, "a")], config(3, 1));
		h.clock.send_replace(Some(5.0));
		tokio::time::sleep(Duration::from_secs(5)).await;
		assert!(h.delivered().is_empty());

		h.offset.send_replace(Some(5.0));
		tokio::time::sleep(Duration::from_secs(2)).await;
		assert_eq!(h.delivered(), vec!["a"]);
	}

	#[tokio::test(start_paused = true)]
	async fn stalled_clock_stops_the_run() {
		let h = harness(&[(1000.0, "never")], config(3, 1));
		h.offset.send_replace(Some(0.0));
		h.clock.send_replace(Some(0.0));

		tokio::time::sleep(Duration::from_secs(59)).await;
		assert!(h.scheduler.is_running());
		tokio::time::sleep(Duration::from_secs(2)).await;
		assert!(!h.scheduler.is_running());
	}

	#[tokio::test(start_paused = true)]
	async fn restart_clears_window_and_clocks() {
		let mut h = harness(&[(0.5, "a"), (1.5, "b"), (2.5, "c")], config(3, 1));
		h.play(10.0, 2).await;
		assert_eq!(h.delivered(), vec!["a", "a\nb"]);

		h.scheduler.restart();
		h.delivered.lock().unwrap().clear();
		tokio::time::sleep(Duration::from_millis(3200)).await;
		assert!(h.delivered().is_empty(), "restarted run must wait for fresh clock values");

		h.play(20.0, 1).await;
		assert_eq!(h.delivered(), vec!["a"]);
		assert_eq!(h.scheduler.stats().runs, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn not_modified_counts_as_delivered() {
		let (offset, offset_rx) = watch::channel(None);
		let (clock, clock_rx) = watch::channel(None);
		let sink = sink_fn(|_text: String| async { Err(CaptionError::NotModified) });
		let request = CaptionRequest::new(CaptionSource::Events(vec![CaptionEvent::new(0.0, "same")]), sink).with_config(config(3, 1));
		let scheduler = CaptionScheduler::new(request, CaptionTiming { offset: offset_rx, clock: clock_rx }, reqwest::Client::new());

		offset.send_replace(Some(0.0));
		clock.send_replace(Some(1.0));
		tokio::time::sleep(Duration::from_secs(2)).await;

		let stats = scheduler.stats();
		assert_eq!(stats.not_modified, 1);
		assert_eq!(stats.failures, 0);
	}
}
