//! The broadcast: one live output fed by a succession of playback sessions.

use crate::buffer::TimeOrderedBuffer;
use crate::caption::{CaptionStats, CaptionTiming};
use crate::config::BroadcastConfig;
use crate::error::{Error, Result};
use crate::media::MediaBackend;
use crate::mux::{PacedMuxer, PlaybackClock};
use crate::output::{lock_output, OutputSession, SharedOutput};
use crate::rebase::Rebaser;
use crate::session::{PlayRequest, Session, SessionContext, SessionPhase, SessionRegistry};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Handle on one accepted play request
#[derive(Debug, Clone)]
pub struct PlaybackTicket {
	id: u64,
	phase: watch::Receiver<SessionPhase>,
}

impl PlaybackTicket {
	pub const fn id(&self) -> u64 {
		self.id
	}

	pub fn phase(&self) -> SessionPhase {
		*self.phase.borrow()
	}

	/// Waits until the session reaches a phase accepted by `accept`, or its task is gone
	pub async fn wait_for(&mut self, accept: impl Fn(SessionPhase) -> bool) -> SessionPhase {
		let reached = self.phase.wait_for(|phase| accept(*phase)).await.map(|phase| *phase);
		reached.unwrap_or_else(|_| *self.phase.borrow())
	}

	/// Waits for the session to end, whichever way it ends
	pub async fn finished(&mut self) -> SessionPhase {
		self.wait_for(SessionPhase::is_terminal).await
	}
}

struct Inner {
	config: Arc<BroadcastConfig>,
	backend: Arc<dyn MediaBackend>,
	buffer: Arc<TimeOrderedBuffer>,
	rebaser: Arc<Mutex<Rebaser>>,
	output: SharedOutput,
	registry: Arc<SessionRegistry>,
	http: reqwest::Client,
	timing: CaptionTiming,
	cancel: CancellationToken,
	next_session: AtomicU64,
	muxer: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
	muxer_failed: AtomicBool,
	closed: AtomicBool,
}

impl Inner {
	fn muxer_alive(&self) -> bool {
		!self.cancel.is_cancelled() && self.muxer.lock().unwrap_or_else(PoisonError::into_inner).as_ref().is_some_and(|handle| !handle.is_finished())
	}

	fn take_finished_muxer(&self) -> Option<JoinHandle<Result<()>>> {
		let mut muxer = self.muxer.lock().unwrap_or_else(PoisonError::into_inner);
		if muxer.as_ref().is_some_and(JoinHandle::is_finished) {
			muxer.take()
		} else {
			None
		}
	}

	fn take_muxer(&self) -> Option<JoinHandle<Result<()>>> {
		self.muxer.lock().unwrap_or_else(PoisonError::into_inner).take()
	}

	fn context(&self) -> SessionContext {
		SessionContext {
			backend: Arc::clone(&self.backend),
			rebaser: Arc::clone(&self.rebaser),
			output: Arc::clone(&self.output),
			registry: Arc::clone(&self.registry),
			config: Arc::clone(&self.config),
			http: self.http.clone(),
			timing: self.timing.clone(),
		}
	}

	fn record_muxer_exit(&self, outcome: std::result::Result<Result<()>, tokio::task::JoinError>) {
		match outcome {
			Ok(Ok(())) => debug!("Muxer task ended"),
			Ok(Err(e)) => {
				error!(error = %e, "❌ Muxer failed, output is gone");
				self.muxer_failed.store(true, Ordering::SeqCst);
			}
			Err(e) => {
				error!(error = %e, "❌ Muxer task panicked");
				self.muxer_failed.store(true, Ordering::SeqCst);
			}
		}
	}

	/// Cancels every session and drains the buffer until their tasks have returned
	async fn stop_sessions(&self) {
		let (handles, captions) = self.registry.close();
		if let Some(captions) = captions {
			captions.cancel();
		}

		for mut handle in handles {
			loop {
				self.buffer.drain();
				tokio::select! {
					joined = &mut handle => {
						if let Err(e) = joined {
							warn!(error = %e, "⚠️ Session task ended abnormally");
						}
						break;
					}
					() = tokio::time::sleep(DRAIN_POLL) => {}
				}
			}
		}
		self.buffer.drain();
	}
}

/// A running broadcast.
///
/// `start` spawns the paced muxer and a watchdog; `play` queues a new playback session which
/// takes over as soon as its first packet is read. Dropping the broadcast cancels everything;
/// `close` does the same and waits for it.
pub struct Broadcast {
	inner: Arc<Inner>,
	watchdog: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Broadcast {
	/// Must be called from within a tokio runtime
	pub fn start(config: BroadcastConfig, backend: Arc<dyn MediaBackend>) -> Result<Self> {
		config.validate()?;
		let config = Arc::new(config);

		let buffer = Arc::new(TimeOrderedBuffer::new(config.buffer_size));
		let rebaser = Rebaser::new(Arc::clone(&buffer));
		let offset = rebaser.subscribe_offset();
		let output = OutputSession::new(Arc::clone(&backend), config.destination.clone(), config.format.clone()).shared();
		let muxer = PacedMuxer::new(Arc::clone(&buffer), Arc::clone(&output), config.pacing.clone(), config.output_retry.clone());
		let timing = CaptionTiming { offset, clock: muxer.clock() };

		let cancel = CancellationToken::new();
		let muxer = muxer.spawn(cancel.child_token());
		let http = reqwest::Client::builder().build()?;

		let inner = Arc::new(Inner {
			config: Arc::clone(&config),
			backend,
			buffer,
			rebaser: Arc::new(Mutex::new(rebaser)),
			output,
			registry: Arc::new(SessionRegistry::default()),
			http,
			timing,
			cancel,
			next_session: AtomicU64::new(0),
			muxer: std::sync::Mutex::new(Some(muxer)),
			muxer_failed: AtomicBool::new(false),
			closed: AtomicBool::new(false),
		});
		let watchdog = tokio::spawn(watchdog(Arc::clone(&inner)));

		info!(destination = %config.destination, format = %config.format, buffer_size = config.buffer_size, "📡 Broadcast started");
		Ok(Self {
			inner,
			watchdog: std::sync::Mutex::new(Some(watchdog)),
		})
	}

	/// Queues a playback session. The current playback keeps going until the new source has
	/// produced its first packet; a request that never gets that far leaves it untouched.
	pub fn play(&self, request: PlayRequest) -> Result<PlaybackTicket> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(Error::Closed);
		}
		if !self.inner.muxer_alive() {
			request.progress.finish(format!("playback failed: {}", Error::MuxerDead));
			return Err(Error::MuxerDead);
		}
		if let Err(e) = request.validate() {
			request.progress.finish(format!("playback failed: {e}"));
			return Err(e);
		}

		let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
		let cancel = self.inner.cancel.child_token();
		self.inner.registry.insert(id, cancel.clone())?;

		let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
		let source = request.source.clone();
		let session = Session::new(id, request, self.inner.context(), cancel, phase_tx);
		self.inner.registry.attach(id, tokio::spawn(session.run()));

		info!(session = id, source = ?source, "📥 Playback requested");
		Ok(PlaybackTicket { id, phase: phase_rx })
	}

	/// Decode time of the packet most recently written to the output
	pub fn playback_clock(&self) -> PlaybackClock {
		self.inner.timing.clock.clone()
	}

	/// Offset applied to the current segment, once its leading keyframe is known
	pub fn segment_offset(&self) -> watch::Receiver<Option<f64>> {
		self.inner.timing.offset.clone()
	}

	/// The session currently feeding the output
	pub fn active_session(&self) -> Option<u64> {
		self.inner.registry.active_session()
	}

	/// Entries waiting in the time-ordered buffer
	pub fn buffered(&self) -> usize {
		self.inner.buffer.len()
	}

	pub fn caption_stats(&self) -> Option<CaptionStats> {
		self.inner.registry.caption_stats()
	}

	pub fn config(&self) -> &BroadcastConfig {
		&self.inner.config
	}

	pub fn is_muxer_alive(&self) -> bool {
		self.inner.muxer_alive()
	}

	/// Resolves once the broadcast has stopped, either closed or because the muxer died
	pub async fn terminated(&self) {
		self.inner.cancel.cancelled().await;
	}

	/// Stops every session, the muxer and the watchdog, then closes the output.
	/// Calling it again is a no-op. Fails if the muxer had died with an error.
	pub async fn close(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		info!("🛑 Closing broadcast");
		self.inner.cancel.cancel();

		let watchdog = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner).take();
		if let Some(watchdog) = watchdog {
			if let Err(e) = watchdog.await {
				warn!(error = %e, "⚠️ Watchdog ended abnormally");
			}
		}

		self.inner.stop_sessions().await;

		if let Some(muxer) = self.inner.take_muxer() {
			self.inner.record_muxer_exit(muxer.await);
		}

		let output = Arc::clone(&self.inner.output);
		tokio::task::spawn_blocking(move || lock_output(&output).close()).await?;
		info!("✅ Broadcast closed");

		if self.inner.muxer_failed.load(Ordering::SeqCst) {
			Err(Error::MuxerDead)
		} else {
			Ok(())
		}
	}
}

impl Drop for Broadcast {
	fn drop(&mut self) {
		self.inner.cancel.cancel();
	}
}

/// Reaps finished sessions and stops the broadcast if the muxer exits
async fn watchdog(inner: Arc<Inner>) {
	let mut ticker = tokio::time::interval(inner.config.watchdog_interval());
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			() = inner.cancel.cancelled() => break,
			_ = ticker.tick() => {}
		}

		for (id, handle) in inner.registry.reap_finished() {
			match handle.await {
				Ok(()) => info!(session = id, "🧹 Session task ended"),
				Err(e) => error!(session = id, error = %e, "❌ Session task panicked"),
			}
		}

		if let Some(muxer) = inner.take_finished_muxer() {
			inner.record_muxer_exit(muxer.await);
			error!("❌ Muxer exited, refusing further playback");
			inner.stop_sessions().await;
			inner.cancel.cancel();
			break;
		}
	}
	debug!("Watchdog stopped");
}
