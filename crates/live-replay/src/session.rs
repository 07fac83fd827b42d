//! Playback sessions.
//!
//! One session per play request: probe the source, open it, and feed its packets through
//! the rebaser, looping as requested. A session only takes over the broadcast once its
//! first packet is in hand; until then the previous session keeps playing.

use crate::caption::{CaptionRequest, CaptionScheduler, CaptionStats, CaptionTiming};
use crate::config::BroadcastConfig;
use crate::error::{Error, MediaError, Result};
use crate::media::{MediaBackend, MediaInput, Packet, StreamDescriptor};
use crate::output::{lock_output, SharedOutput};
use crate::progress::Progress;
use crate::rebase::Rebaser;
use crate::retry::RetryPolicy;
use crate::source::{self, MediaSource};
use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	Idle,
	Probing,
	Opening,
	Streaming,
	Looping,
	Switching,
	Failed,
	Finished,
}

impl SessionPhase {
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Switching | Self::Failed | Self::Finished)
	}
}

/// What to play and how
#[derive(Clone)]
pub struct PlayRequest {
	pub source: MediaSource,
	/// Passes over the source; negative loops until replaced
	pub loop_count: i64,
	pub progress: Progress,
	pub captions: Option<CaptionRequest>,
}

impl PlayRequest {
	pub fn new(source: impl Into<MediaSource>) -> Self {
		Self {
			source: source.into(),
			loop_count: -1,
			progress: Progress::disabled(),
			captions: None,
		}
	}

	#[must_use]
	pub const fn with_loops(mut self, loop_count: i64) -> Self {
		self.loop_count = loop_count;
		self
	}

	#[must_use]
	pub fn with_progress(mut self, progress: Progress) -> Self {
		self.progress = progress;
		self
	}

	#[must_use]
	pub fn with_captions(mut self, captions: CaptionRequest) -> Self {
		self.captions = Some(captions);
		self
	}

	pub fn validate(&self) -> Result<()> {
		if self.loop_count == 0 {
			return Err(Error::InvalidRequest("loop_count must not be 0".to_string()));
		}
		if let MediaSource::Location(location) = &self.source {
			if location.trim().is_empty() {
				return Err(Error::InvalidRequest("source location is empty".to_string()));
			}
		}
		if let Some(captions) = &self.captions {
			captions.config.validate().map_err(|e| Error::InvalidRequest(e.to_string()))?;
		}
		Ok(())
	}
}

/// Everything a session shares with the broadcast
#[derive(Clone)]
pub(crate) struct SessionContext {
	pub backend: Arc<dyn MediaBackend>,
	pub rebaser: Arc<Mutex<Rebaser>>,
	pub output: SharedOutput,
	pub registry: Arc<SessionRegistry>,
	pub config: Arc<BroadcastConfig>,
	pub http: reqwest::Client,
	pub timing: CaptionTiming,
}

struct SessionSlot {
	cancel: CancellationToken,
	handle: Option<JoinHandle<()>>,
	started: bool,
}

#[derive(Default)]
struct RegistryState {
	sessions: BTreeMap<u64, SessionSlot>,
	captions: Option<(u64, CaptionScheduler)>,
	closed: bool,
}

impl RegistryState {
	fn check_activation(&self, id: u64) -> Result<()> {
		if self.closed {
			return Err(Error::Closed);
		}
		if self.sessions.range(id + 1..).any(|(_, slot)| slot.started) {
			return Err(Error::Superseded);
		}
		Ok(())
	}
}

/// Demux sessions in flight and the caption scheduler of the active one
#[derive(Default)]
pub(crate) struct SessionRegistry {
	state: std::sync::Mutex<RegistryState>,
}

impl SessionRegistry {
	fn lock(&self) -> MutexGuard<'_, RegistryState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub(crate) fn insert(&self, id: u64, cancel: CancellationToken) -> Result<()> {
		let mut state = self.lock();
		if state.closed {
			return Err(Error::Closed);
		}
		state.sessions.insert(id, SessionSlot { cancel, handle: None, started: false });
		Ok(())
	}

	pub(crate) fn attach(&self, id: u64, handle: JoinHandle<()>) {
		if let Some(slot) = self.lock().sessions.get_mut(&id) {
			slot.handle = Some(handle);
		}
	}

	/// Makes `id` the active session: older sessions are cancelled and handed back to be
	/// awaited, and the caption scheduler is swapped. Fails if a newer session already streams.
	pub(crate) fn activate(&self, id: u64, captions: Option<CaptionScheduler>) -> Result<Vec<JoinHandle<()>>> {
		let mut state = self.lock();
		state.check_activation(id)?;

		let older: Vec<u64> = state.sessions.range(..id).map(|(key, _)| *key).collect();
		let mut retired = Vec::with_capacity(older.len());
		for key in older {
			if let Some(slot) = state.sessions.remove(&key) {
				slot.cancel.cancel();
				retired.extend(slot.handle);
			}
		}
		if let Some(slot) = state.sessions.get_mut(&id) {
			slot.started = true;
		}

		if let Some((_, previous)) = state.captions.take() {
			previous.cancel();
		}
		state.captions = captions.map(|captions| (id, captions));
		Ok(retired)
	}

	/// Whether `id` could take over right now, without retiring anything
	pub(crate) fn ensure_activatable(&self, id: u64) -> Result<()> {
		self.lock().check_activation(id)
	}

	pub(crate) fn restart_captions(&self, id: u64) {
		if let Some((owner, captions)) = &mut self.lock().captions {
			if *owner == id {
				captions.restart();
			}
		}
	}

	pub(crate) fn caption_stats(&self) -> Option<CaptionStats> {
		self.lock().captions.as_ref().map(|(_, captions)| captions.stats())
	}

	pub(crate) fn active_session(&self) -> Option<u64> {
		self.lock().sessions.iter().rev().find(|(_, slot)| slot.started).map(|(id, _)| *id)
	}

	/// Removes sessions whose task has ended
	pub(crate) fn reap_finished(&self) -> Vec<(u64, JoinHandle<()>)> {
		let mut state = self.lock();
		let finished: Vec<u64> = state.sessions.iter().filter(|(_, slot)| slot.handle.as_ref().is_some_and(JoinHandle::is_finished)).map(|(id, _)| *id).collect();
		finished.into_iter().filter_map(|id| state.sessions.remove(&id).and_then(|slot| slot.handle.map(|handle| (id, handle)))).collect()
	}

	/// Refuses new sessions and hands back everything still running
	pub(crate) fn close(&self) -> (Vec<JoinHandle<()>>, Option<CaptionScheduler>) {
		let mut state = self.lock();
		state.closed = true;
		let handles = std::mem::take(&mut state.sessions)
			.into_values()
			.filter_map(|slot| {
				slot.cancel.cancel();
				slot.handle
			})
			.collect();
		(handles, state.captions.take().map(|(_, captions)| captions))
	}
}

enum Outcome {
	Finished,
	Cancelled,
}

enum PassEnd {
	Completed(usize),
	Cancelled,
}

struct PassFault {
	error: Error,
	processed: usize,
}

impl PassFault {
	fn new(error: impl Into<Error>, processed: usize) -> Self {
		Self { error: error.into(), processed }
	}
}

pub(crate) struct Session {
	id: u64,
	request: PlayRequest,
	ctx: SessionContext,
	cancel: CancellationToken,
	phase: watch::Sender<SessionPhase>,
	captions: Option<CaptionScheduler>,
	started: bool,
}

impl Session {
	pub(crate) const fn new(id: u64, request: PlayRequest, ctx: SessionContext, cancel: CancellationToken, phase: watch::Sender<SessionPhase>) -> Self {
		Self {
			id,
			request,
			ctx,
			cancel,
			phase,
			captions: None,
			started: false,
		}
	}

	fn set_phase(&self, phase: SessionPhase) {
		info!(session = self.id, ?phase, "🔀 Session phase");
		self.phase.send_replace(phase);
	}

	pub(crate) async fn run(mut self) {
		let progress = self.request.progress.clone();

		match self.drive().await {
			Ok(Outcome::Finished) => {
				info!(session = self.id, "✅ Playback finished");
				self.set_phase(SessionPhase::Finished);
			}
			Ok(Outcome::Cancelled) | Err(Error::Superseded | Error::Closed) => {
				info!(session = self.id, started = self.started, "⏭️ Playback replaced");
				self.set_phase(if self.started { SessionPhase::Switching } else { SessionPhase::Finished });
			}
			Err(e) => {
				if self.started {
					error!(session = self.id, error = %e, "❌ Playback aborted");
				} else {
					error!(session = self.id, error = %e, "❌ Playback failed, previous playback continues");
				}
				self.set_phase(SessionPhase::Failed);
				progress.finish(format!("playback failed: {e}"));
			}
		}
		progress.finish("no playback occurred");
	}

	async fn drive(&mut self) -> Result<Outcome> {
		self.set_phase(SessionPhase::Probing);
		if let Some(captions) = self.request.captions.take() {
			self.captions = Some(CaptionScheduler::new(captions, self.ctx.timing.clone(), self.ctx.http.clone()));
		}

		let cancel = self.cancel.clone();
		let location = tokio::select! {
			() = cancel.cancelled() => return Ok(Outcome::Cancelled),
			location = self.request.source.resolve() => location?,
		};
		let probe = tokio::select! {
			() = cancel.cancelled() => return Ok(Outcome::Cancelled),
			probe = source::probe(&location, &self.ctx.http, self.ctx.config.probe_timeout()) => probe,
		};
		match probe {
			Ok(()) => {}
			Err(e @ Error::SourceNotFound(_)) => {
				self.request.progress.finish("failed: not found");
				return Err(e);
			}
			Err(e) => return Err(e),
		}
		info!(session = self.id, location = %location, "🔎 Source found, opening");
		self.request.progress.add_message("found, opening", false);

		let mut remaining = self.request.loop_count;
		let mut retry = RetryPolicy::new((&self.ctx.config.decode_retry).into());
		while remaining != 0 {
			self.set_phase(if self.started { SessionPhase::Looping } else { SessionPhase::Opening });

			match self.stream_pass(&location).await {
				Ok(PassEnd::Completed(0)) => {
					warn!(session = self.id, location = %location, "⚠️ Pass produced no packets, stopping");
					break;
				}
				Ok(PassEnd::Completed(packets)) => {
					if remaining > 0 {
						remaining -= 1;
					}
					info!(session = self.id, packets, remaining, "🔁 Pass complete");
				}
				Ok(PassEnd::Cancelled) => return Ok(Outcome::Cancelled),
				Err(fault) => {
					let worth_retrying = fault.processed >= self.ctx.config.decode_retry.min_packets && fault.error.is_recoverable();
					let delay = if worth_retrying { retry.next_delay() } else { None };
					let Some(delay) = delay else {
						return Err(fault.error);
					};
					warn!(
						session = self.id,
						error = %fault.error,
						processed = fault.processed,
						attempt = retry.attempts(),
						max_attempts = retry.max_attempts(),
						"⚠️ Decode fault, reopening source"
					);
					tokio::select! {
						() = cancel.cancelled() => return Ok(Outcome::Cancelled),
						() = tokio::time::sleep(delay) => {}
					}
				}
			}
		}
		Ok(Outcome::Finished)
	}

	async fn stream_pass(&mut self, location: &str) -> std::result::Result<PassEnd, PassFault> {
		let backend = Arc::clone(&self.ctx.backend);
		let target = location.to_string();
		let input = tokio::task::spawn_blocking(move || backend.open_input(&target))
			.await
			.map_err(|e| PassFault::new(e, 0))?
			.map_err(|e| PassFault::new(e, 0))?;
		let descriptors = input.streams().to_vec();

		let (tx, mut rx) = mpsc::channel(self.ctx.config.demux_read_ahead);
		let reader = tokio::task::spawn_blocking(move || read_packets(input, &tx));

		let mut processed = 0;
		let mut leading = true;
		loop {
			let next = tokio::select! {
				() = self.cancel.cancelled() => return Ok(PassEnd::Cancelled),
				next = rx.recv() => next,
			};
			let packet = match next {
				None => break,
				Some(Err(e)) => return Err(PassFault::new(e, processed)),
				Some(Ok(packet)) => packet,
			};
			if packet.dts.is_none() {
				continue;
			}

			if leading {
				leading = false;
				if self.started {
					if !self.restart_segment().await {
						return Ok(PassEnd::Cancelled);
					}
				} else {
					self.begin_streaming(&descriptors).await.map_err(|e| PassFault::new(e, processed))?;
				}
			}

			let mut rebaser = self.ctx.rebaser.lock().await;
			// a newer session may have taken over while this one waited for the lock
			if self.cancel.is_cancelled() {
				return Ok(PassEnd::Cancelled);
			}
			rebaser.put(packet).await;
			drop(rebaser);
			processed += 1;

			tokio::task::yield_now().await;
			if self.cancel.is_cancelled() {
				return Ok(PassEnd::Cancelled);
			}
		}

		reader.await.map_err(|e| PassFault::new(e, processed))?;
		Ok(PassEnd::Completed(processed))
	}

	/// First packet of the session: take over the broadcast.
	///
	/// Every producer goes through the rebaser lock, so holding it keeps the previous session
	/// paused but intact while the output is prepared. It is only retired once that succeeded.
	async fn begin_streaming(&mut self, descriptors: &[StreamDescriptor]) -> Result<()> {
		let shared = Arc::clone(&self.ctx.rebaser);
		let mut rebaser = shared.lock().await;
		self.ctx.registry.ensure_activatable(self.id)?;
		self.prepare_output(descriptors).await?;

		let retired = self.ctx.registry.activate(self.id, self.captions.take())?;
		rebaser.switch(true);
		drop(rebaser);
		// clock values published by the previous session must not start these captions
		self.ctx.registry.restart_captions(self.id);
		for handle in retired {
			if let Err(e) = handle.await {
				warn!(session = self.id, error = %e, "⚠️ Previous session ended abnormally");
			}
		}

		self.started = true;
		self.set_phase(SessionPhase::Streaming);
		info!(session = self.id, "▶️ Playback started");
		self.request.progress.finish("playback started");
		Ok(())
	}

	async fn prepare_output(&self, descriptors: &[StreamDescriptor]) -> Result<()> {
		let output = Arc::clone(&self.ctx.output);
		let descriptors = descriptors.to_vec();
		tokio::task::spawn_blocking(move || -> std::result::Result<(), MediaError> {
			let mut output = lock_output(&output);
			if !output.has_streams() {
				output.register(&descriptors)
			} else if output.is_compatible(&descriptors) {
				Ok(())
			} else {
				output.rebuild(&descriptors)
			}
		})
		.await??;
		Ok(())
	}

	/// First packet of a later pass over the same source; false once a newer session took over
	async fn restart_segment(&mut self) -> bool {
		let mut rebaser = self.ctx.rebaser.lock().await;
		if self.cancel.is_cancelled() {
			return false;
		}
		rebaser.switch(false);
		drop(rebaser);
		self.ctx.registry.restart_captions(self.id);
		self.set_phase(SessionPhase::Streaming);
		true
	}
}

/// Blocking demux loop; stops at end of input, on the first error, or when the receiver is gone
fn read_packets(mut input: Box<dyn MediaInput>, tx: &mpsc::Sender<std::result::Result<Packet, MediaError>>) {
	loop {
		let next = match input.read_packet() {
			Ok(Some(packet)) => Ok(packet),
			Ok(None) => return,
			Err(e) => Err(e),
		};
		let failed = next.is_err();
		if tx.blocking_send(next).is_err() || failed {
			return;
		}
	}
}
