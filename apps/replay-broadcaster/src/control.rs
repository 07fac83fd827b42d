use crate::config::Config;
use live_replay::{Broadcast, CaptionConfig, CaptionRequest, CaptionSink, CaptionSource, PlayRequest, PlaybackTicket, Progress, ProgressReceiver, SessionPhase};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Play { source: String, loops: Option<i64>, captions: Option<String> },
	Status,
	Quit,
}

/// Parses one control line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
	let mut words = line.split_whitespace();
	let Some(verb) = words.next() else {
		return Ok(None);
	};

	let command = match verb.to_ascii_lowercase().as_str() {
		"play" => {
			let source = words.next().ok_or("usage: play <source> [loops] [captions]")?.to_string();
			let loops = words.next().map(|word| word.parse::<i64>().map_err(|_| format!("loops must be an integer, got {word:?}"))).transpose()?;
			let captions = words.next().map(str::to_string);
			if words.next().is_some() {
				return Err("usage: play <source> [loops] [captions]".to_string());
			}
			Command::Play { source, loops, captions }
		}
		"status" => Command::Status,
		"quit" | "exit" => Command::Quit,
		other => return Err(format!("unknown command {other:?}")),
	};
	Ok(Some(command))
}

/// Turns commands into play requests against the broadcast
#[derive(Clone)]
pub struct Controller {
	broadcast: Arc<Broadcast>,
	caption_sink: Arc<dyn CaptionSink>,
	caption_config: CaptionConfig,
	default_captions: Option<String>,
	default_loops: i64,
}

impl Controller {
	pub fn new(broadcast: Arc<Broadcast>, caption_sink: Arc<dyn CaptionSink>, config: &Config) -> Self {
		Self {
			broadcast,
			caption_sink,
			caption_config: config.caption_config(),
			default_captions: config.captions.clone(),
			default_loops: config.loops,
		}
	}

	pub fn play(&self, source: &str, loops: Option<i64>, captions: Option<&str>) -> live_replay::Result<PlaybackTicket> {
		let (progress, reports) = Progress::channel();
		let mut request = PlayRequest::new(source).with_loops(loops.unwrap_or(self.default_loops)).with_progress(progress);
		if let Some(location) = captions.or(self.default_captions.as_deref()) {
			let captions = CaptionRequest::new(CaptionSource::parse(location), Arc::clone(&self.caption_sink)).with_config(self.caption_config.clone());
			request = request.with_captions(captions);
		}

		let ticket = self.broadcast.play(request)?;
		tokio::spawn(report_progress(ticket.id(), source.to_string(), reports));
		Ok(ticket)
	}

	/// Plays each entry once in order; the last one follows the configured loop count
	pub async fn run_playlist(self, entries: Vec<String>, cancel: CancellationToken) {
		let last = entries.len().saturating_sub(1);
		for (index, entry) in entries.iter().enumerate() {
			let loops = if index == last { None } else { Some(1) };
			let mut ticket = match self.play(entry, loops, None) {
				Ok(ticket) => ticket,
				Err(e) => {
					error!(source = %entry, error = %e, "❌ Playlist stopped");
					return;
				}
			};

			let phase = tokio::select! {
				() = cancel.cancelled() => return,
				phase = ticket.finished() => phase,
			};
			if phase == SessionPhase::Failed {
				warn!(source = %entry, "⚠️ Playlist entry failed, moving on");
				continue;
			}
			if index != last {
				self.wait_for_drain(&cancel).await;
			}
		}
		info!(entries = entries.len(), "📜 Playlist queued");
	}

	/// Lets the muxer play out what is buffered so the next entry does not cut it short
	async fn wait_for_drain(&self, cancel: &CancellationToken) {
		while self.broadcast.buffered() > 0 {
			tokio::select! {
				() = cancel.cancelled() => return,
				() = tokio::time::sleep(DRAIN_POLL) => {}
			}
		}
	}

	fn log_status(&self) {
		let clock = *self.broadcast.playback_clock().borrow();
		info!(
			active_session = ?self.broadcast.active_session(),
			playback_clock = ?clock,
			buffered = self.broadcast.buffered(),
			muxer_alive = self.broadcast.is_muxer_alive(),
			captions = ?self.broadcast.caption_stats(),
			"📊 Status"
		);
	}

	/// Reads commands until `quit`; an exhausted stdin leaves the broadcast running
	pub async fn run_stdin(&self) -> anyhow::Result<()> {
		let mut lines = BufReader::new(tokio::io::stdin()).lines();
		info!("⌨️ Commands: play <source> [loops] [captions] | status | quit");

		while let Some(line) = lines.next_line().await? {
			match parse_command(&line) {
				Ok(None) => {}
				Ok(Some(Command::Quit)) => {
					info!("👋 Quit requested");
					return Ok(());
				}
				Ok(Some(Command::Status)) => self.log_status(),
				Ok(Some(Command::Play { source, loops, captions })) => match self.play(&source, loops, captions.as_deref()) {
					Ok(ticket) => info!(session = ticket.id(), source = %source, "📥 Play accepted"),
					Err(e) => error!(source = %source, error = %e, "❌ Play refused"),
				},
				Err(e) => warn!(error = %e, "⚠️ Unrecognised command"),
			}
		}

		info!("stdin closed, broadcast keeps running until a shutdown signal");
		std::future::pending::<()>().await;
		Ok(())
	}
}

async fn report_progress(session: u64, source: String, mut reports: ProgressReceiver) {
	while let Some(message) = reports.next().await {
		if message.is_final {
			info!(session, source = %source, "📣 {}", message.text);
		} else {
			info!(session, source = %source, "📝 {}", message.text);
		}
	}
}
