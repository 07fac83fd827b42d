mod config;
mod control;
mod sink;

use anyhow::{anyhow, Result};
use clap::Parser;
use live_replay::media::memory::{MemoryBackend, SyntheticLayout};
use live_replay::{Broadcast, CaptionSink, MediaBackend};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use control::Controller;
use sink::{FileSink, LogSink};

#[tokio::main]
async fn main() -> Result<()> {
	// Load environment variables
	dotenvy::dotenv().ok();

	// Parse CLI arguments
	let config = Config::parse();
	config.validate().map_err(|e| anyhow!(e))?;

	init_tracing();

	info!(
		destination = %config.destination,
		format = %config.format,
		dry_run = config.dry_run,
		playlist = config.playlist.len(),
		"🎯 Starting replay broadcaster"
	);

	let backend = media_backend(&config)?;
	let broadcast = Arc::new(Broadcast::start(config.broadcast_config(), backend)?);

	let caption_sink: Arc<dyn CaptionSink> = match &config.caption_file {
		Some(path) => {
			info!(path = %path.display(), "💬 Captions go to file");
			Arc::new(FileSink::new(path))
		}
		None => Arc::new(LogSink),
	};
	let controller = Controller::new(Arc::clone(&broadcast), caption_sink, &config);

	let cancel = CancellationToken::new();
	let playlist = tokio::spawn(controller.clone().run_playlist(config.playlist.clone(), cancel.clone()));

	let outcome = tokio::select! {
		result = controller.run_stdin() => result,
		() = wait_for_shutdown_signal() => {
			info!("🛑 Shutdown signal received (SIGTERM/SIGINT)");
			Ok(())
		}
		() = broadcast.terminated() => Err(anyhow!("broadcast terminated, output could not be recovered")),
	};

	cancel.cancel();
	if let Err(e) = playlist.await {
		warn!(error = %e, "⚠️ Playlist task ended abnormally");
	}
	let closed = broadcast.close().await;

	let mut code = 0;
	if let Err(e) = outcome {
		error!(error = %e, "❌ Broadcaster stopping on error");
		code = 1;
	}
	if let Err(e) = closed {
		error!(error = %e, "❌ Broadcast did not close cleanly");
		code = 1;
	}

	// stdin may still be parked on a blocking read; exit without waiting for it
	info!(code, "✅ Exiting process");
	std::process::exit(code);
}

fn init_tracing() {
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "replay_broadcaster=info,live_replay=info".into()))
		.with(tracing_subscriber::fmt::layer().with_target(true))
		.init();
}

fn media_backend(config: &Config) -> Result<Arc<dyn MediaBackend>> {
	if config.dry_run {
		info!("🧪 Dry run: unknown sources play as synthetic clips, output is discarded");
		return Ok(Arc::new(MemoryBackend::new().with_synthetic_fallback(SyntheticLayout::default()).discarding_writes()));
	}
	ffmpeg_backend()
}

#[cfg(feature = "ffmpeg")]
fn ffmpeg_backend() -> Result<Arc<dyn MediaBackend>> {
	Ok(Arc::new(live_replay::media::ffmpeg::FfmpegBackend::new()?))
}

#[cfg(not(feature = "ffmpeg"))]
fn ffmpeg_backend() -> Result<Arc<dyn MediaBackend>> {
	Err(anyhow!("built without the ffmpeg feature; rebuild with --features ffmpeg or pass --dry-run"))
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			error!(error = %e, "Failed to install Ctrl+C handler");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			}
			Err(e) => {
				error!(error = %e, "Failed to install SIGTERM handler");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}
