use async_trait::async_trait;
use live_replay::{CaptionError, CaptionSink};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

/// Writes the caption window to a file for overlay tools that watch it.
///
/// Each update goes to a sibling temp file that is then renamed over the target, so
/// readers never see a half-written window.
pub struct FileSink {
	path: PathBuf,
	last: Mutex<Option<String>>,
}

impl FileSink {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			last: Mutex::new(None),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn temp_path(&self) -> PathBuf {
		let mut name = self.path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
		name.push(".tmp");
		self.path.with_file_name(name)
	}
}

#[async_trait]
impl CaptionSink for FileSink {
	async fn deliver(&self, text: String) -> Result<(), CaptionError> {
		let mut last = self.last.lock().await;
		if last.as_deref() == Some(text.as_str()) {
			return Err(CaptionError::NotModified);
		}

		let temp = self.temp_path();
		tokio::fs::write(&temp, text.as_bytes()).await?;
		tokio::fs::rename(&temp, &self.path).await?;
		*last = Some(text);
		Ok(())
	}
}

/// Logs each caption window
pub struct LogSink;

#[async_trait]
impl CaptionSink for LogSink {
	async fn deliver(&self, text: String) -> Result<(), CaptionError> {
		info!(lines = text.lines().count(), "💬 Captions\n{text}");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn file_sink_replaces_the_whole_window() {
		let dir = tempfile::tempdir().unwrap();
		let sink = FileSink::new(dir.path().join("captions.txt"));

		sink.deliver("a\nb".to_string()).await.unwrap();
		sink.deliver("b\nc".to_string()).await.unwrap();

		assert_eq!(tokio::fs::read_to_string(sink.path()).await.unwrap(), "b\nc");
		assert!(!dir.path().join("captions.txt.tmp").exists());
	}

	#[tokio::test]
	async fn unchanged_window_is_not_rewritten() {
		let dir = tempfile::tempdir().unwrap();
		let sink = FileSink::new(dir.path().join("captions.txt"));

		sink.deliver("same".to_string()).await.unwrap();
		assert!(matches!(sink.deliver("same".to_string()).await, Err(CaptionError::NotModified)));
	}

	#[tokio::test]
	async fn missing_directory_surfaces_as_io_error() {
		let dir = tempfile::tempdir().unwrap();
		let sink = FileSink::new(dir.path().join("nope").join("captions.txt"));
		assert!(matches!(sink.deliver("x".to_string()).await, Err(CaptionError::Io(_))));
	}
}
