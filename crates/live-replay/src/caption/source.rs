use super::CaptionEvent;
use crate::config::CaptionConfig;
use crate::error::CaptionError;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use tracing::{error, info};

/// Shown when captions cannot be loaded
pub const PLACEHOLDER_TEXT: &str = "captions unavailable";

#[derive(Clone)]
pub enum CaptionSource {
	Path(PathBuf),
	Url(String),
	/// Already parsed events
	Events(Vec<CaptionEvent>),
}

impl CaptionSource {
	/// `http(s)` locations are fetched, everything else is read from disk
	pub fn parse(location: &str) -> Self {
		if location.starts_with("http://") || location.starts_with("https://") {
			Self::Url(location.to_string())
		} else {
			Self::Path(PathBuf::from(location))
		}
	}
}

impl fmt::Display for CaptionSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Path(path) => write!(f, "{}", path.display()),
			Self::Url(url) => f.write_str(url),
			Self::Events(events) => write!(f, "<{} inline events>", events.len()),
		}
	}
}

#[derive(Deserialize)]
struct CaptionDocument {
	data: Vec<Vec<Value>>,
}

/// Parses a caption document: a JSON object whose `data` rows carry the offset at
/// index 0 and the text at index 4. Rows with non-string text are skipped.
pub fn parse_document(bytes: &[u8], max_bytes: usize) -> Result<Vec<CaptionEvent>, CaptionError> {
	if bytes.first() != Some(&b'{') {
		return Err(CaptionError::NotAnObject);
	}
	if bytes.len() > max_bytes {
		return Err(CaptionError::TooLarge { limit: max_bytes });
	}

	let document: CaptionDocument = serde_json::from_slice(bytes)?;
	let mut events: Vec<CaptionEvent> = document
		.data
		.iter()
		.filter_map(|row| {
			let offset = row.first()?.as_f64()?;
			let text = row.get(4)?.as_str()?;
			Some(CaptionEvent::new(offset, text))
		})
		.collect();
	events.sort_by(|a, b| a.offset_secs.total_cmp(&b.offset_secs).then_with(|| a.text.cmp(&b.text)));
	Ok(events)
}

fn read_file(path: PathBuf, max_bytes: usize) -> Result<Vec<u8>, CaptionError> {
	let file = std::fs::File::open(path)?;
	let mut bytes = Vec::new();
	// one byte past the limit is enough to tell that it was exceeded
	file.take(max_bytes as u64 + 1).read_to_end(&mut bytes)?;
	Ok(bytes)
}

async fn fetch(client: &reqwest::Client, url: &str, config: &CaptionConfig) -> Result<Vec<u8>, CaptionError> {
	let mut response = client.get(url).timeout(config.fetch_timeout()).send().await?.error_for_status()?;
	let mut bytes = Vec::new();
	while let Some(chunk) = response.chunk().await? {
		if bytes.is_empty() && chunk.first().is_some_and(|b| *b != b'{') {
			return Err(CaptionError::NotAnObject);
		}
		bytes.extend_from_slice(&chunk);
		if bytes.len() > config.max_bytes {
			return Err(CaptionError::TooLarge { limit: config.max_bytes });
		}
	}
	Ok(bytes)
}

async fn try_load(source: &CaptionSource, client: &reqwest::Client, config: &CaptionConfig) -> Result<Vec<CaptionEvent>, CaptionError> {
	let bytes = match source {
		CaptionSource::Events(events) => {
			let mut events = events.clone();
			events.sort_by(|a, b| a.offset_secs.total_cmp(&b.offset_secs));
			return Ok(events);
		}
		CaptionSource::Path(path) => {
			let (path, max_bytes) = (path.clone(), config.max_bytes);
			tokio::task::spawn_blocking(move || read_file(path, max_bytes)).await.map_err(std::io::Error::other)??
		}
		CaptionSource::Url(url) => fetch(client, url, config).await?,
	};
	parse_document(&bytes, config.max_bytes)
}

/// Loads caption events, falling back to a single placeholder on any failure
pub async fn load_events(source: &CaptionSource, client: &reqwest::Client, config: &CaptionConfig) -> Vec<CaptionEvent> {
	match try_load(source, client, config).await {
		Ok(events) if !events.is_empty() => {
			info!(source = %source, events = events.len(), "💬 Captions loaded");
			events
		}
		Ok(_) => {
			error!(source = %source, "❌ Caption source has no usable entries");
			vec![CaptionEvent::new(0.0, PLACEHOLDER_TEXT)]
		}
		Err(e) => {
			error!(source = %source, error = %e, "❌ Caption load failed");
			vec![CaptionEvent::new(0.0, PLACEHOLDER_TEXT)]
		}
	}
}
