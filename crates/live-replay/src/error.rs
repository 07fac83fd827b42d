use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the media collaborator (demuxer / muxer backend)
#[derive(Error, Debug)]
pub enum MediaError {
	#[error("Failed to open {location}: {message}")]
	Open { location: String, message: String },

	#[error("Read error: {0}")]
	Read(String),

	#[error("Write error: {0}")]
	Write(String),

	#[error("Close error: {0}")]
	Close(String),

	#[error("Unsupported stream: {0}")]
	Unsupported(String),
}

impl MediaError {
	pub fn open(location: impl Into<String>, message: impl ToString) -> Self {
		Self::Open {
			location: location.into(),
			message: message.to_string(),
		}
	}

	/// Read and write faults can be retried; open failures and unsupported streams cannot
	pub const fn is_recoverable(&self) -> bool {
		matches!(self, Self::Read(_) | Self::Write(_))
	}
}

#[derive(Error, Debug)]
pub enum CaptionError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("Caption document must be a JSON object starting with '{{'")]
	NotAnObject,

	#[error("Caption document exceeds {limit} bytes")]
	TooLarge { limit: usize },

	#[error("JSON parsing error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("Caption text was not modified")]
	NotModified,

	#[error("Delivery rejected: {0}")]
	Rejected(String),
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("Media error: {0}")]
	Media(#[from] MediaError),

	#[error("Caption error: {0}")]
	Caption(#[from] CaptionError),

	#[error("Source not found: {0}")]
	SourceNotFound(String),

	#[error("Source unreachable: {location}: {reason}")]
	SourceUnreachable { location: String, reason: String },

	#[error("Failed to resolve source: {0}")]
	Resolve(String),

	#[error("Invalid playback request: {0}")]
	InvalidRequest(String),

	#[error("Output task is not running")]
	MuxerDead,

	#[error("Superseded by a newer playback request")]
	Superseded,

	#[error("Broadcast closed")]
	Closed,

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("Task join error: {0}")]
	Join(#[from] tokio::task::JoinError),

	#[error("Configuration error: {0}")]
	Config(String),
}

impl Error {
	/// Whether the failure is transient and worth another attempt
	pub const fn is_recoverable(&self) -> bool {
		match self {
			Self::Media(e) => e.is_recoverable(),
			Self::Caption(_) | Self::Http(_) => true,
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_faults_are_recoverable_but_missing_sources_are_not() {
		assert!(Error::from(MediaError::Read("corrupt frame".into())).is_recoverable());
		assert!(!Error::from(MediaError::open("a.mp4", "no such file")).is_recoverable());
		assert!(!Error::SourceNotFound("a.mp4".into()).is_recoverable());
		assert!(!Error::MuxerDead.is_recoverable());
	}
}
