use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Produces a playable location at play time, e.g. a freshly signed stream URL
#[async_trait]
pub trait SourceResolver: Send + Sync {
	async fn resolve(&self) -> Result<String>;
}

#[derive(Clone)]
pub enum MediaSource {
	Location(String),
	Resolver(Arc<dyn SourceResolver>),
}

impl MediaSource {
	pub fn location(location: impl Into<String>) -> Self {
		Self::Location(location.into())
	}

	pub fn resolver(resolver: impl SourceResolver + 'static) -> Self {
		Self::Resolver(Arc::new(resolver))
	}

	pub async fn resolve(&self) -> Result<String> {
		match self {
			Self::Location(location) => Ok(location.clone()),
			Self::Resolver(resolver) => resolver.resolve().await.map_err(|e| match e {
				Error::Resolve(_) => e,
				other => Error::Resolve(other.to_string()),
			}),
		}
	}
}

impl fmt::Debug for MediaSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Location(location) => f.debug_tuple("Location").field(location).finish(),
			Self::Resolver(_) => f.write_str("Resolver(..)"),
		}
	}
}

impl From<&str> for MediaSource {
	fn from(location: &str) -> Self {
		Self::location(location)
	}
}

impl From<String> for MediaSource {
	fn from(location: String) -> Self {
		Self::Location(location)
	}
}

/// Anything with a scheme other than `file` is remote
pub fn is_remote(location: &str) -> bool {
	location.split_once("://").is_some_and(|(scheme, _)| !scheme.eq_ignore_ascii_case("file") && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)))
}

fn default_port(scheme: &str) -> Option<u16> {
	match scheme {
		"rtmp" => Some(1935),
		"rtmps" => Some(443),
		"rtsp" => Some(554),
		_ => None,
	}
}

/// Checks that a source exists (local) or answers (remote) before it is opened
pub async fn probe(location: &str, client: &reqwest::Client, timeout: Duration) -> Result<()> {
	if !is_remote(location) {
		let path = location.strip_prefix("file://").unwrap_or(location);
		return match tokio::fs::try_exists(path).await {
			Ok(true) => Ok(()),
			Ok(false) => Err(Error::SourceNotFound(location.to_string())),
			Err(e) => Err(Error::SourceUnreachable {
				location: location.to_string(),
				reason: e.to_string(),
			}),
		};
	}

	let unreachable = |reason: String| Error::SourceUnreachable {
		location: location.to_string(),
		reason,
	};
	let url = Url::parse(location).map_err(|e| unreachable(e.to_string()))?;

	match url.scheme() {
		"http" | "https" => {
			let response = client.head(url.clone()).timeout(timeout).send().await.map_err(|e| unreachable(e.to_string()))?;
			match response.status() {
				StatusCode::NOT_FOUND | StatusCode::GONE => Err(Error::SourceNotFound(location.to_string())),
				status if status.is_server_error() => Err(unreachable(format!("server answered {status}"))),
				status => {
					debug!(location, %status, "Remote source answered probe");
					Ok(())
				}
			}
		}
		scheme => {
			let (Some(host), Some(port)) = (url.host_str(), url.port().or_else(|| default_port(scheme))) else {
				debug!(location, scheme, "No probe for scheme, assuming reachable");
				return Ok(());
			};
			match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await {
				Ok(Ok(_)) => Ok(()),
				Ok(Err(e)) => Err(unreachable(e.to_string())),
				Err(_) => Err(unreachable(format!("no answer within {timeout:?}"))),
			}
		}
	}
}
