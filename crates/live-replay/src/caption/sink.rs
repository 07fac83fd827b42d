use crate::error::CaptionError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Where the caption block ends up. `CaptionError::NotModified` counts as delivered.
#[async_trait]
pub trait CaptionSink: Send + Sync {
	async fn deliver(&self, text: String) -> Result<(), CaptionError>;
}

struct FnSink<F>(F);

#[async_trait]
impl<F> CaptionSink for FnSink<F>
where
	F: Fn(String) -> BoxFuture<'static, Result<(), CaptionError>> + Send + Sync,
{
	async fn deliver(&self, text: String) -> Result<(), CaptionError> {
		(self.0)(text).await
	}
}

/// Wraps an async closure as a sink
pub fn sink_fn<F, Fut>(f: F) -> Arc<dyn CaptionSink>
where
	F: Fn(String) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), CaptionError>> + Send + 'static,
{
	Arc::new(FnSink(move |text: String| -> BoxFuture<'static, Result<(), CaptionError>> { Box::pin(f(text)) }))
}

/// Spreads deliveries over several targets in turn, e.g. to stay under per-account rate limits
pub struct RoundRobinSink {
	sinks: Vec<Arc<dyn CaptionSink>>,
	next: AtomicUsize,
}

impl RoundRobinSink {
	pub fn new(sinks: Vec<Arc<dyn CaptionSink>>) -> Self {
		Self {
			sinks,
			next: AtomicUsize::new(0),
		}
	}
}

#[async_trait]
impl CaptionSink for RoundRobinSink {
	async fn deliver(&self, text: String) -> Result<(), CaptionError> {
		if self.sinks.is_empty() {
			return Err(CaptionError::Rejected("no delivery targets configured".to_string()));
		}
		let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sinks.len();
		self.sinks[index].deliver(text).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	#[tokio::test]
	async fn round_robin_cycles_through_targets() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let target = |name: &'static str| {
			let seen = Arc::clone(&seen);
			sink_fn(move |text: String| {
				let seen = Arc::clone(&seen);
				async move {
					seen.lock().unwrap().push(format!("{name}:{text}"));
					Ok(())
				}
			})
		};
		let sink = RoundRobinSink::new(vec![target("a"), target("b")]);

		for text in ["1", "2", "3"] {
			sink.deliver(text.to_string()).await.unwrap();
		}
		assert_eq!(*seen.lock().unwrap(), vec!["a:1", "b:2", "a:3"]);
	}

	#[tokio::test]
	async fn empty_round_robin_rejects() {
		let sink = RoundRobinSink::new(Vec::new());
		assert!(matches!(sink.deliver("x".into()).await, Err(CaptionError::Rejected(_))));
	}
}
