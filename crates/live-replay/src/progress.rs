use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMessage {
	pub text: String,
	pub is_final: bool,
}

struct ProgressInner {
	tx: mpsc::UnboundedSender<ProgressMessage>,
	finished: AtomicBool,
}

/// Writer half of a progress report.
///
/// Messages are accepted until the first final one; everything after that is ignored.
/// Clones share the same report.
#[derive(Clone)]
pub struct Progress {
	inner: Option<Arc<ProgressInner>>,
}

impl Progress {
	pub fn channel() -> (Self, ProgressReceiver) {
		let (tx, rx) = mpsc::unbounded_channel();
		let inner = ProgressInner {
			tx,
			finished: AtomicBool::new(false),
		};
		(Self { inner: Some(Arc::new(inner)) }, ProgressReceiver { rx, done: false })
	}

	/// A report nobody reads, already finished
	pub const fn disabled() -> Self {
		Self { inner: None }
	}

	/// Returns whether the message was accepted
	pub fn add_message(&self, text: impl Into<String>, is_final: bool) -> bool {
		let Some(inner) = &self.inner else {
			return false;
		};
		let accepted = if is_final {
			!inner.finished.swap(true, Ordering::AcqRel)
		} else {
			!inner.finished.load(Ordering::Acquire)
		};
		if accepted {
			// a dropped reader is not an error for the writer
			let _ = inner.tx.send(ProgressMessage { text: text.into(), is_final });
		}
		accepted
	}

	pub fn finish(&self, text: impl Into<String>) -> bool {
		self.add_message(text, true)
	}

	pub fn is_finished(&self) -> bool {
		self.inner.as_ref().map_or(true, |inner| inner.finished.load(Ordering::Acquire))
	}
}

impl Default for Progress {
	fn default() -> Self {
		Self::disabled()
	}
}

/// Reader half; ends after the final message
pub struct ProgressReceiver {
	rx: mpsc::UnboundedReceiver<ProgressMessage>,
	done: bool,
}

impl ProgressReceiver {
	pub async fn next(&mut self) -> Option<ProgressMessage> {
		if self.done {
			return None;
		}
		let message = self.rx.recv().await;
		self.done = message.as_ref().map_or(true, |m| m.is_final);
		message
	}

	/// Collects every remaining message up to and including the final one
	pub async fn collect(mut self) -> Vec<ProgressMessage> {
		let mut messages = Vec::new();
		while let Some(message) = self.next().await {
			messages.push(message);
		}
		messages
	}
}

impl Stream for ProgressReceiver {
	type Item = ProgressMessage;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		if self.done {
			return Poll::Ready(None);
		}
		let polled = self.rx.poll_recv(cx);
		if let Poll::Ready(message) = &polled {
			self.done = message.as_ref().map_or(true, |m| m.is_final);
		}
		polled
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::StreamExt;

	#[tokio::test]
	async fn finalised_at_most_once() {
		let (progress, receiver) = Progress::channel();
		assert!(progress.add_message("found, opening", false));
		assert!(progress.finish("playback started"));
		assert!(!progress.finish("playback failed"));
		assert!(!progress.add_message("late", false));
		assert!(progress.is_finished());

		let texts: Vec<String> = receiver.collect().await.into_iter().map(|m| m.text).collect();
		assert_eq!(texts, vec!["found, opening", "playback started"]);
	}

	#[tokio::test]
	async fn clones_share_the_same_report() {
		let (progress, mut receiver) = Progress::channel();
		let clone = progress.clone();
		clone.finish("no playback occurred");
		assert!(progress.is_finished());
		assert_eq!(receiver.next().await.map(|m| m.is_final), Some(true));
		assert_eq!(receiver.next().await, None);
	}

	#[tokio::test]
	async fn stream_ends_after_final_message() {
		let (progress, receiver) = Progress::channel();
		progress.add_message("probing", false);
		progress.finish("done");
		drop(progress);
		assert_eq!(receiver.count().await, 2);
	}

	#[test]
	fn disabled_report_accepts_nothing() {
		let progress = Progress::disabled();
		assert!(progress.is_finished());
		assert!(!progress.add_message("anything", true));
	}
}
