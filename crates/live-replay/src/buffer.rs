use crate::media::{MediaKind, Packet};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// A rebased packet waiting to be muxed
#[derive(Debug, Clone)]
pub struct BufferedEntry {
	pub decode_time: f64,
	pub kind: MediaKind,
	pub packet: Packet,
}

struct Slot {
	entry: BufferedEntry,
	seq: u64,
}

impl Slot {
	fn key_cmp(&self, other: &Self) -> Ordering {
		self.entry.decode_time.total_cmp(&other.entry.decode_time).then(self.entry.kind.cmp(&other.entry.kind)).then(self.seq.cmp(&other.seq))
	}
}

impl PartialEq for Slot {
	fn eq(&self, other: &Self) -> bool {
		self.key_cmp(other) == Ordering::Equal
	}
}

impl Eq for Slot {}

impl PartialOrd for Slot {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Slot {
	// reversed: BinaryHeap is a max-heap, we pop the earliest decode time
	fn cmp(&self, other: &Self) -> Ordering {
		other.key_cmp(self)
	}
}

#[derive(Default)]
struct Inner {
	heap: BinaryHeap<Slot>,
	seq: u64,
}

/// Bounded priority buffer keyed on decode time.
///
/// `push` waits while the buffer is full; `pop` waits while it is empty. Entries with equal
/// decode time pop audio first, then in insertion order.
pub struct TimeOrderedBuffer {
	inner: Mutex<Inner>,
	capacity: usize,
	not_full: Notify,
	not_empty: Notify,
}

impl TimeOrderedBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			capacity: capacity.max(1),
			not_full: Notify::new(),
			not_empty: Notify::new(),
		}
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub const fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn len(&self) -> usize {
		self.lock().heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().heap.is_empty()
	}

	/// Inserts without waiting; hands the entry back when full
	pub fn try_push(&self, entry: BufferedEntry) -> Result<(), BufferedEntry> {
		{
			let mut inner = self.lock();
			if inner.heap.len() >= self.capacity {
				return Err(entry);
			}
			inner.seq += 1;
			let seq = inner.seq;
			inner.heap.push(Slot { entry, seq });
		}
		self.not_empty.notify_waiters();
		Ok(())
	}

	pub async fn push(&self, mut entry: BufferedEntry) {
		loop {
			let notified = self.not_full.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			match self.try_push(entry) {
				Ok(()) => return,
				Err(back) => entry = back,
			}
			notified.await;
		}
	}

	pub fn try_pop(&self) -> Option<BufferedEntry> {
		let entry = self.lock().heap.pop().map(|slot| slot.entry);
		if entry.is_some() {
			self.not_full.notify_waiters();
		}
		entry
	}

	pub async fn pop(&self) -> BufferedEntry {
		loop {
			let notified = self.not_empty.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(entry) = self.try_pop() {
				return entry;
			}
			notified.await;
		}
	}

	/// Removes everything, earliest first
	pub fn drain(&self) -> Vec<BufferedEntry> {
		let heap = std::mem::take(&mut self.lock().heap);
		self.not_full.notify_waiters();
		heap.into_sorted_vec().into_iter().rev().map(|slot| slot.entry).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::media::TimeBase;
	use std::sync::Arc;
	use std::time::Duration;

	fn entry(decode_time: f64, kind: MediaKind) -> BufferedEntry {
		let ticks = TimeBase::MILLIS.ticks(decode_time);
		BufferedEntry {
			decode_time,
			kind,
			packet: Packet::new(kind, ticks, ticks, TimeBase::MILLIS),
		}
	}

	#[test]
	fn pops_in_decode_time_order_with_audio_first_on_ties() {
		let buffer = TimeOrderedBuffer::new(8);
		for (t, kind) in [(0.5, MediaKind::Video), (0.1, MediaKind::Video), (0.5, MediaKind::Audio), (0.3, MediaKind::Audio)] {
			buffer.try_push(entry(t, kind)).unwrap();
		}

		let order: Vec<(f64, MediaKind)> = std::iter::from_fn(|| buffer.try_pop()).map(|e| (e.decode_time, e.kind)).collect();
		assert_eq!(
			order,
			vec![(0.1, MediaKind::Video), (0.3, MediaKind::Audio), (0.5, MediaKind::Audio), (0.5, MediaKind::Video)]
		);
	}

	#[test]
	fn try_push_refuses_when_full() {
		let buffer = TimeOrderedBuffer::new(1);
		buffer.try_push(entry(0.0, MediaKind::Video)).unwrap();
		assert!(buffer.try_push(entry(1.0, MediaKind::Video)).is_err());
		assert_eq!(buffer.len(), 1);
	}

	#[test]
	fn drain_returns_earliest_first() {
		let buffer = TimeOrderedBuffer::new(8);
		for t in [0.3, 0.1, 0.2] {
			buffer.try_push(entry(t, MediaKind::Video)).unwrap();
		}
		let times: Vec<f64> = buffer.drain().iter().map(|e| e.decode_time).collect();
		assert_eq!(times, vec![0.1, 0.2, 0.3]);
		assert!(buffer.is_empty());
	}

	#[tokio::test]
	async fn push_waits_for_space() {
		let buffer = Arc::new(TimeOrderedBuffer::new(1));
		buffer.push(entry(0.0, MediaKind::Video)).await;

		let producer = {
			let buffer = Arc::clone(&buffer);
			tokio::spawn(async move { buffer.push(entry(1.0, MediaKind::Video)).await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!producer.is_finished());

		assert!((buffer.pop().await.decode_time - 0.0).abs() < f64::EPSILON);
		producer.await.unwrap();
		assert!((buffer.pop().await.decode_time - 1.0).abs() < f64::EPSILON);
	}

	#[test]
	fn drain_wakes_a_blocked_push() {
		let buffer = TimeOrderedBuffer::new(1);
		buffer.try_push(entry(0.0, MediaKind::Video)).unwrap();

		let mut push = tokio_test::task::spawn(buffer.push(entry(1.0, MediaKind::Audio)));
		tokio_test::assert_pending!(push.poll());

		assert_eq!(buffer.drain().len(), 1);
		assert!(push.is_woken());
		tokio_test::assert_ready!(push.poll());
		assert_eq!(buffer.try_pop().map(|e| e.kind), Some(MediaKind::Audio));
	}
}
