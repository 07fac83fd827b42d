//! Timestamp continuity across independently encoded files.
//!
//! Every file starts its own clock near zero. The rebaser anchors each new segment on its
//! first video keyframe, shifting it just past the last packet of the previous segment, and
//! derives the audio shift from the same offset once it is known.

use crate::buffer::{BufferedEntry, TimeOrderedBuffer};
use crate::media::{MediaKind, Packet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// One typical frame interval reserved between segments
pub const SEGMENT_GAP_SECS: f64 = 1.0 / 60.0;
/// 1024 samples at 48kHz
pub const AUDIO_FRAME_SECS: f64 = 1024.0 / 48_000.0;
/// Leading video later than this is suspicious but still accepted
pub const LATE_LEADING_FRAME_SECS: f64 = 5.0;
/// Flushing on switch only pays off past this many buffered entries
const FLUSH_MIN_ENTRIES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PerKind<T> {
	video: T,
	audio: T,
}

impl<T: Copy> PerKind<T> {
	const fn get(&self, kind: MediaKind) -> Option<T> {
		match kind {
			MediaKind::Video => Some(self.video),
			MediaKind::Audio => Some(self.audio),
			MediaKind::Other => None,
		}
	}

	fn set(&mut self, kind: MediaKind, value: T) {
		match kind {
			MediaKind::Video => self.video = value,
			MediaKind::Audio => self.audio = value,
			MediaKind::Other => {}
		}
	}
}

pub struct Rebaser {
	buffer: Arc<TimeOrderedBuffer>,
	offset_secs: f64,
	applied_ticks: PerKind<Option<i64>>,
	last_decode: PerKind<f64>,
	last_present: PerKind<f64>,
	pending_audio: Vec<Packet>,
	offset_tx: watch::Sender<Option<f64>>,
}

impl Rebaser {
	pub fn new(buffer: Arc<TimeOrderedBuffer>) -> Self {
		let (offset_tx, _) = watch::channel(None);
		Self {
			buffer,
			offset_secs: 0.0,
			applied_ticks: PerKind::default(),
			last_decode: PerKind::default(),
			last_present: PerKind::default(),
			pending_audio: Vec::new(),
			offset_tx,
		}
	}

	/// Segment offset in seconds once the leading keyframe of the segment has been seen
	pub fn subscribe_offset(&self) -> watch::Receiver<Option<f64>> {
		self.offset_tx.subscribe()
	}

	pub fn offset(&self) -> Option<f64> {
		self.applied_ticks.video.map(|_| self.offset_secs)
	}

	pub const fn last_decode_time(&self, kind: MediaKind) -> Option<f64> {
		self.last_decode.get(kind)
	}

	/// Starts a new segment.
	///
	/// With `flush_pending`, whatever is queued from the previous source is cut back to the
	/// earliest entries, up to the first of each kind, and the continuity times are recomputed
	/// from those so the new segment lines up behind what will actually be muxed.
	pub fn switch(&mut self, flush_pending: bool) {
		if flush_pending && self.buffer.len() >= FLUSH_MIN_ENTRIES {
			let drained = self.buffer.drain();
			let previous = drained.len();
			let (mut seen_video, mut seen_audio) = (false, false);

			for entry in drained {
				let (kind, decode_time) = (entry.kind, entry.decode_time);
				let present_time = entry.packet.present_time().unwrap_or(decode_time);
				// unreachable while the rebaser is the only producer: the buffer was emptied above
				// and re-pushing a subset of it never exceeds capacity
				if self.buffer.try_push(entry).is_err() {
					warn!(kind = %kind, decode_time, "⚠️ Buffer refilled during flush, entry dropped");
					break;
				}
				match kind {
					MediaKind::Video => seen_video = true,
					MediaKind::Audio => seen_audio = true,
					MediaKind::Other => {}
				}
				self.last_decode.set(kind, decode_time);
				self.last_present.set(kind, present_time);
				if seen_video && seen_audio {
					break;
				}
			}
			info!(previous, current = self.buffer.len(), "🧹 Buffer flushed for switch");
		}

		self.applied_ticks = PerKind::default();
		self.pending_audio.clear();
		self.offset_tx.send_replace(None);
	}

	/// Rebases one packet and queues it, waiting while the buffer is full
	pub async fn put(&mut self, packet: Packet) {
		match packet.kind {
			MediaKind::Video if self.applied_ticks.video.is_none() => {
				if !self.anchor_video(&packet) {
					return;
				}
			}
			MediaKind::Audio if self.applied_ticks.audio.is_none() => {
				if self.applied_ticks.video.is_none() {
					self.pending_audio.push(packet);
					return;
				}
				let ticks = packet.time_base.ticks(self.offset_secs);
				self.applied_ticks.audio = Some(ticks);
				info!(ticks, time_base = %packet.time_base, "🔊 Audio offset applied");
				self.flush_pending_audio(ticks).await;
			}
			MediaKind::Other => return,
			_ => {}
		}

		self.emit(packet).await;
	}

	/// Computes the segment offset from the leading video packet; false drops the packet
	fn anchor_video(&mut self, packet: &Packet) -> bool {
		if !packet.keyframe {
			debug!("Dropping non-key leading video packet");
			return false;
		}
		let (Some(raw_decode), Some(raw_present)) = (packet.decode_time(), packet.present_time()) else {
			debug!("Dropping leading video packet without timestamps");
			return false;
		};
		if raw_present < 0.0 {
			error!(pts = raw_present, "❌ Leading video frame has negative presentation time, dropping");
			return false;
		}
		if raw_present > LATE_LEADING_FRAME_SECS {
			warn!(pts = raw_present, "⚠️ Leading video frame starts late");
		}

		// audio may run up to a frame past the last video; the new segment starts behind both
		let behind_video = f64::max(self.last_decode.video - raw_decode, self.last_present.video - raw_present);
		self.offset_secs = f64::max(behind_video, self.last_decode.audio - raw_decode) + SEGMENT_GAP_SECS;
		let ticks = packet.time_base.ticks(self.offset_secs);
		self.applied_ticks.video = Some(ticks);
		info!(offset = self.offset_secs, ticks, time_base = %packet.time_base, "🎞️ Segment offset computed");
		self.offset_tx.send_replace(Some(self.offset_secs));
		true
	}

	async fn flush_pending_audio(&mut self, ticks: i64) {
		// measured against the previous segment only, not against packets flushed here
		let floor = self.last_decode.audio + AUDIO_FRAME_SECS;
		for mut packet in std::mem::take(&mut self.pending_audio) {
			packet.shift(ticks);
			let Some(decode_time) = packet.decode_time() else { continue };
			if decode_time < floor {
				debug!(decode_time, floor, "Dropping audio overlapping the previous segment");
				continue;
			}
			self.queue(packet, decode_time).await;
		}
	}

	async fn emit(&mut self, mut packet: Packet) {
		if let Some(Some(ticks)) = self.applied_ticks.get(packet.kind) {
			packet.shift(ticks);
		}
		let Some(decode_time) = packet.decode_time() else {
			debug!(kind = %packet.kind, "Dropping packet without decode time");
			return;
		};
		self.queue(packet, decode_time).await;
	}

	async fn queue(&mut self, packet: Packet, decode_time: f64) {
		let kind = packet.kind;
		self.last_decode.set(kind, decode_time);
		self.last_present.set(kind, packet.present_time().unwrap_or(decode_time));
		self.buffer.push(BufferedEntry { decode_time, kind, packet }).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::media::TimeBase;

	const AUDIO_TB: TimeBase = TimeBase::new(1, 48_000);

	fn video(ms: i64, key: bool) -> Packet {
		Packet::new(MediaKind::Video, ms, ms, TimeBase::MILLIS).with_keyframe(key)
	}

	fn audio(samples: i64) -> Packet {
		Packet::new(MediaKind::Audio, samples, samples, AUDIO_TB)
	}

	fn rebaser() -> (Rebaser, Arc<TimeOrderedBuffer>) {
		let buffer = Arc::new(TimeOrderedBuffer::new(1024));
		(Rebaser::new(Arc::clone(&buffer)), buffer)
	}

	fn drain_video(buffer: &TimeOrderedBuffer) -> Vec<BufferedEntry> {
		buffer.drain().into_iter().filter(|e| e.kind == MediaKind::Video).collect()
	}

	#[tokio::test]
	async fn leading_non_keyframes_are_dropped() {
		let (mut rebaser, buffer) = rebaser();
		rebaser.put(video(0, false)).await;
		rebaser.put(video(33, false)).await;
		assert!(buffer.is_empty());
		assert_eq!(rebaser.offset(), None);

		rebaser.put(video(66, true)).await;
		rebaser.put(video(100, false)).await;
		let entries = drain_video(&buffer);
		assert_eq!(entries.len(), 2);
		assert!(entries[0].packet.keyframe);
	}

	#[tokio::test]
	async fn negative_leading_presentation_time_is_rejected() {
		let (mut rebaser, buffer) = rebaser();
		rebaser.put(Packet::new(MediaKind::Video, -40, -40, TimeBase::MILLIS).with_keyframe(true)).await;
		assert!(buffer.is_empty());
		assert_eq!(rebaser.offset(), None);
	}

	#[tokio::test]
	async fn late_leading_frame_is_accepted() {
		let (mut rebaser, buffer) = rebaser();
		rebaser.put(video(6000, true)).await;
		assert_eq!(buffer.len(), 1);
	}

	#[tokio::test]
	async fn segments_continue_without_going_backwards() {
		let (mut rebaser, buffer) = rebaser();
		let mut last_of_segment = Vec::new();
		let mut first_of_segment = Vec::new();

		for _ in 0..3 {
			rebaser.switch(false);
			for i in 0..30 {
				rebaser.put(video(i * 33, i % 10 == 0)).await;
			}
			let entries = drain_video(&buffer);
			first_of_segment.push(entries[0].decode_time);
			last_of_segment.push(entries[entries.len() - 1].decode_time);
		}

		for n in 0..2 {
			assert!(first_of_segment[n + 1] >= last_of_segment[n], "segment {} starts before segment {} ends", n + 1, n);
		}
	}

	#[tokio::test]
	async fn new_segment_starts_after_trailing_audio() {
		let (mut rebaser, buffer) = rebaser();
		rebaser.put(video(0, true)).await;
		rebaser.put(video(1000, false)).await;
		rebaser.put(audio(48_000)).await;
		// audio ends 20ms past the last video frame
		rebaser.put(audio(48_960)).await;
		buffer.drain();

		rebaser.switch(false);
		rebaser.put(video(0, true)).await;
		rebaser.put(audio(0)).await;

		let entries = buffer.drain();
		assert_eq!(entries.len(), 2);
		assert!(entries.iter().all(|e| e.decode_time > 1.02), "{:?}", entries.iter().map(|e| e.decode_time).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn offset_is_applied_once_per_segment() {
		let (mut rebaser, _buffer) = rebaser();
		rebaser.put(video(0, true)).await;
		let first = rebaser.offset();
		rebaser.put(video(1000, true)).await;
		assert_eq!(rebaser.offset(), first);

		rebaser.switch(false);
		assert_eq!(rebaser.offset(), None);
		rebaser.put(video(0, true)).await;
		assert!(rebaser.offset() > first);
	}

	#[tokio::test]
	async fn audio_waits_for_video_offset() {
		let (mut rebaser, buffer) = rebaser();
		let mut offsets = rebaser.subscribe_offset();

		// 50ms and 100ms of audio before the first keyframe
		rebaser.put(audio(2400)).await;
		rebaser.put(audio(4800)).await;
		assert!(buffer.is_empty());
		assert_eq!(rebaser.pending_audio.len(), 2);

		rebaser.put(video(0, true)).await;
		let offset = (*offsets.borrow_and_update()).expect("offset published");
		assert_eq!(buffer.len(), 1);

		rebaser.put(audio(7200)).await;
		assert_eq!(rebaser.pending_audio.len(), 0);

		let expected = AUDIO_TB.ticks(offset);
		let audio_entries: Vec<BufferedEntry> = buffer.drain().into_iter().filter(|e| e.kind == MediaKind::Audio).collect();
		let raw = [2400, 4800, 7200];
		assert_eq!(audio_entries.len(), 3);
		for (entry, raw) in audio_entries.iter().zip(raw) {
			assert_eq!(entry.packet.dts, Some(raw + expected));
		}
	}

	#[tokio::test]
	async fn pending_audio_overlapping_previous_segment_is_dropped() {
		let (mut rebaser, buffer) = rebaser();
		// first segment ends with audio at 2.0s and video at 2.0s
		rebaser.put(video(0, true)).await;
		rebaser.put(video(2000, false)).await;
		rebaser.put(audio(0)).await;
		rebaser.put(audio(96_000)).await;
		buffer.drain();

		rebaser.switch(false);
		// audio starting well before the keyframe lands behind the previous segment's audio
		rebaser.put(audio(0)).await;
		rebaser.put(audio(48_000)).await;
		rebaser.put(video(500, true)).await;
		rebaser.put(audio(72_000)).await;

		let audio_times: Vec<f64> = buffer.drain().into_iter().filter(|e| e.kind == MediaKind::Audio).map(|e| e.decode_time).collect();
		let last = rebaser.last_decode_time(MediaKind::Audio).unwrap();
		assert_eq!(audio_times.len(), 2);
		assert!(audio_times.iter().all(|t| *t >= 2.0 + AUDIO_FRAME_SECS));
		assert!((audio_times[1] - last).abs() < 1e-9);
	}

	#[tokio::test]
	async fn consecutive_held_audio_frames_are_all_kept() {
		let (mut rebaser, buffer) = rebaser();
		// previous segment: video up to 1.0s, audio up to 0.9s
		rebaser.put(video(0, true)).await;
		rebaser.put(video(1000, false)).await;
		rebaser.put(Packet::new(MediaKind::Audio, 900, 900, TimeBase::MILLIS)).await;
		buffer.drain();

		rebaser.switch(false);
		// 1024-sample frames at 48kHz in millisecond ticks, one frame apart
		let held = [0, 21, 42, 64, 85, 106, 128, 149, 170, 192];
		for ms in held {
			rebaser.put(Packet::new(MediaKind::Audio, ms, ms, TimeBase::MILLIS)).await;
		}
		assert_eq!(rebaser.pending_audio.len(), held.len());
		rebaser.put(video(0, true)).await;
		rebaser.put(Packet::new(MediaKind::Audio, 213, 213, TimeBase::MILLIS)).await;

		let audio_times: Vec<f64> = buffer.drain().into_iter().filter(|e| e.kind == MediaKind::Audio).map(|e| e.decode_time).collect();
		assert_eq!(audio_times.len(), held.len() + 1);
		assert!(audio_times.windows(2).all(|pair| pair[1] > pair[0]));
	}

	#[tokio::test]
	async fn flush_keeps_earliest_entries_until_both_kinds_seen() {
		let (mut rebaser, buffer) = rebaser();
		rebaser.put(video(0, true)).await;
		for i in 1..10 {
			rebaser.put(video(i * 33, false)).await;
		}
		rebaser.put(audio(4800)).await;
		rebaser.put(audio(9600)).await;
		let total = buffer.len();
		assert_eq!(total, 12);

		rebaser.switch(true);
		// video at 16ms, 49ms, 82ms and 115ms precede the first audio at ~116.7ms
		let kept = buffer.drain();
		assert_eq!(kept.last().map(|e| e.kind), Some(MediaKind::Audio));
		assert!(kept.len() < total);
		let first_audio = kept.last().unwrap().decode_time;
		assert!((rebaser.last_decode_time(MediaKind::Audio).unwrap() - first_audio).abs() < 1e-9);
	}

	#[tokio::test]
	async fn small_buffers_are_not_flushed() {
		let (mut rebaser, buffer) = rebaser();
		rebaser.put(video(0, true)).await;
		rebaser.put(video(33, false)).await;
		rebaser.switch(true);
		assert_eq!(buffer.len(), 2);
	}

	#[tokio::test]
	async fn other_kinds_are_ignored() {
		let (mut rebaser, buffer) = rebaser();
		rebaser.put(Packet::new(MediaKind::Other, 0, 0, TimeBase::MILLIS)).await;
		assert!(buffer.is_empty());
	}
}
