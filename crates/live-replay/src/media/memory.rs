//! Scripted in-memory backend.
//!
//! Inputs replay packet lists registered per location; the output records every write
//! with the instant it happened. Faults can be injected on reads, writes, and output opens.
//! Used by the test suite and by dry runs of the broadcaster.

use super::{MediaBackend, MediaInput, MediaKind, MediaOutput, Packet, StreamDescriptor, TimeBase};
use crate::error::MediaError;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// A packet as it reached the output container
#[derive(Debug, Clone)]
pub struct WrittenPacket {
	pub kind: MediaKind,
	pub dts: Option<i64>,
	pub pts: Option<i64>,
	pub decode_time: f64,
	pub keyframe: bool,
	pub at: Instant,
	/// Which opened output container received it, counting from 1
	pub output: usize,
}

/// Read fault injected after `after` packets, on the first `passes` opens of the source
#[derive(Debug, Clone, Copy)]
pub struct ReadFault {
	pub after: usize,
	pub passes: usize,
}

#[derive(Debug, Clone)]
pub struct SyntheticLayout {
	pub duration_secs: f64,
	pub fps: u32,
	/// Frames per group of pictures; every `gop`-th frame is a keyframe
	pub gop: usize,
	pub audio: bool,
	pub width: u32,
	pub height: u32,
	pub sample_rate: u32,
}

impl Default for SyntheticLayout {
	fn default() -> Self {
		Self {
			duration_secs: 3.0,
			fps: 30,
			gop: 30,
			audio: true,
			width: 1280,
			height: 720,
			sample_rate: 48_000,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
	pub streams: Vec<StreamDescriptor>,
	pub packets: Vec<Packet>,
	pub read_fault: Option<ReadFault>,
}

impl ScriptedSource {
	pub const fn new(streams: Vec<StreamDescriptor>) -> Self {
		Self {
			streams,
			packets: Vec::new(),
			read_fault: None,
		}
	}

	/// Video at 1/1000 ticks plus 1024-sample audio frames, interleaved by decode time
	#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_precision_loss)]
	pub fn synthetic(layout: &SyntheticLayout) -> Self {
		let video_tb = TimeBase::MILLIS;
		let audio_tb = TimeBase::new(1, layout.sample_rate as i32);
		let mut streams = vec![StreamDescriptor::video(0, "h264", video_tb, layout.width, layout.height)];
		if layout.audio {
			streams.push(StreamDescriptor::audio(1, "aac", audio_tb, layout.sample_rate));
		}

		let fps = layout.fps.max(1);
		let frames = (layout.duration_secs * f64::from(fps)).round() as usize;
		let gop = layout.gop.max(1);
		let mut packets: Vec<Packet> = (0..frames)
			.map(|i| {
				let dts = (i as f64 * 1000.0 / f64::from(fps)).round() as i64;
				Packet::new(MediaKind::Video, dts, dts, video_tb).with_keyframe(i % gop == 0).with_duration((1000 / fps).into())
			})
			.collect();

		if layout.audio {
			let audio_frames = (layout.duration_secs * f64::from(layout.sample_rate) / 1024.0).floor() as i64;
			packets.extend((0..audio_frames).map(|j| Packet::new(MediaKind::Audio, j * 1024, j * 1024, audio_tb).with_keyframe(true).with_duration(1024)));
		}
		packets.sort_by(|a, b| a.decode_time().unwrap_or_default().total_cmp(&b.decode_time().unwrap_or_default()));

		Self {
			streams,
			packets,
			read_fault: None,
		}
	}

	pub fn push(&mut self, packet: Packet) {
		self.packets.push(packet);
	}

	#[must_use]
	pub fn with_packets(mut self, packets: impl IntoIterator<Item = Packet>) -> Self {
		self.packets.extend(packets);
		self
	}

	#[must_use]
	pub const fn with_read_fault(mut self, after: usize, passes: usize) -> Self {
		self.read_fault = Some(ReadFault { after, passes });
		self
	}
}

#[derive(Default)]
struct MemoryState {
	sources: HashMap<String, ScriptedSource>,
	synthetic_fallback: Option<SyntheticLayout>,
	input_opens: HashMap<String, usize>,
	writes: Vec<WrittenPacket>,
	write_attempts: usize,
	write_faults: BTreeSet<usize>,
	output_open_failures: usize,
	outputs_opened: usize,
	outputs_closed: usize,
	output_streams: Vec<StreamDescriptor>,
	discard_writes: bool,
}

/// Cheap to clone; clones share the same recorded state
#[derive(Clone, Default)]
pub struct MemoryBackend {
	state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	/// Unknown locations open as a synthetic source instead of failing
	#[must_use]
	pub fn with_synthetic_fallback(self, layout: SyntheticLayout) -> Self {
		self.lock().synthetic_fallback = Some(layout);
		self
	}

	/// Counts writes without keeping them, for long dry runs
	#[must_use]
	pub fn discarding_writes(self) -> Self {
		self.lock().discard_writes = true;
		self
	}

	fn lock(&self) -> MutexGuard<'_, MemoryState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn insert_source(&self, location: impl Into<String>, source: ScriptedSource) {
		self.lock().sources.insert(location.into(), source);
	}

	/// Fails the `attempt`-th write (counting from 1 across all outputs)
	pub fn fail_write_at(&self, attempt: usize) {
		self.lock().write_faults.insert(attempt);
	}

	/// Fails the next `count` output opens
	pub fn fail_output_opens(&self, count: usize) {
		self.lock().output_open_failures = count;
	}

	pub fn written(&self) -> Vec<WrittenPacket> {
		self.lock().writes.clone()
	}

	pub fn outputs_opened(&self) -> usize {
		self.lock().outputs_opened
	}

	pub fn outputs_closed(&self) -> usize {
		self.lock().outputs_closed
	}

	pub fn output_streams(&self) -> Vec<StreamDescriptor> {
		self.lock().output_streams.clone()
	}

	pub fn input_opens(&self, location: &str) -> usize {
		self.lock().input_opens.get(location).copied().unwrap_or_default()
	}
}

impl MediaBackend for MemoryBackend {
	fn open_input(&self, location: &str) -> Result<Box<dyn MediaInput>, MediaError> {
		let mut state = self.lock();
		let source = match (state.sources.get(location), &state.synthetic_fallback) {
			(Some(source), _) => source.clone(),
			(None, Some(layout)) => ScriptedSource::synthetic(layout),
			(None, None) => return Err(MediaError::open(location, "no scripted source")),
		};
		let opens = state.input_opens.entry(location.to_string()).or_default();
		*opens += 1;
		let fail_at = source.read_fault.filter(|fault| *opens <= fault.passes).map(|fault| fault.after);

		Ok(Box::new(MemoryInput {
			streams: source.streams,
			packets: source.packets.into_iter(),
			read: 0,
			fail_at,
		}))
	}

	fn open_output(&self, destination: &str, _format: &str) -> Result<Box<dyn MediaOutput>, MediaError> {
		let mut state = self.lock();
		if state.output_open_failures > 0 {
			state.output_open_failures -= 1;
			return Err(MediaError::open(destination, "endpoint refused connection"));
		}
		state.outputs_opened += 1;
		state.output_streams.clear();

		Ok(Box::new(MemoryOutput {
			state: Arc::clone(&self.state),
			index: state.outputs_opened,
			kinds: Vec::new(),
			closed: false,
		}))
	}
}

struct MemoryInput {
	streams: Vec<StreamDescriptor>,
	packets: std::vec::IntoIter<Packet>,
	read: usize,
	fail_at: Option<usize>,
}

impl MediaInput for MemoryInput {
	fn streams(&self) -> &[StreamDescriptor] {
		&self.streams
	}

	fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
		if self.fail_at == Some(self.read) {
			return Err(MediaError::Read(format!("injected fault after {} packets", self.read)));
		}
		self.read += 1;
		Ok(self.packets.next())
	}
}

struct MemoryOutput {
	state: Arc<Mutex<MemoryState>>,
	index: usize,
	kinds: Vec<MediaKind>,
	closed: bool,
}

impl MediaOutput for MemoryOutput {
	fn add_stream(&mut self, descriptor: &StreamDescriptor) -> Result<(), MediaError> {
		self.kinds.push(descriptor.kind);
		self.state.lock().unwrap_or_else(PoisonError::into_inner).output_streams.push(descriptor.clone());
		Ok(())
	}

	fn write_packet(&mut self, packet: Packet) -> Result<(), MediaError> {
		if self.closed {
			return Err(MediaError::Write("output already closed".to_string()));
		}
		if !self.kinds.contains(&packet.kind) {
			return Err(MediaError::Unsupported(format!("no {} stream on output", packet.kind)));
		}

		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		state.write_attempts += 1;
		let attempt = state.write_attempts;
		if state.write_faults.remove(&attempt) {
			return Err(MediaError::Write(format!("broken pipe on write {attempt}")));
		}

		if state.discard_writes {
			return Ok(());
		}
		state.writes.push(WrittenPacket {
			kind: packet.kind,
			dts: packet.dts,
			pts: packet.pts,
			decode_time: packet.decode_time().unwrap_or_default(),
			keyframe: packet.keyframe,
			at: Instant::now(),
			output: self.index,
		});
		Ok(())
	}

	fn close(&mut self) -> Result<(), MediaError> {
		if !self.closed {
			self.closed = true;
			self.state.lock().unwrap_or_else(PoisonError::into_inner).outputs_closed += 1;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn synthetic_source_is_interleaved_and_keyframed() {
		let source = ScriptedSource::synthetic(&SyntheticLayout::default());
		let times: Vec<f64> = source.packets.iter().filter_map(Packet::decode_time).collect();
		assert!(times.windows(2).all(|w| w[0] <= w[1]));

		let keyframes = source.packets.iter().filter(|p| p.kind == MediaKind::Video && p.keyframe).count();
		assert_eq!(keyframes, 3);
		assert!(source.packets.iter().any(|p| p.kind == MediaKind::Audio));
	}

	#[test]
	fn read_fault_applies_only_to_first_passes() {
		let backend = MemoryBackend::new();
		let source = ScriptedSource::synthetic(&SyntheticLayout::default()).with_read_fault(2, 1);
		backend.insert_source("a", source);

		let mut first = backend.open_input("a").unwrap();
		assert!(first.read_packet().unwrap().is_some());
		assert!(first.read_packet().unwrap().is_some());
		assert!(first.read_packet().is_err());

		let mut second = backend.open_input("a").unwrap();
		for _ in 0..5 {
			assert!(second.read_packet().unwrap().is_some());
		}
		assert_eq!(backend.input_opens("a"), 2);
	}

	#[test]
	fn unknown_location_fails_without_fallback() {
		let backend = MemoryBackend::new();
		assert!(matches!(backend.open_input("missing"), Err(MediaError::Open { .. })));
	}

	#[tokio::test]
	async fn write_faults_count_across_outputs() {
		let backend = MemoryBackend::new();
		backend.fail_write_at(2);
		let video = StreamDescriptor::video(0, "h264", TimeBase::MILLIS, 640, 360);

		let mut output = backend.open_output("mem://out", "flv").unwrap();
		output.add_stream(&video).unwrap();
		let frame = |ms| Packet::new(MediaKind::Video, ms, ms, TimeBase::MILLIS);
		output.write_packet(frame(0)).unwrap();
		assert!(matches!(output.write_packet(frame(33)), Err(MediaError::Write(_))));
		assert!(matches!(output.write_packet(Packet::new(MediaKind::Audio, 0, 0, TimeBase::MILLIS)), Err(MediaError::Unsupported(_))));
		output.close().unwrap();
		output.close().unwrap();

		assert_eq!(backend.written().len(), 1);
		assert_eq!(backend.outputs_closed(), 1);
	}

	#[tokio::test]
	async fn discarding_backend_keeps_nothing() {
		let backend = MemoryBackend::new().discarding_writes();
		let mut output = backend.open_output("mem://out", "flv").unwrap();
		output.add_stream(&StreamDescriptor::video(0, "h264", TimeBase::MILLIS, 640, 360)).unwrap();
		output.write_packet(Packet::new(MediaKind::Video, 0, 0, TimeBase::MILLIS)).unwrap();
		assert!(backend.written().is_empty());
	}
}
