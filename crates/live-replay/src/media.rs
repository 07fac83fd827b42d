//! Seam to the container library.
//!
//! Demuxing and muxing are opaque: a backend opens an input that yields timestamped
//! [`Packet`]s and an output that accepts them. All calls are blocking and are driven
//! from the blocking thread pool.

use crate::error::MediaError;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod memory;

/// Ordered so that, at equal decode time, audio pops before video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
	Audio,
	Video,
	Other,
}

impl MediaKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Audio => "audio",
			Self::Video => "video",
			Self::Other => "other",
		}
	}
}

impl fmt::Display for MediaKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Rational tick unit of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
	pub num: i32,
	pub den: i32,
}

impl TimeBase {
	pub const MILLIS: Self = Self::new(1, 1000);

	pub const fn new(num: i32, den: i32) -> Self {
		Self { num, den }
	}

	#[allow(clippy::cast_precision_loss)]
	pub fn seconds(self, ticks: i64) -> f64 {
		ticks as f64 * f64::from(self.num) / f64::from(self.den)
	}

	/// Truncates toward zero
	#[allow(clippy::cast_possible_truncation)]
	pub fn ticks(self, seconds: f64) -> i64 {
		(seconds * f64::from(self.den) / f64::from(self.num)) as i64
	}
}

impl fmt::Display for TimeBase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.num, self.den)
	}
}

#[derive(Debug, Clone)]
pub struct Packet {
	pub kind: MediaKind,
	pub pts: Option<i64>,
	pub dts: Option<i64>,
	pub duration: i64,
	pub time_base: TimeBase,
	pub keyframe: bool,
	pub data: Bytes,
}

impl Packet {
	pub fn new(kind: MediaKind, dts: i64, pts: i64, time_base: TimeBase) -> Self {
		Self {
			kind,
			pts: Some(pts),
			dts: Some(dts),
			duration: 0,
			time_base,
			keyframe: false,
			data: Bytes::new(),
		}
	}

	#[must_use]
	pub const fn with_keyframe(mut self, keyframe: bool) -> Self {
		self.keyframe = keyframe;
		self
	}

	#[must_use]
	pub const fn with_duration(mut self, duration: i64) -> Self {
		self.duration = duration;
		self
	}

	pub fn decode_time(&self) -> Option<f64> {
		self.dts.map(|dts| self.time_base.seconds(dts))
	}

	/// Falls back to the decode time when the container left pts unset
	pub fn present_time(&self) -> Option<f64> {
		self.pts.or(self.dts).map(|pts| self.time_base.seconds(pts))
	}

	pub fn shift(&mut self, ticks: i64) {
		self.dts = self.dts.map(|dts| dts + ticks);
		self.pts = self.pts.map(|pts| pts + ticks);
	}
}

/// Backend-specific codec parameters carried alongside a descriptor
#[derive(Clone)]
pub struct CodecParameters(Arc<dyn Any + Send + Sync>);

impl CodecParameters {
	pub fn new<T: Any + Send + Sync>(value: T) -> Self {
		Self(Arc::new(value))
	}

	pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
		self.0.downcast_ref::<T>()
	}
}

impl fmt::Debug for CodecParameters {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("CodecParameters(..)")
	}
}

/// Everything needed to create a matching output stream
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
	pub kind: MediaKind,
	pub index: usize,
	pub time_base: TimeBase,
	pub codec: String,
	pub sample_rate: Option<u32>,
	pub width: Option<u32>,
	pub height: Option<u32>,
	pub parameters: Option<CodecParameters>,
}

impl StreamDescriptor {
	pub fn video(index: usize, codec: impl Into<String>, time_base: TimeBase, width: u32, height: u32) -> Self {
		Self {
			kind: MediaKind::Video,
			index,
			time_base,
			codec: codec.into(),
			sample_rate: None,
			width: Some(width),
			height: Some(height),
			parameters: None,
		}
	}

	pub fn audio(index: usize, codec: impl Into<String>, time_base: TimeBase, sample_rate: u32) -> Self {
		Self {
			kind: MediaKind::Audio,
			index,
			time_base,
			codec: codec.into(),
			sample_rate: Some(sample_rate),
			width: None,
			height: None,
			parameters: None,
		}
	}

	/// Sample rate and frame size must match for an output stream to be reused
	pub fn is_compatible(&self, other: &Self) -> bool {
		self.kind == other.kind && self.sample_rate == other.sample_rate && self.width == other.width && self.height == other.height
	}
}

/// An opened source. `read_packet` returns `Ok(None)` at end of stream.
pub trait MediaInput: Send {
	fn streams(&self) -> &[StreamDescriptor];
	fn read_packet(&mut self) -> Result<Option<Packet>, MediaError>;
}

/// An opened live output. Streams are added before the first write.
pub trait MediaOutput: Send {
	fn add_stream(&mut self, descriptor: &StreamDescriptor) -> Result<(), MediaError>;
	fn write_packet(&mut self, packet: Packet) -> Result<(), MediaError>;
	fn close(&mut self) -> Result<(), MediaError>;
}

pub trait MediaBackend: Send + Sync + 'static {
	fn open_input(&self, location: &str) -> Result<Box<dyn MediaInput>, MediaError>;
	fn open_output(&self, destination: &str, format: &str) -> Result<Box<dyn MediaOutput>, MediaError>;
}
