//! FFmpeg backend (requires the `ffmpeg` feature and system FFmpeg libraries).
//!
//! Packets are remuxed without decoding: the best video and audio streams of the input
//! are read, and written to the output with their codec parameters copied over.

use super::{CodecParameters, MediaBackend, MediaInput, MediaKind, MediaOutput, Packet, StreamDescriptor, TimeBase};
use crate::error::MediaError;
use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Codec parameters of an input stream, kept for creating output streams later
struct SharedParameters(Mutex<ffmpeg::codec::Parameters>);

pub struct FfmpegBackend;

impl FfmpegBackend {
	pub fn new() -> Result<Self, MediaError> {
		// safe to call repeatedly
		ffmpeg::init().map_err(|e| MediaError::open("ffmpeg", format!("FFmpeg init failed: {e}")))?;
		Ok(Self)
	}
}

impl MediaBackend for FfmpegBackend {
	fn open_input(&self, location: &str) -> Result<Box<dyn MediaInput>, MediaError> {
		let context = ffmpeg::format::input(&location).map_err(|e| MediaError::open(location, e))?;

		let mut descriptors = Vec::new();
		let mut mapping = HashMap::new();
		for (kind, medium) in [(MediaKind::Video, ffmpeg::media::Type::Video), (MediaKind::Audio, ffmpeg::media::Type::Audio)] {
			let Some(stream) = context.streams().best(medium) else {
				debug!(location, kind = %kind, "No stream of this kind");
				continue;
			};
			let descriptor = describe(kind, &stream);
			mapping.insert(stream.index(), (kind, descriptor.time_base));
			descriptors.push(descriptor);
		}

		if descriptors.is_empty() {
			return Err(MediaError::open(location, "no audio or video stream"));
		}
		info!(location, streams = descriptors.len(), "📂 Opened input");

		Ok(Box::new(FfmpegInput { context, descriptors, mapping }))
	}

	fn open_output(&self, destination: &str, format: &str) -> Result<Box<dyn MediaOutput>, MediaError> {
		let context = ffmpeg::format::output_as(&destination, format).map_err(|e| MediaError::open(destination, e))?;
		info!(destination, format, "📡 Opened output");

		Ok(Box::new(FfmpegOutput {
			context,
			streams: HashMap::new(),
			header_written: false,
		}))
	}
}

fn describe(kind: MediaKind, stream: &ffmpeg::format::stream::Stream<'_>) -> StreamDescriptor {
	let parameters = stream.parameters();
	let time_base = TimeBase::new(stream.time_base().numerator(), stream.time_base().denominator());
	let codec = format!("{:?}", parameters.id()).to_lowercase();

	let decoder = ffmpeg::codec::context::Context::from_parameters(parameters.clone()).ok().map(|context| context.decoder());
	let (sample_rate, width, height) = match kind {
		MediaKind::Video => decoder.and_then(|d| d.video().ok()).map_or((None, None, None), |v| (None, Some(v.width()), Some(v.height()))),
		MediaKind::Audio => decoder.and_then(|d| d.audio().ok()).map_or((None, None, None), |a| (Some(a.rate()), None, None)),
		MediaKind::Other => (None, None, None),
	};

	StreamDescriptor {
		kind,
		index: stream.index(),
		time_base,
		codec,
		sample_rate,
		width,
		height,
		parameters: Some(CodecParameters::new(SharedParameters(Mutex::new(parameters)))),
	}
}

struct FfmpegInput {
	context: ffmpeg::format::context::Input,
	descriptors: Vec<StreamDescriptor>,
	mapping: HashMap<usize, (MediaKind, TimeBase)>,
}

impl MediaInput for FfmpegInput {
	fn streams(&self) -> &[StreamDescriptor] {
		&self.descriptors
	}

	fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
		let mut packet = ffmpeg::Packet::empty();
		loop {
			match packet.read(&mut self.context) {
				Ok(()) => {}
				Err(ffmpeg::Error::Eof) => return Ok(None),
				Err(e) => return Err(MediaError::Read(e.to_string())),
			}
			let Some(&(kind, time_base)) = self.mapping.get(&packet.stream()) else {
				continue;
			};

			return Ok(Some(Packet {
				kind,
				pts: packet.pts(),
				dts: packet.dts(),
				duration: packet.duration(),
				time_base,
				keyframe: packet.is_key(),
				data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
			}));
		}
	}
}

struct FfmpegOutput {
	context: ffmpeg::format::context::Output,
	streams: HashMap<MediaKind, usize>,
	header_written: bool,
}

impl MediaOutput for FfmpegOutput {
	fn add_stream(&mut self, descriptor: &StreamDescriptor) -> Result<(), MediaError> {
		if self.header_written {
			return Err(MediaError::Unsupported("streams cannot be added after the header".to_string()));
		}
		let parameters = descriptor
			.parameters
			.as_ref()
			.and_then(|p| p.downcast_ref::<SharedParameters>())
			.ok_or_else(|| MediaError::Unsupported(format!("{} stream has no ffmpeg codec parameters", descriptor.kind)))?;

		let mut stream = self
			.context
			.add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
			.map_err(|e| MediaError::Unsupported(e.to_string()))?;
		stream.set_parameters(parameters.0.lock().unwrap_or_else(PoisonError::into_inner).clone());
		stream.set_time_base(ffmpeg::Rational::new(descriptor.time_base.num, descriptor.time_base.den));
		self.streams.insert(descriptor.kind, stream.index());
		Ok(())
	}

	fn write_packet(&mut self, packet: Packet) -> Result<(), MediaError> {
		let Some(&index) = self.streams.get(&packet.kind) else {
			return Err(MediaError::Unsupported(format!("no {} stream on output", packet.kind)));
		};
		if !self.header_written {
			self.context.write_header().map_err(|e| MediaError::Write(e.to_string()))?;
			self.header_written = true;
		}
		let output_time_base = self.context.stream(index).map(|s| s.time_base()).ok_or_else(|| MediaError::Write(format!("output stream {index} vanished")))?;

		let mut out = ffmpeg::Packet::copy(&packet.data);
		out.set_pts(packet.pts);
		out.set_dts(packet.dts);
		out.set_duration(packet.duration);
		if packet.keyframe {
			out.set_flags(ffmpeg::packet::Flags::KEY);
		}
		out.set_stream(index);
		out.set_position(-1);
		out.rescale_ts(ffmpeg::Rational::new(packet.time_base.num, packet.time_base.den), output_time_base);
		out.write_interleaved(&mut self.context).map_err(|e| MediaError::Write(e.to_string()))
	}

	fn close(&mut self) -> Result<(), MediaError> {
		if self.header_written {
			self.header_written = false;
			self.context.write_trailer().map_err(|e| MediaError::Close(e.to_string()))?;
		}
		Ok(())
	}
}
