use crate::error::MediaError;
use crate::media::{MediaBackend, MediaKind, MediaOutput, Packet, StreamDescriptor};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Output container shared by the mux task and the session controller.
///
/// Only touched from the blocking pool, so a std mutex guards it.
pub type SharedOutput = Arc<Mutex<OutputSession>>;

pub fn lock_output(output: &SharedOutput) -> MutexGuard<'_, OutputSession> {
	output.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The live output container plus the stream map it was built from
pub struct OutputSession {
	backend: Arc<dyn MediaBackend>,
	destination: String,
	format: String,
	container: Option<Box<dyn MediaOutput>>,
	streams: BTreeMap<MediaKind, StreamDescriptor>,
	generation: watch::Sender<u64>,
}

impl OutputSession {
	pub fn new(backend: Arc<dyn MediaBackend>, destination: impl Into<String>, format: impl Into<String>) -> Self {
		Self {
			backend,
			destination: destination.into(),
			format: format.into(),
			container: None,
			streams: BTreeMap::new(),
			generation: watch::channel(0).0,
		}
	}

	pub fn shared(self) -> SharedOutput {
		Arc::new(Mutex::new(self))
	}

	pub fn destination(&self) -> &str {
		&self.destination
	}

	pub fn has_streams(&self) -> bool {
		!self.streams.is_empty()
	}

	pub fn streams(&self) -> impl Iterator<Item = &StreamDescriptor> {
		self.streams.values()
	}

	/// Bumped every time the container is replaced; zero until the first open succeeds
	pub fn generation(&self) -> u64 {
		*self.generation.borrow()
	}

	/// Lets the mux task follow container replacements without taking the lock
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.generation.subscribe()
	}

	/// Opens the container with the first video and first audio stream of `descriptors`
	pub fn register(&mut self, descriptors: &[StreamDescriptor]) -> Result<(), MediaError> {
		let mut selected = BTreeMap::new();
		for descriptor in descriptors {
			if matches!(descriptor.kind, MediaKind::Video | MediaKind::Audio) {
				selected.entry(descriptor.kind).or_insert_with(|| descriptor.clone());
			}
		}
		if selected.is_empty() {
			return Err(MediaError::Unsupported("input has neither audio nor video".to_string()));
		}

		self.streams = selected;
		if let Err(e) = self.open() {
			self.streams.clear();
			return Err(e);
		}
		info!(destination = %self.destination, streams = self.streams.len(), "🎛️ Output streams registered");
		Ok(())
	}

	/// Same kinds, same sample rate and frame size
	pub fn is_compatible(&self, descriptors: &[StreamDescriptor]) -> bool {
		let mut kinds = 0;
		for current in self.streams.values() {
			match descriptors.iter().find(|d| d.kind == current.kind) {
				Some(incoming) if current.is_compatible(incoming) => kinds += 1,
				_ => return false,
			}
		}
		let incoming_kinds = [MediaKind::Video, MediaKind::Audio].iter().filter(|kind| descriptors.iter().any(|d| d.kind == **kind)).count();
		kinds == incoming_kinds
	}

	/// Replaces the container and its streams with ones built from a new input.
	///
	/// On failure the previous stream layout is reopened so whatever was playing can carry on.
	pub fn rebuild(&mut self, descriptors: &[StreamDescriptor]) -> Result<(), MediaError> {
		warn!(destination = %self.destination, "🔁 Rebuilding output for incompatible input");
		let previous = self.streams.clone();
		self.close_container();
		let Err(e) = self.register(descriptors) else {
			return Ok(());
		};

		self.streams = previous;
		match self.open() {
			Ok(()) => warn!(destination = %self.destination, error = %e, "↩️ Rebuild failed, previous output restored"),
			Err(restore) => error!(destination = %self.destination, error = %restore, "❌ Rebuild failed and previous output could not be restored"),
		}
		Err(e)
	}

	/// Closes and reopens against the same destination with the known streams
	pub fn reopen(&mut self) -> Result<(), MediaError> {
		self.close_container();
		self.open()?;
		info!(destination = %self.destination, generation = self.generation(), "🔌 Output reopened");
		Ok(())
	}

	fn open(&mut self) -> Result<(), MediaError> {
		let mut container = self.backend.open_output(&self.destination, &self.format)?;
		for descriptor in self.streams.values() {
			container.add_stream(descriptor)?;
		}
		self.container = Some(container);
		self.generation.send_modify(|generation| *generation += 1);
		Ok(())
	}

	pub fn write(&mut self, packet: Packet) -> Result<(), MediaError> {
		if !self.streams.contains_key(&packet.kind) {
			debug!(kind = %packet.kind, "No output stream for packet kind, skipping");
			return Ok(());
		}
		let container = self.container.as_mut().ok_or_else(|| MediaError::Write("output container is not open".to_string()))?;
		container.write_packet(packet)
	}

	fn close_container(&mut self) {
		if let Some(mut container) = self.container.take() {
			if let Err(e) = container.close() {
				warn!(error = %e, "⚠️ Failed to close output cleanly");
			}
		}
	}

	pub fn close(&mut self) {
		self.close_container();
		debug!(destination = %self.destination, "Output closed");
	}
}
