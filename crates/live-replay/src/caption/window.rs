use super::CaptionEvent;
use std::collections::VecDeque;

/// Result of closing one update round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flush {
	/// Nothing new arrived and the reserve was empty
	Skipped,
	Deliver {
		text: String,
		/// Slots of the round quota that could not be filled
		shortfall: usize,
	},
}

/// The displayed captions plus the reserve of displaced ones
#[derive(Debug)]
pub struct CaptionWindow {
	active: VecDeque<String>,
	capacity: usize,
	update_count: usize,
	reserve: Option<Vec<CaptionEvent>>,
}

impl CaptionWindow {
	pub fn new(total_count: usize, update_count: usize, stale_reserve: bool) -> Self {
		Self {
			active: VecDeque::with_capacity(total_count),
			capacity: total_count,
			update_count: update_count.min(total_count),
			reserve: stale_reserve.then(Vec::new),
		}
	}

	pub const fn update_count(&self) -> usize {
		self.update_count
	}

	/// Captions currently displayed
	pub fn shown(&self) -> usize {
		self.active.len()
	}

	pub fn reserved(&self) -> usize {
		self.reserve.as_ref().map_or(0, Vec::len)
	}

	pub fn text(&self) -> String {
		self.active.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
	}

	fn push_active(&mut self, text: String) {
		if self.capacity == 0 {
			return;
		}
		if self.active.len() == self.capacity {
			self.active.pop_front();
		}
		self.active.push_back(text);
	}

	/// Admits into the window while the round quota lasts, otherwise into the reserve
	pub fn admit(&mut self, event: &CaptionEvent, quota: &mut i64) {
		if *quota > 0 {
			self.push_active(event.text.clone());
		} else if let Some(reserve) = &mut self.reserve {
			reserve.push(event.clone());
		}
		*quota -= 1;
	}

	/// Closes a round with `remaining` unused quota, padding from the most recently reserved
	#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
	pub fn flush(&mut self, remaining: i64) -> Flush {
		let mut remaining = remaining.max(0) as usize;
		while remaining > 0 {
			let Some(event) = self.reserve.as_mut().and_then(Vec::pop) else {
				break;
			};
			self.push_active(event.text);
			remaining -= 1;
		}

		if remaining > 0 && remaining == self.update_count {
			return Flush::Skipped;
		}
		Flush::Deliver { text: self.text(), shortfall: remaining }
	}
}
