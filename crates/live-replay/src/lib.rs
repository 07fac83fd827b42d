// live-replay Library
//
// Stitches independently recorded files into one continuous, wall-clock paced
// live stream and keeps a caption overlay in step with the playback clock.

pub mod broadcast;
pub mod buffer;
pub mod caption;
pub mod config;
pub mod error;
pub mod media;
pub mod mux;
pub mod output;
pub mod progress;
pub mod rebase;
pub mod retry;
pub mod session;
pub mod source;

pub use broadcast::{Broadcast, PlaybackTicket};
pub use caption::{CaptionEvent, CaptionRequest, CaptionScheduler, CaptionSink, CaptionSource, RoundRobinSink};
pub use config::{BroadcastConfig, CaptionConfig, DecodeRetryConfig, PacingConfig};
pub use error::{CaptionError, Error, MediaError, Result};
pub use media::{MediaBackend, MediaInput, MediaKind, MediaOutput, Packet, StreamDescriptor, TimeBase};
pub use progress::{Progress, ProgressMessage, ProgressReceiver};
pub use retry::RetryConfig;
pub use session::{PlayRequest, SessionPhase};
pub use source::{MediaSource, SourceResolver};
