//! Live playback with automatic failover across a channel's candidates

pub mod backend;
pub mod controller;
pub mod session;

pub use backend::{AttachedMedia, MediaBackend, MediaEvents, MediaSignal, ProbeMediaBackend};
pub use controller::{Command, FailoverController, FailoverSettings, FailureReason, PlaybackState};
pub use session::{PlaybackOutcome, PlaybackSession, SessionHandle};
