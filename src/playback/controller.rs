//! Failover state machine for one playback session
//!
//! The controller is pure: it consumes signals and returns [`Command`]s for
//! the driver to execute. It never touches a media resource or a clock.
//!
//! ```text
//! Idle ──select──► Loading(i) ──loaded──► Playing(i)
//!                     │  ▲                  │
//!        fail/timeout │  │ advance          │ fail / skip
//!                     ▼  │                  ▼
//!                  Failed(i) ──────────► Loading(i+1) ... Exhausted
//! ```
//!
//! Every attach gets a fresh attempt number. Signals and timers carrying an
//! older attempt number are ignored.

use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PlaybackConfig;
use crate::errors::MediaLoadError;
use crate::models::Stream;
use crate::utils::url::UrlUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverSettings {
    pub load_timeout: Duration,
    /// Pause before the next candidate after a media failure
    pub advance_delay: Duration,
    /// Pause before the next candidate after a load timeout
    pub timeout_advance_delay: Duration,
    /// In-place retries of one candidate for transient failures
    pub max_in_place_recoveries: u32,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(15),
            advance_delay: Duration::from_millis(2_000),
            timeout_advance_delay: Duration::from_millis(1_000),
            max_in_place_recoveries: 1,
        }
    }
}

impl FailoverSettings {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            load_timeout: config.load_timeout(),
            advance_delay: config.advance_delay(),
            timeout_advance_delay: config.timeout_advance_delay(),
            max_in_place_recoveries: config.max_in_place_recoveries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    LoadTimeout,
    Media(MediaLoadError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::LoadTimeout => write!(f, "no playable signal before the load timeout"),
            FailureReason::Media(err) => write!(f, "{}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading { index: usize },
    /// Pausing is a sub-state of playing, not a transition
    Playing { index: usize, paused: bool },
    Failed { index: usize, reason: FailureReason },
    Exhausted,
}

impl PlaybackState {
    pub fn index(&self) -> Option<usize> {
        match self {
            PlaybackState::Loading { index }
            | PlaybackState::Playing { index, .. }
            | PlaybackState::Failed { index, .. } => Some(*index),
            PlaybackState::Idle | PlaybackState::Exhausted => None,
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing { .. })
    }

    /// No further transitions happen without a new selection
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackState::Exhausted | PlaybackState::Idle)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Loading { index } => write!(f, "loading #{}", index),
            PlaybackState::Playing { index, paused: false } => write!(f, "playing #{}", index),
            PlaybackState::Playing { index, paused: true } => write!(f, "paused #{}", index),
            PlaybackState::Failed { index, reason } => write!(f, "failed #{}: {}", index, reason),
            PlaybackState::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Side effects requested by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Attach a media resource for this candidate
    Attach { attempt: u64, index: usize, stream: Stream },
    /// Release the attached resource
    Detach,
    StartLoadTimer { attempt: u64, after: Duration },
    ScheduleAdvance { attempt: u64, after: Duration },
    CancelTimer,
    /// Retry the attached resource without switching candidates
    RecoverInPlace { attempt: u64 },
    Pause,
    Resume,
}

#[derive(Debug, Clone)]
pub struct FailoverController {
    settings: FailoverSettings,
    candidates: Vec<Stream>,
    state: PlaybackState,
    attempt: u64,
    attached: bool,
    recoveries: u32,
    last_attempted: Option<usize>,
}

impl FailoverController {
    pub fn new(settings: FailoverSettings) -> Self {
        Self {
            settings,
            candidates: Vec::new(),
            state: PlaybackState::Idle,
            attempt: 0,
            attached: false,
            recoveries: 0,
            last_attempted: None,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn candidates(&self) -> &[Stream] {
        &self.candidates
    }

    pub fn current_stream(&self) -> Option<&Stream> {
        self.state.index().and_then(|i| self.candidates.get(i))
    }

    /// Raw URL of the last candidate tried, for opening elsewhere
    pub fn fallback_url(&self) -> Option<&str> {
        self.last_attempted
            .and_then(|i| self.candidates.get(i))
            .map(|s| s.url.as_str())
    }

    /// Start over with a channel's ordered candidates
    pub fn select(&mut self, candidates: Vec<Stream>) -> Vec<Command> {
        let mut commands = self.release();
        self.candidates = candidates;
        self.last_attempted = None;
        commands.extend(self.start_candidate(0));
        commands
    }

    pub fn on_loaded(&mut self, attempt: u64) -> Vec<Command> {
        if attempt != self.attempt {
            return Vec::new();
        }
        match self.state {
            PlaybackState::Loading { index } => {
                info!("Candidate #{} is playing", index);
                self.state = PlaybackState::Playing {
                    index,
                    paused: false,
                };
                vec![Command::CancelTimer]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_load_timeout(&mut self, attempt: u64) -> Vec<Command> {
        if attempt != self.attempt {
            return Vec::new();
        }
        match self.state {
            PlaybackState::Loading { index } => {
                warn!(
                    "Candidate #{} did not start within {:?}",
                    index, self.settings.load_timeout
                );
                self.fail(index, FailureReason::LoadTimeout, self.settings.timeout_advance_delay)
            }
            _ => Vec::new(),
        }
    }

    pub fn on_error(&mut self, attempt: u64, error: MediaLoadError) -> Vec<Command> {
        if attempt != self.attempt {
            return Vec::new();
        }
        let index = match self.state {
            PlaybackState::Loading { index } | PlaybackState::Playing { index, .. } => index,
            _ => return Vec::new(),
        };

        if error == MediaLoadError::Aborted {
            debug!("Load of candidate #{} aborted, staying put", index);
            return Vec::new();
        }

        if error.is_transient() && self.recoveries < self.settings.max_in_place_recoveries {
            self.recoveries += 1;
            warn!(
                "Recovering candidate #{} in place ({}/{}): {}",
                index, self.recoveries, self.settings.max_in_place_recoveries, error
            );
            self.state = PlaybackState::Loading { index };
            return vec![
                Command::RecoverInPlace {
                    attempt: self.attempt,
                },
                Command::StartLoadTimer {
                    attempt: self.attempt,
                    after: self.settings.load_timeout,
                },
            ];
        }

        warn!("Candidate #{} failed: {}", index, error);
        self.fail(index, FailureReason::Media(error), self.settings.advance_delay)
    }

    pub fn on_advance_due(&mut self, attempt: u64) -> Vec<Command> {
        if attempt != self.attempt {
            return Vec::new();
        }
        match self.state {
            PlaybackState::Failed { index, .. } => self.start_candidate(index + 1),
            _ => Vec::new(),
        }
    }

    /// Manual advance to the next candidate, with or without a failure
    pub fn skip(&mut self) -> Vec<Command> {
        let Some(index) = self.state.index() else {
            return Vec::new();
        };
        info!("Skipping candidate #{}", index);
        let mut commands = self.release();
        commands.extend(self.start_candidate(index + 1));
        commands
    }

    pub fn pause(&mut self) -> Vec<Command> {
        match self.state {
            PlaybackState::Playing {
                index,
                paused: false,
            } => {
                self.state = PlaybackState::Playing {
                    index,
                    paused: true,
                };
                vec![Command::Pause]
            }
            _ => Vec::new(),
        }
    }

    pub fn resume(&mut self) -> Vec<Command> {
        match self.state {
            PlaybackState::Playing { index, paused: true } => {
                self.state = PlaybackState::Playing {
                    index,
                    paused: false,
                };
                vec![Command::Resume]
            }
            _ => Vec::new(),
        }
    }

    /// Tear everything down and return to idle
    pub fn stop(&mut self) -> Vec<Command> {
        let commands = self.release();
        self.state = PlaybackState::Idle;
        commands
    }

    /// Detach and invalidate outstanding signals and timers
    fn release(&mut self) -> Vec<Command> {
        self.attempt += 1;
        let mut commands = vec![Command::CancelTimer];
        if self.attached {
            self.attached = false;
            commands.push(Command::Detach);
        }
        commands
    }

    fn fail(&mut self, index: usize, reason: FailureReason, delay: Duration) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.attached {
            self.attached = false;
            commands.push(Command::Detach);
        }
        self.state = PlaybackState::Failed { index, reason };
        commands.push(Command::ScheduleAdvance {
            attempt: self.attempt,
            after: delay,
        });
        commands
    }

    fn start_candidate(&mut self, index: usize) -> Vec<Command> {
        self.attempt += 1;
        self.recoveries = 0;

        let Some(stream) = self.candidates.get(index).cloned() else {
            if self.candidates.is_empty() {
                warn!("No candidates to play");
            } else {
                warn!(
                    "All {} candidates failed; last tried {}",
                    self.candidates.len(),
                    self.fallback_url()
                        .map(UrlUtils::obfuscate_credentials)
                        .unwrap_or_default()
                );
            }
            self.state = PlaybackState::Exhausted;
            return Vec::new();
        };

        debug!(
            "Loading candidate #{} of {}: {}",
            index,
            self.candidates.len(),
            UrlUtils::obfuscate_credentials(&stream.url)
        );
        self.state = PlaybackState::Loading { index };
        self.attached = true;
        self.last_attempted = Some(index);
        vec![
            Command::Attach {
                attempt: self.attempt,
                index,
                stream,
            },
            Command::StartLoadTimer {
                attempt: self.attempt,
                after: self.settings.load_timeout,
            },
        ]
    }
}
