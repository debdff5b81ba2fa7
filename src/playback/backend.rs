//! Media resources driven by a playback session

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::MediaLoadError;
use crate::models::Stream;
use crate::utils::url::UrlUtils;
use crate::validator::{load_with_fallback, MediaProbe, ProbeTarget};

/// Signal reported by an attached resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSignal {
    /// Playback can begin
    Loaded,
    Failed(MediaLoadError),
}

/// Signal sink for one attached resource, stamped with its attempt number
#[derive(Debug, Clone)]
pub struct MediaEvents {
    attempt: u64,
    tx: mpsc::UnboundedSender<(u64, MediaSignal)>,
}

impl MediaEvents {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<(u64, MediaSignal)>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn loaded(&self) {
        self.send(MediaSignal::Loaded);
    }

    pub fn failed(&self, error: MediaLoadError) {
        self.send(MediaSignal::Failed(error));
    }

    fn send(&self, signal: MediaSignal) {
        // the session is gone, nothing left to tell
        let _ = self.tx.send((self.attempt, signal));
    }
}

/// A decoding resource bound to one candidate stream
pub trait AttachedMedia: Send {
    /// Retry loading the same stream in place
    fn recover(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    /// Release everything; must not block
    fn detach(&mut self);
}

pub trait MediaBackend: Send + Sync {
    /// Start loading a stream and report through `events`
    fn attach(
        &self,
        stream: &Stream,
        events: MediaEvents,
    ) -> Result<Box<dyn AttachedMedia>, MediaLoadError>;
}

/// Backend that treats a successful reachability probe as "playing"
pub struct ProbeMediaBackend {
    probe: Arc<dyn MediaProbe>,
}

impl ProbeMediaBackend {
    pub fn new(probe: Arc<dyn MediaProbe>) -> Self {
        Self { probe }
    }
}

impl MediaBackend for ProbeMediaBackend {
    fn attach(
        &self,
        stream: &Stream,
        events: MediaEvents,
    ) -> Result<Box<dyn AttachedMedia>, MediaLoadError> {
        let mut media = ProbeMedia {
            probe: self.probe.clone(),
            target: ProbeTarget::from(stream),
            events,
            task: None,
        };
        media.start();
        Ok(Box::new(media))
    }
}

struct ProbeMedia {
    probe: Arc<dyn MediaProbe>,
    target: ProbeTarget,
    events: MediaEvents,
    task: Option<JoinHandle<()>>,
}

impl ProbeMedia {
    fn start(&mut self) {
        self.abort();
        let probe = self.probe.clone();
        let target = self.target.clone();
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            match load_with_fallback(probe.as_ref(), &target).await {
                Ok(()) => events.loaded(),
                Err(e) => events.failed(e),
            }
        }));
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl AttachedMedia for ProbeMedia {
    fn recover(&mut self) {
        debug!(
            "Re-probing {} (attempt {})",
            UrlUtils::obfuscate_credentials(&self.target.url),
            self.events.attempt()
        );
        self.start();
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn detach(&mut self) {
        self.abort();
    }
}

impl Drop for ProbeMedia {
    fn drop(&mut self) {
        self.abort();
    }
}
