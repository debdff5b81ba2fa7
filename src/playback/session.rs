//! Tokio driver for a [`FailoverController`]
//!
//! The driver task owns the controller, the single load/advance timer and
//! the signal channel from attached media. The attached resource itself
//! lives in a slot shared with the [`SessionHandle`] so that
//! [`SessionHandle::stop`] can release it synchronously.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{AttachedMedia, MediaBackend, MediaEvents, MediaSignal};
use super::controller::{Command, FailoverController, FailoverSettings, PlaybackState};
use crate::errors::{AppError, AppResult};
use crate::models::Stream;

type MediaSlot = Arc<Mutex<Option<Box<dyn AttachedMedia>>>>;

fn lock_slot(slot: &Mutex<Option<Box<dyn AttachedMedia>>>) -> MutexGuard<'_, Option<Box<dyn AttachedMedia>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserCommand {
    Pause,
    Resume,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    LoadTimeout,
    Advance,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    at: Instant,
    attempt: u64,
    kind: TimerKind,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackOutcome {
    pub final_state: PlaybackState,
    /// Every state the session entered, in order
    pub transitions: Vec<PlaybackState>,
    /// Raw URL of the last candidate tried
    pub fallback_url: Option<String>,
}

/// Control surface for a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<UserCommand>,
    cancel: CancellationToken,
    media: MediaSlot,
    state: watch::Receiver<PlaybackState>,
}

impl SessionHandle {
    pub fn pause(&self) {
        self.send(UserCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(UserCommand::Resume);
    }

    /// Advance to the next candidate without waiting for a failure
    pub fn skip(&self) {
        self.send(UserCommand::Skip);
    }

    /// Stop the session, releasing the attached resource before returning
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(mut media) = lock_slot(&self.media).take() {
            media.detach();
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    /// Resolve once the session reaches a state matching `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> PlaybackState
    where
        F: FnMut(&PlaybackState) -> bool,
    {
        let mut rx = self.state.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if predicate(&current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    fn send(&self, command: UserCommand) {
        if self.commands.send(command).is_err() {
            debug!("Playback session already finished, ignoring {:?}", command);
        }
    }
}

pub struct PlaybackSession {
    handle: SessionHandle,
    task: JoinHandle<PlaybackOutcome>,
}

impl PlaybackSession {
    /// Start playing a channel's candidates in priority order
    pub fn start(
        backend: Arc<dyn MediaBackend>,
        settings: FailoverSettings,
        candidates: Vec<Stream>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let media: MediaSlot = Arc::new(Mutex::new(None));

        // observers never see the pre-selection idle state
        info!("Starting playback over {} candidates", candidates.len());
        let mut controller = FailoverController::new(settings);
        let initial = controller.select(candidates);
        let (state_tx, state_rx) = watch::channel(controller.state().clone());

        let driver = Driver {
            controller,
            backend,
            media: media.clone(),
            cancel: cancel.clone(),
            signal_tx,
            state_tx,
            timer: None,
            transitions: Vec::new(),
        };
        let task = tokio::spawn(driver.run(initial, command_rx, signal_rx));

        Self {
            handle: SessionHandle {
                commands: command_tx,
                cancel,
                media,
                state: state_rx,
            },
            task,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Wait for the session to finish (exhausted or stopped)
    pub async fn finished(self) -> AppResult<PlaybackOutcome> {
        self.task
            .await
            .map_err(|e| AppError::internal(format!("playback session task failed: {}", e)))
    }

    /// Stop and wait for the driver to wind down
    pub async fn stop(self) -> AppResult<PlaybackOutcome> {
        self.handle.stop();
        self.finished().await
    }
}

struct Driver {
    controller: FailoverController,
    backend: Arc<dyn MediaBackend>,
    media: MediaSlot,
    cancel: CancellationToken,
    signal_tx: mpsc::UnboundedSender<(u64, MediaSignal)>,
    state_tx: watch::Sender<PlaybackState>,
    timer: Option<Timer>,
    transitions: Vec<PlaybackState>,
}

impl Driver {
    async fn run(
        mut self,
        initial: Vec<Command>,
        mut commands: mpsc::UnboundedReceiver<UserCommand>,
        mut signals: mpsc::UnboundedReceiver<(u64, MediaSignal)>,
    ) -> PlaybackOutcome {
        self.apply(initial);

        let cancel = self.cancel.clone();
        while !self.controller.state().is_terminal() {
            let timer = self.timer;
            let sleep = async move {
                match timer {
                    Some(timer) => tokio::time::sleep_until(timer.at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let next = tokio::select! {
                _ = cancel.cancelled() => self.controller.stop(),
                Some(command) = commands.recv() => match command {
                    UserCommand::Pause => self.controller.pause(),
                    UserCommand::Resume => self.controller.resume(),
                    UserCommand::Skip => self.controller.skip(),
                },
                Some((attempt, signal)) = signals.recv() => match signal {
                    MediaSignal::Loaded => self.controller.on_loaded(attempt),
                    MediaSignal::Failed(error) => self.controller.on_error(attempt, error),
                },
                _ = sleep => self.fire_timer(),
            };
            self.apply(next);
        }

        let final_state = self.controller.state().clone();
        info!("Playback session finished: {}", final_state);
        PlaybackOutcome {
            final_state,
            transitions: self.transitions,
            fallback_url: self.controller.fallback_url().map(str::to_string),
        }
    }

    fn fire_timer(&mut self) -> Vec<Command> {
        match self.timer.take() {
            Some(Timer {
                attempt,
                kind: TimerKind::LoadTimeout,
                ..
            }) => self.controller.on_load_timeout(attempt),
            Some(Timer {
                attempt,
                kind: TimerKind::Advance,
                ..
            }) => self.controller.on_advance_due(attempt),
            None => Vec::new(),
        }
    }

    /// Execute commands, feeding synchronous attach failures back in
    fn apply(&mut self, commands: Vec<Command>) {
        let mut pending: VecDeque<Command> = commands.into();
        while let Some(command) = pending.pop_front() {
            match command {
                Command::Attach {
                    attempt,
                    index,
                    stream,
                } => {
                    if let Err(error) = self.attach(attempt, &stream) {
                        warn!("Could not attach candidate #{}: {}", index, error);
                        pending.extend(self.controller.on_error(attempt, error));
                    }
                }
                Command::Detach => {
                    if let Some(mut media) = lock_slot(&self.media).take() {
                        media.detach();
                    }
                }
                Command::StartLoadTimer { attempt, after } => {
                    self.set_timer(attempt, after, TimerKind::LoadTimeout)
                }
                Command::ScheduleAdvance { attempt, after } => {
                    self.set_timer(attempt, after, TimerKind::Advance)
                }
                Command::CancelTimer => self.timer = None,
                Command::RecoverInPlace { .. } => {
                    if let Some(media) = lock_slot(&self.media).as_mut() {
                        media.recover();
                    }
                }
                Command::Pause => {
                    if let Some(media) = lock_slot(&self.media).as_mut() {
                        media.pause();
                    }
                }
                Command::Resume => {
                    if let Some(media) = lock_slot(&self.media).as_mut() {
                        media.resume();
                    }
                }
            }
        }
        self.publish();
    }

    fn attach(&self, attempt: u64, stream: &Stream) -> Result<(), crate::errors::MediaLoadError> {
        let mut slot = lock_slot(&self.media);
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if let Some(mut previous) = slot.take() {
            warn!("Detaching a resource that was still attached");
            previous.detach();
        }
        let events = MediaEvents::new(attempt, self.signal_tx.clone());
        *slot = Some(self.backend.attach(stream, events)?);
        Ok(())
    }

    fn set_timer(&mut self, attempt: u64, after: Duration, kind: TimerKind) {
        self.timer = Some(Timer {
            at: Instant::now() + after,
            attempt,
            kind,
        });
    }

    fn publish(&mut self) {
        let state = self.controller.state().clone();
        if self.transitions.last() != Some(&state) {
            debug!("Playback state -> {}", state);
            self.transitions.push(state.clone());
            self.state_tx.send_replace(state);
        }
    }
}
