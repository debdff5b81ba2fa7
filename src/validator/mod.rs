//! Concurrent stream reachability validation
//!
//! A fixed pool of `concurrency` workers drains a shared queue of work units.
//! A unit is either one flat target or one channel's full candidate list; in
//! the latter case the owning worker tries candidates strictly in priority
//! order. Every probe is raced against the per-probe timeout and its outcome
//! is recorded as data, so a single bad source never aborts the batch.
//!
//! ```text
//!   queue ──► worker 1 ──► probe ──┐
//!         ──► worker 2 ──► probe ──┼──► results ──► fold ──► sort
//!         ──► worker N ──► probe ──┘
//! ```

use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ValidationConfig;
use crate::errors::MediaLoadError;
use crate::ingestor::ChannelIndex;
use crate::models::{ValidationResult, ValidationStatus};
use crate::utils::url::UrlUtils;

pub mod probe;

pub use probe::{
    probe_from_config, FfprobeMediaProbe, HlsManifestProbe, HttpMediaProbe, MediaProbe,
    ProbeTarget,
};

/// `(completed, total)` after each finished unit of work
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Channel id, invoked the first time any of its sources succeeds
pub type PlayableCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(12_000);

/// A single source validated on its own
#[derive(Debug, Clone)]
pub struct FlatTarget {
    pub channel_id: String,
    pub channel_name: String,
    pub target: ProbeTarget,
}

/// A channel's candidates in priority order
#[derive(Debug, Clone)]
pub struct ChannelCandidates {
    pub channel_id: String,
    pub channel_name: String,
    pub candidates: Vec<ProbeTarget>,
}

#[derive(Debug, Clone)]
pub enum ValidationTargets {
    Flat(Vec<FlatTarget>),
    Grouped(Vec<ChannelCandidates>),
}

impl ValidationTargets {
    /// One unit per stream, in channel then candidate order
    pub fn flat_from_index(index: &ChannelIndex) -> Self {
        let targets = index
            .iter()
            .flat_map(|(channel, streams)| {
                streams.iter().map(move |stream| FlatTarget {
                    channel_id: channel.id.clone(),
                    channel_name: channel.name.clone(),
                    target: ProbeTarget::from(stream),
                })
            })
            .collect();
        Self::Flat(targets)
    }

    /// One unit per channel
    pub fn grouped_from_index(index: &ChannelIndex) -> Self {
        let groups = index
            .iter()
            .map(|(channel, streams)| ChannelCandidates {
                channel_id: channel.id.clone(),
                channel_name: channel.name.clone(),
                candidates: streams.iter().map(ProbeTarget::from).collect(),
            })
            .collect();
        Self::Grouped(groups)
    }

    pub fn from_index(index: &ChannelIndex, grouped: bool) -> Self {
        if grouped {
            Self::grouped_from_index(index)
        } else {
            Self::flat_from_index(index)
        }
    }

    /// Number of units progress is reported against
    pub fn unit_count(&self) -> usize {
        match self {
            Self::Flat(targets) => targets.len(),
            Self::Grouped(groups) => groups.len(),
        }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self, Self::Grouped(_))
    }
}

#[derive(Clone)]
pub struct ValidationOptions {
    /// Maximum probes in flight at once
    pub concurrency: usize,
    /// Deadline for each individual probe
    pub timeout: Duration,
    pub on_progress: Option<ProgressCallback>,
    pub on_channel_playable: Option<PlayableCallback>,
    /// Keep probing a channel's remaining candidates after one succeeds
    pub probe_all_candidates: bool,
    /// Stop handing out work and abandon in-flight probes
    pub cancellation: Option<CancellationToken>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            on_progress: None,
            on_channel_playable: None,
            probe_all_candidates: false,
            cancellation: None,
        }
    }
}

impl fmt::Debug for ValidationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationOptions")
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_channel_playable", &self.on_channel_playable.is_some())
            .field("probe_all_candidates", &self.probe_all_candidates)
            .field("cancellation", &self.cancellation.is_some())
            .finish()
    }
}

impl ValidationOptions {
    pub fn from_config(config: &ValidationConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            timeout: config.timeout(),
            probe_all_candidates: config.probe_all_candidates,
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_channel_playable<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_channel_playable = Some(Arc::new(callback));
        self
    }

    pub fn with_probe_all_candidates(mut self, probe_all: bool) -> Self {
        self.probe_all_candidates = probe_all;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

enum WorkUnit {
    Flat(FlatTarget),
    Channel(ChannelCandidates),
}

/// Result tagged with its dispatch position
struct Recorded {
    unit: usize,
    attempt: usize,
    result: ValidationResult,
}

#[derive(Default)]
struct RunState {
    completed: usize,
    results: Vec<Recorded>,
    notified: HashSet<String>,
}

struct Shared {
    probe: Arc<dyn MediaProbe>,
    queue: Mutex<VecDeque<(usize, WorkUnit)>>,
    state: Mutex<RunState>,
    total: usize,
    options: ValidationOptions,
}

impl Shared {
    async fn next_unit(&self) -> Option<(usize, WorkUnit)> {
        if self.is_cancelled() {
            return None;
        }
        self.queue.lock().await.pop_front()
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancellation
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
    }

    /// Probe one target unless the run is cancelled first
    async fn probe_target(
        &self,
        channel_id: &str,
        channel_name: &str,
        target: &ProbeTarget,
    ) -> Option<ValidationResult> {
        let probe = probe_one(
            self.probe.as_ref(),
            channel_id,
            channel_name,
            target,
            self.options.timeout,
        );
        match &self.options.cancellation {
            Some(token) => tokio::select! {
                _ = token.cancelled() => None,
                result = probe => Some(result),
            },
            None => Some(probe.await),
        }
    }

    async fn mark_playable(&self, channel_id: &str) {
        let mut state = self.state.lock().await;
        if state.notified.insert(channel_id.to_string()) {
            debug!("Channel {} became playable", channel_id);
            if let Some(callback) = &self.options.on_channel_playable {
                callback(channel_id);
            }
        }
    }

    async fn complete_unit(&self, unit: usize, results: Vec<ValidationResult>) {
        let mut state = self.state.lock().await;
        state.results.extend(
            results
                .into_iter()
                .enumerate()
                .map(|(attempt, result)| Recorded { unit, attempt, result }),
        );
        state.completed += 1;
        // under the lock so observers see strictly increasing counts
        if let Some(callback) = &self.options.on_progress {
            callback(state.completed, self.total);
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        let mut handled = 0usize;
        while let Some((unit, work)) = self.next_unit().await {
            let results = match work {
                WorkUnit::Flat(flat) => {
                    let Some(result) = self
                        .probe_target(&flat.channel_id, &flat.channel_name, &flat.target)
                        .await
                    else {
                        break;
                    };
                    if result.is_success() {
                        self.mark_playable(&flat.channel_id).await;
                    }
                    vec![result]
                }
                WorkUnit::Channel(group) => match self.run_channel(&group).await {
                    Some(results) => results,
                    None => break,
                },
            };
            self.complete_unit(unit, results).await;
            handled += 1;
        }
        debug!("Validation worker {} finished after {} units", worker_id, handled);
    }

    /// Candidates in priority order; `None` when cancelled mid-channel
    async fn run_channel(&self, group: &ChannelCandidates) -> Option<Vec<ValidationResult>> {
        let mut results = Vec::with_capacity(group.candidates.len());
        for candidate in &group.candidates {
            let result = self
                .probe_target(&group.channel_id, &group.channel_name, candidate)
                .await?;
            let success = result.is_success();
            results.push(result);
            if success {
                self.mark_playable(&group.channel_id).await;
                if !self.options.probe_all_candidates {
                    break;
                }
            }
        }
        Some(results)
    }
}

/// Reachability validator over a pluggable [`MediaProbe`]
#[derive(Clone)]
pub struct Validator {
    probe: Arc<dyn MediaProbe>,
}

impl Validator {
    pub fn new(probe: Arc<dyn MediaProbe>) -> Self {
        Self { probe }
    }

    /// Validate all targets and return the sorted results
    ///
    /// Grouped runs return one result per channel that had at least one
    /// candidate. Flat runs return one result per target. Successes always
    /// come first; each block is ordered by channel name.
    pub async fn validate(
        &self,
        targets: ValidationTargets,
        options: ValidationOptions,
    ) -> Vec<ValidationResult> {
        let grouped = targets.is_grouped();
        let total = targets.unit_count();
        let queue: VecDeque<(usize, WorkUnit)> = match targets {
            ValidationTargets::Flat(flat) => flat.into_iter().map(WorkUnit::Flat).enumerate().collect(),
            ValidationTargets::Grouped(groups) => groups
                .into_iter()
                .map(WorkUnit::Channel)
                .enumerate()
                .collect(),
        };

        if total == 0 {
            debug!("Nothing to validate");
            return Vec::new();
        }

        let worker_count = options.concurrency.max(1).min(total);
        info!(
            "Validating {} {} with {} workers (timeout {:?})",
            total,
            if grouped { "channels" } else { "streams" },
            worker_count,
            options.timeout
        );

        let started = Instant::now();
        let shared = Arc::new(Shared {
            probe: self.probe.clone(),
            queue: Mutex::new(queue),
            state: Mutex::new(RunState::default()),
            total,
            options,
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(shared.clone().run_worker(worker_id));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Validation worker terminated abnormally: {}", e);
            }
        }

        let state = std::mem::take(&mut *shared.state.lock().await);
        if state.completed < total {
            info!(
                "Validation stopped early: {}/{} units completed",
                state.completed, total
            );
        }

        let mut recorded = state.results;
        recorded.sort_by_key(|r| (r.unit, r.attempt));
        let results: Vec<ValidationResult> = recorded.into_iter().map(|r| r.result).collect();

        let mut results = if grouped {
            fold_by_channel(results)
        } else {
            results
        };
        sort_results(&mut results);

        let playable = results.iter().filter(|r| r.is_success()).count();
        info!(
            "Validation finished in {:?}: {}/{} playable",
            started.elapsed(),
            playable,
            results.len()
        );
        results
    }
}

/// Probe one target against a deadline and classify the outcome
pub async fn probe_one(
    probe: &dyn MediaProbe,
    channel_id: &str,
    channel_name: &str,
    target: &ProbeTarget,
    timeout: Duration,
) -> ValidationResult {
    let tested_at = Utc::now();
    let started = Instant::now();

    let (status, error_detail) = match tokio::time::timeout(timeout, load_with_fallback(probe, target)).await {
        Ok(Ok(())) => (ValidationStatus::Success, None),
        Ok(Err(e)) => (e.status(), Some(e.to_string())),
        Err(_) => (
            ValidationStatus::Timeout,
            Some(format!("No playable signal within {} ms", timeout.as_millis())),
        ),
    };
    let elapsed_millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    debug!(
        "Probe {} -> {} in {} ms",
        UrlUtils::obfuscate_credentials(&target.url),
        status,
        elapsed_millis
    );

    ValidationResult {
        channel_id: channel_id.to_string(),
        channel_name: channel_name.to_string(),
        url: target.url.clone(),
        status,
        error_detail,
        elapsed_millis: Some(elapsed_millis),
        tested_at,
    }
}

/// Direct media load, raced against a manifest probe for segmented URLs
pub async fn load_with_fallback(probe: &dyn MediaProbe, target: &ProbeTarget) -> Result<(), MediaLoadError> {
    if !UrlUtils::is_segmented_manifest(&target.url) {
        return probe.load_media(target).await;
    }

    let direct = probe.load_media(target);
    let manifest = probe.probe_manifest(target);
    tokio::pin!(direct, manifest);

    let mut direct_error: Option<MediaLoadError> = None;
    let mut manifest_error: Option<MediaLoadError> = None;
    loop {
        tokio::select! {
            outcome = &mut direct, if direct_error.is_none() => match outcome {
                Ok(()) => return Ok(()),
                Err(e) => direct_error = Some(e),
            },
            outcome = &mut manifest, if manifest_error.is_none() => match outcome {
                Ok(()) => return Ok(()),
                Err(e) => manifest_error = Some(e),
            },
        }

        if let (Some(direct), Some(manifest)) = (&direct_error, &manifest_error) {
            return Err(most_specific(direct.clone(), manifest.clone()));
        }
    }
}

/// The manifest failure says more about a segmented URL, unless it is not a media failure at all
fn most_specific(direct: MediaLoadError, manifest: MediaLoadError) -> MediaLoadError {
    match (&direct, &manifest) {
        (_, MediaLoadError::Unexpected(_)) => direct,
        _ => manifest,
    }
}

/// One result per channel: the first success, otherwise the first result
pub fn fold_by_channel(results: Vec<ValidationResult>) -> Vec<ValidationResult> {
    let mut folded: Vec<ValidationResult> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for result in results {
        match positions.get(&result.channel_id) {
            Some(&position) => {
                if result.is_success() && !folded[position].is_success() {
                    folded[position] = result;
                }
            }
            None => {
                positions.insert(result.channel_id.clone(), folded.len());
                folded.push(result);
            }
        }
    }

    folded
}

/// Successes first, then by channel name; stable for equal keys
pub fn sort_results(results: &mut [ValidationResult]) {
    results.sort_by(|a, b| {
        b.is_success()
            .cmp(&a.is_success())
            .then_with(|| compare_names(&a.channel_name, &b.channel_name))
    });
}

fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
