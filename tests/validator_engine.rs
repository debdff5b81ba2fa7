use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use m3u_validator::errors::MediaLoadError;
use m3u_validator::ingestor::IngestionPipeline;
use m3u_validator::models::ValidationStatus;
use m3u_validator::validator::{
    ChannelCandidates, FlatTarget, MediaProbe, ProbeTarget, ValidationOptions, ValidationTargets,
    Validator,
};

/// Behaviour is picked from the URL path: `/ok`, `/fail`, `/hang` or `/slow`
#[derive(Default)]
struct ScriptedProbe {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaProbe for ScriptedProbe {
    async fn load_media(&self, target: &ProbeTarget) -> Result<(), MediaLoadError> {
        self.calls.lock().unwrap().push(target.url.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if target.url.contains("/ok") {
            Ok(())
        } else if target.url.contains("/fail") {
            Err(MediaLoadError::Network("connection refused".into()))
        } else if target.url.contains("/slow") {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        } else {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn probe_manifest(&self, _target: &ProbeTarget) -> Result<(), MediaLoadError> {
        Err(MediaLoadError::Manifest("not used".into()))
    }
}

fn flat(n: usize, behaviour: &str) -> FlatTarget {
    FlatTarget {
        channel_id: format!("ch_{n}"),
        channel_name: format!("Channel {n}"),
        target: ProbeTarget::new(format!("http://x/{behaviour}/{n}")),
    }
}

#[tokio::test(start_paused = true)]
async fn test_flat_successes_sorted_first_and_timeouts_share_workers() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe.clone());

    let targets = ValidationTargets::Flat(vec![
        flat(1, "ok"),
        flat(2, "hang"),
        flat(3, "ok"),
        flat(4, "hang"),
        flat(5, "hang"),
    ]);
    let options = ValidationOptions::default()
        .with_concurrency(2)
        .with_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let results = validator.validate(targets, options).await;
    let elapsed = started.elapsed();

    let summary: Vec<(&str, ValidationStatus)> = results
        .iter()
        .map(|r| (r.channel_name.as_str(), r.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("Channel 1", ValidationStatus::Success),
            ("Channel 3", ValidationStatus::Success),
            ("Channel 2", ValidationStatus::Timeout),
            ("Channel 4", ValidationStatus::Timeout),
            ("Channel 5", ValidationStatus::Timeout),
        ]
    );
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    assert!(probe.max_in_flight() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_probes_never_exceed_concurrency() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe.clone());

    let targets = ValidationTargets::Flat((0..20).map(|n| flat(n, "slow")).collect());
    let results = validator
        .validate(targets, ValidationOptions::default().with_concurrency(3))
        .await;

    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|r| r.is_success()));
    assert!(probe.max_in_flight() <= 3);
    assert!(probe.max_in_flight() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_progress_reaches_total_exactly_once() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let targets = ValidationTargets::Flat(
        (0..12)
            .map(|n| flat(n, if n % 3 == 0 { "fail" } else { "slow" }))
            .collect(),
    );
    let recorder = seen.clone();
    let options = ValidationOptions::default()
        .with_concurrency(4)
        .on_progress(move |completed, total| recorder.lock().unwrap().push((completed, total)));

    validator.validate(targets, options).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 12);
    for (i, (completed, total)) in seen.iter().enumerate() {
        assert_eq!(*completed, i + 1);
        assert_eq!(*total, 12);
    }
}

#[tokio::test(start_paused = true)]
async fn test_grouped_progress_counts_channels_not_candidates() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let group = |id: &str, paths: &[&str]| ChannelCandidates {
        channel_id: id.to_string(),
        channel_name: id.to_uppercase(),
        candidates: paths
            .iter()
            .map(|path| ProbeTarget::new(format!("http://x/{path}")))
            .collect(),
    };
    let targets = ValidationTargets::Grouped(vec![
        group("a", &["fail/a1", "slow/a2", "ok/a3"]),
        group("b", &["fail/b1", "fail/b2"]),
        group("c", &[]),
        group("d", &["slow/d1"]),
    ]);

    let recorder = seen.clone();
    let options = ValidationOptions::default()
        .with_concurrency(2)
        .on_progress(move |completed, total| recorder.lock().unwrap().push((completed, total)));
    let results = validator.validate(targets, options).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(1, 4), (2, 4), (3, 4), (4, 4)]
    );
    // the empty channel is counted but yields no result
    assert_eq!(results.len(), 3);
    assert_eq!(probe.calls().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_grouped_channel_playable_once_and_folded_to_success() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe.clone());
    let notified = Arc::new(Mutex::new(Vec::new()));

    let targets = ValidationTargets::Grouped(vec![ChannelCandidates {
        channel_id: "ch_a".into(),
        channel_name: "A".into(),
        candidates: vec![
            ProbeTarget::new("http://x/hang/1"),
            ProbeTarget::new("http://x/ok/2"),
            ProbeTarget::new("http://x/ok/3"),
        ],
    }]);
    let recorder = notified.clone();
    let options = ValidationOptions::default()
        .with_timeout(Duration::from_millis(100))
        .with_probe_all_candidates(true)
        .on_channel_playable(move |id| recorder.lock().unwrap().push(id.to_string()));

    let results = validator.validate(targets, options).await;

    assert_eq!(*notified.lock().unwrap(), vec!["ch_a".to_string()]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ValidationStatus::Success);
    assert_eq!(results[0].url, "http://x/ok/2");
    // candidates were tried strictly in order
    assert_eq!(
        probe.calls(),
        vec!["http://x/hang/1", "http://x/ok/2", "http://x/ok/3"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_grouped_stops_at_first_success_by_default() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe.clone());

    let targets = ValidationTargets::Grouped(vec![
        ChannelCandidates {
            channel_id: "ch_b".into(),
            channel_name: "B".into(),
            candidates: vec![
                ProbeTarget::new("http://x/fail/1"),
                ProbeTarget::new("http://x/ok/2"),
                ProbeTarget::new("http://x/ok/3"),
            ],
        },
        ChannelCandidates {
            channel_id: "ch_a".into(),
            channel_name: "A".into(),
            candidates: vec![
                ProbeTarget::new("http://x/fail/4"),
                ProbeTarget::new("http://x/fail/5"),
            ],
        },
        ChannelCandidates {
            channel_id: "ch_empty".into(),
            channel_name: "Empty".into(),
            candidates: Vec::new(),
        },
    ]);

    let results = validator
        .validate(targets, ValidationOptions::default().with_concurrency(1))
        .await;

    assert!(!probe.calls().contains(&"http://x/ok/3".to_string()));
    let summary: Vec<(&str, ValidationStatus, &str)> = results
        .iter()
        .map(|r| (r.channel_id.as_str(), r.status, r.url.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("ch_b", ValidationStatus::Success, "http://x/ok/2"),
            // ties among failures keep the first encountered
            ("ch_a", ValidationStatus::Failed, "http://x/fail/4"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_flat_mode_notifies_each_channel_once() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe);
    let counts: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut a1 = flat(1, "ok");
    let mut a2 = flat(2, "slow");
    a1.channel_id = "ch_a".into();
    a2.channel_id = "ch_a".into();
    let targets = ValidationTargets::Flat(vec![a1, a2, flat(3, "ok")]);

    let recorder = counts.clone();
    let options = ValidationOptions::default().on_channel_playable(move |id| {
        *recorder.lock().unwrap().entry(id.to_string()).or_default() += 1;
    });
    let results = validator.validate(targets, options).await;

    assert_eq!(results.len(), 3);
    let counts = counts.lock().unwrap();
    assert_eq!(counts.get("ch_a"), Some(&1));
    assert_eq!(counts.get("ch_3"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_abandons_in_flight_probes() {
    let probe = Arc::new(ScriptedProbe::default());
    let validator = Validator::new(probe.clone());
    let token = CancellationToken::new();

    let targets = ValidationTargets::Flat((0..6).map(|n| flat(n, "hang")).collect());
    let options = ValidationOptions::default()
        .with_timeout(Duration::from_secs(60))
        .with_cancellation(token.clone());

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let results = validator.validate(targets, options).await;

    assert!(results.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(probe.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_validate_targets_built_from_index() {
    let playlist = IngestionPipeline::ingest_text_with_defaults(concat!(
        "#EXTM3U\n",
        "#EXTINF:-1,Beta\nhttp://x/fail/b1\n",
        "#EXTINF:-1,Alpha\nhttp://x/fail/a1\n",
        "#EXTINF:-1,Beta\nhttp://x/ok/b2\n",
    ));
    let validator = Validator::new(Arc::new(ScriptedProbe::default()));

    let grouped = validator
        .validate(
            ValidationTargets::from_index(&playlist.index, true),
            ValidationOptions::default(),
        )
        .await;
    let names: Vec<(&str, ValidationStatus)> = grouped
        .iter()
        .map(|r| (r.channel_name.as_str(), r.status))
        .collect();
    assert_eq!(
        names,
        vec![
            ("Beta", ValidationStatus::Success),
            ("Alpha", ValidationStatus::Failed)
        ]
    );

    let flat = validator
        .validate(
            ValidationTargets::from_index(&playlist.index, false),
            ValidationOptions::default(),
        )
        .await;
    assert_eq!(flat.len(), 3);
    assert!(flat[0].is_success());
    assert!(flat[1..].iter().all(|r| !r.is_success()));
}
