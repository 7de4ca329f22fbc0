// tests/watcher_scenarios.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anchor_watch_lib::{
    AlertRepeatPolicy, Anchor, AnchorStore, CycleOutcome, DisplaySink, FetchError,
    MonitorConfig, MovementWatcher, NotificationSink, PositionFeed, PositionSample,
    ValidationError, WatchError, WatcherOptions, WatcherState,
};
use async_trait::async_trait;
use chrono::DateTime;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// --- Test doubles ---

/// Feed that replays a script, repeating the last entry once exhausted
struct ScriptedFeed {
    script: Mutex<VecDeque<Result<PositionSample, String>>>,
    last: Mutex<Option<Result<PositionSample, String>>>,
    calls: AtomicUsize,
}

impl ScriptedFeed {
    fn new(script: Vec<Result<PositionSample, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionFeed for ScriptedFeed {
    async fn fetch(&self) -> Result<PositionSample, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let step = match next {
            Some(step) => {
                *self.last.lock().unwrap() = Some(step.clone());
                step
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("script empty".to_string())),
        };
        step.map_err(FetchError::Network)
    }
}

#[derive(Default)]
struct RecordingSinks {
    positions: Mutex<Vec<PositionSample>>,
    anchors: Mutex<Vec<Anchor>>,
    alerts: Mutex<Vec<(String, String)>>,
}

impl DisplaySink for RecordingSinks {
    fn on_position_updated(&self, sample: &PositionSample) {
        self.positions.lock().unwrap().push(sample.clone());
    }

    fn on_anchor_loaded(&self, anchor: &Anchor) {
        self.anchors.lock().unwrap().push(anchor.clone());
    }
}

impl NotificationSink for RecordingSinks {
    fn notify(&self, title: &str, body: &str) {
        self.alerts
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
    }
}

// --- Helpers ---

fn sample(lat: f64, lon: f64) -> PositionSample {
    let ts = DateTime::parse_from_rfc3339("2024-10-01T08:00:00-04:00").unwrap();
    PositionSample::new(ts, lat, lon, Some(12.5))
}

fn options(armed: bool, threshold_meters: f64, policy: AlertRepeatPolicy) -> WatcherOptions {
    WatcherOptions {
        poll_interval: Duration::from_millis(7_500),
        monitor: MonitorConfig::new(armed, threshold_meters).unwrap(),
        repeat_policy: policy,
        sink_queue_capacity: 64,
    }
}

// Field order matters: the store releases its lock file before the
// directory is removed.
struct Fixture {
    store: Arc<AnchorStore>,
    sinks: Arc<RecordingSinks>,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(AnchorStore::open(dir.path().join("anchor.csv")).unwrap());
    Fixture {
        store,
        sinks: Arc::new(RecordingSinks::default()),
        _dir: dir,
    }
}

fn watcher(fx: &Fixture, feed: Arc<ScriptedFeed>, opts: WatcherOptions) -> MovementWatcher {
    MovementWatcher::new(
        feed,
        fx.store.clone(),
        fx.sinks.clone(),
        fx.sinks.clone(),
        opts,
    )
}

// --- Scenarios ---

#[tokio::test]
async fn no_anchor_saved_means_no_alert() {
    let fx = fixture();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.0, -70.0))]);
    let mut w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::OncePerAnchor));

    let outcome = w.poll_once().await;
    assert!(matches!(outcome, CycleOutcome::NoAnchor), "{:?}", outcome);
    assert_eq!(w.snapshot().current, Some(sample(40.0, -70.0)));

    w.finish().await;
    assert!(fx.sinks.alerts.lock().unwrap().is_empty());
    assert_eq!(fx.sinks.positions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sample_at_anchor_does_not_alert() {
    let fx = fixture();
    fx.store
        .save(&Anchor::from_sample(sample(40.0, -70.0)))
        .await
        .unwrap();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.0, -70.0))]);
    let mut w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::OncePerAnchor));

    match w.poll_once().await {
        CycleOutcome::WithinThreshold { distance_meters } => assert_eq!(distance_meters, 0.0),
        other => panic!("expected WithinThreshold, got {:?}", other),
    }

    w.finish().await;
    assert!(fx.sinks.alerts.lock().unwrap().is_empty());
    assert_eq!(fx.sinks.anchors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn movement_beyond_threshold_alerts_once_until_rearmed() {
    let fx = fixture();
    fx.store
        .save(&Anchor::from_sample(sample(40.0, -70.0)))
        .await
        .unwrap();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.001, -70.0))]);
    let mut w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::OncePerAnchor));
    let controls = w.controls();

    match w.poll_once().await {
        CycleOutcome::Alerted(alert) => {
            assert!((alert.distance_meters - 111.19).abs() < 0.1, "{}", alert.distance_meters);
            assert_eq!(alert.observed, sample(40.001, -70.0));
        }
        other => panic!("expected Alerted, got {:?}", other),
    }

    // Still displaced on the next cycle: held back
    assert!(matches!(
        w.poll_once().await,
        CycleOutcome::Suppressed { .. }
    ));

    // Re-arming re-enables the alert
    controls.arm();
    assert!(matches!(w.poll_once().await, CycleOutcome::Alerted(_)));

    let stats = w.snapshot().stats;
    assert_eq!(stats.alerts_raised, 2);
    assert_eq!(stats.alerts_suppressed, 1);

    w.finish().await;
    let alerts = fx.sinks.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].0, "Movement detected");
    assert!(alerts[0].1.contains("111.2 m"), "{}", alerts[0].1);
}

#[tokio::test]
async fn saving_a_new_anchor_resets_the_alert_latch() {
    let fx = fixture();
    fx.store
        .save(&Anchor::from_sample(sample(40.0, -70.0)))
        .await
        .unwrap();
    let feed = ScriptedFeed::new(vec![
        Ok(sample(40.001, -70.0)),
        Ok(sample(40.001, -70.0)),
        Ok(sample(40.003, -70.0)),
    ]);
    let mut w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::OncePerAnchor));
    let controls = w.controls();

    assert!(matches!(w.poll_once().await, CycleOutcome::Alerted(_)));

    // Anchor the object where it now sits
    let anchor = controls.save_current_as_anchor().await.unwrap();
    assert_eq!(anchor.latitude(), 40.001);
    assert!(matches!(
        w.poll_once().await,
        CycleOutcome::WithinThreshold { .. }
    ));

    // Moves again relative to the new anchor
    assert!(matches!(w.poll_once().await, CycleOutcome::Alerted(_)));
    w.finish().await;
}

#[tokio::test]
async fn every_cycle_policy_repeats_alerts() {
    let fx = fixture();
    fx.store
        .save(&Anchor::from_sample(sample(40.0, -70.0)))
        .await
        .unwrap();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.001, -70.0))]);
    let mut w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::EveryCycle));

    for _ in 0..3 {
        assert!(matches!(w.poll_once().await, CycleOutcome::Alerted(_)));
    }
    w.finish().await;
    assert_eq!(fx.sinks.alerts.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn cooldown_policy_waits_before_repeating() {
    let fx = fixture();
    fx.store
        .save(&Anchor::from_sample(sample(40.0, -70.0)))
        .await
        .unwrap();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.001, -70.0))]);
    let policy = AlertRepeatPolicy::Cooldown(Duration::from_secs(60));
    let mut w = watcher(&fx, feed, options(true, 50.0, policy));

    assert!(matches!(w.poll_once().await, CycleOutcome::Alerted(_)));
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(matches!(w.poll_once().await, CycleOutcome::Suppressed { .. }));
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(matches!(w.poll_once().await, CycleOutcome::Alerted(_)));
    w.finish().await;
}

#[tokio::test]
async fn disarmed_watcher_only_tracks_position() {
    let fx = fixture();
    fx.store
        .save(&Anchor::from_sample(sample(40.0, -70.0)))
        .await
        .unwrap();
    let feed = ScriptedFeed::new(vec![Ok(sample(41.0, -70.0))]);
    let mut w = watcher(&fx, feed, options(false, 50.0, AlertRepeatPolicy::OncePerAnchor));

    assert!(matches!(w.poll_once().await, CycleOutcome::Disarmed));
    assert_eq!(w.snapshot().current, Some(sample(41.0, -70.0)));
    w.finish().await;
    assert!(fx.sinks.alerts.lock().unwrap().is_empty());
    assert!(fx.sinks.anchors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_anchor_degrades_to_no_anchor() {
    let fx = fixture();
    tokio::fs::write(fx.store.path(), "garbage,record\n")
        .await
        .unwrap();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.001, -70.0))]);
    let mut w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::OncePerAnchor));

    assert!(matches!(w.poll_once().await, CycleOutcome::NoAnchor));
    w.finish().await;
    assert!(fx.sinks.alerts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_polls_keep_the_loop_running_without_mutation() {
    let fx = fixture();
    let feed = ScriptedFeed::new(vec![
        Err("connection refused".to_string()),
        Err("connection refused".to_string()),
        Err("connection refused".to_string()),
        Ok(sample(40.0, -70.0)),
    ]);
    let w = watcher(
        &fx,
        feed.clone(),
        options(false, 50.0, AlertRepeatPolicy::OncePerAnchor),
    );
    let handle = w.start(CancellationToken::new());
    assert_eq!(handle.state(), WatcherState::Polling);

    // Cycles at t = 0, 7.5s, 15s fail
    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(feed.calls(), 3);
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.current, None);
    assert_eq!(snapshot.stats.failed_polls, 3);
    assert_eq!(snapshot.stats.consecutive_failures, 3);
    assert!(snapshot
        .stats
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("connection refused"));
    assert!(fx.sinks.positions.lock().unwrap().is_empty());

    // Fourth cycle at 22.5s succeeds
    tokio::time::sleep(Duration::from_millis(7_500)).await;
    assert_eq!(feed.calls(), 4);
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.current, Some(sample(40.0, -70.0)));
    assert_eq!(snapshot.stats.consecutive_failures, 0);
    assert_eq!(snapshot.stats.polls, 4);

    let controls = handle.controls();
    handle.shutdown().await;
    assert_eq!(controls.state(), WatcherState::Stopped);
    assert_eq!(fx.sinks.positions.lock().unwrap().len(), 1);
    assert_eq!(controls.load_anchor().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_before_the_next_fetch() {
    let fx = fixture();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.0, -70.0))]);
    let cancel = CancellationToken::new();
    let w = watcher(
        &fx,
        feed.clone(),
        options(false, 50.0, AlertRepeatPolicy::OncePerAnchor),
    );
    let handle = w.start(cancel.clone());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(feed.calls(), 1);

    cancel.cancel();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.calls(), 1);
    assert_eq!(handle.state(), WatcherState::Stopped);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_stops_the_loop() {
    let fx = fixture();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.0, -70.0))]);
    let cancel = CancellationToken::new();
    let w = watcher(
        &fx,
        feed.clone(),
        options(false, 50.0, AlertRepeatPolicy::OncePerAnchor),
    );
    let handle = w.start(cancel.clone());
    let controls = handle.controls();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(feed.calls(), 1);

    drop(handle);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.calls(), 1);
    assert_eq!(controls.state(), WatcherState::Stopped);
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn invalid_threshold_text_is_rejected_and_config_kept() {
    let fx = fixture();
    let feed = ScriptedFeed::new(vec![Ok(sample(40.0, -70.0))]);
    let w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::OncePerAnchor));
    let controls = w.controls();
    let before = controls.config();

    assert!(matches!(
        controls.apply_threshold_text("abc"),
        Err(ValidationError::NotANumber(_))
    ));
    assert_eq!(controls.config(), before);

    assert!(matches!(
        controls.apply_threshold_text("0.5"),
        Err(ValidationError::OutOfRange { .. })
    ));
    assert_eq!(controls.config().threshold_meters(), 50.0);

    assert_eq!(controls.apply_threshold_text("0.001"), Ok(0.001));
    assert!((controls.config().threshold_meters() - 111.19).abs() < 0.01);

    controls.set_threshold_from_control(0.25);
    assert!((controls.config().threshold_degrees() - 1e-4).abs() < 1e-12);
    w.finish().await;
}

#[tokio::test]
async fn saving_without_a_sample_fails() {
    let fx = fixture();
    let feed = ScriptedFeed::new(vec![Err("offline".to_string())]);
    let mut w = watcher(&fx, feed, options(true, 50.0, AlertRepeatPolicy::OncePerAnchor));
    let controls = w.controls();

    assert!(matches!(w.poll_once().await, CycleOutcome::FetchFailed(_)));
    assert!(matches!(
        controls.save_current_as_anchor().await,
        Err(WatchError::NoCurrentSample)
    ));
    assert_eq!(fx.store.load().await.unwrap(), None);
    w.finish().await;
}
