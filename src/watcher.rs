// src/watcher.rs
//
// The poll loop: fetch a sample, publish it, and compare it against the
// saved anchor while monitoring is armed.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::anchor_store::AnchorStore;
use crate::config::{WatchConfig, DEFAULT_POLL_INTERVAL, SINK_QUEUE_CAPACITY};
use crate::error::{FetchError, StorageError, ValidationError, WatchError};
use crate::feed::PositionFeed;
use crate::geo::distance;
use crate::models::{
    AlertEvent, AlertRepeatPolicy, Anchor, MonitorConfig, PositionSample, WatcherSnapshot,
    WatcherState,
};
use crate::sinks::{spawn_dispatcher, DisplaySink, NotificationSink, SinkEvent, SinkQueue};
use crate::threshold::parse_threshold_input;

/// Tuning for one watcher
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub poll_interval: Duration,
    pub monitor: MonitorConfig,
    pub repeat_policy: AlertRepeatPolicy,
    pub sink_queue_capacity: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            monitor: MonitorConfig::default(),
            repeat_policy: AlertRepeatPolicy::default(),
            sink_queue_capacity: SINK_QUEUE_CAPACITY,
        }
    }
}

impl From<&WatchConfig> for WatcherOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            monitor: config.monitor,
            repeat_policy: config.repeat_policy,
            sink_queue_capacity: SINK_QUEUE_CAPACITY,
        }
    }
}

/// Result of a single poll cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// The feed could not be read; nothing was updated
    FetchFailed(FetchError),

    /// Sample published, monitoring not armed
    Disarmed,

    /// Sample published, no usable anchor to compare against
    NoAnchor,

    WithinThreshold { distance_meters: f64 },

    Alerted(AlertEvent),

    /// Beyond the threshold but held back by the repeat policy
    Suppressed { distance_meters: f64 },
}

/// What the last alert was raised against
#[derive(Debug, Clone)]
struct AlertLatch {
    anchor: Anchor,
    anchor_generation: u64,
    arm_generation: u64,
    raised_at: Instant,
}

/// One poll cycle's worth of collaborators and memory
struct PollCycle {
    feed: Arc<dyn PositionFeed>,
    store: Arc<AnchorStore>,
    sinks: SinkQueue,
    repeat_policy: AlertRepeatPolicy,
    shared: Arc<watch::Sender<WatcherSnapshot>>,
    last_anchor: Option<Anchor>,
    latch: Option<AlertLatch>,
}

impl PollCycle {
    fn set_state(&self, state: WatcherState) {
        self.shared.send_modify(|s| s.state = state);
    }

    async fn run(&mut self) -> CycleOutcome {
        let sample = match self.feed.fetch().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Position poll failed: {}", e);
                let message = e.to_string();
                self.shared.send_modify(|s| {
                    let stats = &mut s.stats;
                    stats.polls += 1;
                    stats.failed_polls += 1;
                    stats.consecutive_failures += 1;
                    stats.last_error = Some(message);
                });
                return CycleOutcome::FetchFailed(e);
            }
        };

        debug!(
            "Received position {} at {}",
            sample.display_coordinates(),
            sample.timestamp()
        );
        self.shared.send_modify(|s| {
            s.current = Some(sample.clone());
            s.stats.polls += 1;
            s.stats.consecutive_failures = 0;
        });
        self.sinks.push(SinkEvent::PositionUpdated(sample.clone()));

        let (config, arm_generation, anchor_generation) = {
            let shared = self.shared.borrow();
            (shared.config, shared.arm_generation, shared.anchor_generation)
        };
        if !config.armed() {
            return CycleOutcome::Disarmed;
        }

        let anchor = match self.store.load().await {
            Ok(Some(anchor)) => anchor,
            Ok(None) => {
                debug!("No anchor saved yet, skipping movement check");
                self.last_anchor = None;
                return CycleOutcome::NoAnchor;
            }
            Err(e) => {
                warn!(
                    "Anchor record unusable, continuing as if none were saved: {}",
                    e
                );
                self.last_anchor = None;
                return CycleOutcome::NoAnchor;
            }
        };

        if self.last_anchor.as_ref() != Some(&anchor) {
            self.sinks.push(SinkEvent::AnchorLoaded(anchor.clone()));
            self.last_anchor = Some(anchor.clone());
        }

        let distance_meters = distance(&anchor, &sample);
        if distance_meters <= config.threshold_meters() {
            debug!(
                "Within threshold: {:.2}m of {:.2}m",
                distance_meters,
                config.threshold_meters()
            );
            return CycleOutcome::WithinThreshold { distance_meters };
        }

        let now = Instant::now();
        if !self.should_alert(&anchor, arm_generation, anchor_generation, now) {
            debug!(
                "Movement of {:.2}m already reported, suppressing repeat alert",
                distance_meters
            );
            self.shared.send_modify(|s| s.stats.alerts_suppressed += 1);
            return CycleOutcome::Suppressed { distance_meters };
        }

        let alert = AlertEvent {
            raised_at: Utc::now(),
            anchor: anchor.clone(),
            observed: sample,
            distance_meters,
        };
        info!(
            "Movement alert: {:.2}m from anchor exceeds {:.2}m threshold",
            distance_meters,
            config.threshold_meters()
        );
        self.latch = Some(AlertLatch {
            anchor,
            anchor_generation,
            arm_generation,
            raised_at: now,
        });
        self.shared.send_modify(|s| s.stats.alerts_raised += 1);
        self.sinks.push(SinkEvent::Alert(alert.clone()));

        CycleOutcome::Alerted(alert)
    }

    fn should_alert(
        &self,
        anchor: &Anchor,
        arm_generation: u64,
        anchor_generation: u64,
        now: Instant,
    ) -> bool {
        let latch = match &self.latch {
            Some(latch) => latch,
            None => return true,
        };
        let reset = latch.anchor != *anchor
            || latch.anchor_generation != anchor_generation
            || latch.arm_generation != arm_generation;

        match self.repeat_policy {
            AlertRepeatPolicy::EveryCycle => true,
            AlertRepeatPolicy::OncePerAnchor => reset,
            AlertRepeatPolicy::Cooldown(cooldown) => {
                reset || now.duration_since(latch.raised_at) >= cooldown
            }
        }
    }
}

/// A watcher that has been built but whose loop may not be running yet
///
/// Must be created inside a Tokio runtime, as it starts the sink
/// dispatcher immediately.
pub struct MovementWatcher {
    cycle: PollCycle,
    poll_interval: Duration,
    controls: WatcherControls,
    dispatcher: JoinHandle<()>,
}

impl MovementWatcher {
    pub fn new(
        feed: Arc<dyn PositionFeed>,
        store: Arc<AnchorStore>,
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn NotificationSink>,
        options: WatcherOptions,
    ) -> Self {
        let (sinks, dispatcher) =
            spawn_dispatcher(display, notifier, options.sink_queue_capacity);
        let (shared, _) = watch::channel(WatcherSnapshot::new(options.monitor));
        let shared = Arc::new(shared);

        let controls = WatcherControls {
            store: store.clone(),
            shared: shared.clone(),
        };
        let cycle = PollCycle {
            feed,
            store,
            sinks,
            repeat_policy: options.repeat_policy,
            shared,
            last_anchor: None,
            latch: None,
        };

        Self {
            cycle,
            poll_interval: options.poll_interval,
            controls,
            dispatcher,
        }
    }

    pub fn controls(&self) -> WatcherControls {
        self.controls.clone()
    }

    pub fn snapshot(&self) -> WatcherSnapshot {
        self.controls.snapshot()
    }

    /// Run one cycle immediately, outside the timer
    pub async fn poll_once(&mut self) -> CycleOutcome {
        self.cycle.run().await
    }

    /// Drop the watcher without starting it, waiting for queued sink
    /// events to be delivered.
    pub async fn finish(self) {
        let MovementWatcher {
            cycle, dispatcher, ..
        } = self;
        drop(cycle);
        if let Err(e) = dispatcher.await {
            warn!("Sink dispatcher ended abnormally: {}", e);
        }
    }

    /// Start polling. The loop runs until `cancel` fires or the returned
    /// handle is shut down or dropped.
    pub fn start(self, cancel: CancellationToken) -> WatcherHandle {
        let MovementWatcher {
            mut cycle,
            poll_interval,
            controls,
            dispatcher,
        } = self;

        cycle.set_state(WatcherState::Polling);
        info!("Movement watcher polling every {:?}", poll_interval);

        // Scoped to this handle so dropping it never cancels the caller's token
        let cancel = cancel.child_token();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    outcome = cycle.run() => {
                        debug!("Poll cycle finished: {:?}", outcome);
                    }
                }
            }

            cycle.set_state(WatcherState::Stopped);
            info!("Movement watcher stopped");
            drop(cycle);
            if let Err(e) = dispatcher.await {
                warn!("Sink dispatcher ended abnormally: {}", e);
            }
        });

        WatcherHandle {
            controls,
            task,
            cancel_on_drop: cancel.drop_guard(),
        }
    }
}

/// Cloneable control surface: read state, change monitoring, manage the
/// anchor. Works whether or not the loop is running.
#[derive(Clone)]
pub struct WatcherControls {
    store: Arc<AnchorStore>,
    shared: Arc<watch::Sender<WatcherSnapshot>>,
}

impl WatcherControls {
    pub fn snapshot(&self) -> WatcherSnapshot {
        self.shared.borrow().clone()
    }

    /// Receiver that sees every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<WatcherSnapshot> {
        self.shared.subscribe()
    }

    pub fn current(&self) -> Option<PositionSample> {
        self.shared.borrow().current.clone()
    }

    pub fn config(&self) -> MonitorConfig {
        self.shared.borrow().config
    }

    pub fn state(&self) -> WatcherState {
        self.shared.borrow().state
    }

    /// Arm monitoring. Arming again while armed also re-enables alerts
    /// held back by the repeat policy.
    pub fn arm(&self) {
        self.shared.send_modify(|s| {
            s.config.set_armed(true);
            s.arm_generation += 1;
        });
        info!("Monitoring armed");
    }

    pub fn disarm(&self) {
        self.shared.send_if_modified(|s| {
            let was_armed = s.config.armed();
            s.config.set_armed(false);
            was_armed
        });
        info!("Monitoring disarmed");
    }

    fn update_config<F>(&self, apply: F) -> Result<(), ValidationError>
    where
        F: FnOnce(&mut MonitorConfig) -> Result<(), ValidationError>,
    {
        let mut result = Ok(());
        self.shared.send_if_modified(|s| {
            result = apply(&mut s.config);
            result.is_ok()
        });
        result
    }

    pub fn set_threshold_meters(&self, meters: f64) -> Result<(), ValidationError> {
        self.update_config(|c| c.set_threshold_meters(meters))
    }

    pub fn set_threshold_degrees(&self, degrees: f64) -> Result<(), ValidationError> {
        self.update_config(|c| c.set_threshold_degrees(degrees))
    }

    /// Set the threshold from the linear control position in [0, 1]
    pub fn set_threshold_from_control(&self, position: f64) {
        self.shared
            .send_modify(|s| s.config.set_threshold_from_control(position));
    }

    /// Apply a threshold typed as text, in degrees. Rejected input leaves
    /// the config exactly as it was.
    pub fn apply_threshold_text(&self, text: &str) -> Result<f64, ValidationError> {
        let degrees = match parse_threshold_input(text) {
            Ok(degrees) => degrees,
            Err(e) => {
                debug!(
                    "Rejected threshold input {:?}, keeping {:.6}: {}",
                    text,
                    self.config().threshold_degrees(),
                    e
                );
                return Err(e);
            }
        };
        self.set_threshold_degrees(degrees)?;
        Ok(degrees)
    }

    /// Persist the latest sample as the new anchor
    pub async fn save_current_as_anchor(&self) -> Result<Anchor, WatchError> {
        let current = self.current().ok_or(WatchError::NoCurrentSample)?;
        let anchor = Anchor::from_sample(current);
        self.store.save(&anchor).await?;
        self.shared.send_modify(|s| s.anchor_generation += 1);
        Ok(anchor)
    }

    pub async fn load_anchor(&self) -> Result<Option<Anchor>, StorageError> {
        self.store.load().await
    }

    pub async fn clear_anchor(&self) -> Result<(), StorageError> {
        self.store.clear().await?;
        self.shared.send_modify(|s| s.anchor_generation += 1);
        Ok(())
    }
}

/// A running watcher
///
/// Dropping the handle cancels the loop without waiting for it; use
/// `shutdown` to also wait for queued sink events to be delivered.
pub struct WatcherHandle {
    controls: WatcherControls,
    task: JoinHandle<()>,
    cancel_on_drop: DropGuard,
}

impl WatcherHandle {
    pub fn controls(&self) -> WatcherControls {
        self.controls.clone()
    }

    /// Cancel the loop and wait for it and the sink dispatcher to finish
    pub async fn shutdown(self) {
        let WatcherHandle {
            task,
            cancel_on_drop,
            ..
        } = self;
        cancel_on_drop.disarm().cancel();
        if let Err(e) = task.await {
            warn!("Watcher task ended abnormally: {}", e);
        }
    }
}

impl Deref for WatcherHandle {
    type Target = WatcherControls;

    fn deref(&self) -> &WatcherControls {
        &self.controls
    }
}
