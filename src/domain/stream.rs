//! Weight Stream Controller
//!
//! Gates parsed readings on their way to subscribers: throttling, burst
//! cadence right after connect, and pause/resume. Cadence only, values pass
//! through untouched.

use crate::domain::events::EventBus;
use crate::domain::frame_parser;
use crate::domain::models::WeightReading;
use crate::domain::settings::StreamConfig;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Who asked for delivery to stop. Delivery resumes once no source remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseSource {
    /// Weight lock in progress
    Lock,
    /// Connection paused instead of closed
    Connection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PauseFlags {
    lock: bool,
    connection: bool,
}

impl PauseFlags {
    fn set(&mut self, source: PauseSource, value: bool) {
        match source {
            PauseSource::Lock => self.lock = value,
            PauseSource::Connection => self.connection = value,
        }
    }

    fn any(&self) -> bool {
        self.lock || self.connection
    }
}

#[derive(Debug, Clone)]
pub struct StreamingPolicy {
    pub interval: Duration,
    pub burst_interval: Duration,
    pub burst_duration: Duration,
    pub burst_started_at: Option<Instant>,
    min_interval: Duration,
    paused: PauseFlags,
}

impl StreamingPolicy {
    pub fn burst_active(&self, now: Instant) -> bool {
        self.burst_started_at
            .is_some_and(|started| now.saturating_duration_since(started) < self.burst_duration)
    }

    pub fn current_interval(&self, now: Instant) -> Duration {
        if self.burst_active(now) {
            self.burst_interval
        } else {
            self.interval
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.any()
    }
}

impl From<StreamConfig> for StreamingPolicy {
    fn from(cfg: StreamConfig) -> Self {
        Self {
            interval: cfg.interval,
            burst_interval: cfg.burst_interval,
            burst_duration: cfg.burst_duration,
            burst_started_at: None,
            min_interval: cfg.min_interval,
            paused: PauseFlags::default(),
        }
    }
}

pub struct WeightStreamController {
    policy: StreamingPolicy,
    last_delivered_at: Option<Instant>,
    last_delivered: Option<WeightReading>,
    latest: Option<WeightReading>,
    /// Newest reading held back by a pause
    suppressed: Option<WeightReading>,
}

impl WeightStreamController {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            policy: StreamingPolicy::from(config),
            last_delivered_at: None,
            last_delivered: None,
            latest: None,
            suppressed: None,
        }
    }

    pub fn policy(&self) -> &StreamingPolicy {
        &self.policy
    }

    /// Record a reading; returns it when it should reach subscribers now.
    pub fn offer(&mut self, reading: WeightReading, now: Instant) -> Option<WeightReading> {
        self.latest = Some(reading.clone());

        if self.policy.is_paused() {
            self.suppressed = Some(reading);
            return None;
        }

        let due = match self.last_delivered_at {
            Some(at) => now.saturating_duration_since(at) >= self.policy.current_interval(now),
            None => true,
        };
        if !due {
            return None;
        }

        self.mark_delivered(&reading, now);
        Some(reading)
    }

    fn mark_delivered(&mut self, reading: &WeightReading, now: Instant) {
        self.last_delivered_at = Some(now);
        self.last_delivered = Some(reading.clone());
    }

    pub fn pause(&mut self, source: PauseSource) {
        self.policy.paused.set(source, true);
    }

    /// Lift one pause source. When delivery becomes possible again the held
    /// back reading is returned once to resynchronise subscribers.
    pub fn resume(&mut self, source: PauseSource, now: Instant) -> Option<WeightReading> {
        self.policy.paused.set(source, false);
        if self.policy.is_paused() {
            return None;
        }
        let reading = self.suppressed.take()?;
        self.mark_delivered(&reading, now);
        Some(reading)
    }

    pub fn is_paused(&self) -> bool {
        self.policy.is_paused()
    }

    /// Hand the best current reading (newest, else last delivered) to `pick`
    /// and pause for [`PauseSource::Lock`] when it accepts one. Nothing can
    /// be delivered in between.
    pub fn freeze<T>(&mut self, pick: impl FnOnce(Option<&WeightReading>) -> Option<T>) -> Option<T> {
        let candidate = self.latest.as_ref().or(self.last_delivered.as_ref());
        let picked = pick(candidate)?;
        self.pause(PauseSource::Lock);
        Some(picked)
    }

    pub fn is_paused_by(&self, source: PauseSource) -> bool {
        match source {
            PauseSource::Lock => self.policy.paused.lock,
            PauseSource::Connection => self.policy.paused.connection,
        }
    }

    /// Set the normal interval, clamped to the safety floor. Returns the value applied.
    pub fn set_interval(&mut self, interval: Duration) -> Duration {
        let applied = interval.max(self.policy.min_interval);
        self.policy.interval = applied;
        applied
    }

    pub fn start_burst(&mut self, now: Instant) {
        self.policy.burst_started_at = Some(now);
    }

    pub fn burst_active(&self, now: Instant) -> bool {
        self.policy.burst_active(now)
    }

    /// Most recent parsed reading, delivered or not
    pub fn latest(&self) -> Option<&WeightReading> {
        self.latest.as_ref()
    }

    pub fn last_delivered(&self) -> Option<&WeightReading> {
        self.last_delivered.as_ref()
    }

    /// Forget readings from a link that is gone. Pause flags are kept.
    pub fn clear_readings(&mut self) {
        self.latest = None;
        self.suppressed = None;
        self.last_delivered = None;
        self.last_delivered_at = None;
        self.policy.burst_started_at = None;
    }
}

/// Parser + controller + subscriber fan-out, shared by the reader, the
/// connection manager and the lock coordinator.
pub struct WeightStream {
    controller: Mutex<WeightStreamController>,
    bus: EventBus,
}

impl WeightStream {
    pub fn new(config: StreamConfig, bus: EventBus) -> Self {
        Self {
            controller: Mutex::new(WeightStreamController::new(config)),
            bus,
        }
    }

    fn controller(&self) -> MutexGuard<'_, WeightStreamController> {
        self.controller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decode one frame and deliver it if the controller lets it through.
    /// Returns whether the frame produced a reading at all.
    pub fn ingest_frame(&self, frame: &str) -> bool {
        let Some(reading) = frame_parser::parse(frame) else {
            return false;
        };
        trace!(kg = reading.value_kg(), "Frame decoded");

        // Publish outside the controller lock
        let delivered = self.controller().offer(reading, Instant::now());
        if let Some(reading) = delivered {
            self.bus.publish_weight(reading);
        }
        true
    }

    pub fn pause(&self, source: PauseSource) {
        debug!(?source, "Weight delivery paused");
        self.controller().pause(source);
    }

    pub fn resume(&self, source: PauseSource) {
        let resync = self.controller().resume(source, Instant::now());
        debug!(?source, resync = resync.is_some(), "Weight delivery resume requested");
        if let Some(reading) = resync {
            self.bus.publish_weight(reading);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.controller().is_paused()
    }

    /// See [`WeightStreamController::freeze`].
    pub fn freeze<T>(&self, pick: impl FnOnce(Option<&WeightReading>) -> Option<T>) -> Option<T> {
        let picked = self.controller().freeze(pick);
        if picked.is_some() {
            debug!("Weight delivery frozen for lock");
        }
        picked
    }

    pub fn is_paused_by(&self, source: PauseSource) -> bool {
        self.controller().is_paused_by(source)
    }

    pub fn set_interval(&self, interval: Duration) -> Duration {
        self.controller().set_interval(interval)
    }

    pub fn start_burst(&self) {
        self.controller().start_burst(Instant::now());
    }

    pub fn burst_active(&self) -> bool {
        self.controller().burst_active(Instant::now())
    }

    pub fn latest(&self) -> Option<WeightReading> {
        self.controller().latest().cloned()
    }

    pub fn last_delivered(&self) -> Option<WeightReading> {
        self.controller().last_delivered().cloned()
    }

    pub fn clear_readings(&self) {
        self.controller().clear_readings();
    }

    pub fn policy(&self) -> StreamingPolicy {
        self.controller().policy().clone()
    }
}
