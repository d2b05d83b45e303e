//! Virtual Scale
//!
//! A scale that exists only in memory. It pushes legacy `ST,GS,` frames
//! through the same reader, parser and stream controller as real hardware.

use crate::domain::models::DeviceDescriptor;
use crate::infrastructure::link::{LinkChunk, LinkError, LinkSession, ScaleLink};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

pub const VIRTUAL_SCALE_ID: &str = "SIM:00:00:00:00:01";
pub const VIRTUAL_SCALE_NAME: &str = "Virtual Scale";

pub const MIN_KG: f64 = 0.0;
pub const MAX_KG: f64 = 10.0;
const MAX_STEP_KG: f64 = 0.4;
/// Chance that a step moves toward the target
const TOWARD_TARGET_BIAS: f64 = 0.8;
const SETTLED_KG: f64 = 0.05;

/// Bounded random walk that drifts toward a target, then picks a new one.
pub struct RandomWalk {
    value: f64,
    target: f64,
    settled: bool,
    rng: StdRng,
}

impl RandomWalk {
    pub fn new(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let target = rng.gen_range(MIN_KG..=MAX_KG);
        Self {
            value: MIN_KG,
            target,
            settled: false,
            rng,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn step(&mut self) -> f64 {
        if (self.target - self.value).abs() < SETTLED_KG {
            self.target = self.rng.gen_range(MIN_KG..=MAX_KG);
        }

        let toward = (self.target - self.value).signum();
        let magnitude = self.rng.gen_range(0.0..MAX_STEP_KG);
        let delta = if self.rng.gen_bool(TOWARD_TARGET_BIAS) {
            // Never overshoot the target
            toward * magnitude.min((self.target - self.value).abs())
        } else {
            -toward * magnitude * 0.5
        };

        self.value = (self.value + delta).clamp(MIN_KG, MAX_KG);
        self.settled = delta.abs() < SETTLED_KG;
        self.value
    }

    /// Legacy frame for the current value, terminated like a real scale.
    pub fn frame(&self) -> String {
        let status = if self.settled { "ST" } else { "US" };
        format!("{},GS,{:>8.2}KG\r\n", status, self.value)
    }
}

pub struct SimulatedLink {
    tick: Duration,
    seed: Option<u64>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self {
            tick: Duration::from_millis(500),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    fn placeholder() -> Option<DeviceDescriptor> {
        DeviceDescriptor::new(VIRTUAL_SCALE_ID, Some(VIRTUAL_SCALE_NAME.to_string()))
            .map(|d| d.paired(true))
    }
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScaleLink for SimulatedLink {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        Ok(Self::placeholder().into_iter().collect())
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        Ok(Vec::new())
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn LinkSession>, LinkError> {
        let device = Self::placeholder()
            .filter(|d| d.address_key() == device_id.trim().to_uppercase())
            .ok_or_else(|| LinkError::Open {
                device: device_id.to_string(),
                reason: "device not found".to_string(),
            })?;

        info!(device_id, "Virtual scale connected");
        Ok(Arc::new(SimulatedSession::start(
            device,
            RandomWalk::new(self.seed),
            self.tick,
        )))
    }
}

struct SimulatedSession {
    device: DeviceDescriptor,
    alive: Arc<AtomicBool>,
    frames: Mutex<Option<mpsc::Receiver<LinkChunk>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedSession {
    fn start(device: DeviceDescriptor, mut walk: RandomWalk, tick: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let alive = Arc::new(AtomicBool::new(true));
        let running = alive.clone();

        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                walk.step();
                let frame = walk.frame();
                trace!(frame = frame.trim_end(), "Virtual scale frame");
                match tx.try_send(Ok(frame.into_bytes())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        Self {
            device,
            alive,
            frames: Mutex::new(Some(rx)),
            ticker: Mutex::new(Some(ticker)),
        }
    }
}

#[async_trait]
impl LinkSession for SimulatedSession {
    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<LinkChunk>> {
        self.frames.lock().ok()?.take()
    }

    async fn read_available(&self) -> Result<Vec<u8>, LinkError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let mut guard = self
            .frames
            .lock()
            .map_err(|_| LinkError::Io("frame queue poisoned".into()))?;
        let rx = guard
            .as_mut()
            .ok_or(LinkError::Unsupported("frames are pushed to a subscriber"))?;

        let mut bytes = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            bytes.extend(chunk?);
        }
        Ok(bytes)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        debug!(len = bytes.len(), "Virtual scale ignored command");
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.lock().ok().and_then(|mut t| t.take()) {
            ticker.abort();
        }
        info!("Virtual scale disconnected");
    }
}
