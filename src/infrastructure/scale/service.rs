//! Scale Service
//!
//! Constructed once per process and cloned into whoever needs it. This is
//! the only place where the hardware or the virtual link is chosen.

use crate::domain::device_filter::{ApprovedScaleStore, DeviceFilter, ScaleCandidate};
use crate::domain::errors::{ConnectionError, LockError};
use crate::domain::events::{EventBus, ScaleObserver, Subscription};
use crate::domain::lock::{LockState, WeightLockCoordinator};
use crate::domain::models::{ConnectionState, DeviceDescriptor, WeightReading};
use crate::domain::settings::{ConnectionConfig, SettingsService, StreamConfig};
use crate::domain::stream::WeightStream;
use crate::infrastructure::link::{ScaleLink, SerialLink, SerialLinkConfig, SimulatedLink};
use crate::infrastructure::scale::connection::ConnectionManager;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

struct ServiceInner {
    settings: Arc<Mutex<SettingsService>>,
    bus: EventBus,
    filter: DeviceFilter,
    stream: Arc<WeightStream>,
    connection: ConnectionManager,
    lock: WeightLockCoordinator,
}

#[derive(Clone)]
pub struct ScaleService {
    inner: Arc<ServiceInner>,
}

impl ScaleService {
    /// Build the service around an explicit link.
    pub fn new(settings: Arc<Mutex<SettingsService>>, link: Arc<dyn ScaleLink>) -> Self {
        let (connection_config, stream_config) = {
            let guard = settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let s = guard.get();
            (
                ConnectionConfig::from(&s.connection),
                StreamConfig::from(&s.stream),
            )
        };

        let bus = EventBus::new();
        let store: Arc<dyn ApprovedScaleStore> = settings.clone();
        let filter = DeviceFilter::new(store);
        let stream = Arc::new(WeightStream::new(stream_config, bus.clone()));
        let connection =
            ConnectionManager::new(link.clone(), stream.clone(), bus.clone(), connection_config);
        let lock = WeightLockCoordinator::new(stream.clone());

        info!(link = link.kind(), "Scale service ready");
        Self {
            inner: Arc::new(ServiceInner {
                settings,
                bus,
                filter,
                stream,
                connection,
                lock,
            }),
        }
    }

    /// Pick the link from settings; `force_simulator` overrides them.
    pub fn from_settings(settings: Arc<Mutex<SettingsService>>, force_simulator: bool) -> Self {
        let (use_simulator, serial_config) = {
            let guard = settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let s = guard.get();
            (s.use_simulator, SerialLinkConfig::from(&s.connection))
        };

        let link: Arc<dyn ScaleLink> = if force_simulator || use_simulator {
            Arc::new(SimulatedLink::new())
        } else {
            Arc::new(SerialLink::new(serial_config))
        };
        Self::new(settings, link)
    }

    pub fn link_kind(&self) -> &'static str {
        self.inner.connection.link_kind()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub fn subscribe_observer(&self, observer: Arc<dyn ScaleObserver>) -> Subscription {
        self.inner.bus.subscribe_observer(observer)
    }

    // ---- Discovery ----

    /// All devices, flagged when the user approved them as scales.
    pub async fn scan(&self, include_nearby: bool) -> Result<Vec<DeviceDescriptor>, ConnectionError> {
        let mut devices = self.inner.connection.scan(include_nearby).await?;
        self.inner.filter.annotate(&mut devices);
        Ok(devices)
    }

    /// Only the devices that look like scales, best candidates first.
    pub async fn scan_scales(&self, include_nearby: bool) -> Result<Vec<ScaleCandidate>, ConnectionError> {
        let devices = self.inner.connection.scan(include_nearby).await?;
        Ok(self.inner.filter.classify(&devices))
    }

    pub fn approve(&self, address: &str) -> anyhow::Result<()> {
        self.inner.filter.approve(address)
    }

    pub fn revoke(&self, address: &str) -> anyhow::Result<()> {
        self.inner.filter.revoke(address)
    }

    // ---- Connection ----

    pub async fn connect(&self, device_id: &str) -> Result<DeviceDescriptor, ConnectionError> {
        let device = self.inner.connection.connect(device_id).await?;
        self.remember_device(Some(device.id.clone()));
        Ok(device)
    }

    /// Reconnect to the device saved by the last successful connect.
    pub async fn connect_last(&self) -> Result<DeviceDescriptor, ConnectionError> {
        let last = self
            .inner
            .settings
            .lock()
            .ok()
            .and_then(|s| s.get().last_connected_device.clone());
        match last {
            Some(device_id) => self.connect(&device_id).await,
            None => Err(ConnectionError::NotConnected),
        }
    }

    pub async fn disconnect(&self, force: bool) {
        self.inner.connection.disconnect(force).await;
        if force {
            self.remember_device(None);
        }
    }

    pub async fn resume(&self) -> Result<DeviceDescriptor, ConnectionError> {
        self.inner.connection.resume().await
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.inner.connection.send(bytes).await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.inner.connection.device()
    }

    fn remember_device(&self, device_id: Option<String>) {
        let saved = self
            .inner
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))
            .and_then(|mut s| s.set_last_connected(device_id));
        if let Err(e) = saved {
            warn!("Could not save last connected device: {}", e);
        }
    }

    // ---- Weight ----

    pub fn latest_weight(&self) -> Option<WeightReading> {
        self.inner.stream.latest()
    }

    /// Normal delivery interval, clamped to the safety floor.
    pub fn set_interval(&self, interval: Duration) -> Duration {
        self.inner.stream.set_interval(interval)
    }

    // ---- Lock ----

    pub fn lock(&self) -> Result<f64, LockError> {
        self.inner.lock.lock()
    }

    pub fn submission_weight(&self, override_kg: Option<f64>) -> Option<f64> {
        self.inner.lock.submission_weight(override_kg)
    }

    pub fn begin_submission(&self) -> Result<f64, LockError> {
        self.inner.lock.begin_submission()
    }

    pub fn finish_submission(&self) {
        self.inner.lock.finish_submission()
    }

    pub fn unlock(&self, force: bool) -> Result<(), LockError> {
        self.inner.lock.unlock(force)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock.is_locked()
    }

    pub fn lock_state(&self) -> Option<LockState> {
        self.inner.lock.lock_state()
    }
}
