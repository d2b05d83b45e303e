//! Connection Manager
//!
//! Owns the single active scale session: scanning, connecting (with
//! de-duplication), pause/teardown, liveness checks and bounded
//! auto-reconnect.

use crate::domain::errors::{ConnectionError, StreamingError};
use crate::domain::events::EventBus;
use crate::domain::models::{ConnectionState, DeviceDescriptor, StatusEvent};
use crate::domain::settings::ConnectionConfig;
use crate::domain::stream::{PauseSource, WeightStream};
use crate::infrastructure::link::{LinkError, LinkSession, ScaleLink};
use crate::infrastructure::scale::reader::{DataStreamReader, ReaderHandle, SessionEvent};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Fixed-delay, bounded retry budget for unexpected link loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    User,
    Reconnect,
}

type ConnectResult = Result<DeviceDescriptor, ConnectionError>;

enum Resume {
    Resumed(DeviceDescriptor),
    /// The paused link was gone and has been torn down
    LinkDead(String),
}

struct PendingConnect {
    /// Identifies the attempt that owns this slot
    seq: u64,
    device_id: String,
    result: watch::Receiver<Option<ConnectResult>>,
}

struct ActiveSession {
    generation: u64,
    session: Arc<dyn LinkSession>,
    reader: ReaderHandle,
    liveness: JoinHandle<()>,
}

impl ActiveSession {
    /// Timers first, so nothing reads a half-closed handle.
    fn stop_tasks(&self) {
        self.reader.stop();
        self.liveness.abort();
    }

    async fn close(self) {
        self.stop_tasks();
        self.session.close().await;
        debug!(generation = self.generation, "Session closed");
    }
}

struct State {
    connection: ConnectionState,
    device: Option<DeviceDescriptor>,
    active: Option<ActiveSession>,
    pending: Option<PendingConnect>,
    reconnect: ReconnectPolicy,
    reconnect_task: Option<JoinHandle<()>>,
    last_connected: Option<String>,
    /// Bumped for every installed or torn down session
    generation: u64,
    /// Bumped by every manual disconnect; stale attempts compare against it
    disconnect_epoch: u64,
    attempt_seq: u64,
}

impl State {
    /// Release the pending slot, unless a newer attempt owns it by now.
    fn release_pending(&mut self, seq: u64) {
        if self.pending.as_ref().is_some_and(|p| p.seq == seq) {
            self.pending = None;
        }
    }
}

struct Inner {
    link: Arc<dyn ScaleLink>,
    stream: Arc<WeightStream>,
    bus: EventBus,
    config: ConnectionConfig,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        link: Arc<dyn ScaleLink>,
        stream: Arc<WeightStream>,
        bus: EventBus,
        config: ConnectionConfig,
    ) -> Self {
        let reconnect = ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_delay);
        Self {
            inner: Arc::new(Inner {
                link,
                stream,
                bus,
                config,
                state: Mutex::new(State {
                    connection: ConnectionState::Disconnected,
                    device: None,
                    active: None,
                    pending: None,
                    reconnect,
                    reconnect_task: None,
                    last_connected: None,
                    generation: 0,
                    disconnect_epoch: 0,
                    attempt_seq: 0,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state().connection
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.inner.state().device.clone()
    }

    pub fn last_connected(&self) -> Option<String> {
        self.inner.state().last_connected.clone()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.inner.state().reconnect
    }

    pub fn link_kind(&self) -> &'static str {
        self.inner.link.kind()
    }

    /// Paired devices, plus live discovery merged in when asked for.
    pub async fn scan(&self, include_nearby: bool) -> Result<Vec<DeviceDescriptor>, ConnectionError> {
        let mut devices: Vec<DeviceDescriptor> = self
            .inner
            .link
            .bonded_devices()
            .await
            .map_err(|e| ConnectionError::from_link_message(&e.to_string()))?
            .into_iter()
            .map(|d| d.paired(true))
            .collect();

        if include_nearby {
            match self.inner.link.discover().await {
                Ok(found) => merge_discovered(&mut devices, found),
                Err(LinkError::Unsupported(why)) => {
                    debug!("Discovery unsupported ({}), paired devices only", why)
                }
                Err(e) => warn!("Discovery failed, returning paired devices only: {}", e),
            }
        }

        info!(count = devices.len(), include_nearby, "Scan complete");
        Ok(devices)
    }

    /// Connect to `device_id`. Concurrent calls for the same device share one
    /// attempt; a call for another device while one is in flight is refused.
    pub async fn connect(&self, device_id: &str) -> ConnectResult {
        Inner::connect(&self.inner, device_id, Origin::User).await
    }

    /// With persistence on and `force == false` this only pauses delivery and
    /// keeps the link open. Otherwise the link is closed and auto-reconnect is
    /// cancelled.
    pub async fn disconnect(&self, force: bool) {
        if self.inner.config.persistent_connection && !force && self.inner.pause() {
            return;
        }
        self.inner.teardown().await;
    }

    /// Leave the paused state without re-opening the link. A paused link
    /// that died meanwhile is replaced by a fresh connection.
    pub async fn resume(&self) -> ConnectResult {
        match self.inner.resume_paused().await? {
            Resume::Resumed(device) => Ok(device),
            Resume::LinkDead(device_id) => {
                Inner::connect(&self.inner, &device_id, Origin::User).await
            }
        }
    }

    /// The single write path to the scale.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let (session, generation) = {
            let st = self.inner.state();
            let active = st.active.as_ref().ok_or(ConnectionError::NotConnected)?;
            (active.session.clone(), active.generation)
        };

        match session.write(bytes).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_link_lost() => {
                self.inner
                    .on_link_lost(generation, StreamingError::LinkLost(e.to_string()));
                Err(ConnectionError::NotConnected)
            }
            Err(e) => Err(ConnectionError::from_link_message(&e.to_string())),
        }
    }
}

/// Merge discovered devices into the paired list by address: the paired
/// entry keeps its identity and takes the fresher signal strength.
fn merge_discovered(devices: &mut Vec<DeviceDescriptor>, found: Vec<DeviceDescriptor>) {
    for discovered in found {
        let key = discovered.address_key();
        match devices.iter_mut().find(|d| d.address_key() == key) {
            Some(existing) => {
                if discovered.signal_strength.is_some() {
                    existing.signal_strength = discovered.signal_strength;
                }
                if existing.name.is_none() {
                    existing.name = discovered.name;
                }
            }
            None => devices.push(discovered),
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, status: StatusEvent) {
        self.bus.publish_status(status);
    }

    async fn connect(self: &Arc<Self>, device_id: &str, origin: Origin) -> ConnectResult {
        let device_id = device_id.trim().to_string();

        let paused_here = {
            let st = self.state();
            st.connection == ConnectionState::Paused
                && st.active.is_some()
                && st.device.as_ref().is_some_and(|d| d.id == device_id)
        };
        if paused_here {
            match self.resume_paused().await? {
                Resume::Resumed(device) => return Ok(device),
                Resume::LinkDead(_) => debug!(device_id = %device_id, "Paused link gone, opening anew"),
            }
        }

        let mut result = {
            let mut st = self.state();

            if st.connection == ConnectionState::Connected && st.active.is_some() {
                if let Some(device) = st.device.clone().filter(|d| d.id == device_id) {
                    return Ok(device);
                }
            }

            let in_flight = st
                .pending
                .as_ref()
                .map(|p| (p.device_id.clone(), p.result.clone()));

            match in_flight {
                Some((pending_id, rx)) if pending_id == device_id => {
                    debug!(device_id = %device_id, "Joining in-flight connect");
                    rx
                }
                Some((pending_id, _)) => {
                    warn!(busy = %pending_id, requested = %device_id, "Connect refused");
                    return Err(ConnectionError::AlreadyConnecting(pending_id));
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    st.attempt_seq += 1;
                    let seq = st.attempt_seq;
                    st.pending = Some(PendingConnect {
                        seq,
                        device_id: device_id.clone(),
                        result: rx.clone(),
                    });
                    if origin == Origin::User {
                        if let Some(task) = st.reconnect_task.take() {
                            task.abort();
                        }
                        st.connection = ConnectionState::Connecting;
                    }
                    let epoch = st.disconnect_epoch;
                    drop(st);

                    if origin == Origin::User {
                        self.publish(StatusEvent::new(
                            ConnectionState::Connecting,
                            format!("Connecting to {}", device_id),
                        ));
                    }

                    let this = self.clone();
                    let id = device_id.clone();
                    tokio::spawn(async move {
                        let outcome = this.attempt(&id, origin, epoch, seq).await;
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        loop {
            let current = result.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if result.changed().await.is_err() {
                return Err(ConnectionError::Unknown("connect attempt abandoned".into()));
            }
        }
    }

    async fn resume_paused(self: &Arc<Self>) -> Result<Resume, ConnectionError> {
        let (session, generation, device) = {
            let st = self.state();
            match (&st.connection, &st.active, &st.device) {
                (ConnectionState::Paused, Some(active), Some(device)) => {
                    (active.session.clone(), active.generation, device.clone())
                }
                (ConnectionState::Connected, Some(_), Some(device)) => {
                    return Ok(Resume::Resumed(device.clone()))
                }
                _ => return Err(ConnectionError::NotConnected),
            }
        };

        if !session.is_alive().await {
            warn!(device_id = %device.id, "Paused link died");
            self.on_link_lost(
                generation,
                StreamingError::LinkLost("link closed while paused".into()),
            );
            return Ok(Resume::LinkDead(device.id));
        }

        let resumed = {
            let mut st = self.state();
            if st.generation == generation && st.connection == ConnectionState::Paused {
                st.connection = ConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if !resumed {
            return Err(ConnectionError::NotConnected);
        }

        self.stream.resume(PauseSource::Connection);
        info!(device_id = %device.id, "Connection resumed");
        self.publish(
            StatusEvent::new(ConnectionState::Connected, "Resumed").with_device(Some(device.clone())),
        );
        Ok(Resume::Resumed(device))
    }

    /// One physical attempt. Always releases its pending slot before returning.
    async fn attempt(
        self: &Arc<Self>,
        device_id: &str,
        origin: Origin,
        epoch: u64,
        seq: u64,
    ) -> ConnectResult {
        // Tear down whatever is open first; scales rarely accept two handles
        let prior = {
            let mut st = self.state();
            st.generation += 1;
            st.active.take()
        };
        if let Some(prior) = prior {
            info!(generation = prior.generation, "Closing previous session");
            prior.close().await;
            self.stream.clear_readings();
            self.stream.resume(PauseSource::Connection);
        }

        info!(device_id, ?origin, "Opening scale link");
        let timeout = self.config.connect_timeout;
        let opened = match tokio::time::timeout(timeout, self.link.open(device_id)).await {
            Err(_) => Err(ConnectionError::Timeout(timeout)),
            Ok(Err(e)) => Err(ConnectionError::from_link_message(&e.to_string())),
            Ok(Ok(session)) => Ok(session),
        };

        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                self.fail_attempt(device_id, origin, epoch, seq, &e);
                return Err(e);
            }
        };

        let device = session.device().clone();
        let installed = {
            let mut st = self.state();
            st.release_pending(seq);

            let cancelled = st.disconnect_epoch != epoch
                || (origin == Origin::Reconnect
                    && (st.connection != ConnectionState::Reconnecting
                        || st.last_connected.as_deref() != Some(device_id)));
            if cancelled {
                false
            } else {
                st.generation += 1;
                let generation = st.generation;
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let reader =
                    DataStreamReader::spawn(session.clone(), self.stream.clone(), events_tx.clone());
                let liveness = tokio::spawn(liveness_loop(
                    session.clone(),
                    events_tx,
                    self.config.liveness_period(),
                ));
                tokio::spawn(supervise(Arc::downgrade(self), generation, events_rx));

                st.active = Some(ActiveSession {
                    generation,
                    session: session.clone(),
                    reader,
                    liveness,
                });
                st.connection = ConnectionState::Connected;
                st.device = Some(device.clone());
                st.reconnect.reset();
                st.last_connected = Some(device.id.clone());
                true
            }
        };

        if !installed {
            info!(device_id, "Connect superseded by a manual action, closing link");
            session.close().await;
            return Err(ConnectionError::Unknown("connection cancelled".into()));
        }

        self.stream.resume(PauseSource::Connection);
        self.stream.start_burst();
        info!(device_id, name = device.display_name(), "Scale connected");
        self.publish(
            StatusEvent::new(
                ConnectionState::Connected,
                format!("Connected to {}", device.display_name()),
            )
            .with_device(Some(device.clone())),
        );
        Ok(device)
    }

    fn fail_attempt(
        &self,
        device_id: &str,
        origin: Origin,
        epoch: u64,
        seq: u64,
        error: &ConnectionError,
    ) {
        let publish = {
            let mut st = self.state();
            st.release_pending(seq);
            let user_attempt = origin == Origin::User && st.disconnect_epoch == epoch;
            if user_attempt {
                st.connection = ConnectionState::Failed;
                st.device = None;
            }
            user_attempt
        };

        warn!(device_id, code = error.code(), "Connect failed: {}", error);
        if publish {
            self.publish(
                StatusEvent::new(
                    ConnectionState::Failed,
                    format!("{}. {}", error, error.remediation()),
                )
                .with_error(error.clone()),
            );
        }
    }

    /// Returns false when there is nothing to pause.
    fn pause(&self) -> bool {
        let device = {
            let mut st = self.state();
            if st.active.is_none() {
                return false;
            }
            if st.connection == ConnectionState::Paused {
                return true;
            }
            st.connection = ConnectionState::Paused;
            st.device.clone()
        };

        self.stream.pause(PauseSource::Connection);
        info!("Connection paused, link kept open");
        self.publish(
            StatusEvent::new(ConnectionState::Paused, "Paused (link kept open)").with_device(device),
        );
        true
    }

    /// Manual full disconnect. Never followed by an automatic reconnect.
    async fn teardown(&self) {
        let (active, device) = {
            let mut st = self.state();
            st.disconnect_epoch += 1;
            st.generation += 1;
            // The in-flight attempt notices the epoch change and closes its link
            st.pending = None;
            if let Some(task) = st.reconnect_task.take() {
                task.abort();
            }
            st.last_connected = None;
            st.reconnect.reset();
            st.connection = ConnectionState::Disconnected;
            (st.active.take(), st.device.take())
        };

        if let Some(active) = active {
            active.close().await;
        }
        self.stream.clear_readings();
        self.stream.resume(PauseSource::Connection);

        info!("Disconnected by user");
        self.publish(StatusEvent::new(ConnectionState::Disconnected, "Disconnected").with_device(device));
    }

    fn check_liveness(self: &Arc<Self>, generation: u64, alive: bool) {
        let healed = {
            let mut st = self.state();
            if st.generation != generation || st.active.is_none() {
                return;
            }
            match (alive, st.connection) {
                (true, ConnectionState::Connected | ConnectionState::Paused) => None,
                (true, _) => {
                    st.connection = ConnectionState::Connected;
                    st.device.clone()
                }
                (false, ConnectionState::Connected) => {
                    drop(st);
                    self.on_link_lost(
                        generation,
                        StreamingError::LinkLost("liveness check failed".into()),
                    );
                    return;
                }
                (false, _) => None,
            }
        };

        if let Some(device) = healed {
            info!("Liveness check healed state to connected");
            self.publish(StatusEvent::new(ConnectionState::Connected, "Connected").with_device(Some(device)));
        }
    }

    /// Unexpected loss of the session `generation`. Stale generations are ignored.
    fn on_link_lost(self: &Arc<Self>, generation: u64, reason: StreamingError) {
        let (active, device, reconnect_to) = {
            let mut st = self.state();
            let current = st.active.as_ref().map(|a| a.generation);
            if current != Some(generation) {
                return;
            }
            let was_connected = st.connection == ConnectionState::Connected;
            let active = st.active.take();
            st.generation += 1;

            let reconnect_to = if was_connected && self.config.auto_reconnect {
                st.last_connected.clone()
            } else {
                None
            };
            st.connection = if reconnect_to.is_some() {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
            st.reconnect.reset();
            (active, st.device.clone(), reconnect_to)
        };

        warn!(reconnect = reconnect_to.is_some(), "Scale link lost: {}", reason);
        if let Some(active) = &active {
            active.stop_tasks();
        }
        self.stream.clear_readings();

        let state = if reconnect_to.is_some() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        self.publish(StatusEvent::new(state, reason.to_string()).with_device(device));

        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Some(active) = active {
                active.close().await;
            }
            if let Some(device_id) = reconnect_to {
                this.reconnect_loop(device_id).await;
            }
        });

        let mut st = self.state();
        if st.connection == ConnectionState::Reconnecting {
            if let Some(old) = st.reconnect_task.replace(task) {
                old.abort();
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>, device_id: String) {
        loop {
            let (attempt, max, delay) = {
                let mut st = self.state();
                if st.connection != ConnectionState::Reconnecting
                    || st.last_connected.as_deref() != Some(device_id.as_str())
                {
                    debug!("Reconnect no longer wanted");
                    return;
                }
                if st.reconnect.exhausted() {
                    break;
                }
                st.reconnect.attempts += 1;
                (st.reconnect.attempts, st.reconnect.max_attempts, st.reconnect.delay)
            };

            info!(attempt, max, "Reconnecting in {:?}", delay);
            self.publish(StatusEvent::new(
                ConnectionState::Reconnecting,
                format!("Reconnecting (attempt {}/{})", attempt, max),
            ));
            tokio::time::sleep(delay).await;

            match Inner::connect(&self, &device_id, Origin::Reconnect).await {
                Ok(_) => {
                    info!(attempt, "Reconnected");
                    return;
                }
                Err(ConnectionError::AlreadyConnecting(other)) => {
                    debug!(other = %other, "User is connecting elsewhere, reconnect dropped");
                    return;
                }
                Err(e) => warn!(attempt, "Reconnect attempt failed: {}", e),
            }
        }

        let max = {
            let mut st = self.state();
            st.connection = ConnectionState::Failed;
            st.reconnect_task = None;
            st.reconnect.max_attempts
        };
        let error = ConnectionError::ReconnectExhausted(max);
        error!("{}", error);
        self.publish(StatusEvent::new(ConnectionState::Failed, error.to_string()).with_error(error));
    }
}

async fn liveness_loop(
    session: Arc<dyn LinkSession>,
    events: mpsc::UnboundedSender<SessionEvent>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let alive = session.is_alive().await;
        if events.send(SessionEvent::Liveness { alive }).is_err() {
            return;
        }
    }
}

/// Routes one session's events to the manager. Ends when the session's
/// reader and liveness tasks are gone.
async fn supervise(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            SessionEvent::LinkLost(reason) => {
                inner.on_link_lost(generation, reason);
                return;
            }
            SessionEvent::Liveness { alive } => inner.check_liveness(generation, alive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::Subscription;
    use crate::domain::models::ScaleEvent;
    use crate::domain::settings::StreamConfig;
    use crate::infrastructure::link::mock::MockLink;

    struct Fixture {
        link: Arc<MockLink>,
        manager: ConnectionManager,
        stream: Arc<WeightStream>,
        events: Subscription,
    }

    fn fixture(link: MockLink, config: ConnectionConfig) -> Fixture {
        let link = Arc::new(link);
        let bus = EventBus::new();
        let events = bus.subscribe();
        let stream = Arc::new(WeightStream::new(StreamConfig::default(), bus.clone()));
        let manager = ConnectionManager::new(link.clone(), stream.clone(), bus, config);
        Fixture {
            link,
            manager,
            stream,
            events,
        }
    }

    fn scales() -> MockLink {
        MockLink::with_devices(&["SCALE-A", "SCALE-B"])
    }

    fn states(events: &mut Subscription) -> Vec<ConnectionState> {
        let mut out = Vec::new();
        while let Some(event) = events.try_recv() {
            if let ScaleEvent::Status(s) = event {
                out.push(s.state);
            }
        }
        out
    }

    fn weights(events: &mut Subscription) -> Vec<f64> {
        let mut out = Vec::new();
        while let Some(event) = events.try_recv() {
            if let ScaleEvent::Weight(r) = event {
                out.push(r.value_kg());
            }
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_merge_prefers_paired_identity_and_fresh_signal() {
        let mut devices = vec![DeviceDescriptor::new("98:D3:31:00:00:01", Some("Scale".into()))
            .unwrap()
            .paired(true)];
        let found = vec![
            DeviceDescriptor::new("98:d3:31:00:00:01", Some("HC-05".into()))
                .unwrap()
                .with_signal(Some(-48)),
            DeviceDescriptor::new("AA:00:00:00:00:02", None)
                .unwrap()
                .with_signal(Some(-70)),
        ];

        merge_discovered(&mut devices, found);

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name.as_deref(), Some("Scale"));
        assert!(devices[0].is_paired);
        assert_eq!(devices[0].signal_strength, Some(-48));
        assert!(!devices[1].is_paired);
    }

    #[tokio::test]
    async fn test_scan_falls_back_to_bonded_only() {
        let f = fixture(scales(), ConnectionConfig::default());
        let devices = f.manager.scan(true).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.is_paired));
    }

    #[tokio::test]
    async fn test_scan_with_nearby() {
        let nearby = vec![DeviceDescriptor::new("NEW-SCALE", Some("BT Scale".into())).unwrap()];
        let f = fixture(scales().with_nearby(nearby), ConnectionConfig::default());
        assert_eq!(f.manager.scan(false).await.unwrap().len(), 2);
        assert_eq!(f.manager.scan(true).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_starts_pipeline() {
        let mut f = fixture(scales(), ConnectionConfig::default());
        let device = f.manager.connect("SCALE-A").await.unwrap();

        assert_eq!(device.id, "SCALE-A");
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.manager.last_connected().as_deref(), Some("SCALE-A"));
        assert!(f.stream.burst_active());
        assert_eq!(
            states(&mut f.events),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        f.link.last_session().feed(b"ST,GS,    12.34KG\r\n");
        settle().await;
        assert_eq!(weights(&mut f.events), vec![12.34]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.link.set_open_delay(Duration::from_secs(1));

        let (a, b) = tokio::join!(f.manager.connect("SCALE-A"), f.manager.connect("SCALE-A"));

        assert_eq!(f.link.opens(), 1);
        assert_eq!(a.unwrap().id, "SCALE-A");
        assert_eq!(b.unwrap().id, "SCALE-A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_other_device_while_connecting() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.link.set_open_delay(Duration::from_secs(1));

        let (a, b) = tokio::join!(f.manager.connect("SCALE-A"), f.manager.connect("SCALE-B"));

        assert!(a.is_ok());
        assert_eq!(b, Err(ConnectionError::AlreadyConnecting("SCALE-A".into())));
        assert_eq!(f.link.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_classified() {
        let mut f = fixture(scales(), ConnectionConfig::default());
        f.link.fail_next_open(LinkError::Open {
            device: "SCALE-A".into(),
            reason: "Permission denied (os error 13)".into(),
        });

        let err = f.manager.connect("SCALE-A").await.unwrap_err();
        assert!(matches!(err, ConnectionError::PermissionDenied(_)));
        assert_eq!(f.manager.state(), ConnectionState::Failed);

        let failed = std::iter::from_fn(|| f.events.try_recv())
            .filter_map(|e| match e {
                ScaleEvent::Status(s) if s.state == ConnectionState::Failed => Some(s),
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(failed.error.map(|e| e.code()), Some("permission_denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.link.set_open_delay(Duration::from_secs(60));

        let err = f.manager.connect("SCALE-A").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
        assert_eq!(f.manager.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_loss_reconnects() {
        let mut f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        let first = f.link.last_session();
        states(&mut f.events);

        first.drop_link();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(first.is_closed());
        assert_eq!(f.link.opens(), 2);
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.manager.reconnect_policy().attempts, 0);

        let seen = states(&mut f.events);
        assert_eq!(seen.first(), Some(&ConnectionState::Reconnecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_bounded() {
        let mut f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        states(&mut f.events);

        f.link.fail_all_opens(true);
        f.link.last_session().drop_link();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(f.manager.state(), ConnectionState::Failed);
        assert_eq!(f.link.opens(), 1 + 5);

        let last = std::iter::from_fn(|| f.events.try_recv())
            .filter_map(|e| match e {
                ScaleEvent::Status(s) => Some(s),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last.state, ConnectionState::Failed);
        assert_eq!(last.error.map(|e| e.code()), Some("reconnect_failed"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.link.opens(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_never_reconnects() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        let session = f.link.last_session();

        f.manager.disconnect(true).await;
        assert!(session.is_closed());
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert_eq!(f.manager.last_connected(), None);

        session.drop_link();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.link.opens(), 1);
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_cancels_pending_reconnect() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        f.link.fail_all_opens(true);
        f.link.last_session().drop_link();

        // first retry fires after the 3s delay
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(f.manager.state(), ConnectionState::Reconnecting);

        f.manager.disconnect(true).await;
        let opens = f.link.opens();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(f.link.opens(), opens);
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_disconnect_pauses() {
        let mut f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        let session = f.link.last_session();
        session.feed(b"W 1.00 kg\r\n");
        settle().await;
        weights(&mut f.events);

        f.manager.disconnect(false).await;
        assert_eq!(f.manager.state(), ConnectionState::Paused);
        assert!(!session.is_closed());
        assert!(f.stream.is_paused_by(PauseSource::Connection));

        tokio::time::sleep(Duration::from_millis(200)).await;
        session.feed(b"W 2.00 kg\r\n");
        settle().await;
        assert!(weights(&mut f.events).is_empty());

        let device = f.manager.resume().await.unwrap();
        assert_eq!(device.id, "SCALE-A");
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(weights(&mut f.events), vec![2.0]);
        assert_eq!(f.link.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_paused_device_resumes() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        f.manager.disconnect(false).await;

        f.manager.connect("SCALE-A").await.unwrap();
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.link.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_persistent_disconnect_closes() {
        let config = ConnectionConfig {
            persistent_connection: false,
            ..ConnectionConfig::default()
        };
        let f = fixture(scales(), config);
        f.manager.connect("SCALE-A").await.unwrap();
        let session = f.link.last_session();

        f.manager.disconnect(false).await;
        assert!(session.is_closed());
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_detects_silent_death() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        f.link.last_session().die_silently();

        // persistent liveness period is 5s, then the 3s reconnect delay
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(f.link.opens(), 2);
        assert_eq!(f.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_heals_drifted_state() {
        let mut f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        states(&mut f.events);

        f.manager.inner.state().connection = ConnectionState::Disconnected;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(f.manager.state(), ConnectionState::Connected);
        let healed: Vec<_> = std::iter::from_fn(|| f.events.try_recv())
            .filter_map(|e| match e {
                ScaleEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(healed.len(), 1);
        assert_eq!(healed[0].state, ConnectionState::Connected);
        assert_eq!(healed[0].device.as_ref().map(|d| d.id.as_str()), Some("SCALE-A"));
        assert_eq!(f.link.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_disconnect_during_open() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.link.set_open_delay(Duration::from_secs(1));

        let manager = f.manager.clone();
        let abandoned = tokio::spawn(async move { manager.connect("SCALE-A").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.manager.disconnect(true).await;

        let device = f.manager.connect("SCALE-B").await.unwrap();
        assert_eq!(device.id, "SCALE-B");
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.link.opens(), 2);

        assert!(abandoned.await.unwrap().is_err());
        let sessions = f.link.sessions();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].is_closed());
        assert!(!sessions[1].is_closed());
        assert_eq!(f.manager.device().map(|d| d.id), Some("SCALE-B".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_same_device_after_disconnect_during_open() {
        let f = fixture(scales(), ConnectionConfig::default());
        f.link.set_open_delay(Duration::from_secs(1));

        let manager = f.manager.clone();
        let abandoned = tokio::spawn(async move { manager.connect("SCALE-A").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.manager.disconnect(true).await;

        let device = f.manager.connect("SCALE-A").await.unwrap();
        assert_eq!(device.id, "SCALE-A");
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.link.opens(), 2);
        assert!(abandoned.await.unwrap().is_err());

        // the abandoned attempt must not release the live attempt's slot
        assert!(f.manager.inner.state().pending.is_none());
        assert!(!f.link.last_session().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_without_reconnect_clears_readings_at_once() {
        let config = ConnectionConfig {
            auto_reconnect: false,
            ..ConnectionConfig::default()
        };
        let f = fixture(scales(), config);
        f.manager.connect("SCALE-A").await.unwrap();
        f.link.last_session().feed(b"W 4.00 kg\r\n");
        settle().await;
        assert!(f.stream.latest().is_some());

        let generation = f.manager.inner.state().active.as_ref().map(|a| a.generation).unwrap();
        f.manager
            .inner
            .on_link_lost(generation, StreamingError::LinkLost("gone".into()));
        assert!(f.stream.latest().is_none());
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_devices_closes_previous() {
        let mut f = fixture(scales(), ConnectionConfig::default());
        f.manager.connect("SCALE-A").await.unwrap();
        let first = f.link.last_session();
        first.feed(b"W 3.00 kg\r\n");
        settle().await;

        f.manager.connect("SCALE-B").await.unwrap();
        assert!(first.is_closed());
        assert_eq!(f.manager.device().map(|d| d.id), Some("SCALE-B".to_string()));
        assert!(f.stream.latest().is_none());
        weights(&mut f.events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_writes_to_link() {
        let f = fixture(scales(), ConnectionConfig::default());
        assert_eq!(f.manager.send(b"T\r\n").await, Err(ConnectionError::NotConnected));

        f.manager.connect("SCALE-A").await.unwrap();
        f.manager.send(b"T\r\n").await.unwrap();
        assert_eq!(f.link.last_session().written(), b"T\r\n");
    }
}
