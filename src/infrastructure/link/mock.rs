//! Scripted link for exercising connection handling without hardware.

use crate::domain::models::DeviceDescriptor;
use crate::infrastructure::link::{LinkChunk, LinkError, LinkSession, ScaleLink};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct MockLink {
    bonded: Vec<DeviceDescriptor>,
    /// `None` makes discovery unsupported
    nearby: Option<Vec<DeviceDescriptor>>,
    push: bool,
    open_delay: Mutex<Duration>,
    open_failures: Mutex<VecDeque<LinkError>>,
    fail_all_opens: AtomicBool,
    opens: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockLink {
    pub fn new(bonded: Vec<DeviceDescriptor>) -> Self {
        Self {
            bonded,
            nearby: None,
            push: true,
            open_delay: Mutex::new(Duration::ZERO),
            open_failures: Mutex::new(VecDeque::new()),
            fail_all_opens: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_devices(ids: &[&str]) -> Self {
        Self::new(
            ids.iter()
                .filter_map(|id| DeviceDescriptor::new(*id, Some(format!("Scale {id}"))))
                .map(|d| d.paired(true))
                .collect(),
        )
    }

    pub fn with_nearby(mut self, nearby: Vec<DeviceDescriptor>) -> Self {
        self.nearby = Some(nearby);
        self
    }

    pub fn polling(mut self) -> Self {
        self.push = false;
        self
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_open(&self, error: LinkError) {
        self.open_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_all_opens(&self, fail: bool) {
        self.fail_all_opens.store(fail, Ordering::SeqCst);
    }

    /// Physical open attempts so far, failed ones included
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every session opened so far, oldest first
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        self.sessions.lock().unwrap().last().cloned().expect("no session opened")
    }
}

#[async_trait]
impl ScaleLink for MockLink {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        Ok(self.bonded.clone())
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        self.nearby
            .clone()
            .ok_or(LinkError::Unsupported("mock has no radio"))
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn LinkSession>, LinkError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.open_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.fail_all_opens.load(Ordering::SeqCst) {
            return Err(LinkError::Open {
                device: device_id.to_string(),
                reason: "Device not found".into(),
            });
        }

        let device = self
            .bonded
            .iter()
            .chain(self.nearby.iter().flatten())
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| LinkError::Open {
                device: device_id.to_string(),
                reason: "no such device".into(),
            })?;

        let session = Arc::new(MockSession::new(device, self.push));
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct MockSession {
    device: DeviceDescriptor,
    push: bool,
    alive: AtomicBool,
    closed: AtomicBool,
    tx: Mutex<Option<mpsc::Sender<LinkChunk>>>,
    rx: Mutex<Option<mpsc::Receiver<LinkChunk>>>,
    polled: Mutex<VecDeque<LinkChunk>>,
    written: Mutex<Vec<u8>>,
}

impl MockSession {
    fn new(device: DeviceDescriptor, push: bool) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            device,
            push,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            polled: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Bytes arriving from the scale
    pub fn feed(&self, bytes: &[u8]) {
        self.deliver(Ok(bytes.to_vec()));
    }

    pub fn inject_error(&self, error: LinkError) {
        self.deliver(Err(error));
    }

    fn deliver(&self, chunk: LinkChunk) {
        if self.push {
            if let Some(tx) = self.tx.lock().unwrap().as_ref() {
                let _ = tx.try_send(chunk);
            }
        } else {
            self.polled.lock().unwrap().push_back(chunk);
        }
    }

    /// The scale powers off: the reader sees the link close.
    pub fn drop_link(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.deliver(Err(LinkError::Closed));
        self.tx.lock().unwrap().take();
    }

    /// The link dies without any read noticing; only liveness can tell.
    pub fn die_silently(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkSession for MockSession {
    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<LinkChunk>> {
        if !self.push {
            return None;
        }
        self.rx.lock().unwrap().take()
    }

    async fn read_available(&self) -> Result<Vec<u8>, LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        match self.polled.lock().unwrap().pop_front() {
            Some(chunk) => chunk,
            None => Ok(Vec::new()),
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_alive().await {
            return Err(LinkError::Closed);
        }
        self.written.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
    }
}
