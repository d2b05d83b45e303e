//! Serial Link
//!
//! Classic Bluetooth scales speak SPP, which the OS exposes as a serial port
//! once the device is paired and bound (`/dev/rfcommN`, `COMn`, `/dev/cu.*`).

use crate::domain::models::DeviceDescriptor;
use crate::domain::settings::{ConnectionSettings, ReadMode};
use crate::infrastructure::link::{LinkChunk, LinkError, LinkSession, ScaleLink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 256;
const PUSH_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SerialLinkConfig {
    pub baud_rate: u32,
    pub read_mode: ReadMode,
    /// Upper bound on one poll read
    pub poll_timeout: Duration,
}

impl From<&ConnectionSettings> for SerialLinkConfig {
    fn from(s: &ConnectionSettings) -> Self {
        Self {
            baud_rate: s.baud_rate,
            read_mode: s.read_mode,
            ..Self::default()
        }
    }
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            read_mode: ReadMode::Push,
            poll_timeout: Duration::from_millis(20),
        }
    }
}

/// Hardware link over Bluetooth serial ports.
pub struct SerialLink {
    config: SerialLinkConfig,
}

impl SerialLink {
    pub fn new(config: SerialLinkConfig) -> Self {
        Self { config }
    }
}

fn is_bluetooth_port(port_name: &str, port_type: &SerialPortType) -> bool {
    let lower = port_name.to_lowercase();
    matches!(port_type, SerialPortType::BluetoothPort)
        || lower.contains("rfcomm")
        || lower.contains("bluetooth")
}

fn port_label(port_name: &str) -> String {
    let short = port_name.rsplit('/').next().unwrap_or(port_name);
    format!("Bluetooth SPP ({})", short)
}

#[async_trait]
impl ScaleLink for SerialLink {
    fn kind(&self) -> &'static str {
        "serial"
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        let ports = tokio_serial::available_ports().map_err(|e| LinkError::Io(e.to_string()))?;

        let devices: Vec<DeviceDescriptor> = ports
            .into_iter()
            .filter(|p| is_bluetooth_port(&p.port_name, &p.port_type))
            .filter_map(|p| {
                let label = port_label(&p.port_name);
                DeviceDescriptor::new(p.port_name, Some(label))
            })
            .map(|d| d.paired(true))
            .collect();

        debug!(count = devices.len(), "Bound serial ports enumerated");
        Ok(devices)
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, LinkError> {
        // Unbound devices have no port until paired through the OS
        Err(LinkError::Unsupported("serial ports cannot discover unpaired devices"))
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn LinkSession>, LinkError> {
        info!(port = device_id, baud = self.config.baud_rate, "Opening serial port");

        let port = tokio_serial::new(device_id, self.config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
            .map_err(|e| LinkError::Open {
                device: device_id.to_string(),
                reason: e.to_string(),
            })?;

        let device = DeviceDescriptor::new(device_id, Some(port_label(device_id)))
            .ok_or_else(|| LinkError::Open {
                device: device_id.to_string(),
                reason: "device not found: empty port name".to_string(),
            })?
            .paired(true);

        Ok(Arc::new(SerialSession::new(device, port, self.config.clone())))
    }
}

pub struct SerialSession {
    device: DeviceDescriptor,
    config: SerialLinkConfig,
    reader: tokio::sync::Mutex<Option<ReadHalf<SerialStream>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<SerialStream>>>,
    alive: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SerialSession {
    fn new(device: DeviceDescriptor, port: SerialStream, config: SerialLinkConfig) -> Self {
        let (reader, writer) = tokio::io::split(port);
        Self {
            device,
            config,
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            alive: Arc::new(AtomicBool::new(true)),
            pump: Mutex::new(None),
        }
    }

    fn port_still_present(&self) -> bool {
        // rfcomm nodes disappear when the binding is released
        #[cfg(unix)]
        {
            std::path::Path::new(&self.device.id).exists()
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

async fn pump(
    mut reader: ReadHalf<SerialStream>,
    tx: tokio::sync::mpsc::Sender<LinkChunk>,
    alive: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let chunk = match reader.read(&mut buf).await {
            Ok(0) => Err(LinkError::Closed),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) => Err(LinkError::from(e)),
        };

        let lost = matches!(&chunk, Err(e) if e.is_link_lost());
        if lost {
            alive.store(false, Ordering::SeqCst);
        }
        if tx.send(chunk).await.is_err() || lost {
            trace!("Serial pump stopped");
            return;
        }
    }
}

#[async_trait]
impl LinkSession for SerialSession {
    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.port_still_present()
    }

    fn subscribe(&self) -> Option<tokio::sync::mpsc::Receiver<LinkChunk>> {
        if self.config.read_mode == ReadMode::Poll {
            return None;
        }
        let reader = self.reader.try_lock().ok()?.take()?;

        let (tx, rx) = tokio::sync::mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let handle = tokio::spawn(pump(reader, tx, self.alive.clone()));
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
        debug!(port = %self.device.id, "Serial push pump started");
        Some(rx)
    }

    async fn read_available(&self) -> Result<Vec<u8>, LinkError> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or(LinkError::Unsupported("reader is owned by the push pump"))?;

        let mut buf = [0u8; READ_BUFFER_SIZE];
        match tokio::time::timeout(self.config.poll_timeout, reader.read(&mut buf)).await {
            // Nothing arrived within the window
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(LinkError::Closed)
            }
            Ok(Ok(n)) => Ok(buf[..n].to_vec()),
            Ok(Err(e)) => {
                let err = LinkError::from(e);
                if err.is_link_lost() {
                    self.alive.store(false, Ordering::SeqCst);
                }
                Err(err)
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::Closed)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.pump.lock().ok().and_then(|mut p| p.take()) {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                warn!(port = %self.device.id, "Serial shutdown failed: {}", e);
            }
        }
        self.reader.lock().await.take();
        info!(port = %self.device.id, "Serial port closed");
    }
}
