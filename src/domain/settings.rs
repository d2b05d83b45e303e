use crate::domain::device_filter::ApprovedScaleStore;
use crate::domain::models::normalize_address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "scale_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// How the reader pulls bytes from the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Bytes are pushed by a background pump as they arrive
    Push,
    /// The reader polls the link on a timer
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Disconnect pauses delivery instead of closing the link
    pub persistent_connection: bool,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub liveness_interval_ms: u64,
    /// Liveness interval while persistence is on
    pub persistent_liveness_interval_ms: u64,
    pub baud_rate: u32,
    pub read_mode: ReadMode,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            persistent_connection: true,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 3000,
            connect_timeout_ms: 15_000,
            liveness_interval_ms: 2000,
            persistent_liveness_interval_ms: 5000,
            baud_rate: 9600,
            read_mode: ReadMode::Push,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub interval_ms: u64,
    pub burst_interval_ms: u64,
    pub burst_duration_ms: u64,
    /// Floor for any configured interval
    pub min_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            burst_interval_ms: 25,
            burst_duration_ms: 10_000,
            min_interval_ms: 20,
        }
    }
}

/// Connection behaviour derived from settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub persistent_connection: bool,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub liveness_interval: Duration,
    pub persistent_liveness_interval: Duration,
}

impl ConnectionConfig {
    pub fn liveness_period(&self) -> Duration {
        if self.persistent_connection {
            self.persistent_liveness_interval
        } else {
            self.liveness_interval
        }
    }
}

impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(s: &ConnectionSettings) -> Self {
        Self {
            persistent_connection: s.persistent_connection,
            auto_reconnect: s.auto_reconnect,
            max_reconnect_attempts: s.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(s.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            liveness_interval: Duration::from_millis(s.liveness_interval_ms),
            persistent_liveness_interval: Duration::from_millis(s.persistent_liveness_interval_ms),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

/// Delivery cadence derived from settings
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub interval: Duration,
    pub burst_interval: Duration,
    pub burst_duration: Duration,
    pub min_interval: Duration,
}

impl From<&StreamSettings> for StreamConfig {
    fn from(s: &StreamSettings) -> Self {
        let min_interval = Duration::from_millis(s.min_interval_ms);
        Self {
            interval: Duration::from_millis(s.interval_ms).max(min_interval),
            burst_interval: Duration::from_millis(s.burst_interval_ms).max(min_interval),
            burst_duration: Duration::from_millis(s.burst_duration_ms),
            min_interval,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from(&StreamSettings::default())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub stream: StreamSettings,

    /// Addresses the user marked as scales
    #[serde(default)]
    pub approved_scale_addresses: Vec<String>,

    #[serde(default)]
    pub last_connected_device: Option<String>,

    /// Use the virtual scale instead of hardware
    #[serde(default = "default_false")]
    pub use_simulator: bool,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when missing or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ScaleLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn add_approved_address(&mut self, address: &str) -> anyhow::Result<()> {
        let address = normalize_address(address);
        if !self.settings.approved_scale_addresses.contains(&address) {
            self.settings.approved_scale_addresses.push(address);
            self.save()?;
        }
        Ok(())
    }

    pub fn remove_approved_address(&mut self, address: &str) -> anyhow::Result<()> {
        let address = normalize_address(address);
        let before = self.settings.approved_scale_addresses.len();
        self.settings
            .approved_scale_addresses
            .retain(|a| normalize_address(a) != address);
        if self.settings.approved_scale_addresses.len() != before {
            self.save()?;
        }
        Ok(())
    }

    pub fn set_last_connected(&mut self, device_id: Option<String>) -> anyhow::Result<()> {
        if self.settings.last_connected_device != device_id {
            self.settings.last_connected_device = device_id;
            self.save()?;
        }
        Ok(())
    }
}

impl ApprovedScaleStore for Mutex<SettingsService> {
    fn approved_addresses(&self) -> anyhow::Result<HashSet<String>> {
        let service = self.lock().map_err(|_| anyhow::anyhow!("Lock error"))?;
        Ok(service
            .get()
            .approved_scale_addresses
            .iter()
            .map(|a| normalize_address(a))
            .collect())
    }

    fn approve(&self, address: &str) -> anyhow::Result<()> {
        self.lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .add_approved_address(address)
    }

    fn revoke(&self, address: &str) -> anyhow::Result<()> {
        self.lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?
            .remove_approved_address(address)
    }
}
