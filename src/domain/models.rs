use crate::domain::errors::ConnectionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Radio address or port path. Unique and stable across scans.
    pub id: String,
    pub name: Option<String>,
    pub is_paired: bool,
    /// RSSI in dBm, when the transport reports one
    pub signal_strength: Option<i16>,
    pub approved_as_scale: bool,
}

impl DeviceDescriptor {
    /// Build a descriptor, rejecting blank ids. Blank names are treated as unnamed.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Option<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return None;
        }
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        Some(Self {
            id,
            name,
            is_paired: false,
            signal_strength: None,
            approved_as_scale: false,
        })
    }

    pub fn paired(mut self, is_paired: bool) -> Self {
        self.is_paired = is_paired;
        self
    }

    pub fn with_signal(mut self, rssi: Option<i16>) -> Self {
        self.signal_strength = rssi;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// Upper-cased id used for address comparisons and the approved set
    pub fn address_key(&self) -> String {
        normalize_address(&self.id)
    }
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Paused,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Paused => "paused",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightUnit {
    Kilogram,
    Gram,
    Pound,
    Ounce,
}

impl WeightUnit {
    /// Match a unit token as sent by the scale (`KG`, `g`, `lbs`, `ounces`, ...).
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "kg" | "kgs" | "kilo" | "kilos" | "kilogram" | "kilograms" => Some(Self::Kilogram),
            "g" | "gr" | "grs" | "gram" | "grams" => Some(Self::Gram),
            "lb" | "lbs" | "pound" | "pounds" => Some(Self::Pound),
            "oz" | "ounce" | "ounces" => Some(Self::Ounce),
            _ => None,
        }
    }

    pub fn to_kg(self, value: f64) -> f64 {
        match self {
            Self::Kilogram => value,
            Self::Gram => value / 1000.0,
            Self::Pound => value * 0.453_592_37,
            Self::Ounce => value * 0.028_349_523_125,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Kilogram => "kg",
            Self::Gram => "g",
            Self::Pound => "lb",
            Self::Ounce => "oz",
        }
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One decoded weight. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightReading {
    value_kg: f64,
    unit: WeightUnit,
    raw_frame: String,
    observed_at: DateTime<Utc>,
    stable: bool,
}

impl WeightReading {
    /// `value` is in `unit`; returns `None` unless the converted value is finite.
    pub fn new(value: f64, unit: WeightUnit, raw_frame: impl Into<String>, stable: bool) -> Option<Self> {
        let value_kg = unit.to_kg(value);
        if !value_kg.is_finite() {
            return None;
        }
        Some(Self {
            value_kg,
            unit,
            raw_frame: raw_frame.into(),
            observed_at: Utc::now(),
            stable,
        })
    }

    pub fn value_kg(&self) -> f64 {
        self.value_kg
    }

    /// Unit the scale reported in. `value_kg` is always kilograms.
    pub fn unit(&self) -> WeightUnit {
        self.unit
    }

    pub fn raw_frame(&self) -> &str {
        &self.raw_frame
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub state: ConnectionState,
    pub message: String,
    pub device: Option<DeviceDescriptor>,
    pub error: Option<ConnectionError>,
    pub severity: MessageSeverity,
}

impl StatusEvent {
    pub fn new(state: ConnectionState, message: impl Into<String>) -> Self {
        let severity = match state {
            ConnectionState::Connected => MessageSeverity::Success,
            ConnectionState::Failed => MessageSeverity::Error,
            ConnectionState::Reconnecting | ConnectionState::Paused => MessageSeverity::Warning,
            _ => MessageSeverity::Info,
        };
        Self {
            state,
            message: message.into(),
            device: None,
            error: None,
            severity,
        }
    }

    pub fn with_device(mut self, device: Option<DeviceDescriptor>) -> Self {
        self.device = device;
        self
    }

    pub fn with_error(mut self, error: ConnectionError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Everything delivered to subscribers.
#[derive(Debug, Clone)]
pub enum ScaleEvent {
    Weight(WeightReading),
    Status(StatusEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_rejects_blank_id() {
        assert!(DeviceDescriptor::new("   ", Some("Scale".into())).is_none());
        let d = DeviceDescriptor::new(" 98:d3:31:00:11:22 ", Some("  ".into())).unwrap();
        assert_eq!(d.id, "98:d3:31:00:11:22");
        assert_eq!(d.name, None);
        assert_eq!(d.display_name(), "Unknown");
        assert_eq!(d.address_key(), "98:D3:31:00:11:22");
    }

    #[test]
    fn test_unit_tokens() {
        assert_eq!(WeightUnit::from_token("KG"), Some(WeightUnit::Kilogram));
        assert_eq!(WeightUnit::from_token("grams"), Some(WeightUnit::Gram));
        assert_eq!(WeightUnit::from_token("lbs"), Some(WeightUnit::Pound));
        assert_eq!(WeightUnit::from_token("Ounce"), Some(WeightUnit::Ounce));
        assert_eq!(WeightUnit::from_token("N"), None);
        assert!((WeightUnit::Gram.to_kg(1500.0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_reading_rejects_non_finite() {
        assert!(WeightReading::new(f64::NAN, WeightUnit::Kilogram, "x", true).is_none());
        assert!(WeightReading::new(f64::INFINITY, WeightUnit::Gram, "x", true).is_none());
        let r = WeightReading::new(250.0, WeightUnit::Gram, "250g", false).unwrap();
        assert!((r.value_kg() - 0.25).abs() < 1e-9);
        assert_eq!(r.unit(), WeightUnit::Gram);
        assert!(!r.is_stable());
    }
}
