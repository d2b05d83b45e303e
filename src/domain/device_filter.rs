//! Scale Device Filter
//!
//! Decides which scanned devices are plausibly weighing scales.

use crate::domain::models::{normalize_address, DeviceDescriptor};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Name fragments used by scale vendors and the serial radio modules they embed
pub const SCALE_KEYWORDS: &[&str] = &[
    "scale", "weigh", "balance", "kg", "load cell", "loadcell", "crane", "hc-05", "hc-06",
    "hc-08", "jdy-", "spp", "bt-scale", "livestock",
];

/// OUI prefixes of the serial Bluetooth modules found in older scales
pub const MODULE_ADDRESS_PREFIXES: &[&str] = &[
    "98:D3:31", "98:D3:32", "98:D3:34", "98:D3:51", "98:D3:61", "98:D3:71", "98:D3:91",
    "00:21:13", "00:14:03", "00:18:E4", "00:13:EF", "20:16:", "20:15:",
];

/// Persisted allow-list of devices the user marked as scales.
pub trait ApprovedScaleStore: Send + Sync {
    fn approved_addresses(&self) -> anyhow::Result<HashSet<String>>;
    fn approve(&self, address: &str) -> anyhow::Result<()>;
    fn revoke(&self, address: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// The user approved this address
    Approved,
    NameKeyword,
    ModuleAddress,
    /// No advertised name, but the address belongs to a scale module
    UnnamedModule,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleCandidate {
    pub device: DeviceDescriptor,
    pub reason: MatchReason,
}

/// Classify devices against the heuristics and an approved set.
///
/// Paired devices come first; within each group the stronger signal wins.
pub fn classify(devices: &[DeviceDescriptor], approved: &HashSet<String>) -> Vec<ScaleCandidate> {
    let mut candidates: Vec<ScaleCandidate> = devices
        .iter()
        .filter_map(|device| {
            let reason = match_reason(device, approved)?;
            let mut device = device.clone();
            device.approved_as_scale = reason == MatchReason::Approved;
            Some(ScaleCandidate { device, reason })
        })
        .collect();

    candidates.sort_by(|a, b| compare_candidates(&a.device, &b.device));
    candidates
}

fn match_reason(device: &DeviceDescriptor, approved: &HashSet<String>) -> Option<MatchReason> {
    let address = device.address_key();

    if approved.contains(&address) {
        return Some(MatchReason::Approved);
    }

    if let Some(name) = &device.name {
        let name = name.to_lowercase();
        if SCALE_KEYWORDS.iter().any(|k| name.contains(k)) {
            return Some(MatchReason::NameKeyword);
        }
    }

    if MODULE_ADDRESS_PREFIXES.iter().any(|p| address.starts_with(p)) {
        return Some(if device.name.is_none() {
            MatchReason::UnnamedModule
        } else {
            MatchReason::ModuleAddress
        });
    }

    None
}

fn compare_candidates(a: &DeviceDescriptor, b: &DeviceDescriptor) -> Ordering {
    b.is_paired
        .cmp(&a.is_paired)
        .then_with(|| match (a.signal_strength, b.signal_strength) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Device filter with an in-memory cache of the approved set.
pub struct DeviceFilter {
    store: Arc<dyn ApprovedScaleStore>,
    approved: Mutex<HashSet<String>>,
}

impl DeviceFilter {
    pub fn new(store: Arc<dyn ApprovedScaleStore>) -> Self {
        let filter = Self {
            store,
            approved: Mutex::new(HashSet::new()),
        };
        filter.refresh();
        filter
    }

    /// Reload the approved set. A failing store is treated as empty.
    pub fn refresh(&self) {
        let loaded = match self.store.approved_addresses() {
            Ok(set) => set.iter().map(|a| normalize_address(a)).collect(),
            Err(e) => {
                warn!("Could not load approved scales, treating as none: {}", e);
                HashSet::new()
            }
        };
        debug!(count = loaded.len(), "Approved scale set loaded");
        if let Ok(mut approved) = self.approved.lock() {
            *approved = loaded;
        }
    }

    pub fn approved(&self) -> HashSet<String> {
        self.approved
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn is_approved(&self, address: &str) -> bool {
        self.approved
            .lock()
            .map(|set| set.contains(&normalize_address(address)))
            .unwrap_or(false)
    }

    pub fn classify(&self, devices: &[DeviceDescriptor]) -> Vec<ScaleCandidate> {
        classify(devices, &self.approved())
    }

    /// Mark descriptors found in the approved set.
    pub fn annotate(&self, devices: &mut [DeviceDescriptor]) {
        let approved = self.approved();
        for device in devices.iter_mut() {
            device.approved_as_scale = approved.contains(&device.address_key());
        }
    }

    pub fn approve(&self, address: &str) -> anyhow::Result<()> {
        self.store.approve(&normalize_address(address))?;
        if let Ok(mut approved) = self.approved.lock() {
            approved.insert(normalize_address(address));
        }
        Ok(())
    }

    pub fn revoke(&self, address: &str) -> anyhow::Result<()> {
        self.store.revoke(&normalize_address(address))?;
        if let Ok(mut approved) = self.approved.lock() {
            approved.remove(&normalize_address(address));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        set: Mutex<HashSet<String>>,
        broken: bool,
    }

    impl ApprovedScaleStore for MemoryStore {
        fn approved_addresses(&self) -> anyhow::Result<HashSet<String>> {
            if self.broken {
                anyhow::bail!("store offline");
            }
            Ok(self.set.lock().unwrap().clone())
        }

        fn approve(&self, address: &str) -> anyhow::Result<()> {
            self.set.lock().unwrap().insert(address.to_string());
            Ok(())
        }

        fn revoke(&self, address: &str) -> anyhow::Result<()> {
            self.set.lock().unwrap().remove(address);
            Ok(())
        }
    }

    fn device(id: &str, name: Option<&str>, paired: bool, rssi: Option<i16>) -> DeviceDescriptor {
        DeviceDescriptor::new(id, name.map(String::from))
            .unwrap()
            .paired(paired)
            .with_signal(rssi)
    }

    #[test]
    fn test_empty_input() {
        assert!(classify(&[], &HashSet::new()).is_empty());
    }

    #[test]
    fn test_heuristics() {
        let devices = vec![
            device("AA:BB:CC:00:00:01", Some("Kitchen SCALE"), false, None),
            device("98:d3:31:f0:12:34", Some("Module"), false, None),
            device("00:21:13:00:00:09", None, false, None),
            device("AA:BB:CC:00:00:02", Some("Headphones"), true, Some(-40)),
            device("AA:BB:CC:00:00:03", None, false, None),
        ];

        let found = classify(&devices, &HashSet::new());
        let reasons: Vec<_> = found.iter().map(|c| (c.device.id.as_str(), c.reason)).collect();

        assert_eq!(found.len(), 3);
        assert!(reasons.contains(&("AA:BB:CC:00:00:01", MatchReason::NameKeyword)));
        assert!(reasons.contains(&("98:d3:31:f0:12:34", MatchReason::ModuleAddress)));
        assert!(reasons.contains(&("00:21:13:00:00:09", MatchReason::UnnamedModule)));
    }

    #[test]
    fn test_approved_address_matches_case_insensitively() {
        let approved: HashSet<String> = ["AA:BB:CC:00:00:02".to_string()].into();
        let devices = vec![device("aa:bb:cc:00:00:02", Some("Headphones"), false, None)];

        let found = classify(&devices, &approved);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].reason, MatchReason::Approved);
        assert!(found[0].device.approved_as_scale);
    }

    #[test]
    fn test_sort_paired_then_signal() {
        let devices = vec![
            device("A", Some("scale a"), false, Some(-30)),
            device("B", Some("scale b"), true, Some(-80)),
            device("C", Some("scale c"), true, None),
            device("D", Some("scale d"), true, Some(-50)),
            device("E", Some("scale e"), false, Some(-90)),
        ];

        let order: Vec<_> = classify(&devices, &HashSet::new())
            .into_iter()
            .map(|c| c.device.id)
            .collect();
        assert_eq!(order, vec!["D", "B", "C", "A", "E"]);
    }

    #[test]
    fn test_filter_fails_open_on_store_error() {
        let store = Arc::new(MemoryStore {
            broken: true,
            ..Default::default()
        });
        let filter = DeviceFilter::new(store);
        assert!(filter.approved().is_empty());
        assert!(!filter.is_approved("AA:BB"));
    }

    #[test]
    fn test_filter_approve_and_revoke() {
        let store = Arc::new(MemoryStore::default());
        let filter = DeviceFilter::new(store.clone());
        let devices = vec![device("aa:bb:cc:dd:ee:ff", Some("Printer"), true, None)];
        assert!(filter.classify(&devices).is_empty());

        filter.approve("aa:bb:cc:dd:ee:ff").unwrap();
        assert!(store.set.lock().unwrap().contains("AA:BB:CC:DD:EE:FF"));
        assert_eq!(filter.classify(&devices).len(), 1);

        filter.revoke("AA:BB:CC:DD:EE:FF").unwrap();
        assert!(filter.classify(&devices).is_empty());
    }
}
