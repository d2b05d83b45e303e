//! Scale Module
//!
//! Connects to a weighing scale and turns its serial output into locked,
//! throttled weight readings.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ScaleService                        │
//! │   (facade - the only type the application talks to)      │
//! └───────┬──────────────┬──────────────┬───────────────┬─────┘
//!         │              │              │               │
//!         ▼              ▼              ▼               ▼
//! ┌─────────────┐ ┌─────────────┐ ┌───────────┐ ┌──────────────┐
//! │ DeviceFilter│ │ Connection  │ │  Weight   │ │  WeightLock  │
//! │             │ │  Manager    │ │  Stream   │ │  Coordinator │
//! │ - keywords  │ │ - connect   │ │ - parse   │ │ - lock       │
//! │ - approved  │ │ - liveness  │ │ - throttle│ │ - submission │
//! └─────────────┘ │ - reconnect │ │ - pause   │ └──────────────┘
//!                 └──────┬──────┘ └─────▲─────┘
//!                        │ spawns       │ frames
//!                        ▼              │
//!                 ┌─────────────────────┴──┐
//!                 │    DataStreamReader    │◀── dyn LinkSession
//!                 └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`reader`] - Frame assembly and push/poll ingestion
//! - [`connection`] - Session lifecycle, liveness and auto-reconnect
//! - [`service`] - Facade wiring everything together

pub mod connection;
pub mod reader;
pub mod service;

pub use connection::{ConnectionManager, ReconnectPolicy};
pub use service::ScaleService;
