//! Scale Link Capability
//!
//! The one seam between the subsystem and the physical (or virtual) scale.
//! Everything above this module is identical for hardware and simulator.
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │   dyn ScaleLink      │  bonded_devices / discover / open
//!                 └──────────┬───────────┘
//!              ┌─────────────┴─────────────┐
//!              ▼                           ▼
//!     ┌─────────────────┐         ┌──────────────────┐
//!     │   SerialLink    │         │  SimulatedLink   │
//!     │ RFCOMM / SPP    │         │ random-walk      │
//!     │ via tokio-serial│         │ virtual scale    │
//!     └────────┬────────┘         └────────┬─────────┘
//!              └─────────────┬─────────────┘
//!                            ▼
//!                 ┌──────────────────────┐
//!                 │   dyn LinkSession    │  push (subscribe) or poll (read_available)
//!                 └──────────────────────┘
//! ```

use crate::domain::models::DeviceDescriptor;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(test)]
pub mod mock;
pub mod serial;
pub mod simulated;

pub use serial::{SerialLink, SerialLinkConfig};
pub use simulated::{SimulatedLink, VIRTUAL_SCALE_ID};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("not supported by this link: {0}")]
    Unsupported(&'static str),

    #[error("failed to open {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("link closed")]
    Closed,
}

impl LinkError {
    /// True when the session is gone for good, as opposed to a hiccup.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, LinkError::Closed)
    }
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => LinkError::Closed,
            _ => LinkError::Io(e.to_string()),
        }
    }
}

/// One chunk of bytes pushed by a session, or the error that ended the push.
pub type LinkChunk = Result<Vec<u8>, LinkError>;

#[async_trait]
pub trait ScaleLink: Send + Sync {
    /// Short label for logs ("serial", "simulated")
    fn kind(&self) -> &'static str;

    /// Devices the platform already knows (paired / bound).
    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, LinkError>;

    /// Live discovery. `Err(Unsupported)` means bonded devices are all there is.
    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, LinkError>;

    async fn open(&self, device_id: &str) -> Result<Arc<dyn LinkSession>, LinkError>;
}

/// An open connection to one scale.
#[async_trait]
pub trait LinkSession: Send + Sync {
    fn device(&self) -> &DeviceDescriptor;

    async fn is_alive(&self) -> bool;

    /// Push capability probe. Returns the receiving end the first time when
    /// the session can push bytes as they arrive; `None` means poll instead.
    fn subscribe(&self) -> Option<mpsc::Receiver<LinkChunk>>;

    /// Whatever bytes arrived since the last call (possibly none).
    async fn read_available(&self) -> Result<Vec<u8>, LinkError>;

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError>;

    async fn close(&self);
}
