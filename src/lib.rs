//! Weighing-scale link subsystem: discovery, connection lifecycle, frame
//! decoding, throttled delivery and weight locking for Bluetooth serial
//! scales, with a virtual scale for hardware-free environments.

pub mod domain;
pub mod infrastructure;

pub use domain::errors::{ConnectionError, LockError, StreamingError};
pub use domain::models::{ConnectionState, DeviceDescriptor, ScaleEvent, WeightReading};
pub use infrastructure::scale::ScaleService;
