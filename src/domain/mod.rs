//! Domain layer: pure data and decision logic, no I/O besides settings.

pub mod device_filter;
pub mod errors;
pub mod events;
pub mod frame_parser;
pub mod lock;
pub mod models;
pub mod settings;
pub mod stream;
