//! Core types for controlling high-voltage bias supplies.
//!
//! - [`transport`]: CRLF-framed command/response exchange over a serial line
//! - [`capabilities`]: the [`BiasSupply`] trait every driver implements
//! - [`config`]: figment-backed settings and per-device validation
//! - [`events`]: the semantic device log
//! - [`error`]: [`HvError`] and its fatal/recoverable split
//! - [`mock_serial`]: scripted port for driver tests

pub mod capabilities;
pub mod config;
pub mod error;
pub mod events;
pub mod mock_serial;
pub mod serial;
pub mod transport;

pub use capabilities::{BiasSupply, InstrumentState, IvSample, MeasurementHistory};
pub use config::{DeviceConfig, HvSettings, TimingConfig};
pub use error::{HvError, HvResult};
pub use events::{DeviceEvent, LogEvent, LogRecord};
pub use transport::{FramingConfig, ReadOutcome, Transport};
