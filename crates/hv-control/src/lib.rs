//! Bias control for Keithley high-voltage supplies.
//!
//! - [`registry`]: model ids and driver construction
//! - [`ramp`]: the rate-limited step toward a target bias
//! - [`controller`]: [`DeviceController`], one poll loop and busy lock per device

pub mod controller;
pub mod ramp;
pub mod registry;

pub use controller::{Channel, ChannelState, ControllerOptions, DeviceController};
pub use ramp::{RampLimits, RampStep};
pub use registry::{build_supply, SupplyModel};
