//! Simulated hardware for hv-bias.
//!
//! [`SimulatedSupply`] implements [`hv_core::BiasSupply`] without a serial
//! port. It backs the controller tests and `model = "sim"` dry runs.

pub mod simulated_supply;

pub use simulated_supply::{SimulatedHandle, SimulatedSupply, SimulatedSupplyBuilder, SupplyCall};
