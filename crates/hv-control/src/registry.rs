//! Model identifiers and driver construction.
//!
//! The set of supported supplies is closed: a configured model id maps to
//! exactly one [`SupplyModel`], and anything else is rejected before any
//! port is opened.

use hv_core::config::{DeviceConfig, TimingConfig};
use hv_core::transport::Transport;
use hv_core::{BiasSupply, HvError, HvResult};
use hv_driver_keithley::{Keithley24xx, Keithley24xxOptions, Keithley6517b};
use hv_driver_mock::SimulatedSupply;
use std::fmt;
use std::str::FromStr;

/// Supported supply models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupplyModel {
    /// Keithley 2400 SourceMeter (±200 V).
    Keithley2400,
    /// Keithley 2410 SourceMeter (±1100 V).
    Keithley2410,
    /// Keithley 6517B electrometer source (±1000 V).
    Keithley6517B,
    /// In-memory supply for dry runs.
    Simulated,
}

impl FromStr for SupplyModel {
    type Err = HvError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        match id.trim().to_ascii_uppercase().as_str() {
            "2400" | "K2400" => Ok(SupplyModel::Keithley2400),
            "2410" | "K2410" => Ok(SupplyModel::Keithley2410),
            "6517" | "6517B" | "K6517B" => Ok(SupplyModel::Keithley6517B),
            "SIM" | "SIMULATED" => Ok(SupplyModel::Simulated),
            _ => Err(HvError::UnsupportedModel(id.to_string())),
        }
    }
}

impl fmt::Display for SupplyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SupplyModel::Keithley2400 => "Keithley 2400",
            SupplyModel::Keithley2410 => "Keithley 2410",
            SupplyModel::Keithley6517B => "Keithley 6517B",
            SupplyModel::Simulated => "Simulated",
        };
        write!(f, "{label}")
    }
}

impl SupplyModel {
    /// Whether the model talks over a serial port.
    pub fn needs_port(&self) -> bool {
        !matches!(self, SupplyModel::Simulated)
    }
}

/// Open the port for `config` and run the driver's start sequence.
///
/// # Errors
///
/// - [`HvError::UnsupportedModel`] for an unknown model id
/// - [`HvError::Config`] when a serial model has no address
/// - [`HvError::Connection`] when the port cannot be opened and
///   `allow_detached` is off
pub async fn build_supply(
    config: &DeviceConfig,
    timing: &TimingConfig,
) -> HvResult<Box<dyn BiasSupply>> {
    let model: SupplyModel = config.model.parse()?;
    tracing::info!(device = %config.id, %model, hot_start = config.hot_start, "building supply");

    if !model.needs_port() {
        let (supply, _handle) = SimulatedSupply::builder().build();
        return Ok(Box::new(supply));
    }

    if config.address.trim().is_empty() {
        return Err(HvError::Config(format!(
            "device '{}': model {model} needs a serial address",
            config.id
        )));
    }
    let transport = Transport::connect(
        &config.id,
        &config.address,
        config.baud_rate,
        timing.framing(),
        config.allow_detached,
    )
    .await?;

    let supply: Box<dyn BiasSupply> = match model {
        SupplyModel::Keithley2400 | SupplyModel::Keithley2410 => {
            let options = Keithley24xxOptions {
                compliance: config.compliance,
                rear_output: config.rear_output,
            };
            Box::new(Keithley24xx::connect(transport, options, config.hot_start).await?)
        }
        SupplyModel::Keithley6517B => {
            Box::new(Keithley6517b::connect(transport, config.hot_start).await?)
        }
        SupplyModel::Simulated => {
            let (supply, _handle) = SimulatedSupply::builder().build();
            Box::new(supply)
        }
    };
    Ok(supply)
}
