//! Error types for bias supply control.
//!
//! `HvError` is the single error type shared by the transport, the instrument
//! drivers and the device controller. Variants fall into two groups:
//!
//! - **Fatal**: `Config`, `ConfigLoad`, `UnsupportedModel`, `Connection` and
//!   `Desync`. Construction-time fatal errors keep a device from ever being
//!   scheduled; a run-time `Desync` stops only the affected device loop.
//! - **Recoverable**: everything else. The poll loop absorbs these, logs them
//!   and tries again on the next tick.
//!
//! Use [`HvError::is_fatal`] rather than matching on variants when deciding
//! whether a loop may continue.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the workspace.
pub type HvResult<T> = std::result::Result<T, HvError>;

/// Errors raised while configuring or operating a bias supply.
#[derive(Error, Debug)]
pub enum HvError {
    /// Semantic configuration problem (bad bias window, missing field, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration source could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// The configured model identifier names no known driver variant.
    #[error("Unsupported model '{0}'")]
    UnsupportedModel(String),

    /// The serial channel could not be bound.
    #[error("Failed to open serial port '{address}': {message}")]
    Connection {
        /// Port path that failed to open.
        address: String,
        /// Underlying reason.
        message: String,
    },

    /// No terminated reply arrived for a command.
    #[error("No response to '{command}' within {timeout:?}")]
    TransportTimeout {
        /// Command that went unanswered.
        command: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Driver set-voltage and measured bias disagree after all re-polls.
    #[error(
        "Channel {channel} desynchronized: set-voltage {set_voltage:.3} V vs measured {measured:.3} V after {attempts} re-polls"
    )]
    Desync {
        /// Channel index.
        channel: usize,
        /// Voltage the driver believes it programmed.
        set_voltage: f64,
        /// Last measured bias.
        measured: f64,
        /// Number of re-polls performed.
        attempts: u32,
    },

    /// The instrument reported a compliance (current limit) trip.
    #[error("Compliance trip (status word {0:#x})")]
    ComplianceTrip(u32),

    /// A reply arrived but could not be interpreted as a measurement.
    #[error("Measurement error: {0}")]
    Measurement(String),

    /// The device busy lock was not acquired in time; the command was dropped.
    #[error("Device busy: '{operation}' abandoned after waiting {timeout:?}")]
    LockTimeout {
        /// Operation that gave up.
        operation: String,
        /// Bounded wait that elapsed.
        timeout: Duration,
    },

    /// A requested target bias lies outside the configured window.
    #[error("Bias {value} V outside allowed window [{min}, {max}] V")]
    BiasOutOfRange {
        /// Requested value.
        value: f64,
        /// Configured lower bound.
        min: f64,
        /// Configured upper bound.
        max: f64,
    },

    /// The channel index does not exist on this device.
    #[error("Channel {0} does not exist")]
    InvalidChannel(usize),

    /// Serial I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HvError {
    /// Whether this error must stop the device (or keep it from starting).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HvError::Config(_)
                | HvError::ConfigLoad(_)
                | HvError::UnsupportedModel(_)
                | HvError::Connection { .. }
                | HvError::Desync { .. }
        )
    }
}

impl From<figment::Error> for HvError {
    fn from(err: figment::Error) -> Self {
        HvError::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_follows_error_table() {
        assert!(HvError::Config("x".into()).is_fatal());
        assert!(HvError::UnsupportedModel("2450".into()).is_fatal());
        assert!(HvError::Desync {
            channel: 0,
            set_voltage: 10.0,
            measured: 0.0,
            attempts: 10
        }
        .is_fatal());

        assert!(!HvError::TransportTimeout {
            command: ":READ?".into(),
            timeout: Duration::from_secs(300)
        }
        .is_fatal());
        assert!(!HvError::ComplianceTrip(0x08).is_fatal());
        assert!(!HvError::Measurement("garbage".into()).is_fatal());
        assert!(!HvError::LockTimeout {
            operation: "set_output".into(),
            timeout: Duration::from_secs(20)
        }
        .is_fatal());
    }

    #[test]
    fn messages_carry_context() {
        let err = HvError::BiasOutOfRange {
            value: 600.0,
            min: 0.0,
            max: 500.0,
        };
        assert_eq!(
            err.to_string(),
            "Bias 600 V outside allowed window [0, 500] V"
        );
        assert_eq!(
            HvError::ComplianceTrip(8).to_string(),
            "Compliance trip (status word 0x8)"
        );
    }
}
