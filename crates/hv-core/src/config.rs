//! Configuration for bias supplies and the control loop.
//!
//! Settings are read from a TOML file with figment and can be overridden from
//! the environment (`HVCTL_` prefix, `__` as the nesting separator, e.g.
//! `HVCTL_TIMING__TICK_MS=50`).
//!
//! ```toml
//! [application]
//! name = "testbeam"
//!
//! [[devices]]
//! id = "HV1"
//! model = 2410
//! address = "/dev/ttyUSB0"
//! ramp = 10.0
//! bias = -300.0
//! min_bias = -500.0
//! max_bias = 0.0
//! max_step = 20.0
//! ```
//!
//! Deserialization rejects missing required numbers. Semantic checks live in
//! [`DeviceConfig::validate`] so that one bad device keeps only itself from
//! starting.

use crate::error::{HvError, HvResult};
use crate::transport::FramingConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Top level
// =============================================================================

/// Everything loaded from one configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HvSettings {
    /// Process-wide settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Handshake and loop timing.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Supplies to control.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl HvSettings {
    /// Load from `path`, with environment overrides.
    pub fn load(path: &Path) -> HvResult<Self> {
        if !path.exists() {
            return Err(HvError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), "loading settings");

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HVCTL_").split("__"));
        Self::from_figment(figment)
    }

    /// Parse from an in-memory TOML document.
    pub fn from_toml_str(source: &str) -> HvResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(source)))
    }

    fn from_figment(figment: Figment) -> HvResult<Self> {
        let settings: Self = figment.extract()?;
        settings.check_unique_ids()?;
        tracing::info!(
            name = %settings.application.name,
            devices = settings.devices.len(),
            "settings loaded"
        );
        Ok(settings)
    }

    fn check_unique_ids(&self) -> HvResult<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(HvError::Config(format!(
                    "duplicate device id '{}'",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// Name of the setup, used in diagnostics.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_app_name() -> String {
    "hv-bias".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Timing
// =============================================================================

/// Timing of the poll loop and the serial handshake.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Poll loop period.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Ceiling on waiting for the device busy lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Pause between desync re-polls.
    #[serde(default = "default_desync_pause_ms")]
    pub desync_pause_ms: u64,
    /// Re-polls before a desync becomes fatal.
    #[serde(default = "default_desync_retries")]
    pub desync_retries: u32,
    /// Delay after every write.
    #[serde(default = "default_write_settle_ms")]
    pub write_settle_ms: u64,
    /// Delay between a query and its read.
    #[serde(default = "default_read_settle_ms")]
    pub read_settle_ms: u64,
    /// Interval between input checks while reading.
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,
    /// Reply timeout.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_tick_ms() -> u64 {
    100
}
fn default_lock_timeout_ms() -> u64 {
    20_000
}
fn default_desync_pause_ms() -> u64 {
    1_000
}
fn default_desync_retries() -> u32 {
    10
}
fn default_write_settle_ms() -> u64 {
    100
}
fn default_read_settle_ms() -> u64 {
    200
}
fn default_read_poll_ms() -> u64 {
    200
}
fn default_read_timeout_secs() -> u64 {
    300
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            desync_pause_ms: default_desync_pause_ms(),
            desync_retries: default_desync_retries(),
            write_settle_ms: default_write_settle_ms(),
            read_settle_ms: default_read_settle_ms(),
            read_poll_ms: default_read_poll_ms(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl TimingConfig {
    /// Poll loop period.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Busy lock ceiling.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Pause between desync re-polls.
    pub fn desync_pause(&self) -> Duration {
        Duration::from_millis(self.desync_pause_ms)
    }

    /// Transport timing derived from these settings.
    pub fn framing(&self) -> FramingConfig {
        FramingConfig {
            write_settle: Duration::from_millis(self.write_settle_ms),
            read_settle: Duration::from_millis(self.read_settle_ms),
            read_poll: Duration::from_millis(self.read_poll_ms),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            ..FramingConfig::default()
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// One supply.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Unique key, e.g. "HV1".
    pub id: String,
    /// Model identifier; selects the driver variant.
    #[serde(deserialize_with = "model_id")]
    pub model: String,
    /// Serial port path.
    #[serde(default)]
    pub address: String,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Ramp speed in V/s.
    #[serde(rename = "ramp")]
    pub ramp_speed: f64,
    /// Bias to ramp to once the output is on.
    #[serde(rename = "bias")]
    pub target_bias: f64,
    /// Lowest allowed target.
    pub min_bias: f64,
    /// Highest allowed target.
    pub max_bias: f64,
    /// Largest change per tick, in volts.
    pub max_step: f64,
    /// Display name attached to log events.
    #[serde(default = "default_display_name")]
    pub name: String,
    /// Current protection level in amperes.
    #[serde(default = "default_compliance")]
    pub compliance: f64,
    /// Use the rear terminals (24xx only).
    #[serde(default)]
    pub rear_output: bool,
    /// Keep running without a port when it cannot be opened.
    #[serde(default = "default_allow_detached")]
    pub allow_detached: bool,
    /// Attach to a supply that is already biased without touching its output.
    #[serde(default)]
    pub hot_start: bool,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_display_name() -> String {
    "UNKNOWN".to_string()
}
fn default_compliance() -> f64 {
    100e-6
}
fn default_allow_detached() -> bool {
    true
}

fn model_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ModelId {
        Text(String),
        Number(i64),
    }

    Ok(match ModelId::deserialize(deserializer)? {
        ModelId::Text(s) => s.trim().to_string(),
        ModelId::Number(n) => n.to_string(),
    })
}

impl DeviceConfig {
    /// Check the bias window and ramp parameters.
    ///
    /// # Errors
    ///
    /// [`HvError::Config`] describing the first violated rule.
    pub fn validate(&self) -> HvResult<()> {
        let fail = |msg: String| Err(HvError::Config(format!("device '{}': {msg}", self.id)));

        if self.id.trim().is_empty() {
            return Err(HvError::Config("device id must not be empty".into()));
        }
        for (field, value) in [
            ("ramp", self.ramp_speed),
            ("bias", self.target_bias),
            ("min_bias", self.min_bias),
            ("max_bias", self.max_bias),
            ("max_step", self.max_step),
        ] {
            if !value.is_finite() {
                return fail(format!("{field} must be a finite number"));
            }
        }
        if self.min_bias > self.max_bias {
            return fail(format!(
                "min_bias {} exceeds max_bias {}",
                self.min_bias, self.max_bias
            ));
        }
        if !self.bias_allowed(self.target_bias) {
            return fail(format!(
                "bias {} outside [{}, {}]",
                self.target_bias, self.min_bias, self.max_bias
            ));
        }
        if self.ramp_speed <= 0.0 {
            return fail(format!("ramp must be positive, got {}", self.ramp_speed));
        }
        if self.max_step <= 0.0 {
            return fail(format!("max_step must be positive, got {}", self.max_step));
        }
        Ok(())
    }

    /// Whether `value` lies inside `[min_bias, max_bias]`.
    pub fn bias_allowed(&self, value: f64) -> bool {
        (self.min_bias..=self.max_bias).contains(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [application]
        name = "testbeam"

        [timing]
        tick_ms = 50

        [[devices]]
        id = "HV1"
        model = 2410
        address = "/dev/ttyUSB0"
        baud_rate = 57600
        ramp = 10.0
        bias = -300.0
        min_bias = -500.0
        max_bias = 0.0
        max_step = 20.0
        name = "DUT-A"

        [[devices]]
        id = "HV2"
        model = "6517B"
        ramp = 5.0
        bias = 100.0
        min_bias = 0.0
        max_bias = 500.0
        max_step = 10.0
    "#;

    #[test]
    fn parses_devices_and_defaults() {
        let settings = HvSettings::from_toml_str(SAMPLE).unwrap();

        assert_eq!(settings.application.name, "testbeam");
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.timing.tick(), Duration::from_millis(50));
        assert_eq!(settings.timing.lock_timeout(), Duration::from_secs(20));
        assert_eq!(settings.devices.len(), 2);

        let hv1 = &settings.devices[0];
        assert_eq!(hv1.model, "2410");
        assert_eq!(hv1.target_bias, -300.0);
        assert_eq!(hv1.name, "DUT-A");
        assert!(hv1.validate().is_ok());

        let hv2 = &settings.devices[1];
        assert_eq!(hv2.model, "6517B");
        assert_eq!(hv2.name, "UNKNOWN");
        assert_eq!(hv2.baud_rate, 9600);
        assert_eq!(hv2.compliance, 100e-6);
        assert!(hv2.allow_detached);
        assert!(!hv2.hot_start);
    }

    #[test]
    fn missing_numeric_field_is_rejected() {
        let source = r#"
            [[devices]]
            id = "HV1"
            model = "2410"
            ramp = 10.0
            bias = 0.0
            min_bias = 0.0
            max_bias = 100.0
        "#;
        let err = HvSettings::from_toml_str(source).unwrap_err();
        assert!(matches!(err, HvError::ConfigLoad(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("max_step"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let source = r#"
            [[devices]]
            id = "HV1"
            model = "sim"
            ramp = 1.0
            bias = 0.0
            min_bias = 0.0
            max_bias = 1.0
            max_step = 1.0

            [[devices]]
            id = "HV1"
            model = "sim"
            ramp = 1.0
            bias = 0.0
            min_bias = 0.0
            max_bias = 1.0
            max_step = 1.0
        "#;
        assert!(matches!(
            HvSettings::from_toml_str(source),
            Err(HvError::Config(_))
        ));
    }

    fn device() -> DeviceConfig {
        HvSettings::from_toml_str(SAMPLE).unwrap().devices.remove(1)
    }

    #[test]
    fn validate_rejects_inverted_window() {
        let mut cfg = device();
        cfg.min_bias = 600.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds max_bias"));
    }

    #[test]
    fn validate_rejects_target_outside_window() {
        let mut cfg = device();
        cfg.target_bias = 501.0;
        assert!(matches!(cfg.validate(), Err(HvError::Config(_))));

        cfg.target_bias = -0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_positive_ramp() {
        let mut cfg = device();
        cfg.ramp_speed = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = device();
        cfg.max_step = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = device();
        cfg.max_step = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn framing_follows_timing() {
        let timing = TimingConfig {
            read_timeout_secs: 5,
            ..TimingConfig::default()
        };
        let framing = timing.framing();
        assert_eq!(framing.read_timeout, Duration::from_secs(5));
        assert_eq!(framing.write_settle, Duration::from_millis(100));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = HvSettings::load(file.path()).unwrap();
        assert_eq!(settings.devices[0].id, "HV1");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = HvSettings::load(Path::new("/nonexistent/hv.toml")).unwrap_err();
        assert!(matches!(err, HvError::Config(_)));
    }
}
