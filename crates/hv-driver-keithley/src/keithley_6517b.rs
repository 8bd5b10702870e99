//! Keithley 6517B Electrometer (voltage source) driver
//!
//! Reference: Keithley Model 6517B Reference Manual
//!
//! Protocol Overview:
//! - Format: SCPI over RS-232, CRLF terminated
//! - Identity: `*IDN?` -> `KEITHLEY INSTRUMENTS INC.,MODEL 6517B,<serial>,<firmware>`
//! - Readings: `:READ?` with `:FORM:ELEM READ,VSO` -> `<current>,<source voltage>`,
//!   each value possibly carrying a unit suffix (`NADC`, `VSRC`)
//! - Trips: reading overflow (ROF, bit 0) in the measurement event register
//!   (`:STAT:MEAS?`); reading the register clears it
//!
//! The built-in source is limited to ±1000 V.

use crate::scpi;
use async_trait::async_trait;
use hv_core::capabilities::{BiasSupply, InstrumentState, IvSample};
use hv_core::transport::Transport;
use hv_core::{HvError, HvResult};
use std::time::Duration;
use tracing::instrument;

/// Measurement event register bit for reading overflow.
pub const OVERFLOW_BIT: u32 = 0x01;

const SOURCE_LIMIT: f64 = 1000.0;
const SETTLE_LONG: Duration = Duration::from_secs(1);

/// Driver for the Keithley 6517B voltage source.
#[derive(Debug)]
pub struct Keithley6517b {
    transport: Transport,
    state: InstrumentState,
}

impl Keithley6517b {
    /// Build the driver and bring the instrument up (cold) or attach to it (hot).
    pub async fn connect(transport: Transport, hot_start: bool) -> HvResult<Self> {
        let mut driver = Self::build(transport);
        if hot_start {
            driver.attach().await?;
        } else {
            driver.initialize().await?;
        }
        Ok(driver)
    }

    fn build(transport: Transport) -> Self {
        Self {
            transport,
            state: InstrumentState::new(1),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_transport(transport: Transport, max_voltage: f64) -> Self {
        let mut driver = Self::build(transport);
        driver.state.max_voltage = max_voltage;
        driver
    }

    /// Cold start: output off, reset, identify, set the reading format.
    pub async fn initialize(&mut self) -> HvResult<()> {
        tokio::time::sleep(SETTLE_LONG).await;
        self.set_output(false).await?;
        self.send("*RST").await?;
        self.clear_buffer().await?;
        self.identify().await?;
        self.send(":FORM:ELEM READ,VSO").await?;
        self.state.record_set_voltage(0, 0.0);
        tracing::info!(max_voltage = self.state.max_voltage, "Keithley 6517B initialized");
        Ok(())
    }

    /// Hot start: identify and learn the source level.
    pub async fn attach(&mut self) -> HvResult<()> {
        tokio::time::sleep(SETTLE_LONG).await;
        self.transport.clear_buffer().await?;
        self.identify().await?;
        let level = match self.read_source_level().await {
            Ok(level) => level,
            Err(_) if !self.transport.is_attached() => 0.0,
            Err(e) => {
                tracing::warn!(error = %e, "could not read back source level, seeding from the supply");
                self.seed_set_voltage(0).await?
            }
        };
        self.state.record_set_voltage(0, level);
        Ok(())
    }

    /// Drop stale input and the reading buffer.
    pub async fn clear_buffer(&mut self) -> HvResult<()> {
        self.transport.clear_buffer().await?;
        self.send(":TRAC:CLEAR").await
    }

    /// Programmed source level.
    pub async fn read_source_level(&mut self) -> HvResult<f64> {
        let reply = self.query(":SOUR:VOLT?").await?;
        let token = reply.split_whitespace().next().unwrap_or_default();
        scpi::number(token, &reply)
    }

    async fn send(&mut self, command: &str) -> HvResult<()> {
        self.transport.write(command).await
    }

    async fn query(&mut self, command: &str) -> HvResult<String> {
        let reply = self.transport.query(command, 1).await?;
        if reply.is_empty() {
            return Err(HvError::TransportTimeout {
                command: command.to_string(),
                timeout: self.transport.framing().read_timeout,
            });
        }
        Ok(reply)
    }

    /// Model name from a cleaned `*IDN?` reply.
    pub fn parse_model(identity: &str) -> Option<String> {
        let tokens: Vec<&str> = identity.split_whitespace().collect();
        if tokens.len() > 5 && tokens[3].to_lowercase().starts_with("model") {
            Some(tokens[4].to_string())
        } else {
            None
        }
    }

    /// Source limit for a model name.
    pub fn max_voltage_for(model: Option<&str>) -> f64 {
        if model == Some("6517B") {
            SOURCE_LIMIT
        } else {
            0.0
        }
    }

    /// `<current> <voltage>` from a `:READ?` reply.
    pub fn parse_reading(reply: &str) -> HvResult<IvSample> {
        let tokens: Vec<&str> = reply.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(HvError::Measurement(format!(
                "expected reading and source voltage, got '{reply}'"
            )));
        }
        let current = scpi::number(tokens[0], reply)?;
        let voltage = scpi::number(tokens[1], reply)?;
        Ok(IvSample::new(0, voltage, current))
    }
}

#[async_trait]
impl BiasSupply for Keithley6517b {
    fn family(&self) -> &'static str {
        "Keithley 6517B"
    }

    fn state(&self) -> &InstrumentState {
        &self.state
    }

    #[instrument(skip(self), err)]
    async fn identify(&mut self) -> HvResult<String> {
        let identity = self.transport.query("*IDN?", 1).await?;
        let model = Self::parse_model(&identity);

        self.state.max_voltage = Self::max_voltage_for(model.as_deref());
        self.state.identity = identity.clone();
        match &model {
            Some(m) => tracing::info!(model = %m, max_voltage = self.state.max_voltage, "connected Keithley"),
            None => tracing::warn!(identity = %identity, "unrecognised identity, voltage limited to 0 V"),
        }
        self.state.model = model;
        Ok(identity)
    }

    #[instrument(skip(self), err)]
    async fn get_output_status(&mut self) -> HvResult<bool> {
        let reply = self.query(":OUTP?").await?;
        let on = scpi::output_flag(&reply)
            .ok_or_else(|| HvError::Measurement(format!("invalid output status '{reply}'")))?;
        self.state.output = on;
        Ok(on)
    }

    #[instrument(skip(self), err)]
    async fn set_output(&mut self, on: bool) -> HvResult<()> {
        self.send(if on { ":OUTP ON" } else { ":OUTP OFF" }).await?;
        self.state.output = on;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn set_voltage(&mut self, channel: usize, value: f64) -> HvResult<f64> {
        if channel != 0 {
            return Err(HvError::InvalidChannel(channel));
        }
        let applied = self.state.clamp_voltage(value);
        self.send(&format!(":SOUR:VOLT {applied}")).await?;
        self.state.record_set_voltage(0, applied);
        Ok(applied)
    }

    #[instrument(skip(self), err)]
    async fn read_iv(&mut self) -> HvResult<Vec<IvSample>> {
        let reply = self.query(":READ?").await?;
        let mut sample = match Self::parse_reading(&reply) {
            Ok(sample) => sample,
            Err(e) => {
                self.transport.clear_buffer().await?;
                return Err(e);
            }
        };

        let status_reply = self.query(":STAT:MEAS?").await?;
        let word = scpi::status_word(
            status_reply.split_whitespace().next().unwrap_or_default(),
            &status_reply,
        )?;
        sample = sample.with_status(word);
        sample.tripped = self.detect_trip(word).await?;

        self.state.record_samples(&[sample]);
        Ok(vec![sample])
    }

    #[instrument(skip(self), err)]
    async fn set_manual(&mut self, manual: bool) -> HvResult<Vec<f64>> {
        if manual {
            self.send(":SYST:LOC").await?;
            return Ok(vec![self.state.set_voltage(0).unwrap_or_default()]);
        }
        self.send(":SYST:REM").await?;
        let level = self.read_source_level().await?;
        self.state.record_set_voltage(0, level);
        Ok(vec![level])
    }

    async fn detect_trip(&mut self, status_word: u32) -> HvResult<bool> {
        if status_word & OVERFLOW_BIT == 0 {
            return Ok(false);
        }
        tracing::warn!(status = status_word, "6517B reading overflow, clearing");
        self.send("*CLS").await?;
        self.clear_buffer().await?;
        tokio::time::sleep(SETTLE_LONG).await;
        Ok(true)
    }
}
