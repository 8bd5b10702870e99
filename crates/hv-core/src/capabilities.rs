//! Capability surface shared by every bias supply driver.
//!
//! A driver owns its transport and an [`InstrumentState`]. The controller
//! talks to it only through [`BiasSupply`]: it never writes driver state
//! directly and reads it back through [`BiasSupply::state`].

use crate::error::{HvError, HvResult};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::collections::VecDeque;

/// Samples kept per driver.
pub const HISTORY_CAPACITY: usize = 1000;

// =============================================================================
// Measurement types
// =============================================================================

/// One voltage/current reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IvSample {
    /// Output channel, starting at 0.
    pub channel: usize,
    /// Measured bias in volts.
    pub voltage: f64,
    /// Measured current in amperes.
    pub current: f64,
    /// Raw status word reported alongside the reading, if any.
    pub status: Option<u32>,
    /// Set when the status word flagged a compliance trip.
    pub tripped: bool,
    /// When the reading was parsed.
    pub timestamp: DateTime<Local>,
}

impl IvSample {
    /// Reading for `channel` stamped with the current time.
    pub fn new(channel: usize, voltage: f64, current: f64) -> Self {
        Self {
            channel,
            voltage,
            current,
            status: None,
            tripped: false,
            timestamp: Local::now(),
        }
    }

    /// Attach the instrument status word.
    pub fn with_status(mut self, status: u32) -> Self {
        self.status = Some(status);
        self
    }

    /// The trip this reading recovered from, as a recoverable error.
    pub fn trip(&self) -> Option<HvError> {
        self.tripped
            .then(|| HvError::ComplianceTrip(self.status.unwrap_or_default()))
    }
}

/// Bounded ring of recent samples, oldest first.
#[derive(Debug, Clone)]
pub struct MeasurementHistory {
    samples: VecDeque<IvSample>,
    capacity: usize,
}

impl MeasurementHistory {
    /// Empty history holding at most `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Append, evicting the oldest sample when full.
    pub fn push(&mut self, sample: IvSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Most recent sample for `channel`.
    pub fn latest(&self, channel: usize) -> Option<&IvSample> {
        self.samples.iter().rev().find(|s| s.channel == channel)
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &IvSample> {
        self.samples.iter()
    }
}

impl Default for MeasurementHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

// =============================================================================
// Instrument state
// =============================================================================

/// What a driver knows about its instrument.
#[derive(Debug, Clone)]
pub struct InstrumentState {
    /// Raw identity reply, cleaned.
    pub identity: String,
    /// Model parsed out of the identity, if recognised.
    pub model: Option<String>,
    /// Largest magnitude the driver will program, in volts.
    pub max_voltage: f64,
    /// Last output state seen or commanded.
    pub output: bool,
    set_voltage: Vec<f64>,
    history: MeasurementHistory,
}

impl InstrumentState {
    /// State for an instrument with `channels` outputs.
    pub fn new(channels: usize) -> Self {
        Self {
            identity: String::new(),
            model: None,
            max_voltage: 0.0,
            output: false,
            set_voltage: vec![0.0; channels.max(1)],
            history: MeasurementHistory::default(),
        }
    }

    /// Number of output channels.
    pub fn channel_count(&self) -> usize {
        self.set_voltage.len()
    }

    /// Voltage last programmed on `channel`.
    pub fn set_voltage(&self, channel: usize) -> Option<f64> {
        self.set_voltage.get(channel).copied()
    }

    /// Record a programmed voltage.
    pub fn record_set_voltage(&mut self, channel: usize, value: f64) {
        if let Some(slot) = self.set_voltage.get_mut(channel) {
            *slot = value;
        }
    }

    /// Append samples to the history.
    pub fn record_samples(&mut self, samples: &[IvSample]) {
        for sample in samples {
            self.history.push(*sample);
        }
    }

    /// Recent samples.
    pub fn history(&self) -> &MeasurementHistory {
        &self.history
    }

    /// Latest (voltage, current) for `channel`.
    pub fn last_sample(&self, channel: usize) -> Option<&IvSample> {
        self.history.latest(channel)
    }

    /// Limit `value` to `max_voltage`, keeping its sign.
    ///
    /// Out-of-range requests are clamped rather than rejected, with a warning.
    pub fn clamp_voltage(&self, value: f64) -> f64 {
        if value.abs() > self.max_voltage {
            let clamped = self.max_voltage.copysign(value);
            tracing::warn!(
                requested = value,
                clamped,
                model = self.model.as_deref().unwrap_or("unknown"),
                "requested voltage exceeds instrument limit, clamping"
            );
            clamped
        } else {
            value
        }
    }
}

// =============================================================================
// BiasSupply - uniform control surface
// =============================================================================

/// Operations every supply family provides.
///
/// All methods run a complete command/response exchange before returning.
/// Callers serialise access; a driver is never used by two tasks at once.
#[async_trait]
pub trait BiasSupply: Send {
    /// Human readable family name, e.g. "Keithley 24xx".
    fn family(&self) -> &'static str;

    /// Driver-owned state.
    fn state(&self) -> &InstrumentState;

    /// Number of output channels.
    fn channel_count(&self) -> usize {
        self.state().channel_count()
    }

    /// Voltage the driver last programmed on `channel`.
    fn set_voltage_readback(&self, channel: usize) -> Option<f64> {
        self.state().set_voltage(channel)
    }

    /// Query the identity, resolve the model and its limits.
    async fn identify(&mut self) -> HvResult<String>;

    /// Whether the output relay is on.
    async fn get_output_status(&mut self) -> HvResult<bool>;

    /// Switch the output relay.
    async fn set_output(&mut self, on: bool) -> HvResult<()>;

    /// Program a source voltage; returns the value actually applied after clamping.
    async fn set_voltage(&mut self, channel: usize, value: f64) -> HvResult<f64>;

    /// Take one reading per channel.
    async fn read_iv(&mut self) -> HvResult<Vec<IvSample>>;

    /// Enter or leave front-panel control; returns the applied voltage per channel.
    async fn set_manual(&mut self, manual: bool) -> HvResult<Vec<f64>>;

    /// Test a status word for a compliance trip, recovering the instrument if set.
    async fn detect_trip(&mut self, status_word: u32) -> HvResult<bool>;

    /// Establish the programmed level of `channel` without querying it.
    ///
    /// With the output on the measured bias is taken as the level. With the
    /// output off 0 V is programmed, which the open relay keeps from the load.
    async fn seed_set_voltage(&mut self, channel: usize) -> HvResult<f64> {
        if !self.get_output_status().await? {
            return self.set_voltage(channel, 0.0).await;
        }
        self.read_iv()
            .await?
            .iter()
            .find(|sample| sample.channel == channel)
            .map(|sample| sample.voltage)
            .ok_or_else(|| HvError::Measurement(format!("no reading on channel {channel}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tripped_reading_reports_recoverable_error() {
        let clean = IvSample::new(0, 100.0, 1e-9).with_status(0);
        assert!(clean.trip().is_none());

        let mut tripped = IvSample::new(0, 100.0, 1e-4).with_status(0x08);
        tripped.tripped = true;
        let err = tripped.trip().unwrap();
        assert!(matches!(err, HvError::ComplianceTrip(0x08)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn history_is_bounded() {
        let mut history = MeasurementHistory::with_capacity(3);
        for i in 0..5 {
            history.push(IvSample::new(0, i as f64, 0.0));
        }
        assert_eq!(history.len(), 3);
        let voltages: Vec<f64> = history.iter().map(|s| s.voltage).collect();
        assert_eq!(voltages, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn latest_is_per_channel() {
        let mut history = MeasurementHistory::default();
        history.push(IvSample::new(0, 1.0, 0.0));
        history.push(IvSample::new(1, 2.0, 0.0));
        history.push(IvSample::new(0, 3.0, 0.0));

        assert_eq!(history.latest(0).map(|s| s.voltage), Some(3.0));
        assert_eq!(history.latest(1).map(|s| s.voltage), Some(2.0));
        assert!(history.latest(2).is_none());
    }

    #[test]
    fn clamp_preserves_sign() {
        let mut state = InstrumentState::new(1);
        state.max_voltage = 200.0;

        assert_eq!(state.clamp_voltage(150.0), 150.0);
        assert_eq!(state.clamp_voltage(-250.0), -200.0);
        assert_eq!(state.clamp_voltage(1e4), 200.0);
    }

    #[test]
    fn unknown_model_clamps_to_zero() {
        let state = InstrumentState::new(1);
        assert_eq!(state.clamp_voltage(-5.0), -0.0);
    }
}
