//! Simulated bias supply.
//!
//! Slews instantly to the programmed voltage and draws an ohmic leakage
//! current. Every hardware call is recorded so tests can check what reached
//! the "wire".
//!
//! # Example
//!
//! ```rust,ignore
//! use hv_driver_mock::SimulatedSupply;
//!
//! let (supply, handle) = SimulatedSupply::builder()
//!     .max_voltage(1000.0)
//!     .initial_state(150.0, true)   // already biased, for hot-start tests
//!     .build();
//!
//! // ... hand `supply` to a controller ...
//! assert_eq!(handle.set_voltage_calls(0).len(), 0);
//! ```

use async_trait::async_trait;
use hv_core::capabilities::{BiasSupply, InstrumentState, IvSample};
use hv_core::{HvError, HvResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Status bit the simulation raises for an injected trip.
pub const SIM_TRIP_BIT: u32 = 0x100;

/// A call that reached the simulated hardware.
#[derive(Debug, Clone, PartialEq)]
pub enum SupplyCall {
    /// `identify`
    Identify,
    /// `get_output_status`
    GetOutputStatus,
    /// `set_output`
    SetOutput(bool),
    /// `set_voltage`
    SetVoltage {
        /// Channel index.
        channel: usize,
        /// Value after clamping.
        value: f64,
    },
    /// `read_iv`
    ReadIv,
    /// `set_manual`
    SetManual(bool),
    /// Trip recovery ran.
    ClearTrip,
}

#[derive(Debug)]
struct SimState {
    output: bool,
    applied: Vec<f64>,
    frozen: Vec<Option<f64>>,
    leakage_ohms: f64,
    latency: Duration,
    trip_pending: bool,
    fail_reads: usize,
    calls: Vec<SupplyCall>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Builder for [`SimulatedSupply`].
#[derive(Debug, Clone)]
pub struct SimulatedSupplyBuilder {
    channels: usize,
    max_voltage: f64,
    initial_voltage: f64,
    initial_output: bool,
    leakage_ohms: f64,
}

impl Default for SimulatedSupplyBuilder {
    fn default() -> Self {
        Self {
            channels: 1,
            max_voltage: 1000.0,
            initial_voltage: 0.0,
            initial_output: false,
            leakage_ohms: 1e9,
        }
    }
}

impl SimulatedSupplyBuilder {
    /// Number of output channels.
    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Clamp limit.
    pub fn max_voltage(mut self, volts: f64) -> Self {
        self.max_voltage = volts;
        self
    }

    /// Voltage and output state the "hardware" is already in.
    pub fn initial_state(mut self, volts: f64, output: bool) -> Self {
        self.initial_voltage = volts;
        self.initial_output = output;
        self
    }

    /// Load resistance used to derive the current.
    pub fn leakage_ohms(mut self, ohms: f64) -> Self {
        self.leakage_ohms = ohms;
        self
    }

    /// Create the supply and its test handle.
    pub fn build(self) -> (SimulatedSupply, SimulatedHandle) {
        let shared = Arc::new(Mutex::new(SimState {
            output: self.initial_output,
            applied: vec![self.initial_voltage; self.channels],
            frozen: vec![None; self.channels],
            leakage_ohms: self.leakage_ohms,
            latency: Duration::ZERO,
            trip_pending: false,
            fail_reads: 0,
            calls: Vec::new(),
            in_flight: 0,
            peak_in_flight: 0,
        }));

        let mut state = InstrumentState::new(self.channels);
        state.identity = "SIMULATED BIAS SUPPLY".to_string();
        state.model = Some("sim".to_string());
        state.max_voltage = self.max_voltage;
        state.output = self.initial_output;
        for channel in 0..self.channels {
            state.record_set_voltage(channel, self.initial_voltage);
        }

        (
            SimulatedSupply {
                shared: shared.clone(),
                state,
            },
            SimulatedHandle { shared },
        )
    }
}

/// In-memory bias supply.
#[derive(Debug)]
pub struct SimulatedSupply {
    shared: Arc<Mutex<SimState>>,
    state: InstrumentState,
}

impl SimulatedSupply {
    /// Start building a supply.
    pub fn builder() -> SimulatedSupplyBuilder {
        SimulatedSupplyBuilder::default()
    }

    /// Idle single-channel supply with a 1 kV limit.
    pub fn new() -> (Self, SimulatedHandle) {
        Self::builder().build()
    }

    async fn begin(&self, call: SupplyCall) {
        let latency = {
            let mut sim = self.shared.lock();
            sim.calls.push(call);
            sim.in_flight += 1;
            sim.peak_in_flight = sim.peak_in_flight.max(sim.in_flight);
            sim.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn end(&self) {
        let mut sim = self.shared.lock();
        sim.in_flight = sim.in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl BiasSupply for SimulatedSupply {
    fn family(&self) -> &'static str {
        "Simulated"
    }

    fn state(&self) -> &InstrumentState {
        &self.state
    }

    async fn identify(&mut self) -> HvResult<String> {
        self.begin(SupplyCall::Identify).await;
        self.end();
        Ok(self.state.identity.clone())
    }

    async fn get_output_status(&mut self) -> HvResult<bool> {
        self.begin(SupplyCall::GetOutputStatus).await;
        let on = self.shared.lock().output;
        self.state.output = on;
        self.end();
        Ok(on)
    }

    async fn set_output(&mut self, on: bool) -> HvResult<()> {
        self.begin(SupplyCall::SetOutput(on)).await;
        self.shared.lock().output = on;
        self.state.output = on;
        self.end();
        Ok(())
    }

    async fn set_voltage(&mut self, channel: usize, value: f64) -> HvResult<f64> {
        if channel >= self.state.channel_count() {
            return Err(HvError::InvalidChannel(channel));
        }
        let applied = self.state.clamp_voltage(value);
        self.begin(SupplyCall::SetVoltage {
            channel,
            value: applied,
        })
        .await;
        self.shared.lock().applied[channel] = applied;
        self.state.record_set_voltage(channel, applied);
        self.end();
        Ok(applied)
    }

    async fn read_iv(&mut self) -> HvResult<Vec<IvSample>> {
        self.begin(SupplyCall::ReadIv).await;
        let (samples, trip) = {
            let mut sim = self.shared.lock();
            if sim.fail_reads > 0 {
                sim.fail_reads -= 1;
                drop(sim);
                self.end();
                return Err(HvError::Measurement("simulated garbled reply".into()));
            }
            let trip = std::mem::take(&mut sim.trip_pending);
            let samples: Vec<IvSample> = (0..sim.applied.len())
                .map(|channel| {
                    let voltage = match (sim.output, sim.frozen[channel]) {
                        (_, Some(stuck)) => stuck,
                        (true, None) => sim.applied[channel],
                        (false, None) => 0.0,
                    };
                    let status = if trip { SIM_TRIP_BIT } else { 0 };
                    IvSample::new(channel, voltage, voltage / sim.leakage_ohms).with_status(status)
                })
                .collect();
            (samples, trip)
        };
        self.end();

        let mut samples = samples;
        if trip {
            for sample in &mut samples {
                sample.tripped = self.detect_trip(SIM_TRIP_BIT).await?;
            }
        }
        self.state.record_samples(&samples);
        Ok(samples)
    }

    async fn set_manual(&mut self, manual: bool) -> HvResult<Vec<f64>> {
        self.begin(SupplyCall::SetManual(manual)).await;
        let applied = self.shared.lock().applied.clone();
        if !manual {
            for (channel, value) in applied.iter().enumerate() {
                self.state.record_set_voltage(channel, *value);
            }
        }
        self.end();
        Ok(applied)
    }

    async fn detect_trip(&mut self, status_word: u32) -> HvResult<bool> {
        if status_word & SIM_TRIP_BIT == 0 {
            return Ok(false);
        }
        self.begin(SupplyCall::ClearTrip).await;
        tracing::warn!(status = status_word, "simulated compliance trip cleared");
        self.end();
        Ok(true)
    }
}

/// Test-side view of a [`SimulatedSupply`].
#[derive(Debug, Clone)]
pub struct SimulatedHandle {
    shared: Arc<Mutex<SimState>>,
}

impl SimulatedHandle {
    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<SupplyCall> {
        self.shared.lock().calls.clone()
    }

    /// Values passed to `set_voltage` on `channel`, in order.
    pub fn set_voltage_calls(&self, channel: usize) -> Vec<f64> {
        self.shared
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SupplyCall::SetVoltage { channel: c, value } if *c == channel => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// How often `set_output(on)` was called.
    pub fn set_output_calls(&self, on: bool) -> usize {
        self.shared
            .lock()
            .calls
            .iter()
            .filter(|call| **call == SupplyCall::SetOutput(on))
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.shared.lock().calls.clear();
    }

    /// Largest number of calls ever in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.shared.lock().peak_in_flight
    }

    /// Make every call take `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.lock().latency = latency;
    }

    /// Pin the measured voltage of `channel`, or release it with `None`.
    pub fn freeze_measurement(&self, channel: usize, value: Option<f64>) {
        if let Some(slot) = self.shared.lock().frozen.get_mut(channel) {
            *slot = value;
        }
    }

    /// Change the output voltage behind the driver's back (front panel).
    pub fn turn_knob(&self, channel: usize, volts: f64) {
        if let Some(slot) = self.shared.lock().applied.get_mut(channel) {
            *slot = volts;
        }
    }

    /// Switch the output relay from the front panel.
    pub fn press_output(&self, on: bool) {
        self.shared.lock().output = on;
    }

    /// Flag a trip in the next reading.
    pub fn inject_trip(&self) {
        self.shared.lock().trip_pending = true;
    }

    /// Make the next `count` readings fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.shared.lock().fail_reads = count;
    }

    /// Voltage at the terminals of `channel`.
    pub fn applied(&self, channel: usize) -> f64 {
        self.shared.lock().applied.get(channel).copied().unwrap_or_default()
    }

    /// Output relay state.
    pub fn output(&self) -> bool {
        self.shared.lock().output
    }
}
