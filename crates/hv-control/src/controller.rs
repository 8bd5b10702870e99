//! Per-device bias controller.
//!
//! A [`DeviceController`] owns one supply and runs its poll loop. Every
//! hardware exchange, from the loop or from an operator command, happens
//! under the device's busy lock. Waiting for that lock is bounded; a command
//! that cannot get it in time is abandoned with [`HvError::LockTimeout`].
//!
//! Per channel the controller moves through
//!
//! ```text
//! OFF --output on--> ON_STABLE <--target reached-- RAMPING
//!                        |  ^                         ^
//!                        |  +--------target moved-----+
//!                        +--power_down--> POWERING_DOWN --|V| < 0.1--> OFF
//! ```
//!
//! A ramp tick first checks that the programmed and measured bias agree. If
//! they stay more than 1 V apart after the configured number of re-polls the
//! tick fails with [`HvError::Desync`], which halts this device's loop and
//! leaves every other device running.

use crate::ramp::{RampLimits, RampStep, DESYNC_THRESHOLD, TOLERANCE};
use crate::registry;
use chrono::{DateTime, Local, NaiveDate};
use hv_core::config::{DeviceConfig, TimingConfig};
use hv_core::events::{DeviceEvent, EventSender, LogEvent, LogRecord};
use hv_core::{BiasSupply, HvError, HvResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Loop and lock timing for one controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    /// Poll loop period.
    pub tick: Duration,
    /// Ceiling on waiting for the busy lock.
    pub lock_timeout: Duration,
    /// Pause between desync re-polls.
    pub desync_pause: Duration,
    /// Re-polls before a desync is fatal.
    pub desync_retries: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for ControllerOptions {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            tick: timing.tick(),
            lock_timeout: timing.lock_timeout(),
            desync_pause: timing.desync_pause(),
            desync_retries: timing.desync_retries,
        }
    }
}

/// Where a channel is in its ramp lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Output disabled.
    Off,
    /// Output on, measured bias within tolerance of the target.
    OnStable,
    /// Output on, moving toward the target.
    Ramping,
    /// Heading to 0 V; the output switches off once there.
    PoweringDown,
}

/// Snapshot of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Channel index.
    pub index: usize,
    /// Where the ramp is heading.
    pub target_bias: f64,
    /// Last measured bias.
    pub measured_bias: f64,
    /// Last measured current.
    pub measured_current: f64,
    /// When the last valid reading arrived.
    pub last_update: Option<DateTime<Local>>,
    /// Output state from the last status poll.
    pub output: bool,
    /// Output on and measured bias away from the target.
    pub ramping: bool,
    /// A power-down is in progress.
    pub powering_down: bool,
    last_change: Instant,
    logged_output: bool,
    logged_ramping: bool,
}

impl Channel {
    fn new(index: usize, target_bias: f64) -> Self {
        Self {
            index,
            target_bias,
            measured_bias: 0.0,
            measured_current: 0.0,
            last_update: None,
            output: false,
            ramping: false,
            powering_down: false,
            last_change: Instant::now(),
            logged_output: false,
            logged_ramping: false,
        }
    }

    /// Lifecycle state derived from the flags.
    pub fn state(&self) -> ChannelState {
        if !self.output {
            ChannelState::Off
        } else if self.powering_down {
            ChannelState::PoweringDown
        } else if self.ramping {
            ChannelState::Ramping
        } else {
            ChannelState::OnStable
        }
    }

    fn update_ramping(&mut self) {
        self.ramping = self.output && (self.measured_bias - self.target_bias).abs() > TOLERANCE;
    }
}

struct Inner {
    id: String,
    config: DeviceConfig,
    options: ControllerOptions,
    name: RwLock<String>,
    supply: Mutex<Box<dyn BiasSupply>>,
    channels: RwLock<Vec<Channel>>,
    manual: AtomicBool,
    killed: AtomicBool,
    events: EventSender,
}

/// Handle to one device's controller. Clones share the same device.
#[derive(Clone)]
pub struct DeviceController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("id", &self.inner.id)
            .field("name", &*self.inner.name.read())
            .field("manual", &self.is_manual())
            .finish_non_exhaustive()
    }
}

impl DeviceController {
    /// Validate `config`, build its driver and attach a controller.
    ///
    /// # Errors
    ///
    /// Any fatal construction error: [`HvError::Config`],
    /// [`HvError::UnsupportedModel`] or [`HvError::Connection`].
    pub async fn connect(
        config: DeviceConfig,
        timing: &TimingConfig,
        events: EventSender,
    ) -> HvResult<Self> {
        config.validate()?;
        let supply = registry::build_supply(&config, timing).await?;
        Self::new(config, supply, ControllerOptions::from(timing), events).await
    }

    /// Attach a controller to an already-built supply.
    ///
    /// With `hot_start` set the current output and bias are read back and
    /// adopted as the target, so no voltage command is sent.
    ///
    /// # Errors
    ///
    /// [`HvError::Config`] if `config` is invalid.
    pub async fn new(
        config: DeviceConfig,
        supply: Box<dyn BiasSupply>,
        options: ControllerOptions,
        events: EventSender,
    ) -> HvResult<Self> {
        config.validate()?;
        let channels = (0..supply.channel_count())
            .map(|index| Channel::new(index, config.target_bias))
            .collect();

        let controller = Self {
            inner: Arc::new(Inner {
                id: config.id.clone(),
                name: RwLock::new(config.name.clone()),
                config,
                options,
                supply: Mutex::new(supply),
                channels: RwLock::new(channels),
                manual: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                events,
            }),
        };

        if controller.inner.config.hot_start {
            controller.adopt_running_state().await?;
        }
        info!(
            device = %controller.inner.id,
            name = %controller.name(),
            channels = controller.channel_count(),
            "controller ready"
        );
        Ok(controller)
    }

    async fn adopt_running_state(&self) -> HvResult<()> {
        let mut supply = self.acquire("hot_start").await?;
        self.refresh(&mut **supply).await;

        let mut channels = self.inner.channels.write();
        for channel in channels.iter_mut() {
            channel.target_bias = channel.measured_bias;
            channel.logged_output = channel.output;
            channel.update_ramping();
            if !self.inner.config.bias_allowed(channel.target_bias) {
                warn!(
                    device = %self.inner.id,
                    channel = channel.index,
                    bias = channel.target_bias,
                    min = self.inner.config.min_bias,
                    max = self.inner.config.max_bias,
                    "hot start bias lies outside the configured window"
                );
            }
            info!(
                device = %self.inner.id,
                channel = channel.index,
                output = channel.output,
                bias = channel.target_bias,
                "hot start adopted running bias"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Busy lock
    // =========================================================================

    async fn acquire(&self, operation: &str) -> HvResult<MutexGuard<'_, Box<dyn BiasSupply>>> {
        let timeout = self.inner.options.lock_timeout;
        match tokio::time::timeout(timeout, self.inner.supply.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(
                    device = %self.inner.id,
                    operation,
                    ?timeout,
                    "device busy, command abandoned"
                );
                Err(HvError::LockTimeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Set the bias a channel should ramp to.
    ///
    /// # Errors
    ///
    /// - [`HvError::InvalidChannel`]
    /// - [`HvError::BiasOutOfRange`] when outside `[min_bias, max_bias]`
    /// - [`HvError::LockTimeout`]
    #[instrument(skip(self), fields(device = %self.inner.id), err)]
    pub async fn set_target_bias(&self, channel: usize, value: f64) -> HvResult<()> {
        self.check_channel(channel)?;
        let config = &self.inner.config;
        if !value.is_finite() || !config.bias_allowed(value) {
            return Err(HvError::BiasOutOfRange {
                value,
                min: config.min_bias,
                max: config.max_bias,
            });
        }

        let _busy = self.acquire("set_target_bias").await?;
        {
            let mut channels = self.inner.channels.write();
            let state = &mut channels[channel];
            state.target_bias = value;
            state.last_change = Instant::now();
            state.powering_down = false;
            state.update_ramping();
        }
        self.emit_log(channel, LogEvent::SetBiasTo(value));
        Ok(())
    }

    /// Switch the output on or off.
    ///
    /// # Errors
    ///
    /// [`HvError::LockTimeout`] or the driver's error.
    #[instrument(skip(self), fields(device = %self.inner.id), err)]
    pub async fn set_output(&self, on: bool) -> HvResult<()> {
        let mut supply = self.acquire("set_output").await?;
        supply.set_output(on).await?;

        let now = Instant::now();
        for channel in self.inner.channels.write().iter_mut() {
            channel.output = on;
            channel.last_change = now;
            if !on {
                channel.powering_down = false;
            }
            channel.update_ramping();
        }
        Ok(())
    }

    /// Hand the front panel to the operator, or take it back.
    ///
    /// While manual the poll loop issues no commands. Each channel's target
    /// becomes the voltage the supply reports, so leaving manual mode does
    /// not move the bias. Returns those voltages.
    ///
    /// # Errors
    ///
    /// [`HvError::LockTimeout`] or the driver's error.
    #[instrument(skip(self), fields(device = %self.inner.id), err)]
    pub async fn set_manual(&self, manual: bool) -> HvResult<Vec<f64>> {
        let mut supply = self.acquire("set_manual").await?;
        let applied = supply.set_manual(manual).await?;

        {
            let mut channels = self.inner.channels.write();
            let now = Instant::now();
            for (channel, value) in channels.iter_mut().zip(&applied) {
                if !self.inner.config.bias_allowed(*value) {
                    warn!(
                        device = %self.inner.id,
                        channel = channel.index,
                        bias = value,
                        "panel voltage lies outside the configured window"
                    );
                }
                channel.target_bias = *value;
                channel.last_change = now;
                channel.update_ramping();
            }
        }
        self.inner.manual.store(manual, Ordering::SeqCst);
        info!(device = %self.inner.id, manual, "manual mode changed");
        Ok(applied)
    }

    /// Ramp every channel to 0 V, then switch the output off.
    ///
    /// Channels whose output is already off are left alone.
    ///
    /// # Errors
    ///
    /// [`HvError::LockTimeout`]
    #[instrument(skip(self), fields(device = %self.inner.id), err)]
    pub async fn power_down(&self) -> HvResult<()> {
        let _busy = self.acquire("power_down").await?;
        let indices: Vec<usize> = {
            let mut channels = self.inner.channels.write();
            let now = Instant::now();
            channels
                .iter_mut()
                .map(|channel| {
                    channel.target_bias = 0.0;
                    channel.last_change = now;
                    channel.powering_down = channel.output;
                    channel.update_ramping();
                    channel.index
                })
                .collect()
        };
        for channel in indices {
            self.emit_log(channel, LogEvent::SetBiasTo(0.0));
        }
        info!(device = %self.inner.id, "powering down");
        Ok(())
    }

    /// Change the display name; subscribers get [`DeviceEvent::Renamed`].
    pub fn rename(&self, name: impl Into<String>) {
        let name = name.into();
        *self.inner.name.write() = name.clone();
        info!(device = %self.inner.id, %name, "renamed");
        self.emit(DeviceEvent::Renamed {
            device: self.inner.id.clone(),
            name,
        });
    }

    /// Ask the poll loop to exit at its next tick. Outputs are untouched.
    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Device id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    /// Configuration the controller was built from.
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().len()
    }

    /// Snapshot of one channel.
    ///
    /// # Errors
    ///
    /// [`HvError::InvalidChannel`]
    pub fn channel(&self, channel: usize) -> HvResult<Channel> {
        self.inner
            .channels
            .read()
            .get(channel)
            .cloned()
            .ok_or(HvError::InvalidChannel(channel))
    }

    /// Last measured bias.
    pub fn bias(&self, channel: usize) -> HvResult<f64> {
        self.channel(channel).map(|c| c.measured_bias)
    }

    /// Last measured current.
    pub fn current(&self, channel: usize) -> HvResult<f64> {
        self.channel(channel).map(|c| c.measured_current)
    }

    /// Output state from the last poll.
    pub fn status(&self, channel: usize) -> HvResult<bool> {
        self.channel(channel).map(|c| c.output)
    }

    /// Whether the channel is moving toward its target.
    pub fn is_ramping(&self, channel: usize) -> HvResult<bool> {
        self.channel(channel).map(|c| c.ramping)
    }

    /// Where the channel is heading.
    pub fn target_bias(&self, channel: usize) -> HvResult<f64> {
        self.channel(channel).map(|c| c.target_bias)
    }

    /// When the last valid reading arrived.
    pub fn last_update(&self, channel: usize) -> HvResult<Option<DateTime<Local>>> {
        self.channel(channel).map(|c| c.last_update)
    }

    /// Lifecycle state.
    pub fn state(&self, channel: usize) -> HvResult<ChannelState> {
        self.channel(channel).map(|c| c.state())
    }

    /// Whether the front panel has control.
    pub fn is_manual(&self) -> bool {
        self.inner.manual.load(Ordering::SeqCst)
    }

    /// Whether [`kill`](Self::kill) was called.
    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Poll loop
    // =========================================================================

    /// Run the poll loop on its own task.
    pub fn spawn(&self) -> JoinHandle<HvResult<()>> {
        tokio::spawn(self.clone().run())
    }

    /// Poll until killed or a fatal error.
    ///
    /// Recoverable errors are logged and the loop carries on. A fatal error
    /// publishes [`DeviceEvent::Halted`] and is returned.
    pub async fn run(self) -> HvResult<()> {
        let mut today = Local::now().date_naive();
        info!(device = %self.inner.id, tick = ?self.inner.options.tick, "poll loop started");

        while !self.is_killed() {
            today = self.check_day(today, Local::now().date_naive());
            tokio::time::sleep(self.inner.options.tick).await;
            if self.is_manual() || self.is_killed() {
                continue;
            }

            match self.poll_once().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(device = %self.inner.id, error = %e, "poll loop halted");
                    self.emit(DeviceEvent::Halted {
                        device: self.inner.id.clone(),
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) => warn!(device = %self.inner.id, error = %e, "poll cycle failed"),
            }
        }

        info!(device = %self.inner.id, "poll loop stopped");
        Ok(())
    }

    /// Publish [`DeviceEvent::DayChanged`] when `now` is past `today`.
    fn check_day(&self, today: NaiveDate, now: NaiveDate) -> NaiveDate {
        if now != today {
            self.emit(DeviceEvent::DayChanged {
                device: self.inner.id.clone(),
                date: now,
            });
        }
        now
    }

    /// One loop cycle: poll, log, ramp, and re-poll if anything moved.
    ///
    /// # Errors
    ///
    /// [`HvError::LockTimeout`], [`HvError::Desync`] or a driver error from
    /// a voltage or output command.
    pub async fn poll_once(&self) -> HvResult<()> {
        let mut guard = self.acquire("poll").await?;
        let supply: &mut dyn BiasSupply = &mut **guard;

        self.refresh(supply).await;
        self.write_log();

        let mut moved = false;
        for channel in 0..self.channel_count() {
            moved |= self.ramp_tick(supply, channel).await?;
        }
        self.finish_power_down(supply).await?;

        if moved {
            self.refresh(supply).await;
        }
        Ok(())
    }

    /// Read output status and, when on, a fresh IV sample.
    ///
    /// Failures are logged and the previous values kept.
    async fn refresh(&self, supply: &mut dyn BiasSupply) {
        let output = match supply.get_output_status().await {
            Ok(on) => on,
            Err(e) => {
                warn!(device = %self.inner.id, error = %e, "could not read output status");
                return;
            }
        };

        let samples = if output {
            match supply.read_iv().await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(device = %self.inner.id, error = %e, "could not read a valid IV sample");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let now = Local::now();
        let mut channels = self.inner.channels.write();
        for channel in channels.iter_mut() {
            channel.output = output;
            if !output && channel.powering_down {
                info!(
                    device = %self.inner.id,
                    channel = channel.index,
                    "output found off, power-down dropped"
                );
                channel.powering_down = false;
            }
        }
        for sample in &samples {
            let Some(channel) = channels.get_mut(sample.channel) else {
                continue;
            };
            channel.measured_bias = sample.voltage;
            channel.measured_current = sample.current;
            channel.last_update = Some(now);
            if let Some(trip) = sample.trip() {
                warn!(
                    device = %self.inner.id,
                    channel = sample.channel,
                    error = %trip,
                    "compliance trip recovered"
                );
            }
        }
        for channel in channels.iter_mut() {
            channel.update_ramping();
        }
    }

    fn write_log(&self) {
        let mut lines = Vec::new();
        {
            let mut channels = self.inner.channels.write();
            for ch in channels.iter_mut() {
                if ch.logged_output != ch.output {
                    let event = if ch.output {
                        LogEvent::DeviceOn
                    } else {
                        LogEvent::DeviceOff
                    };
                    lines.push((ch.index, event));
                    ch.logged_output = ch.output;
                }

                let ramp_edge = ch.logged_ramping != ch.ramping;
                if ramp_edge && ch.output && ch.ramping {
                    lines.push((ch.index, LogEvent::StartRampingAt(ch.measured_bias)));
                    lines.push((ch.index, LogEvent::TargetBias(ch.target_bias)));
                }
                if ch.output {
                    lines.push((
                        ch.index,
                        LogEvent::Measurement {
                            voltage: ch.measured_bias,
                            current: ch.measured_current,
                        },
                    ));
                }
                if ramp_edge && ch.output && !ch.ramping {
                    lines.push((ch.index, LogEvent::FinishRampingAt(ch.measured_bias)));
                }
                ch.logged_ramping = ch.ramping;
            }
        }

        for (channel, event) in lines {
            self.emit_log(channel, event);
        }
    }

    /// One rate-limited step toward the target. Returns whether a voltage
    /// command was sent.
    async fn ramp_tick(&self, supply: &mut dyn BiasSupply, channel: usize) -> HvResult<bool> {
        let options = &self.inner.options;

        let mut attempts = 0;
        loop {
            let snapshot = self.channel(channel)?;
            if !snapshot.output {
                return Ok(false);
            }
            let set_voltage = supply.set_voltage_readback(channel).unwrap_or_default();
            if (set_voltage - snapshot.measured_bias).abs() <= DESYNC_THRESHOLD {
                break;
            }
            if attempts >= options.desync_retries {
                return Err(HvError::Desync {
                    channel,
                    set_voltage,
                    measured: snapshot.measured_bias,
                    attempts,
                });
            }
            attempts += 1;
            warn!(
                device = %self.inner.id,
                channel,
                set_voltage,
                measured = snapshot.measured_bias,
                attempt = attempts,
                "measured bias disagrees with set voltage, re-polling"
            );
            tokio::time::sleep(options.desync_pause).await;
            self.refresh(supply).await;
        }

        let snapshot = self.channel(channel)?;
        let limits = RampLimits {
            ramp_speed: self.inner.config.ramp_speed,
            max_step: self.inner.config.max_step,
        };
        let set_voltage = supply.set_voltage_readback(channel).unwrap_or_default();
        let step = limits.next_step(
            snapshot.target_bias,
            snapshot.measured_bias,
            set_voltage,
            snapshot.last_change.elapsed(),
        );

        let RampStep::Move {
            bias,
            reaches_target,
        } = step
        else {
            return Ok(false);
        };

        let applied = supply.set_voltage(channel, bias).await?;
        if let Some(state) = self.inner.channels.write().get_mut(channel) {
            state.last_change = Instant::now();
        }
        debug!(device = %self.inner.id, channel, requested = bias, applied, "ramp step");
        if reaches_target && !snapshot.powering_down {
            info!(device = %self.inner.id, channel, bias, "done ramping");
        }
        Ok(true)
    }

    /// Switch the output off once every powering-down channel sits at 0 V.
    async fn finish_power_down(&self, supply: &mut dyn BiasSupply) -> HvResult<()> {
        let ready = {
            let channels = self.inner.channels.read();
            let pending: Vec<&Channel> = channels.iter().filter(|c| c.powering_down).collect();
            !pending.is_empty()
                && pending
                    .iter()
                    .all(|c| c.output && c.measured_bias.abs() < TOLERANCE)
        };
        if !ready {
            return Ok(());
        }

        supply.set_output(false).await?;
        for channel in self.inner.channels.write().iter_mut() {
            channel.output = false;
            channel.powering_down = false;
            channel.update_ramping();
        }
        info!(device = %self.inner.id, "ramped down and turned off");
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn check_channel(&self, channel: usize) -> HvResult<()> {
        if channel < self.channel_count() {
            Ok(())
        } else {
            Err(HvError::InvalidChannel(channel))
        }
    }

    fn emit_log(&self, channel: usize, event: LogEvent) {
        let record = LogRecord {
            device: self.inner.id.clone(),
            name: self.name(),
            channel,
            timestamp: Local::now(),
            event,
        };
        debug!(target: "hv_control::log", "{record}");
        self.emit(DeviceEvent::Log(record));
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}
