//! Keithley 2400 / 2410 SourceMeter driver
//!
//! Reference: Keithley Series 2400 SourceMeter User's Manual
//!
//! Protocol Overview:
//! - Format: SCPI over RS-232, CRLF terminated both ways
//! - Identity: `*IDN?` -> `KEITHLEY INSTRUMENTS INC.,MODEL 2410,<serial>,<firmware>`
//! - Readings: `:READ?` with `:FORM:ELEM VOLT,CURR,RES,TIME,STAT`, five values per sample
//! - Status word bit 3 (0x08) is set while the output is in compliance
//!
//! Limits by model:
//! - 2400: ±200 V
//! - 2410: ±1100 V
//! - anything else: 0 V (every request clamps to zero)

use crate::scpi;
use async_trait::async_trait;
use hv_core::capabilities::{BiasSupply, InstrumentState, IvSample};
use hv_core::transport::Transport;
use hv_core::{HvError, HvResult};
use std::time::Duration;
use tracing::instrument;

/// Status word bit flagging compliance (current protection).
pub const COMPLIANCE_BIT: u32 = 0x08;

/// Values per sample in the standard output form.
const VALUES_PER_READING: usize = 5;

/// `:READ?` replies are never shorter than this.
const READ_MIN_LENGTH: usize = 20;

/// Pause around reset and after a trip.
const SETTLE_LONG: Duration = Duration::from_secs(1);

/// `:OUTP?` re-queries before giving up on a non-numeric reply.
const STATUS_RETRIES: usize = 5;

/// Setup applied on a cold start.
#[derive(Debug, Clone, PartialEq)]
pub struct Keithley24xxOptions {
    /// Current protection level in amperes.
    pub compliance: f64,
    /// Route the output to the rear terminals.
    pub rear_output: bool,
}

impl Default for Keithley24xxOptions {
    fn default() -> Self {
        Self {
            compliance: 100e-6,
            rear_output: false,
        }
    }
}

/// Driver for the Keithley 2400-series SourceMeters.
#[derive(Debug)]
pub struct Keithley24xx {
    transport: Transport,
    state: InstrumentState,
    options: Keithley24xxOptions,
}

impl Keithley24xx {
    /// Build the driver and bring the instrument up.
    ///
    /// A cold start resets and configures the instrument with its output
    /// off. A hot start only identifies it and learns the programmed source
    /// level, leaving the output untouched.
    pub async fn connect(
        transport: Transport,
        options: Keithley24xxOptions,
        hot_start: bool,
    ) -> HvResult<Self> {
        let mut driver = Self::build(transport, options);
        if hot_start {
            driver.attach().await?;
        } else {
            driver.initialize().await?;
        }
        Ok(driver)
    }

    fn build(transport: Transport, options: Keithley24xxOptions) -> Self {
        Self {
            transport,
            state: InstrumentState::new(1),
            options,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_transport(transport: Transport, max_voltage: f64) -> Self {
        let mut driver = Self::build(transport, Keithley24xxOptions::default());
        driver.state.max_voltage = max_voltage;
        driver
    }

    /// Cold start: reset and configure for bias operation.
    pub async fn initialize(&mut self) -> HvResult<()> {
        tokio::time::sleep(SETTLE_LONG).await;
        self.set_output(false).await?;
        self.reset().await?;
        self.clear_buffer().await?;
        self.identify().await?;
        self.select_terminals(self.options.rear_output).await?;
        self.send(":SOUR:VOLT:MODE FIX").await?;
        self.send(":FORM:ELEM VOLT,CURR,RES,TIME,STAT").await?;
        self.set_concurrent_measurements().await?;
        self.set_average_filter(3).await?;
        self.send(&format!(":CURR:PROT:LEV {:e}", self.options.compliance))
            .await?;
        self.send(":SENS:CURR:NPLC 5").await?;
        self.clear_error_queue().await?;
        self.send(":SOURCE:SWEEP:CABort LATE").await?;
        tokio::time::sleep(SETTLE_LONG).await;

        self.state.record_set_voltage(0, 0.0);
        tracing::info!(
            model = self.state.model.as_deref().unwrap_or("unknown"),
            compliance = self.options.compliance,
            rear = self.options.rear_output,
            "Keithley 24xx initialized"
        );
        Ok(())
    }

    /// Hot start: identify and learn the applied source level, output untouched.
    pub async fn attach(&mut self) -> HvResult<()> {
        tokio::time::sleep(SETTLE_LONG).await;
        self.clear_buffer().await?;
        self.identify().await?;
        self.clear_error_queue().await?;

        let level = match self.read_source_level().await {
            Ok(level) => level,
            Err(_) if !self.transport.is_attached() => 0.0,
            Err(e) => {
                tracing::warn!(error = %e, "could not read back source level, seeding from the supply");
                self.seed_set_voltage(0).await?
            }
        };
        self.state.record_set_voltage(0, level);
        tokio::time::sleep(SETTLE_LONG).await;
        tracing::info!(
            set_voltage = self.state.set_voltage(0).unwrap_or_default(),
            "Keithley 24xx attached"
        );
        Ok(())
    }

    /// `*RST`
    pub async fn reset(&mut self) -> HvResult<()> {
        self.send("*RST").await
    }

    /// `*CLS`
    pub async fn clear_error_queue(&mut self) -> HvResult<()> {
        self.send("*CLS").await
    }

    /// Drop stale input and the instrument's reading buffer.
    pub async fn clear_buffer(&mut self) -> HvResult<()> {
        self.transport.clear_buffer().await?;
        self.send(":TRAC:CLEAR").await
    }

    /// Front or rear output terminals.
    pub async fn select_terminals(&mut self, rear: bool) -> HvResult<()> {
        self.send(if rear { ":ROUT:TERM REAR" } else { ":ROUT:TERM FRONT" })
            .await
    }

    /// Sense voltage and current together.
    pub async fn set_concurrent_measurements(&mut self) -> HvResult<()> {
        self.send(":FUNC:CONC ON").await?;
        self.send(":SENS:FUNC 'VOLT:DC'").await?;
        self.send(":SENS:FUNC 'CURR:DC'").await
    }

    /// Repeating average over `count` readings.
    pub async fn set_average_filter(&mut self, count: u32) -> HvResult<()> {
        self.send(":SENS:AVER:TCON REP").await?;
        self.send(":SENS:AVER:STAT ON").await?;
        self.send(&format!(":SENS:AVER:COUN {count}")).await
    }

    /// Programmed source level (`:SOUR:VOLT?`).
    pub async fn read_source_level(&mut self) -> HvResult<f64> {
        let reply = self.query(":SOUR:VOLT?", 1).await?;
        let token = reply.split_whitespace().next().unwrap_or_default();
        scpi::number(token, &reply)
    }

    async fn send(&mut self, command: &str) -> HvResult<()> {
        self.transport.write(command).await
    }

    async fn query(&mut self, command: &str, min_length: usize) -> HvResult<String> {
        let reply = self.transport.query(command, min_length).await?;
        if reply.is_empty() {
            return Err(HvError::TransportTimeout {
                command: command.to_string(),
                timeout: self.transport.framing().read_timeout,
            });
        }
        Ok(reply)
    }

    /// Model number from a cleaned `*IDN?` reply.
    pub fn parse_model(identity: &str) -> Option<u32> {
        let tokens: Vec<&str> = identity.split_whitespace().collect();
        if tokens.len() > 5 {
            tokens[4].parse().ok()
        } else {
            None
        }
    }

    /// Voltage limit for a model number.
    pub fn max_voltage_for(model: Option<u32>) -> f64 {
        match model {
            Some(2400) => 200.0,
            Some(2410) => 1100.0,
            _ => 0.0,
        }
    }

    /// Split a `:READ?` reply into samples.
    pub fn parse_readings(reply: &str) -> HvResult<Vec<IvSample>> {
        let tokens: Vec<&str> = reply.split_whitespace().collect();
        if tokens.is_empty() || tokens.len() % VALUES_PER_READING != 0 {
            return Err(HvError::Measurement(format!(
                "expected groups of {VALUES_PER_READING} values, got {} in '{reply}'",
                tokens.len()
            )));
        }

        tokens
            .chunks(VALUES_PER_READING)
            .map(|group| {
                let voltage = scpi::number(group[0], reply)?;
                let current = scpi::number(group[1], reply)?;
                let status = scpi::status_word(group[4], reply)?;
                Ok(IvSample::new(0, voltage, current).with_status(status))
            })
            .collect()
    }

    fn check_channel(channel: usize) -> HvResult<()> {
        if channel == 0 {
            Ok(())
        } else {
            Err(HvError::InvalidChannel(channel))
        }
    }
}

#[async_trait]
impl BiasSupply for Keithley24xx {
    fn family(&self) -> &'static str {
        "Keithley 24xx"
    }

    fn state(&self) -> &InstrumentState {
        &self.state
    }

    #[instrument(skip(self), err)]
    async fn identify(&mut self) -> HvResult<String> {
        let identity = self.transport.query("*IDN?", 1).await?;
        let model = Self::parse_model(&identity);

        self.state.max_voltage = Self::max_voltage_for(model);
        self.state.model = model.map(|m| m.to_string());
        self.state.identity = identity.clone();

        match model {
            Some(m) => tracing::info!(model = m, max_voltage = self.state.max_voltage, "connected Keithley"),
            None => tracing::warn!(identity = %identity, "unrecognised identity, voltage limited to 0 V"),
        }
        Ok(identity)
    }

    #[instrument(skip(self), err)]
    async fn get_output_status(&mut self) -> HvResult<bool> {
        let mut reply = self.query(":OUTP?", 1).await?;
        for _ in 1..STATUS_RETRIES {
            if let Some(on) = scpi::output_flag(&reply) {
                self.state.output = on;
                return Ok(on);
            }
            tracing::debug!(reply = %reply, "non-numeric output status, asking again");
            reply = self.query(":OUTP?", 1).await?;
        }
        scpi::output_flag(&reply)
            .inspect(|on| self.state.output = *on)
            .ok_or_else(|| HvError::Measurement(format!("invalid output status '{reply}'")))
    }

    #[instrument(skip(self), err)]
    async fn set_output(&mut self, on: bool) -> HvResult<()> {
        self.send(if on { ":OUTP ON" } else { ":OUTP OFF" }).await?;
        self.state.output = on;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn set_voltage(&mut self, channel: usize, value: f64) -> HvResult<f64> {
        Self::check_channel(channel)?;
        let applied = self.state.clamp_voltage(value);
        self.send(&format!(":SOUR:VOLT {applied}")).await?;
        self.state.record_set_voltage(channel, applied);
        Ok(applied)
    }

    #[instrument(skip(self), err)]
    async fn read_iv(&mut self) -> HvResult<Vec<IvSample>> {
        let reply = self.query(":READ?", READ_MIN_LENGTH).await?;
        let mut samples = match Self::parse_readings(&reply) {
            Ok(samples) => samples,
            Err(e) => {
                // A torn reply leaves the rest of the frame on the wire.
                self.transport.clear_buffer().await?;
                return Err(e);
            }
        };

        for sample in &mut samples {
            if let Some(word) = sample.status {
                sample.tripped = self.detect_trip(word).await?;
            }
        }
        self.state.record_samples(&samples);
        Ok(samples)
    }

    #[instrument(skip(self), err)]
    async fn set_manual(&mut self, manual: bool) -> HvResult<Vec<f64>> {
        if manual {
            self.send(":SYST:LOCAL").await?;
            return Ok(vec![self.state.set_voltage(0).unwrap_or_default()]);
        }

        self.send(":SYST:REM").await?;
        let level = self.read_source_level().await?;
        self.state.record_set_voltage(0, level);
        Ok(vec![level])
    }

    async fn detect_trip(&mut self, status_word: u32) -> HvResult<bool> {
        if status_word & COMPLIANCE_BIT == 0 {
            return Ok(false);
        }
        tracing::warn!(status = status_word, "Keithley in compliance, clearing");
        self.clear_error_queue().await?;
        self.clear_buffer().await?;
        tokio::time::sleep(SETTLE_LONG).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_core::mock_serial::{self, MockDeviceHarness};
    use hv_core::transport::FramingConfig;

    const IDN_2410: &[u8] =
        b"KEITHLEY INSTRUMENTS INC.,MODEL 2410,1234567,C30   Mar 17 2006 09:29:29/A02  /K/J\r\n";

    fn driver(max_voltage: f64) -> (Keithley24xx, MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let transport = Transport::from_port("k24xx", Box::new(port), FramingConfig::default());
        (Keithley24xx::with_test_transport(transport, max_voltage), harness)
    }

    #[test]
    fn model_limits() {
        let identity = hv_core::transport::clean_response(IDN_2410);
        assert_eq!(Keithley24xx::parse_model(&identity), Some(2410));
        assert_eq!(Keithley24xx::max_voltage_for(Some(2410)), 1100.0);
        assert_eq!(Keithley24xx::max_voltage_for(Some(2400)), 200.0);
        assert_eq!(Keithley24xx::max_voltage_for(Some(2450)), 0.0);
        assert_eq!(Keithley24xx::parse_model("KEITHLEY MODEL"), None);
    }

    #[test]
    fn readings_come_in_groups_of_five() {
        let reply = "-1.000000E+02 -1.234000E-09 +9.910000E+37 +1.234567E+03 +3.841000E+04";
        let samples = Keithley24xx::parse_readings(reply).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].voltage, -100.0);
        assert_eq!(samples[0].current, -1.234e-9);
        assert_eq!(samples[0].status, Some(38410));

        assert!(Keithley24xx::parse_readings("-1.0E+02 -1.2E-09").is_err());
        assert!(Keithley24xx::parse_readings("").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn identify_sets_limit() {
        let (mut k, mut harness) = driver(0.0);
        harness.send_response(IDN_2410).unwrap();

        k.identify().await.unwrap();
        harness.expect_write(b"*IDN?\r\n").await;

        assert_eq!(k.state().model.as_deref(), Some("2410"));
        assert_eq!(k.state().max_voltage, 1100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_voltage_clamps_with_sign() {
        let (mut k, mut harness) = driver(200.0);

        assert_eq!(k.set_voltage(0, -350.0).await.unwrap(), -200.0);
        harness.expect_write(b":SOUR:VOLT -200\r\n").await;
        assert_eq!(k.set_voltage_readback(0), Some(-200.0));

        assert_eq!(k.set_voltage(0, 12.5).await.unwrap(), 12.5);
        harness.expect_write(b":SOUR:VOLT 12.5\r\n").await;

        assert!(matches!(
            k.set_voltage(1, 1.0).await,
            Err(HvError::InvalidChannel(1))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn output_status_requeries_garbage() {
        let (mut k, mut harness) = driver(1100.0);
        harness.send_response(b"?X\r\n").unwrap();
        harness.send_response(b"1\r\n").unwrap();

        assert!(k.get_output_status().await.unwrap());
        assert_eq!(harness.written_frames(), vec![":OUTP?", ":OUTP?"]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_iv_detects_compliance() {
        let (mut k, mut harness) = driver(1100.0);
        harness
            .send_response(b"-1.000000E+02,-1.000000E-04,+9.910000E+37,+1.0E+03,+8.000000E+00\r\n")
            .unwrap();

        let samples = k.read_iv().await.unwrap();
        assert!(samples[0].tripped);
        assert_eq!(
            harness.written_frames(),
            vec![":READ?", "*CLS", ":TRAC:CLEAR"]
        );
        assert_eq!(k.state().history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_iv_timeout_is_recoverable() {
        let (port, _harness) = mock_serial::new();
        let framing = FramingConfig {
            read_timeout: Duration::from_secs(1),
            ..FramingConfig::default()
        };
        let mut k = Keithley24xx::with_test_transport(
            Transport::from_port("k24xx", Box::new(port), framing),
            1100.0,
        );

        let err = k.read_iv().await.unwrap_err();
        assert!(matches!(err, HvError::TransportTimeout { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_manual_reads_back_level() {
        let (mut k, mut harness) = driver(1100.0);
        harness.send_response(b"+1.500000E+02\r\n").unwrap();

        assert_eq!(k.set_manual(false).await.unwrap(), vec![150.0]);
        assert_eq!(harness.written_frames(), vec![":SYST:REM", ":SOUR:VOLT?"]);
        assert_eq!(k.set_voltage_readback(0), Some(150.0));

        assert_eq!(k.set_manual(true).await.unwrap(), vec![150.0]);
        assert_eq!(harness.written_frames(), vec![":SYST:LOCAL"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_sequence() {
        let (port, mut harness) = mock_serial::new();
        let transport = Transport::from_port("k24xx", Box::new(port), FramingConfig::default());
        let options = Keithley24xxOptions {
            compliance: 1e-5,
            rear_output: true,
        };

        let task = tokio::spawn(Keithley24xx::connect(transport, options, false));

        harness.expect_write(b":OUTP OFF\r\n").await;
        harness.expect_write(b"*RST\r\n").await;
        harness.expect_write(b":TRAC:CLEAR\r\n").await;
        harness.expect_and_respond(b"*IDN?\r\n", IDN_2410).await;

        let k = task.await.unwrap().unwrap();
        assert_eq!(
            harness.written_frames(),
            vec![
                ":ROUT:TERM REAR",
                ":SOUR:VOLT:MODE FIX",
                ":FORM:ELEM VOLT,CURR,RES,TIME,STAT",
                ":FUNC:CONC ON",
                ":SENS:FUNC 'VOLT:DC'",
                ":SENS:FUNC 'CURR:DC'",
                ":SENS:AVER:TCON REP",
                ":SENS:AVER:STAT ON",
                ":SENS:AVER:COUN 3",
                ":CURR:PROT:LEV 1e-5",
                ":SENS:CURR:NPLC 5",
                "*CLS",
                ":SOURCE:SWEEP:CABort LATE",
            ]
        );
        assert_eq!(k.state().max_voltage, 1100.0);
        assert!(!k.state().output);
    }

    #[tokio::test(start_paused = true)]
    async fn hot_start_never_touches_output() {
        let (port, mut harness) = mock_serial::new();
        let transport = Transport::from_port("k24xx", Box::new(port), FramingConfig::default());

        let task = tokio::spawn(Keithley24xx::connect(
            transport,
            Keithley24xxOptions::default(),
            true,
        ));

        harness.expect_write(b":TRAC:CLEAR\r\n").await;
        harness.expect_and_respond(b"*IDN?\r\n", IDN_2410).await;
        harness.expect_write(b"*CLS\r\n").await;
        harness
            .expect_and_respond(b":SOUR:VOLT?\r\n", b"+1.500000E+02\r\n")
            .await;

        let k = task.await.unwrap().unwrap();
        assert_eq!(k.set_voltage_readback(0), Some(150.0));
        let rest = harness.written_frames();
        assert!(rest.iter().all(|f| !f.starts_with(":OUTP") && !f.starts_with(":SOUR:VOLT ")));
    }

    #[tokio::test(start_paused = true)]
    async fn hot_start_without_level_reply_seeds_from_reading() {
        let (port, mut harness) = mock_serial::new();
        let framing = FramingConfig {
            read_timeout: Duration::from_secs(1),
            ..FramingConfig::default()
        };
        let transport = Transport::from_port("k24xx", Box::new(port), framing);

        let task = tokio::spawn(Keithley24xx::connect(
            transport,
            Keithley24xxOptions::default(),
            true,
        ));

        harness.expect_write(b":TRAC:CLEAR\r\n").await;
        harness.expect_and_respond(b"*IDN?\r\n", IDN_2410).await;
        harness.expect_write(b"*CLS\r\n").await;
        harness.expect_write(b":SOUR:VOLT?\r\n").await;
        harness.expect_and_respond(b":OUTP?\r\n", b"1\r\n").await;
        harness
            .expect_and_respond(
                b":READ?\r\n",
                b"+1.500000E+02,+2.000000E-09,+9.910000E+37,+1.0E+03,+0.000000E+00\r\n",
            )
            .await;

        let k = task.await.unwrap().unwrap();
        assert_eq!(k.set_voltage_readback(0), Some(150.0));
        assert!(harness.written_frames().iter().all(|f| !f.starts_with(":OUTP ")));
    }

    #[tokio::test(start_paused = true)]
    async fn hot_start_with_output_off_reprograms_zero() {
        let (port, mut harness) = mock_serial::new();
        let framing = FramingConfig {
            read_timeout: Duration::from_secs(1),
            ..FramingConfig::default()
        };
        let transport = Transport::from_port("k24xx", Box::new(port), framing);

        let task = tokio::spawn(Keithley24xx::connect(
            transport,
            Keithley24xxOptions::default(),
            true,
        ));

        harness.expect_write(b":TRAC:CLEAR\r\n").await;
        harness.expect_and_respond(b"*IDN?\r\n", IDN_2410).await;
        harness.expect_write(b"*CLS\r\n").await;
        harness.expect_write(b":SOUR:VOLT?\r\n").await;
        harness.expect_and_respond(b":OUTP?\r\n", b"0\r\n").await;
        harness.expect_write(b":SOUR:VOLT 0\r\n").await;

        let k = task.await.unwrap().unwrap();
        assert_eq!(k.set_voltage_readback(0), Some(0.0));
    }
}
