//! Semantic event log emitted by device controllers.
//!
//! Events are broadcast in the order they occur. The sink decides where they
//! go; the controller only signals when the calendar day changes so the sink
//! can rotate its output.

use chrono::{DateTime, Local, NaiveDate};
use std::fmt;
use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One line of the device log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogEvent {
    /// Output switched on.
    DeviceOn,
    /// Output switched off.
    DeviceOff,
    /// Operator changed the target bias.
    SetBiasTo(f64),
    /// A ramp started from this bias.
    StartRampingAt(f64),
    /// Bias the ramp is heading for.
    TargetBias(f64),
    /// A ramp ended at this bias.
    FinishRampingAt(f64),
    /// Periodic reading while the output is on.
    Measurement {
        /// Volts.
        voltage: f64,
        /// Amperes.
        current: f64,
    },
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::DeviceOn => write!(f, "DEVICE_ON"),
            LogEvent::DeviceOff => write!(f, "DEVICE_OFF"),
            LogEvent::SetBiasTo(v) => write!(f, "SET_BIAS_TO {v:7.1}"),
            LogEvent::StartRampingAt(v) => write!(f, "START_RAMPING_AT {v:7.1}"),
            LogEvent::TargetBias(v) => write!(f, "TARGET_BIAS {v:7.1}"),
            LogEvent::FinishRampingAt(v) => write!(f, "FINISH_RAMPING_AT {v:7.1}"),
            LogEvent::Measurement { voltage, current } => {
                write!(f, "{voltage:10.3e} {current:10.3e}")
            }
        }
    }
}

/// A [`LogEvent`] tagged with its origin and time.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Device id from the configuration.
    pub device: String,
    /// Display name at the time of the event.
    pub name: String,
    /// Channel index.
    pub channel: usize,
    /// When it happened.
    pub timestamp: DateTime<Local>,
    /// What happened.
    pub event: LogEvent,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}/{} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.device,
            self.name,
            self.channel,
            self.event
        )
    }
}

/// Everything a controller publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Append to the device log.
    Log(LogRecord),
    /// The calendar day rolled over; the sink should rotate.
    DayChanged {
        /// Device id.
        device: String,
        /// The new day.
        date: NaiveDate,
    },
    /// The display name changed; the sink should start a new log.
    Renamed {
        /// Device id.
        device: String,
        /// New display name.
        name: String,
    },
    /// The poll loop stopped on a fatal error.
    Halted {
        /// Device id.
        device: String,
        /// Error text.
        reason: String,
    },
}

impl DeviceEvent {
    /// Id of the device that produced the event.
    pub fn device(&self) -> &str {
        match self {
            DeviceEvent::Log(record) => &record.device,
            DeviceEvent::DayChanged { device, .. }
            | DeviceEvent::Renamed { device, .. }
            | DeviceEvent::Halted { device, .. } => device,
        }
    }

    /// The log record, if this is one.
    pub fn as_log(&self) -> Option<&LogRecord> {
        match self {
            DeviceEvent::Log(record) => Some(record),
            _ => None,
        }
    }
}

/// Sending half of the event stream.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Create an event stream.
pub fn event_channel() -> (EventSender, broadcast::Receiver<DeviceEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_match_legacy_layout() {
        assert_eq!(LogEvent::DeviceOn.to_string(), "DEVICE_ON");
        assert_eq!(
            LogEvent::StartRampingAt(-12.345).to_string(),
            "START_RAMPING_AT   -12.3"
        );
        assert_eq!(
            LogEvent::FinishRampingAt(300.0).to_string(),
            "FINISH_RAMPING_AT   300.0"
        );
        let line = LogEvent::Measurement {
            voltage: 150.0,
            current: -1.5e-9,
        }
        .to_string();
        assert_eq!(line.split_whitespace().count(), 2);
        assert!(line.contains("1.500e2"));
    }

    #[test]
    fn device_accessor_covers_all_variants() {
        let halted = DeviceEvent::Halted {
            device: "HV3".into(),
            reason: "desync".into(),
        };
        assert_eq!(halted.device(), "HV3");
        assert!(halted.as_log().is_none());

        let record = LogRecord {
            device: "HV1".into(),
            name: "DUT".into(),
            channel: 0,
            timestamp: Local::now(),
            event: LogEvent::DeviceOff,
        };
        let event = DeviceEvent::Log(record.clone());
        assert_eq!(event.device(), "HV1");
        assert_eq!(event.as_log(), Some(&record));
        assert!(record.to_string().ends_with("HV1 DUT/0 DEVICE_OFF"));
    }
}
