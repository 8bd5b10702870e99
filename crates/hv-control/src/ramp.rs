//! Rate-limited ramp step.
//!
//! Each tick may move the bias by at most
//! `min(max_step, |ramp_speed| * elapsed)`, where `elapsed` is the time since
//! the last voltage change. The cap is measured from the last *measured*
//! bias, and the step never passes the target.

use std::time::Duration;

/// Bias difference below which a channel counts as "at target", in volts.
pub const TOLERANCE: f64 = 0.1;

/// Largest tolerated gap between programmed and measured bias, in volts.
pub const DESYNC_THRESHOLD: f64 = 1.0;

/// Ramp limits for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampLimits {
    /// V/s
    pub ramp_speed: f64,
    /// V per tick
    pub max_step: f64,
}

/// What a tick should do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampStep {
    /// Already within tolerance of the target; touch nothing.
    Hold,
    /// Program this bias.
    Move {
        /// New bias in volts.
        bias: f64,
        /// The move lands exactly on the target.
        reaches_target: bool,
    },
}

impl RampLimits {
    /// Largest move allowed after `elapsed`.
    pub fn step_cap(&self, elapsed: Duration) -> f64 {
        (self.ramp_speed * elapsed.as_secs_f64())
            .abs()
            .min(self.max_step)
    }

    /// Next move toward `target`.
    ///
    /// `set_voltage` is what the driver last programmed and decides whether
    /// any move is needed; `measured` is where the step starts from.
    pub fn next_step(&self, target: f64, measured: f64, set_voltage: f64, elapsed: Duration) -> RampStep {
        let delta = target - set_voltage;
        if delta.abs() <= TOLERANCE {
            return RampStep::Hold;
        }

        let cap = self.step_cap(elapsed);
        let bias = if delta.abs() <= cap {
            target
        } else {
            let candidate = measured + cap.copysign(delta);
            let overshoots = (delta > 0.0 && candidate > target) || (delta < 0.0 && candidate < target);
            if overshoots {
                target
            } else {
                candidate
            }
        };

        RampStep::Move {
            bias,
            reaches_target: bias == target,
        }
    }
}
