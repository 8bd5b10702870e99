//! Keithley bias supply drivers for hv-bias.
//!
//! This crate provides [`hv_core::BiasSupply`] implementations for:
//! - Keithley 2400 / 2410 SourceMeter (RS-232)
//! - Keithley 6517B Electrometer voltage source (RS-232)
//!
//! Each driver owns a [`hv_core::Transport`]. Build one with `connect`, which
//! runs the cold or hot start sequence:
//!
//! ```rust,ignore
//! use hv_driver_keithley::{Keithley24xx, Keithley24xxOptions};
//!
//! let transport = Transport::connect("HV1", "/dev/ttyUSB0", 57600, framing, true).await?;
//! let supply = Keithley24xx::connect(transport, Keithley24xxOptions::default(), false).await?;
//! ```

pub mod keithley_24xx;
pub mod keithley_6517b;
pub mod scpi;

pub use keithley_24xx::{Keithley24xx, Keithley24xxOptions};
pub use keithley_6517b::Keithley6517b;
