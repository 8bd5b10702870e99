//! Serial port plumbing shared by the transport and the drivers.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port with 8N1 framing on a blocking thread
//! - [`drain_serial_buffer`]: discard stale input until the line goes quiet, within a deadline
//!
//! Opening real hardware needs the `serial` feature (on by default).

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;

#[cfg(feature = "serial")]
use crate::error::{HvError, HvResult};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream` on real hardware, by
/// `tokio::io::DuplexStream` and by [`crate::mock_serial::MockSerialPort`] in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port using `spawn_blocking`, 8N1 with no flow control.
///
/// # Errors
///
/// Returns [`HvError::Connection`] if the port cannot be bound.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> HvResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let opened = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| HvError::Connection {
        address: port_path.to_string(),
        message: format!("spawn_blocking for {device_name} port failed: {e}"),
    })?;

    opened.map_err(|e| HvError::Connection {
        address: port_path.to_string(),
        message: format!("{device_name}: {e}"),
    })
}

/// Discard input until the line stays quiet for `quiet`, EOF, or `limit`
/// has passed in total.
///
/// Returns the number of bytes thrown away.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    quiet: Duration,
    limit: Duration,
) -> usize {
    let mut scratch = [0u8; 256];
    let mut dropped = 0usize;
    let deadline = Instant::now() + limit;

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            tracing::debug!(dropped, ?limit, "input still arriving, drain cut short");
            break;
        }
        let Ok(read) = tokio::time::timeout(quiet.min(left), port.read(&mut scratch)).await else {
            break;
        };
        match read {
            Ok(0) => break,
            Ok(n) => dropped += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(error = %e, "I/O error while draining serial input");
                break;
            }
        }
    }

    dropped
}
