//! Framed command/response transport over a serial line.
//!
//! Every command is an ASCII string followed by a CRLF terminator. Replies are
//! terminated the same way. The instruments need time to parse a command, so
//! each write is followed by a fixed settle delay and each query waits a
//! second, longer delay before reading.
//!
//! Reading is a single deadline-driven primitive ([`Transport::read_frame`])
//! that stops on the first of:
//!
//! 1. a terminator in the accumulated bytes,
//! 2. `min_length` bytes accumulated (when `min_length > 0`),
//! 3. the read timeout.
//!
//! Bytes that arrive after a terminator stay buffered for the next read.
//!
//! A transport may also be *detached*: no port is bound, writes succeed
//! without doing anything and reads come back empty. This lets control logic
//! run against a configuration with no hardware present.

use crate::error::{HvError, HvResult};
use crate::serial::{drain_serial_buffer, DynSerial};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Frame terminator for commands and replies.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Bytes removed from replies before parsing (CR, LF, NUL, XOFF, XON, DLE).
const STRIPPED: &[char] = &['\r', '\n', '\0', '\x13', '\x11', '\x10'];

/// Timing of the command/response handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct FramingConfig {
    /// Delay after every write.
    pub write_settle: Duration,
    /// Extra delay between a query's write and its read.
    pub read_settle: Duration,
    /// Interval between checks for new input.
    pub read_poll: Duration,
    /// Give up on a reply after this long.
    pub read_timeout: Duration,
    /// Quiet period that ends a drain in [`Transport::clear_buffer`].
    pub drain_timeout: Duration,
    /// Longest a single drain may take on a line that never goes quiet.
    pub drain_limit: Duration,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            write_settle: Duration::from_millis(100),
            read_settle: Duration::from_millis(200),
            read_poll: Duration::from_millis(200),
            read_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_millis(50),
            drain_limit: Duration::from_secs(1),
        }
    }
}

/// How a read ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes up to and including the first terminator.
    TerminatorFound(Vec<u8>),
    /// At least `min_length` bytes arrived before any terminator.
    MinLengthReached(Vec<u8>),
    /// Deadline elapsed; carries whatever partial bytes were seen.
    TimedOut(Vec<u8>),
}

impl ReadOutcome {
    /// True when the read hit its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReadOutcome::TimedOut(_))
    }
}

/// Serial command/response framer for one instrument.
pub struct Transport {
    name: String,
    address: String,
    port: Option<DynSerial>,
    pending: Vec<u8>,
    framing: FramingConfig,
    detached_warned: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("attached", &self.port.is_some())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Transport {
    /// Wrap an already opened port.
    pub fn from_port(name: impl Into<String>, port: DynSerial, framing: FramingConfig) -> Self {
        Self {
            name: name.into(),
            address: String::from("<stream>"),
            port: Some(port),
            pending: Vec::new(),
            framing,
            detached_warned: false,
        }
    }

    /// A transport with no port bound.
    pub fn detached(
        name: impl Into<String>,
        address: impl Into<String>,
        framing: FramingConfig,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: None,
            pending: Vec::new(),
            framing,
            detached_warned: false,
        }
    }

    /// Open the serial port at `address`.
    ///
    /// # Errors
    ///
    /// [`HvError::Connection`] if the port cannot be bound.
    pub async fn open(
        name: &str,
        address: &str,
        baud_rate: u32,
        framing: FramingConfig,
    ) -> HvResult<Self> {
        #[cfg(feature = "serial")]
        {
            let stream = crate::serial::open_serial_async(address, baud_rate, name).await?;
            let mut transport = Self::from_port(name, Box::new(stream), framing);
            transport.address = address.to_string();
            tracing::info!(port = %name, address, baud_rate, "serial port opened");
            Ok(transport)
        }
        #[cfg(not(feature = "serial"))]
        {
            let _ = (baud_rate, framing);
            Err(HvError::Connection {
                address: address.to_string(),
                message: format!("{name}: built without serial support"),
            })
        }
    }

    /// Open the port, falling back to a detached transport when allowed.
    pub async fn connect(
        name: &str,
        address: &str,
        baud_rate: u32,
        framing: FramingConfig,
        allow_detached: bool,
    ) -> HvResult<Self> {
        match Self::open(name, address, baud_rate, framing.clone()).await {
            Ok(transport) => Ok(transport),
            Err(e) if allow_detached => {
                tracing::warn!(
                    port = %name,
                    address,
                    error = %e,
                    "serial port unavailable, continuing detached"
                );
                Ok(Self::detached(name, address, framing))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a port is bound.
    pub fn is_attached(&self) -> bool {
        self.port.is_some()
    }

    /// Label used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handshake timing in use.
    pub fn framing(&self) -> &FramingConfig {
        &self.framing
    }

    fn warn_detached(&mut self) {
        if !self.detached_warned {
            tracing::warn!(
                port = %self.name,
                address = %self.address,
                "port is not open, commands are discarded"
            );
            self.detached_warned = true;
        }
    }

    /// Send `command` followed by the terminator, then settle.
    ///
    /// The whole frame is written even when the port accepts it piecewise.
    pub async fn write(&mut self, command: &str) -> HvResult<()> {
        if self.port.is_none() {
            self.warn_detached();
            return Ok(());
        }

        let mut frame = Vec::with_capacity(command.len() + TERMINATOR.len());
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(TERMINATOR);

        if let Some(port) = self.port.as_mut() {
            port.write_all(&frame).await?;
            port.flush().await?;
        }
        tracing::trace!(port = %self.name, cmd = %command, bytes = frame.len(), "frame sent");

        tokio::time::sleep(self.framing.write_settle).await;
        Ok(())
    }

    /// Accumulate input until a terminator, `min_length` bytes or the deadline.
    pub async fn read_frame(&mut self, min_length: usize) -> HvResult<ReadOutcome> {
        if self.port.is_none() {
            self.warn_detached();
            return Ok(ReadOutcome::TimedOut(Vec::new()));
        }

        let deadline = Instant::now() + self.framing.read_timeout;
        let mut chunk = [0u8; 256];

        loop {
            if let Some(pos) = find_terminator(&self.pending) {
                let frame: Vec<u8> = self.pending.drain(..pos + TERMINATOR.len()).collect();
                return Ok(ReadOutcome::TerminatorFound(frame));
            }
            if min_length > 0 && self.pending.len() >= min_length {
                return Ok(ReadOutcome::MinLengthReached(std::mem::take(
                    &mut self.pending,
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadOutcome::TimedOut(std::mem::take(&mut self.pending)));
            }
            let wait = self.framing.read_poll.min(deadline - now);

            let Some(port) = self.port.as_mut() else {
                return Ok(ReadOutcome::TimedOut(std::mem::take(&mut self.pending)));
            };
            match tokio::time::timeout(wait, port.read(&mut chunk)).await {
                Ok(Ok(0)) => tokio::time::sleep(wait).await,
                Ok(Ok(n)) => self.pending.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(wait).await
                }
                Ok(Err(e)) => return Err(HvError::Io(e)),
                Err(_) => {} // nothing arrived this poll interval
            }
        }
    }

    /// Read one reply; empty on timeout.
    pub async fn read(&mut self, min_length: usize) -> HvResult<Vec<u8>> {
        match self.read_frame(min_length).await? {
            ReadOutcome::TerminatorFound(bytes) | ReadOutcome::MinLengthReached(bytes) => Ok(bytes),
            ReadOutcome::TimedOut(partial) => {
                if self.is_attached() {
                    tracing::warn!(
                        port = %self.name,
                        timeout = ?self.framing.read_timeout,
                        partial = %String::from_utf8_lossy(&partial).escape_debug(),
                        "read timed out without terminator"
                    );
                }
                Ok(Vec::new())
            }
        }
    }

    /// Discard unread input, both buffered and on the wire.
    pub async fn clear_buffer(&mut self) -> HvResult<usize> {
        let mut discarded = std::mem::take(&mut self.pending).len();
        if let Some(port) = self.port.as_mut() {
            discarded +=
                drain_serial_buffer(port, self.framing.drain_timeout, self.framing.drain_limit).await;
        }
        if discarded > 0 {
            tracing::debug!(port = %self.name, discarded, "cleared stale input");
        }
        Ok(discarded)
    }

    /// Write `command`, wait, read the reply and clean it for parsing.
    pub async fn query(&mut self, command: &str, min_length: usize) -> HvResult<String> {
        self.write(command).await?;
        tokio::time::sleep(self.framing.read_settle).await;
        let raw = self.read(min_length).await?;
        let cleaned = clean_response(&raw);
        tracing::debug!(port = %self.name, cmd = %command, reply = %cleaned, "query");
        Ok(cleaned)
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

/// Strip control characters and turn comma delimiters into spaces.
pub fn clean_response(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !STRIPPED.contains(c))
        .map(|c| if c == ',' { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}
