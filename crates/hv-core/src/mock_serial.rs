//! Scripted serial port for driver tests.
//!
//! [`new`] returns a connected pair:
//! - [`MockSerialPort`] goes to the code under test as a [`crate::serial::DynSerial`],
//! - [`MockDeviceHarness`] stays in the test and plays the instrument.
//!
//! ```rust,ignore
//! let (port, mut instrument) = hv_core::mock_serial::new();
//! let mut transport = Transport::from_port("test", Box::new(port), FramingConfig::default());
//!
//! instrument.send_response(b"1\r\n")?;
//! assert_eq!(transport.query(":OUTP?", 1).await?, "1");
//! instrument.expect_write(b":OUTP?\r\n").await;
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long the harness waits for the client to write.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Client side: implements `AsyncRead + AsyncWrite`.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Test side: asserts on writes and feeds replies.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();

    (
        MockSerialPort {
            writes_tx,
            reads_rx,
            read_buffer: VecDeque::new(),
        },
        MockDeviceHarness {
            writes_rx,
            reads_tx,
            write_buffer: Vec::new(),
        },
    )
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Harness dropped: end of file.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.fill(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock instrument disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the client to read.
    ///
    /// # Errors
    /// Fails once the client port has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "client port disconnected")
    }

    /// Wait for the client to write exactly `expected` next.
    ///
    /// # Panics
    /// On mismatch, or when nothing arrives within two seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("client port closed while expecting {:?}", lossy(expected)),
                Err(_) => panic!(
                    "timed out waiting for {:?}, got {:?}",
                    lossy(expected),
                    lossy(&self.write_buffer)
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "expected write {:?}, got {:?}",
            lossy(expected),
            lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Wait for `expected`, then reply with `response`.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{e}");
        }
    }

    /// Everything written so far, split into terminated frames.
    pub fn written_frames(&mut self) -> Vec<String> {
        while let Ok(chunk) = self.writes_rx.try_recv() {
            self.write_buffer.extend_from_slice(&chunk);
        }
        let text = lossy(&self.write_buffer);
        self.write_buffer.clear();
        text.split_terminator("\r\n").map(str::to_string).collect()
    }

    /// Discard pending writes without checking them.
    pub async fn drain_writes(&mut self) {
        let quiet = Duration::from_millis(50);
        while let Ok(Some(_)) = tokio::time::timeout(quiet, self.writes_rx.recv()).await {}
        self.write_buffer.clear();
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
