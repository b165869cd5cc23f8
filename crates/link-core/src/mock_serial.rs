//! Mock serial port for exercising protocol code without hardware.
//!
//! `MockSerialPort` implements `AsyncRead` and `AsyncWrite` and is handed to
//! the code under test. The paired `MockDeviceHarness` stays in the test and
//! plays the instrument: it asserts on what the host wrote and pushes reply
//! bytes back, including unsolicited ones.
//!
//! # Architecture
//!
//! A pair of unbounded channels simulates the wire:
//! - `MockSerialPort` (given to the transport): implements AsyncRead/AsyncWrite
//! - `MockDeviceHarness` (kept in test): scripts device behavior
//!
//! # Example
//!
//! ```rust,ignore
//! use link_core::{mock_serial, SharedTransport};
//!
//! let (port, mut harness) = mock_serial::new();
//! let transport = SharedTransport::serial("mock", port, Duration::ZERO);
//!
//! tokio::spawn(async move {
//!     harness.expect_and_respond(b"/1 1 get pos\n", b"@01 1 OK IDLE -- 0\r\n").await;
//! });
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The client-facing side of the mock serial port.
#[derive(Debug)]
pub struct MockSerialPort {
    /// Channel to send written data to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Data received from the harness but not yet read by the client
    read_buffer: VecDeque<u8>,
}

/// The test-facing side for controlling the mock serial port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    /// Channel to receive data written by the client
    writes_rx: UnboundedReceiver<Vec<u8>>,
    /// Channel to send data to the client for it to read
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Data received from the client but not yet asserted by the test
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

// =============================================================================
// MockSerialPort Implementations
// =============================================================================

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
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

// =============================================================================
// MockDeviceHarness Implementations
// =============================================================================

/// How long harness expectations wait before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

impl MockDeviceHarness {
    /// Push bytes to the client as if the device had sent them.
    ///
    /// # Errors
    /// Returns error if the client port has been dropped
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Wait for the client to write `expected`, asserting the bytes match.
    ///
    /// Writes are buffered until enough bytes have arrived; any excess is kept
    /// for the next expectation.
    ///
    /// # Panics
    /// Panics if the data does not arrive within 2 seconds or does not match.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => {
                    panic!(
                        "Timeout waiting for write. Expected {:02X?}, but only received {:02X?}.",
                        expected, self.write_buffer
                    );
                }
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual, expected,
            "Mismatch in expected write. Expected {:02X?}, got {:02X?}.",
            expected, actual
        );

        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write and sends a response in one operation.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response)
            .expect("Failed to send response");
    }

    /// Next chunk written by the client, or `None` once the client is gone.
    ///
    /// Buffered data left over from `expect_write` is returned first. Waits
    /// without a deadline, for scripted device loops running in their own task.
    pub async fn recv_write(&mut self) -> Option<Vec<u8>> {
        if !self.write_buffer.is_empty() {
            return Some(std::mem::take(&mut self.write_buffer));
        }
        self.writes_rx.recv().await
    }

    /// Assert the client wrote nothing for `window`.
    ///
    /// # Panics
    /// Panics if any bytes were written.
    pub async fn expect_silence(&mut self, window: Duration) {
        assert!(
            self.write_buffer.is_empty(),
            "Unconsumed write: {:02X?}",
            self.write_buffer
        );
        if let Ok(Some(chunk)) = tokio::time::timeout(window, self.writes_rx.recv()).await {
            panic!("Expected no writes, got {:02X?}", chunk);
        }
    }

    /// Drains any pending writes without asserting their content.
    pub async fn drain_writes(&mut self) {
        let short_timeout = Duration::from_millis(50);
        while let Ok(Some(chunk)) = tokio::time::timeout(short_timeout, self.writes_rx.recv()).await
        {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }
}
