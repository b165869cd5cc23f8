//! Serial Port Abstractions
//!
//! Shared types and utilities for async serial communication.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking (`serial` feature)
//! - [`read_now`]: Non-blocking read of whatever is already buffered
//! - [`drain_pending`]: Collect stale data until the line goes quiet
//!
//! # Example
//!
//! ```rust,ignore
//! use link_core::serial::{open_serial_async, drain_pending};
//! use std::time::Duration;
//!
//! let mut port = open_serial_async("/dev/ttyUSB0", 115_200, "APT stage").await?;
//! let stale = drain_pending(&mut port, Duration::from_millis(5)).await?;
//! ```

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`MockSerialPort`](crate::mock_serial::MockSerialPort)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Port initialization can block, so it runs off the async runtime. Standard
/// settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Read whatever bytes are already available, without waiting.
///
/// The read future is polled exactly once. No data, `WouldBlock`, and EOF all
/// yield an empty vector; genuine I/O errors are returned.
pub async fn read_now<R: AsyncRead + Unpin>(port: &mut R, max: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max.max(1)];
    match tokio::time::timeout(Duration::ZERO, port.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(buf)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Vec::new()),
    }
}

/// Collect stale data from a serial port buffer.
///
/// Reads until no new byte has arrived for `quiet`. A zero `quiet` window
/// still takes everything already buffered. The discarded bytes are returned
/// so a caller can inspect them (e.g. for unsolicited notifications).
pub async fn drain_pending<R: AsyncRead + Unpin>(
    port: &mut R,
    quiet: Duration,
) -> std::io::Result<Vec<u8>> {
    let mut discard = [0u8; 256];
    let mut drained = Vec::new();

    loop {
        match tokio::time::timeout(quiet, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => drained.extend_from_slice(&discard[..n]),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(e)) => return Err(e),
            Err(_) => break, // quiet for the whole window
        }
    }

    Ok(drained)
}
