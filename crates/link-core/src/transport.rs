//! Duplex byte channel contract and exclusive access to it.
//!
//! A [`Transport`] knows nothing about frames: it writes bytes, hands back
//! whatever has already arrived, and throws away stale input. Framing and
//! reply matching are layered on top by `link-protocol`.
//!
//! [`SharedTransport`] is the one object every axis on a physical port
//! holds. Driving the port requires a [`TransportOwnership`] guard, so at most
//! one round trip (or one poll step) is ever in progress per port.

use crate::error::LinkResult;
use crate::serial::{drain_pending, read_now, SerialPortIO};
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

// =============================================================================
// Transport Trait
// =============================================================================

/// A duplex byte channel to one instrument port.
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes and flush.
    async fn write(&mut self, bytes: &[u8]) -> LinkResult<()>;

    /// Return up to `max` bytes that are already available. Never waits for
    /// data; an empty vector means nothing has arrived yet.
    async fn read_available(&mut self, max: usize) -> LinkResult<Vec<u8>>;

    /// Discard pending input, returning the discarded bytes.
    async fn purge(&mut self) -> LinkResult<Vec<u8>>;
}

/// [`Transport`] over any async serial port.
pub struct SerialTransport<P> {
    port: P,
    purge_window: Duration,
}

impl<P: SerialPortIO> SerialTransport<P> {
    /// Wrap a port. Purging takes only what is already buffered.
    pub fn new(port: P) -> Self {
        Self {
            port,
            purge_window: Duration::ZERO,
        }
    }

    /// Keep purging until the line has been quiet for `window`.
    pub fn with_purge_window(mut self, window: Duration) -> Self {
        self.purge_window = window;
        self
    }

    /// Access the underlying port.
    pub fn get_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[async_trait]
impl<P: SerialPortIO> Transport for SerialTransport<P> {
    async fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    async fn read_available(&mut self, max: usize) -> LinkResult<Vec<u8>> {
        Ok(read_now(&mut self.port, max).await?)
    }

    async fn purge(&mut self) -> LinkResult<Vec<u8>> {
        Ok(drain_pending(&mut self.port, self.purge_window).await?)
    }
}

// =============================================================================
// Shared Transport & Ownership
// =============================================================================

#[derive(Debug, Default)]
struct OwnershipCounters {
    acquisitions: AtomicU64,
    holders: AtomicUsize,
    peak_holders: AtomicUsize,
}

/// Snapshot of a [`SharedTransport`]'s ownership counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipStats {
    /// Ownership grants since the transport was created.
    pub acquisitions: u64,
    /// Holders right now (0 or 1).
    pub holders: usize,
    /// Highest number of simultaneous holders ever observed.
    pub peak_holders: usize,
}

/// A transport shared by every context that talks to one physical port.
///
/// Cloning is cheap; all clones share the same port and the same lock.
#[derive(Clone)]
pub struct SharedTransport {
    name: Arc<str>,
    inner: Arc<Mutex<Box<dyn Transport>>>,
    counters: Arc<OwnershipCounters>,
}

impl std::fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTransport")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SharedTransport {
    /// Share a transport under a human-readable name (usually the port path).
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::from_boxed(name, Box::new(transport))
    }

    /// Share an already boxed transport.
    pub fn from_boxed(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(transport)),
            counters: Arc::new(OwnershipCounters::default()),
        }
    }

    /// Convenience for serial ports: wraps `port` in a [`SerialTransport`].
    pub fn serial<P: SerialPortIO + 'static>(
        name: impl Into<String>,
        port: P,
        purge_window: Duration,
    ) -> Self {
        Self::new(name, SerialTransport::new(port).with_purge_window(purge_window))
    }

    /// Port name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for exclusive ownership of the transport.
    pub async fn acquire(&self) -> TransportOwnership {
        let guard = self.inner.clone().lock_owned().await;
        Self::grant(guard, &self.counters)
    }

    /// Take ownership only if nobody holds it right now.
    pub fn try_acquire(&self) -> Option<TransportOwnership> {
        let guard = self.inner.clone().try_lock_owned().ok()?;
        Some(Self::grant(guard, &self.counters))
    }

    fn grant(
        guard: OwnedMutexGuard<Box<dyn Transport>>,
        counters: &Arc<OwnershipCounters>,
    ) -> TransportOwnership {
        counters.acquisitions.fetch_add(1, Ordering::SeqCst);
        let holders = counters.holders.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_holders.fetch_max(holders, Ordering::SeqCst);
        TransportOwnership {
            guard,
            counters: counters.clone(),
        }
    }

    /// Current ownership counters.
    pub fn stats(&self) -> OwnershipStats {
        OwnershipStats {
            acquisitions: self.counters.acquisitions.load(Ordering::SeqCst),
            holders: self.counters.holders.load(Ordering::SeqCst),
            peak_holders: self.counters.peak_holders.load(Ordering::SeqCst),
        }
    }

    /// Whether two handles drive the same physical port.
    pub fn same_port(&self, other: &SharedTransport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Exclusive right to drive the next write/read round trip on a transport.
///
/// Released on drop. Never hold one across a sleep.
pub struct TransportOwnership {
    guard: OwnedMutexGuard<Box<dyn Transport>>,
    counters: Arc<OwnershipCounters>,
}

impl Deref for TransportOwnership {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for TransportOwnership {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

impl Drop for TransportOwnership {
    fn drop(&mut self) {
        self.counters.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_serial_transport_round_trip() {
        let (port, mut harness) = mock_serial::new();
        let mut transport = SerialTransport::new(port);

        transport.write(b"/1 1 get pos\n").await.unwrap();
        harness.expect_write(b"/1 1 get pos\n").await;

        harness.send_response(b"@01 1 OK IDLE -- 0\r\n").unwrap();
        let bytes = transport.read_available(64).await.unwrap();
        assert_eq!(bytes, b"@01 1 OK IDLE -- 0\r\n");
    }

    #[tokio::test]
    async fn test_read_available_never_waits() {
        let (port, _harness) = mock_serial::new();
        let mut transport = SerialTransport::new(port);
        assert!(transport.read_available(64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_returns_discarded_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = SerialTransport::new(device);

        host.write_all(&[0x64, 0x04, 0x0E, 0x00]).await.unwrap();
        let purged = transport.purge().await.unwrap();
        assert_eq!(purged, vec![0x64, 0x04, 0x0E, 0x00]);
        assert!(transport.purge().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ownership_is_exclusive() {
        let (port, _harness) = mock_serial::new();
        let shared = SharedTransport::serial("mock", port, Duration::ZERO);

        let first = shared.acquire().await;
        assert!(shared.try_acquire().is_none());
        assert_eq!(shared.stats().holders, 1);
        drop(first);

        let second = shared.try_acquire();
        assert!(second.is_some());
        drop(second);

        let stats = shared.stats();
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.holders, 0);
        assert_eq!(stats.peak_holders, 1);
    }

    #[tokio::test]
    async fn test_clones_share_one_port() {
        let (port, _harness) = mock_serial::new();
        let shared = SharedTransport::serial("mock", port, Duration::ZERO);
        let other = shared.clone();
        assert!(shared.same_port(&other));

        let _owned = other.acquire().await;
        assert!(shared.try_acquire().is_none());
    }
}
