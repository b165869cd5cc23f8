//! Shared port management for multi-drop buses.
//!
//! Several axes (or several controllers on an RS-485 bus) can sit behind a
//! single serial port. Opening that port twice would give two independent
//! ownership locks and let frames interleave on the wire, so ports are opened
//! through this registry and every caller gets the same [`SharedTransport`].

use crate::transport::SharedTransport;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Process-wide registry of open transports, keyed by port path.
static SHARED_PORTS: OnceLock<RwLock<HashMap<String, SharedTransport>>> = OnceLock::new();

fn port_registry() -> &'static RwLock<HashMap<String, SharedTransport>> {
    SHARED_PORTS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Get an existing shared transport if one is already open for the given path.
pub fn get_existing_port(port_path: &str) -> Option<SharedTransport> {
    let registry = port_registry().read();
    registry.get(port_path).cloned()
}

/// Register an opened transport under `port_path`, replacing any previous one.
pub fn register_port(port_path: &str, transport: SharedTransport) {
    let mut registry = port_registry().write();
    registry.insert(port_path.to_string(), transport);
    tracing::info!(port = port_path, "Registered shared port");
}

/// Remove a port from the registry (e.g., when it becomes stale).
pub fn remove_port(port_path: &str) -> bool {
    let mut registry = port_registry().write();
    let removed = registry.remove(port_path).is_some();
    if removed {
        tracing::info!(port = port_path, "Removed shared port from registry");
    }
    removed
}

/// Return the registered transport for `port_path` if it still answers a
/// flush within `probe`; stale entries are dropped from the registry.
pub async fn healthy_existing_port(port_path: &str, probe: Duration) -> Option<SharedTransport> {
    let transport = get_existing_port(port_path)?;

    let health_check = async {
        let mut owned = transport.acquire().await;
        owned.write(&[]).await
    };

    match tokio::time::timeout(probe, health_check).await {
        Ok(Ok(())) => {
            tracing::debug!(port = port_path, "Reusing healthy shared port");
            Some(transport)
        }
        Ok(Err(e)) => {
            tracing::warn!(port = port_path, error = %e, "Shared port health check failed, reopening");
            remove_port(port_path);
            None
        }
        Err(_) => {
            // Busy with a long round trip is not the same as dead.
            tracing::debug!(port = port_path, "Shared port busy during health check, reusing");
            Some(transport)
        }
    }
}

/// Get or open the shared transport for a serial port.
///
/// If the port is already open and healthy, returns the existing transport.
/// Otherwise opens it (8N1, no flow control) and registers it.
#[cfg(feature = "serial")]
pub async fn get_or_open_port(
    port_path: &str,
    baud_rate: u32,
    purge_window: Duration,
) -> anyhow::Result<SharedTransport> {
    if let Some(transport) = healthy_existing_port(port_path, Duration::from_millis(100)).await {
        return Ok(transport);
    }

    let port = crate::serial::open_serial_async(port_path, baud_rate, port_path).await?;
    let shared = SharedTransport::serial(port_path, port, purge_window);
    tracing::info!(port = port_path, baud_rate, "Opened serial port");

    register_port(port_path, shared.clone());
    Ok(shared)
}

/// Close all shared ports (for cleanup/testing).
pub fn close_all_ports() {
    if let Some(registry) = SHARED_PORTS.get() {
        let mut guard = registry.write();
        let count = guard.len();
        guard.clear();
        tracing::info!(count, "Closed all shared ports");
    }
}

/// Get the number of currently open shared ports.
pub fn port_count() -> usize {
    SHARED_PORTS.get().map(|r| r.read().len()).unwrap_or(0)
}
