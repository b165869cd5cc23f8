//! Driver factories.
//!
//! Each adapter exposes a [`DriverFactory`] that turns a driver-specific TOML
//! table into [`DeviceComponents`]. The [`DriverRegistry`] maps the `driver`
//! field of a device entry to its factory.
//!
//! ```rust,ignore
//! let registry = DriverRegistry::with_builtin();
//! let components = registry
//!     .build("stage-x", "apt", table, DriverContext::default())
//!     .await?;
//! let stage = components.stage.context("not a stage")?;
//! ```

use crate::capabilities::{Shutter, Stage};
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use link_core::{ports, SharedTransport};
use link_protocol::{CommandEngine, EngineConfig, FrameCodec, MotionConfig};
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// What a built device can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Positions an axis.
    Stage,
    /// Opens and closes a light path.
    Shutter,
}

/// Capability handles of one built device.
#[derive(Default, Clone)]
pub struct DeviceComponents {
    pub stage: Option<Arc<dyn Stage>>,
    pub shutter: Option<Arc<dyn Shutter>>,
}

impl std::fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("stage", &self.stage.is_some())
            .field("shutter", &self.shutter.is_some())
            .finish()
    }
}

/// Session-wide timing handed to every factory.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub engine: EngineConfig,
    pub motion: MotionConfig,
    /// Quiet period that ends a purge.
    pub purge_window: Duration,
    /// Timeout used by blocking helpers such as `Shutter::set_open`.
    pub operation_timeout: Duration,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            motion: MotionConfig::default(),
            purge_window: Duration::from_millis(5),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds one kind of device from configuration.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `driver` field that selects this factory.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for listings and error messages.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Check a driver table without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Open the port (shared with any other device on it) and build the device.
    fn build(&self, config: toml::Value, context: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>>;
}

/// Factories keyed by driver type.
#[derive(Default)]
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, Arc<dyn DriverFactory>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the APT, Zaber and Lambda (shutter and wheel) factories.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register_factory(Arc::new(crate::apt::AptFactory));
        registry.register_factory(Arc::new(crate::zaber::ZaberFactory));
        registry.register_factory(Arc::new(crate::lambda::LambdaFactory));
        registry.register_factory(Arc::new(crate::lambda::LambdaWheelFactory));
        registry
    }

    /// Register `factory`, returning the one it replaced.
    pub fn register_factory(&self, factory: Arc<dyn DriverFactory>) -> Option<Arc<dyn DriverFactory>> {
        let driver_type = factory.driver_type().to_string();
        tracing::info!(
            driver_type = %driver_type,
            name = %factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        self.factories.write().insert(driver_type, factory)
    }

    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.read().contains_key(driver_type)
    }

    /// Registered driver types, sorted.
    pub fn list_factories(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn factory(&self, driver_type: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.read().get(driver_type).cloned()
    }

    /// Validate a device entry against its factory.
    pub fn validate(&self, device_id: &str, driver_type: &str, config: &toml::Value) -> Result<()> {
        let factory = self.lookup(device_id, driver_type)?;
        factory.validate(config).with_context(|| {
            format!(
                "Configuration validation failed for device '{}' ({})",
                device_id, driver_type
            )
        })
    }

    /// Validate and build a device entry.
    pub async fn build(
        &self,
        device_id: &str,
        driver_type: &str,
        config: toml::Value,
        context: DriverContext,
    ) -> Result<DeviceComponents> {
        self.validate(device_id, driver_type, &config)?;
        let factory = self.lookup(device_id, driver_type)?;

        tracing::info!(device_id, driver_type, "Building device from factory");
        factory
            .build(config, context)
            .await
            .with_context(|| format!("Factory build failed for device '{}' ({})", device_id, driver_type))
    }

    fn lookup(&self, device_id: &str, driver_type: &str) -> Result<Arc<dyn DriverFactory>> {
        self.factory(driver_type).ok_or_else(|| {
            anyhow!(
                "Unknown driver type '{}' for device '{}'. Available: {}",
                driver_type,
                device_id,
                self.list_factories().join(", ")
            )
        })
    }
}

// =============================================================================
// Shared ports and engines
// =============================================================================

/// Shared transport for `port`: the registered one if present, otherwise a
/// freshly opened serial port.
pub async fn open_port(port: &str, baud_rate: u32, purge_window: Duration) -> Result<SharedTransport> {
    #[cfg(feature = "serial")]
    {
        ports::get_or_open_port(port, baud_rate, purge_window).await
    }
    #[cfg(not(feature = "serial"))]
    {
        let _ = (baud_rate, purge_window);
        ports::get_existing_port(port)
            .ok_or_else(|| anyhow!("Port '{}' is not registered and serial support is disabled", port))
    }
}

type EngineKey = (String, TypeId);

static SHARED_ENGINES: OnceLock<Mutex<HashMap<EngineKey, Arc<dyn Any + Send + Sync>>>> = OnceLock::new();

/// The engine for `transport` and codec type `C`, created on first use.
///
/// Axes on one port must share one engine so that completions read on behalf
/// of one axis reach the observers of the others.
pub fn shared_engine<C: FrameCodec>(
    transport: &SharedTransport,
    make_codec: impl FnOnce() -> C,
    config: &EngineConfig,
) -> Arc<CommandEngine<C>> {
    shared_engine_with(transport, make_codec, config, |_| {})
}

/// [`shared_engine`], running `on_create` once on a newly created engine
/// (to register port-wide observers).
pub fn shared_engine_with<C: FrameCodec>(
    transport: &SharedTransport,
    make_codec: impl FnOnce() -> C,
    config: &EngineConfig,
    on_create: impl FnOnce(&CommandEngine<C>),
) -> Arc<CommandEngine<C>> {
    let key = (transport.name().to_string(), TypeId::of::<C>());
    let mut engines = SHARED_ENGINES.get_or_init(|| Mutex::new(HashMap::new())).lock();

    if let Some(existing) = engines.get(&key) {
        if let Ok(engine) = existing.clone().downcast::<CommandEngine<C>>() {
            if engine.transport().same_port(transport) {
                return engine;
            }
        }
    }

    let engine = Arc::new(CommandEngine::with_config(transport.clone(), make_codec(), config.clone()));
    on_create(&engine);
    engines.insert(key, engine.clone());
    engine
}

/// Forget every shared engine (for cleanup/testing).
pub fn clear_shared_engines() {
    if let Some(engines) = SHARED_ENGINES.get() {
        engines.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_core::mock_serial;
    use link_protocol::codec::{AsciiCodec, FixedLengthCodec};

    struct NullFactory;

    impl DriverFactory for NullFactory {
        fn driver_type(&self) -> &'static str {
            "null"
        }

        fn name(&self) -> &'static str {
            "Null device"
        }

        fn validate(&self, config: &toml::Value) -> Result<()> {
            config
                .get("port")
                .map(|_| ())
                .ok_or_else(|| anyhow!("missing port"))
        }

        fn build(&self, _config: toml::Value, _context: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
            Box::pin(async { Ok(DeviceComponents::default()) })
        }
    }

    #[test]
    fn test_builtin_factories() {
        let registry = DriverRegistry::with_builtin();
        assert_eq!(registry.list_factories(), vec!["apt", "lambda", "lambda_wheel", "zaber"]);
        assert!(registry.has_factory("zaber"));
        assert!(!registry.has_factory("ell14"));
    }

    #[test]
    fn test_register_replaces() {
        let registry = DriverRegistry::new();
        assert!(registry.register_factory(Arc::new(NullFactory)).is_none());
        assert!(registry.register_factory(Arc::new(NullFactory)).is_some());
    }

    #[tokio::test]
    async fn test_build_validates_first() {
        let registry = DriverRegistry::new();
        registry.register_factory(Arc::new(NullFactory));

        let bad = toml::Value::Table(toml::toml! { baud_rate = 9600 });
        let err = registry
            .build("dev", "null", bad, DriverContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("validation failed"));

        let good = toml::Value::Table(toml::toml! { port = "/dev/null" });
        let components = registry
            .build("dev", "null", good, DriverContext::default())
            .await
            .unwrap();
        assert!(components.stage.is_none());
    }

    #[tokio::test]
    async fn test_unknown_driver_lists_available() {
        let registry = DriverRegistry::with_builtin();
        let err = registry
            .build("dev", "ell14", toml::Value::Table(Default::default()), DriverContext::default())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("ell14"));
        assert!(message.contains("apt, lambda, zaber"));
    }

    #[test]
    fn test_shared_engine_per_port_and_codec() {
        let (port, _harness) = mock_serial::new();
        let transport = SharedTransport::serial("factory-test-port", port, Duration::ZERO);
        let config = EngineConfig::default();

        let a = shared_engine(&transport, AsciiCodec::new, &config);
        let b = shared_engine(&transport, AsciiCodec::new, &config);
        assert!(Arc::ptr_eq(&a, &b));

        let fixed = shared_engine(&transport, || FixedLengthCodec::new(1), &config);
        assert!(fixed.transport().same_port(&transport));

        let (other_port, _other) = mock_serial::new();
        let reopened = SharedTransport::serial("factory-test-port", other_port, Duration::ZERO);
        let c = shared_engine(&reopened, AsciiCodec::new, &config);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_on_create_runs_once_per_engine() {
        let (port, _harness) = mock_serial::new();
        let transport = SharedTransport::serial("factory-test-observers", port, Duration::ZERO);
        let config = EngineConfig::default();
        let created = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..3 {
            let engine = shared_engine_with(&transport, AsciiCodec::new, &config, |engine| {
                created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                engine.register_observer(Arc::new(crate::zaber::AlertLog::new("bus")));
            });
            assert_eq!(engine.observer_count(), 1);
        }
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
