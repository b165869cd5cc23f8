//! Reference instrument adapters for motionlink.
//!
//! This crate provides drivers for:
//! - Thorlabs APT motor controllers (binary protocol, notified completion)
//! - Zaber-style ASCII stages (text protocol, polled completion)
//! - Sutter Lambda-style shutters (single-byte protocol, settle delay) and
//!   filter wheels
//!
//! # Usage
//!
//! Build devices from configuration through the registry:
//!
//! ```rust,ignore
//! use link_drivers::{DriverContext, DriverRegistry};
//!
//! let registry = DriverRegistry::with_builtin();
//! let device = registry.build("stage-x", "apt", table, DriverContext::default()).await?;
//! ```

pub mod apt;
pub mod capabilities;
pub mod factory;
pub mod lambda;
pub mod zaber;

pub use apt::{AptFactory, AptProtocol, AptStage};
pub use capabilities::{CoordinatedStage, Shutter, Stage};
pub use factory::{
    clear_shared_engines, open_port, shared_engine, shared_engine_with, Capability, DeviceComponents, DriverContext,
    DriverFactory, DriverRegistry,
};
pub use lambda::{
    LambdaFactory, LambdaProtocol, LambdaShutter, LambdaWheel, LambdaWheelFactory, LambdaWheelStage,
};
pub use zaber::{AlertLog, ZaberFactory, ZaberProtocol, ZaberStage};
