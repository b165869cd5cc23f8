//! # motionlink
//!
//! Application layer over the protocol crates:
//!
//! - **`link-core`**: transports, serial ports and the typed [`LinkError`].
//! - **`link-protocol`**: frame codecs, the command/response engine, busy
//!   polling and the motion coordinator.
//! - **`link-drivers`**: APT, Zaber-style and Lambda-style adapters built
//!   from configuration through a [`DriverRegistry`].
//!
//! This crate adds configuration loading ([`config`]) and tracing setup
//! ([`logging`]) used by the `motionlink` command-line tool.

pub mod config;
pub mod logging;

pub use config::{DeviceDefinition, LinkConfig};
pub use link_core::{LinkError, LinkErrorKind, LinkResult};
pub use link_drivers::{DeviceComponents, DriverRegistry, Shutter, Stage};
