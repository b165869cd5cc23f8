//! `link-core`
//!
//! Core building blocks for talking to serial lab instruments: the error
//! taxonomy, the byte-level [`Transport`](transport::Transport) contract, and
//! the plumbing that lets several logical axes share one physical port.
//!
//! ## Layers
//!
//! - **serial**: async serial port trait alias, port opening and buffer draining
//! - **transport**: the duplex byte channel contract plus [`SharedTransport`],
//!   which hands out exclusive [`TransportOwnership`] for one round trip
//! - **ports**: process-wide registry so multi-drop buses are opened once
//! - **mock_serial**: channel-backed port and device harness for tests
//!
//! Framing, the command/response engine and motion coordination live in
//! `link-protocol`; concrete instruments live in `link-drivers`.

pub mod error;
pub mod mock_serial;
pub mod ports;
pub mod serial;
pub mod transport;

pub use error::{LinkError, LinkErrorKind, LinkResult};
pub use serial::{DynSerial, SerialPortIO};
pub use transport::{
    OwnershipStats, SerialTransport, SharedTransport, Transport, TransportOwnership,
};
