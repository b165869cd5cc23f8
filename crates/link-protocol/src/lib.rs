//! `link-protocol`
//!
//! Protocol machinery shared by every instrument driver.
//!
//! ## Modules
//!
//! - **codec**: pure frame codecs (binary header, fixed length, text line, ASCII)
//! - **command**: commands and the reply signatures that identify them
//! - **engine**: [`CommandEngine`], one round trip at a time over a shared transport
//! - **poller**: busy sources and [`wait_until_idle`]
//! - **motion**: [`MotionCoordinator`], non-blocking motions with completion
//!   detection that tolerates concurrent queries
//!
//! ## Example
//!
//! ```rust,ignore
//! let engine = Arc::new(CommandEngine::new(transport, BinaryCodec::apt()));
//! let reply = engine.execute(&command, Duration::from_millis(500)).await?;
//! ```

pub mod codec;
pub mod command;
pub mod engine;
pub mod motion;
pub mod poller;

pub use codec::{Decoded, FrameCodec};
pub use command::{Command, Reply, Signature, SignatureSet};
pub use engine::{CommandEngine, EngineConfig, FrameObserver, ObserverId};
pub use motion::{
    Completion, MotionConfig, MotionCoordinator, MotionKind, MotionPhase, MotionProtocol,
    MotionRequest, MotionState,
};
pub use poller::{wait_until_idle, BusySource, CompositeBusy, QueriedBusy, SettleTimer};
