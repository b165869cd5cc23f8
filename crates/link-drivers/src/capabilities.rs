//! Device-facing capability traits.
//!
//! Drivers hand these out through [`DeviceComponents`](crate::DeviceComponents)
//! so the CLI can operate any configured device without knowing its protocol.

use async_trait::async_trait;
use link_core::LinkResult;
use link_protocol::{MotionCoordinator, MotionKind, MotionPhase, MotionProtocol, MotionRequest};
use std::time::Duration;

/// A positioning axis.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Start a motion without waiting for it.
    fn start_move(&self, kind: MotionKind, timeout: Duration) -> LinkResult<()>;

    /// Wait for the started motion; returns the final position if known.
    async fn wait_settled(&self, timeout: Duration) -> LinkResult<Option<i64>>;

    /// Current position (cached while moving unless the device can be
    /// queried in motion).
    async fn position(&self) -> LinkResult<i64>;

    /// Best-effort stop of the motion in flight.
    async fn stop(&self) -> LinkResult<()>;

    /// Send the stop command even if no motion was started here.
    async fn halt(&self) -> LinkResult<()>;

    fn is_moving(&self) -> bool;

    fn phase(&self) -> MotionPhase;

    fn last_known_position(&self) -> Option<i64>;
}

/// A two-state light path.
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Command the shutter and wait for the controller to finish. The settle
    /// interval may still be running when this returns.
    async fn set_open(&self, open: bool) -> LinkResult<()>;

    /// Last commanded state, if any.
    fn is_open(&self) -> Option<bool>;

    /// Controller busy or settle interval still running.
    async fn is_busy(&self) -> bool;

    /// Poll [`is_busy`](Self::is_busy) until idle.
    async fn wait_until_idle(&self, timeout: Duration) -> LinkResult<()>;
}

/// [`Stage`] for any [`MotionProtocol`], driven by a [`MotionCoordinator`].
pub struct CoordinatedStage<P: MotionProtocol> {
    coordinator: MotionCoordinator<P>,
}

impl<P: MotionProtocol> CoordinatedStage<P> {
    pub fn new(coordinator: MotionCoordinator<P>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &MotionCoordinator<P> {
        &self.coordinator
    }
}

#[async_trait]
impl<P: MotionProtocol> Stage for CoordinatedStage<P> {
    fn start_move(&self, kind: MotionKind, timeout: Duration) -> LinkResult<()> {
        self.coordinator.start_move(MotionRequest {
            axis: self.coordinator.axis_id(),
            kind,
            timeout,
        })
    }

    async fn wait_settled(&self, timeout: Duration) -> LinkResult<Option<i64>> {
        self.coordinator.wait_for_outcome(timeout).await?;
        Ok(self.coordinator.last_known_position())
    }

    async fn position(&self) -> LinkResult<i64> {
        self.coordinator.position().await
    }

    async fn stop(&self) -> LinkResult<()> {
        self.coordinator.cancel().await
    }

    async fn halt(&self) -> LinkResult<()> {
        self.coordinator.halt().await
    }

    fn is_moving(&self) -> bool {
        self.coordinator.is_moving()
    }

    fn phase(&self) -> MotionPhase {
        self.coordinator.state()
    }

    fn last_known_position(&self) -> Option<i64> {
        self.coordinator.last_known_position()
    }
}
