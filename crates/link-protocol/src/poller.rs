//! Busy/status polling.
//!
//! Instruments report "still working" in different ways: some answer a status
//! query, some give no feedback at all and are simply assumed to have settled
//! after a fixed delay. Both are unified behind [`BusySource::is_busy`], and
//! [`wait_until_idle`] polls any source.
//!
//! Each status query is its own round trip; nothing here holds transport
//! ownership across a sleep.

use crate::codec::FrameCodec;
use crate::command::Command;
use crate::engine::CommandEngine;
use async_trait::async_trait;
use link_core::{LinkError, LinkResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Anything that can say whether the instrument is still busy.
#[async_trait]
pub trait BusySource: Send + Sync {
    /// Non-blocking apart from at most one short status round trip.
    async fn is_busy(&self) -> bool;
}

// =============================================================================
// Device-queried
// =============================================================================

type BusyPredicate<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

/// Busy according to a lightweight status command.
///
/// Any failure while polling is logged and reported as "not busy", so a
/// flaky status line can never wedge a caller waiting for idle.
pub struct QueriedBusy<C: FrameCodec> {
    engine: Arc<CommandEngine<C>>,
    command: Command<C::Request>,
    timeout: Duration,
    busy_when: BusyPredicate<C::Reply>,
}

impl<C: FrameCodec> QueriedBusy<C> {
    /// Poll with `command`; `busy_when` interprets the reply.
    pub fn new(
        engine: Arc<CommandEngine<C>>,
        command: Command<C::Request>,
        timeout: Duration,
        busy_when: impl Fn(&C::Reply) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            engine,
            command,
            timeout,
            busy_when: Box::new(busy_when),
        }
    }
}

#[async_trait]
impl<C: FrameCodec> BusySource for QueriedBusy<C> {
    async fn is_busy(&self) -> bool {
        match self.engine.execute(&self.command, self.timeout).await {
            Ok(reply) => (self.busy_when)(&reply),
            Err(e) => {
                warn!(command = %self.command.label, error = %e, "Status poll failed, assuming not busy");
                false
            }
        }
    }
}

// =============================================================================
// Elapsed-time
// =============================================================================

/// Busy for a fixed settle duration after each accepted command.
#[derive(Debug)]
pub struct SettleTimer {
    settle: Mutex<Duration>,
    changed: Mutex<Option<Instant>>,
}

impl SettleTimer {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle: Mutex::new(settle),
            changed: Mutex::new(None),
        }
    }

    /// Record that a command was just accepted.
    pub fn mark(&self) {
        *self.changed.lock() = Some(Instant::now());
    }

    pub fn settle(&self) -> Duration {
        *self.settle.lock()
    }

    /// Change the settle duration; applies to the running interval too.
    pub fn set_settle(&self, settle: Duration) {
        *self.settle.lock() = settle;
    }

    /// Whether the settle interval is still running.
    pub fn settling(&self) -> bool {
        let settle = self.settle();
        let changed = *self.changed.lock();
        changed.map(|at| at.elapsed() < settle).unwrap_or(false)
    }
}

#[async_trait]
impl BusySource for SettleTimer {
    async fn is_busy(&self) -> bool {
        self.settling()
    }
}

// =============================================================================
// Composite
// =============================================================================

/// Busy while any member is busy.
#[derive(Default)]
pub struct CompositeBusy {
    members: Vec<Arc<dyn BusySource>>,
}

impl CompositeBusy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, member: Arc<dyn BusySource>) -> Self {
        self.members.push(member);
        self
    }
}

#[async_trait]
impl BusySource for CompositeBusy {
    async fn is_busy(&self) -> bool {
        for member in &self.members {
            if member.is_busy().await {
                return true;
            }
        }
        false
    }
}

// =============================================================================
// Waiting
// =============================================================================

/// Sleep `poll_interval`, re-check, repeat.
///
/// Returns on the first idle observation, or [`LinkError::BusyTimeout`] once
/// the accumulated wait exceeds `timeout`.
pub async fn wait_until_idle(
    source: &dyn BusySource,
    poll_interval: Duration,
    timeout: Duration,
) -> LinkResult<()> {
    let mut waited = Duration::ZERO;
    let mut polls = 0u32;

    loop {
        tokio::time::sleep(poll_interval).await;
        waited += poll_interval;
        polls += 1;

        if !source.is_busy().await {
            debug!(polls, waited_ms = waited.as_millis() as u64, "Device idle");
            return Ok(());
        }
        if waited > timeout {
            warn!(polls, timeout_ms = timeout.as_millis() as u64, "Device still busy");
            return Err(LinkError::BusyTimeout(waited));
        }
    }
}
