//! Asynchronous motion coordination.
//!
//! A [`MotionCoordinator`] owns the lifecycle of motions on one logical axis:
//!
//! ```text
//! Idle --start_move--> InFlight --+--> Completed(reply) --take_outcome--> Idle
//!                                 +--> Failed(error)    --take_outcome--> Idle
//! ```
//!
//! The motion itself runs on a spawned task that drives the engine in short,
//! separately-owned poll steps, so position queries and `cancel` from other
//! contexts interleave with it on the shared transport.
//!
//! # Completion races
//!
//! On protocols where the completion notification and a position reply share
//! the channel, whoever reads the notification first settles the motion:
//! the motion task itself, a position query (which accepts the completion
//! signatures as alternates), or any other round trip on the same engine (via
//! the axis's [`FrameObserver`]). Each path goes through the same guarded
//! transition, so a motion completes exactly once.

use crate::codec::FrameCodec;
use crate::command::{Command, Reply, SignatureSet};
use crate::engine::{CommandEngine, FrameObserver, ObserverId};
use crate::poller::BusySource;
use async_trait::async_trait;
use link_core::{LinkError, LinkErrorKind, LinkResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Request type of a protocol's codec.
pub type RequestOf<P> = <<P as MotionProtocol>::Codec as FrameCodec>::Request;
/// Reply type of a protocol's codec.
pub type ReplyOf<P> = <<P as MotionProtocol>::Codec as FrameCodec>::Reply;

/// How often a waiter re-checks for a motion task that died silently.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Requests & state
// =============================================================================

/// What a motion should do, in device-native integer units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionKind {
    Absolute(i64),
    Relative(i64),
    Home,
}

/// One motion on one axis with a caller-chosen timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionRequest {
    pub axis: u8,
    pub kind: MotionKind,
    pub timeout: Duration,
}

impl MotionRequest {
    pub fn absolute(axis: u8, target: i64, timeout: Duration) -> Self {
        Self {
            axis,
            kind: MotionKind::Absolute(target),
            timeout,
        }
    }

    pub fn relative(axis: u8, distance: i64, timeout: Duration) -> Self {
        Self {
            axis,
            kind: MotionKind::Relative(distance),
            timeout,
        }
    }

    pub fn home(axis: u8, timeout: Duration) -> Self {
        Self {
            axis,
            kind: MotionKind::Home,
            timeout,
        }
    }
}

/// Lifecycle of a motion on one axis.
#[derive(Debug)]
pub enum MotionState<R> {
    Idle,
    InFlight(MotionRequest),
    Completed(R),
    Failed(LinkError),
}

/// Cheap snapshot of a [`MotionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionPhase {
    Idle,
    InFlight(MotionRequest),
    Completed,
    Failed(LinkErrorKind),
}

/// How a protocol tells the host that a motion has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The move command's own reply arrives when the motion ends.
    OnReply,
    /// The move command is not answered; a later unsolicited frame with one
    /// of these signatures reports completion.
    Notified(SignatureSet),
    /// The move command is acknowledged at once. If the acknowledgement is
    /// not itself a completion, a later frame with one of these signatures is.
    Acknowledged(SignatureSet),
    /// The device must be polled with the status command until idle.
    Polled,
}

/// Instrument-specific motion vocabulary.
pub trait MotionProtocol: Send + Sync + 'static {
    /// Framing used by the instrument.
    type Codec: FrameCodec;

    /// Command that starts `request`.
    fn move_command(&self, request: &MotionRequest) -> LinkResult<Command<RequestOf<Self>>>;

    /// How completion of `request` is observed.
    fn completion(&self, request: &MotionRequest) -> Completion;

    /// Position query for `axis`, if the device has one.
    fn position_command(&self, axis: u8) -> Option<Command<RequestOf<Self>>>;

    /// Position carried by a reply, if any.
    fn position_from(&self, reply: &ReplyOf<Self>) -> Option<i64>;

    /// Stop command for `axis`, if the device has one.
    fn stop_command(&self, axis: u8) -> Option<Command<RequestOf<Self>>>;

    /// Status query used by [`Completion::Polled`]; defaults to the position query.
    fn status_command(&self, axis: u8) -> Option<Command<RequestOf<Self>>> {
        self.position_command(axis)
    }

    /// Whether position queries may be issued while a motion is in flight.
    fn supports_query_while_moving(&self) -> bool {
        false
    }

    /// Signatures of frames that can complete `request` without being asked for.
    fn completion_signatures(&self, request: &MotionRequest) -> Option<SignatureSet> {
        match self.completion(request) {
            Completion::OnReply => self.move_command(request).ok().map(|c| c.expect),
            Completion::Notified(set) | Completion::Acknowledged(set) => Some(set),
            Completion::Polled => None,
        }
    }

    /// Whether `reply` reports that `request` has finished.
    fn is_completion(&self, request: &MotionRequest, reply: &ReplyOf<Self>) -> bool {
        self.completion_signatures(request)
            .map(|set| set.matches(&reply.signature()))
            .unwrap_or(false)
    }

    /// Final position after `request` completed with `reply`.
    fn final_position(&self, request: &MotionRequest, reply: &ReplyOf<Self>) -> Option<i64> {
        self.position_from(reply).or(match request.kind {
            MotionKind::Absolute(target) => Some(target),
            _ => None,
        })
    }
}

/// Polling knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Length of one owned poll step, and the pause between status polls.
    pub poll_interval: Duration,
    /// Budget for position and status round trips.
    pub query_timeout: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            query_timeout: Duration::from_millis(500),
        }
    }
}

// =============================================================================
// Axis state shared with the motion task and the observer
// =============================================================================

struct Slot<R> {
    generation: u64,
    state: MotionState<R>,
}

struct Axis<P: MotionProtocol> {
    name: String,
    protocol: Arc<P>,
    slot: Mutex<Slot<ReplyOf<P>>>,
    position: Mutex<Option<i64>>,
    settled: Notify,
}

impl<P: MotionProtocol> Axis<P> {
    fn is_current(&self, generation: u64) -> bool {
        let slot = self.slot.lock();
        slot.generation == generation && matches!(slot.state, MotionState::InFlight(_))
    }

    fn set_position(&self, position: i64) {
        *self.position.lock() = Some(position);
    }

    /// InFlight -> Completed, once. `generation` pins the transition to a
    /// specific motion; `None` accepts whichever motion is in flight.
    fn complete(&self, generation: Option<u64>, reply: ReplyOf<P>) -> bool {
        let mut slot = self.slot.lock();
        if generation.is_some_and(|g| g != slot.generation) {
            return false;
        }
        let MotionState::InFlight(request) = &slot.state else {
            return false;
        };

        let position = self.protocol.final_position(request, &reply);
        if let Some(position) = position {
            *self.position.lock() = Some(position);
        }
        info!(axis = %self.name, ?position, "Motion completed");
        slot.state = MotionState::Completed(reply);
        drop(slot);
        self.settled.notify_waiters();
        true
    }

    /// InFlight -> Failed, once.
    fn fail(&self, generation: u64, error: LinkError) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation || !matches!(slot.state, MotionState::InFlight(_)) {
            return false;
        }
        warn!(axis = %self.name, error = %error, "Motion failed");
        slot.state = MotionState::Failed(error);
        drop(slot);
        self.settled.notify_waiters();
        true
    }
}

impl<P: MotionProtocol> FrameObserver<ReplyOf<P>> for Axis<P> {
    fn offer(&self, frame: &ReplyOf<P>) -> bool {
        let generation = {
            let slot = self.slot.lock();
            let MotionState::InFlight(request) = &slot.state else {
                return false;
            };
            let unsolicited = self
                .protocol
                .completion_signatures(request)
                .is_some_and(|set| set.matches(&frame.signature()));
            if !unsolicited || !self.protocol.is_completion(request, frame) {
                return false;
            }
            slot.generation
        };

        debug!(axis = %self.name, signature = %frame.signature(), "Completion observed outside the motion task");
        self.complete(Some(generation), frame.clone())
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs motions on one axis while other contexts keep querying it.
pub struct MotionCoordinator<P: MotionProtocol> {
    axis_id: u8,
    axis: Arc<Axis<P>>,
    engine: Arc<CommandEngine<P::Codec>>,
    config: MotionConfig,
    observer: ObserverId,
    task: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl<P: MotionProtocol> std::fmt::Debug for MotionCoordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionCoordinator")
            .field("axis", &self.axis.name)
            .field("axis_id", &self.axis_id)
            .field("phase", &self.state())
            .finish()
    }
}

impl<P: MotionProtocol> MotionCoordinator<P> {
    /// Coordinate `axis_id` on `engine`. Registers a completion observer on
    /// the engine for the coordinator's lifetime.
    pub fn new(
        name: impl Into<String>,
        axis_id: u8,
        engine: Arc<CommandEngine<P::Codec>>,
        protocol: Arc<P>,
        config: MotionConfig,
    ) -> Self {
        let axis = Arc::new(Axis {
            name: name.into(),
            protocol,
            slot: Mutex::new(Slot {
                generation: 0,
                state: MotionState::Idle,
            }),
            position: Mutex::new(None),
            settled: Notify::new(),
        });
        let observer = engine.register_observer(axis.clone());

        Self {
            axis_id,
            axis,
            engine,
            config,
            observer,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.axis.name
    }

    pub fn axis_id(&self) -> u8 {
        self.axis_id
    }

    pub fn engine(&self) -> &Arc<CommandEngine<P::Codec>> {
        &self.engine
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.axis.protocol
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Start `request` on a spawned task. Never suspends the caller.
    ///
    /// # Errors
    ///
    /// [`LinkError::Busy`] unless the axis is Idle (an unconsumed outcome
    /// counts as busy), or whatever the protocol reports for a move it cannot
    /// express.
    pub fn start_move(&self, request: MotionRequest) -> LinkResult<()> {
        if request.axis != self.axis_id {
            return Err(LinkError::Configuration(format!(
                "{} drives axis {}, not {}",
                self.axis.name, self.axis_id, request.axis
            )));
        }
        let command = self.axis.protocol.move_command(&request)?;

        self.reap();
        let generation = {
            let mut slot = self.axis.slot.lock();
            if !matches!(slot.state, MotionState::Idle) {
                debug!(axis = %self.axis.name, "start_move refused, axis busy");
                return Err(LinkError::Busy(self.axis.name.clone()));
            }
            slot.generation += 1;
            slot.state = MotionState::InFlight(request.clone());
            slot.generation
        };

        info!(axis = %self.axis.name, kind = ?request.kind, timeout_ms = request.timeout.as_millis() as u64, "Motion started");
        let handle = tokio::spawn(run_motion(
            self.axis.clone(),
            self.engine.clone(),
            self.config.clone(),
            request,
            command,
            generation,
        ));
        *self.task.lock() = Some((generation, handle));
        Ok(())
    }

    /// True while a motion is in flight.
    pub fn is_moving(&self) -> bool {
        self.reap();
        matches!(self.axis.slot.lock().state, MotionState::InFlight(_))
    }

    /// Position cached from the last completion or query.
    pub fn last_known_position(&self) -> Option<i64> {
        *self.axis.position.lock()
    }

    pub fn state(&self) -> MotionPhase {
        self.reap();
        match &self.axis.slot.lock().state {
            MotionState::Idle => MotionPhase::Idle,
            MotionState::InFlight(request) => MotionPhase::InFlight(request.clone()),
            MotionState::Completed(_) => MotionPhase::Completed,
            MotionState::Failed(e) => MotionPhase::Failed(e.kind()),
        }
    }

    /// Consume a Completed/Failed outcome and return to Idle.
    pub fn take_outcome(&self) -> Option<LinkResult<ReplyOf<P>>> {
        self.reap();
        let mut slot = self.axis.slot.lock();
        match std::mem::replace(&mut slot.state, MotionState::Idle) {
            MotionState::Completed(reply) => Some(Ok(reply)),
            MotionState::Failed(e) => Some(Err(e)),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Wait up to `timeout` for the in-flight motion, then consume its outcome.
    ///
    /// # Errors
    ///
    /// The motion's own error, [`LinkError::BusyTimeout`] if it is still in
    /// flight after `timeout`, or [`LinkError::TaskFailed`] if nothing was
    /// started.
    pub async fn wait_for_outcome(&self, timeout: Duration) -> LinkResult<ReplyOf<P>> {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.axis.settled.notified();

            match self.state() {
                MotionPhase::Idle => {
                    return Err(LinkError::TaskFailed(format!(
                        "no motion to wait for on {}",
                        self.axis.name
                    )))
                }
                MotionPhase::InFlight(_) => {}
                MotionPhase::Completed | MotionPhase::Failed(_) => {
                    if let Some(outcome) = self.take_outcome() {
                        return outcome;
                    }
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::BusyTimeout(timeout));
            }
            let _ = tokio::time::timeout((deadline - now).min(REAP_INTERVAL), settled).await;
        }
    }

    /// Start `request` and wait for it, allowing two poll intervals of slack.
    pub async fn move_and_wait(&self, request: MotionRequest) -> LinkResult<ReplyOf<P>> {
        let budget = request.timeout + self.config.poll_interval * 2;
        self.start_move(request)?;
        self.wait_for_outcome(budget).await
    }

    /// Best-effort stop. The motion task still settles the state.
    ///
    /// # Errors
    ///
    /// [`LinkError::Unsupported`] if the protocol has no stop command.
    #[instrument(skip(self), fields(axis = %self.axis.name))]
    pub async fn cancel(&self) -> LinkResult<()> {
        if !self.is_moving() {
            return Ok(());
        }
        let stop = self
            .axis
            .protocol
            .stop_command(self.axis_id)
            .ok_or_else(|| LinkError::Unsupported(format!("{} has no stop command", self.axis.name)))?;

        info!("Cancelling motion");
        self.engine.send(&stop).await
    }

    /// Send the stop command whether or not this coordinator started a
    /// motion, for axes that may have been set moving by another session.
    ///
    /// # Errors
    ///
    /// [`LinkError::Unsupported`] if the protocol has no stop command.
    #[instrument(skip(self), fields(axis = %self.axis.name))]
    pub async fn halt(&self) -> LinkResult<()> {
        let stop = self
            .axis
            .protocol
            .stop_command(self.axis_id)
            .ok_or_else(|| LinkError::Unsupported(format!("{} has no stop command", self.axis.name)))?;

        info!("Halting axis");
        self.engine.send(&stop).await
    }

    /// Current position.
    ///
    /// Idle axes are queried. In-flight axes return the cached position
    /// unless the protocol allows queries while moving; such a query also
    /// accepts the motion's completion frame in place of the position reply,
    /// in which case the motion is completed and the position it carries is
    /// returned.
    #[instrument(skip(self), fields(axis = %self.axis.name))]
    pub async fn position(&self) -> LinkResult<i64> {
        self.reap();
        let (in_flight, generation) = {
            let slot = self.axis.slot.lock();
            let in_flight = match &slot.state {
                MotionState::InFlight(request) => Some(request.clone()),
                _ => None,
            };
            (in_flight, slot.generation)
        };
        let protocol = &self.axis.protocol;

        let Some(mut query) = protocol.position_command(self.axis_id) else {
            return self
                .last_known_position()
                .ok_or_else(|| LinkError::Unsupported(format!("{} has no position query", self.axis.name)));
        };

        if let Some(request) = &in_flight {
            if !protocol.supports_query_while_moving() {
                return self
                    .last_known_position()
                    .ok_or_else(|| LinkError::Busy(self.axis.name.clone()));
            }
            if let Some(completion) = protocol.completion_signatures(request) {
                query.expect = query.expect.or_any(&completion);
            }
        }

        let reply = self.engine.execute(&query, self.config.query_timeout).await?;

        if let Some(request) = &in_flight {
            if protocol.is_completion(request, &reply) {
                debug!("Position query overtaken by motion completion");
                let position = protocol.final_position(request, &reply);
                self.axis.complete(Some(generation), reply);
                return position
                    .or_else(|| self.last_known_position())
                    .ok_or_else(|| LinkError::malformed(&query.label, "completion carries no position"));
            }
            if *query.expect.primary() != reply.signature() {
                // Someone else's completion; hand it on and ask again.
                self.engine.dispatch(&reply);
                if let Some(plain) = protocol.position_command(self.axis_id) {
                    query = plain;
                }
                let reply = self.engine.execute(&query, self.config.query_timeout).await?;
                return self.cache_position(&query, &reply);
            }
            if !self.axis.is_current(generation) {
                // The motion settled behind this reply; its final position is newer.
                return self
                    .axis
                    .protocol
                    .position_from(&reply)
                    .ok_or_else(|| LinkError::malformed(&query.label, "reply carries no position"));
            }
        }

        self.cache_position(&query, &reply)
    }

    fn cache_position(&self, query: &Command<RequestOf<P>>, reply: &ReplyOf<P>) -> LinkResult<i64> {
        let position = self
            .axis
            .protocol
            .position_from(reply)
            .ok_or_else(|| LinkError::malformed(&query.label, "reply carries no position"))?;
        self.axis.set_position(position);
        Ok(position)
    }

    /// Turn a motion task that ended without settling the state into
    /// `Failed(TaskFailed)`.
    fn reap(&self) {
        let finished = {
            let task = self.task.lock();
            match task.as_ref() {
                Some((generation, handle)) if handle.is_finished() => Some(*generation),
                _ => None,
            }
        };
        if let Some(generation) = finished {
            self.axis.fail(
                generation,
                LinkError::TaskFailed(format!("motion task for {} ended without an outcome", self.axis.name)),
            );
        }
    }
}

impl<P: MotionProtocol> Drop for MotionCoordinator<P> {
    fn drop(&mut self) {
        self.engine.remove_observer(self.observer);
        if let Some((_, handle)) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl<P: MotionProtocol> BusySource for MotionCoordinator<P> {
    async fn is_busy(&self) -> bool {
        self.is_moving()
    }
}

// =============================================================================
// Motion task
// =============================================================================

async fn run_motion<P: MotionProtocol>(
    axis: Arc<Axis<P>>,
    engine: Arc<CommandEngine<P::Codec>>,
    config: MotionConfig,
    request: MotionRequest,
    command: Command<RequestOf<P>>,
    generation: u64,
) {
    match drive(&axis, &engine, &config, &request, &command, generation).await {
        Ok(Some(reply)) => {
            axis.complete(Some(generation), reply);
        }
        Ok(None) => debug!(axis = %axis.name, "Motion settled by another context"),
        Err(e) => {
            let timed_out = matches!(e, LinkError::Timeout { .. });
            axis.fail(generation, e);
            if timed_out {
                if let Err(purge_err) = engine.purge().await {
                    warn!(axis = %axis.name, error = %purge_err, "Purge after motion timeout failed");
                }
            }
        }
    }
}

/// Returns the completing reply, or `None` if another context settled the
/// motion first.
async fn drive<P: MotionProtocol>(
    axis: &Axis<P>,
    engine: &CommandEngine<P::Codec>,
    config: &MotionConfig,
    request: &MotionRequest,
    command: &Command<RequestOf<P>>,
    generation: u64,
) -> LinkResult<Option<ReplyOf<P>>> {
    let protocol = &axis.protocol;
    let deadline = Instant::now() + request.timeout;

    match protocol.completion(request) {
        Completion::OnReply => {
            engine.send(command).await?;
            let expect = command.expect.clone();
            await_completion(axis, engine, config, request, generation, &expect, deadline, &command.label).await
        }
        Completion::Notified(expect) => {
            engine.send(command).await?;
            await_completion(axis, engine, config, request, generation, &expect, deadline, &command.label).await
        }
        Completion::Acknowledged(expect) => {
            let ack = engine.execute(command, remaining(deadline)).await?;
            if protocol.is_completion(request, &ack) {
                return Ok(Some(ack));
            }
            await_completion(axis, engine, config, request, generation, &expect, deadline, &command.label).await
        }
        Completion::Polled => {
            engine.execute(command, remaining(deadline)).await?;
            poll_completion(axis, engine, config, request, generation, deadline, &command.label).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn await_completion<P: MotionProtocol>(
    axis: &Axis<P>,
    engine: &CommandEngine<P::Codec>,
    config: &MotionConfig,
    request: &MotionRequest,
    generation: u64,
    expect: &SignatureSet,
    deadline: Instant,
    label: &str,
) -> LinkResult<Option<ReplyOf<P>>> {
    let protocol = &axis.protocol;
    loop {
        if !axis.is_current(generation) {
            return Ok(None);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(LinkError::timeout(label, request.timeout));
        }

        let window = config.poll_interval.min(deadline - now);
        let frame = engine
            .await_frame_where(
                |frame: &ReplyOf<P>| {
                    expect.matches(&frame.signature())
                        && (frame.rejection().is_some() || protocol.is_completion(request, frame))
                },
                window,
            )
            .await?;

        if let Some(frame) = frame {
            if let Some(reason) = frame.rejection() {
                return Err(LinkError::rejected(label, reason));
            }
            return Ok(Some(frame));
        }
    }
}

async fn poll_completion<P: MotionProtocol>(
    axis: &Axis<P>,
    engine: &CommandEngine<P::Codec>,
    config: &MotionConfig,
    request: &MotionRequest,
    generation: u64,
    deadline: Instant,
    label: &str,
) -> LinkResult<Option<ReplyOf<P>>> {
    let protocol = &axis.protocol;
    let status = protocol.status_command(request.axis).ok_or_else(|| {
        LinkError::Unsupported(format!("{} cannot poll for completion without a status command", axis.name))
    })?;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(LinkError::timeout(label, request.timeout));
        }
        tokio::time::sleep(config.poll_interval.min(deadline - now)).await;

        if !axis.is_current(generation) {
            return Ok(None);
        }
        if Instant::now() >= deadline {
            return Err(LinkError::timeout(label, request.timeout));
        }

        match engine
            .execute(&status, config.query_timeout.min(remaining(deadline)))
            .await
        {
            Ok(reply) if protocol.is_completion(request, &reply) => return Ok(Some(reply)),
            Ok(reply) => {
                if let Some(position) = protocol.position_from(&reply) {
                    axis.set_position(position);
                }
            }
            Err(e @ (LinkError::Timeout { .. } | LinkError::UnexpectedResponse { .. } | LinkError::MalformedResponse { .. })) => {
                debug!(axis = %axis.name, error = %e, "Status poll failed, polling again");
            }
            Err(e) => return Err(e),
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BinaryCodec, BinaryFrame};
    use crate::command::Signature;
    use link_core::{mock_serial, SharedTransport};

    const MOVE_COMPLETED: u16 = 0x0464;
    const MOVE_STOPPED: u16 = 0x0466;

    struct Stage {
        stoppable: bool,
        query_while_moving: bool,
    }

    impl Default for Stage {
        fn default() -> Self {
            Self {
                stoppable: true,
                query_while_moving: true,
            }
        }
    }

    impl MotionProtocol for Stage {
        type Codec = BinaryCodec;

        fn move_command(&self, request: &MotionRequest) -> LinkResult<Command<BinaryFrame>> {
            let MotionKind::Absolute(target) = request.kind else {
                return Err(LinkError::Unsupported("test stage only moves absolute".into()));
            };
            let mut payload = u16::from(request.axis).to_le_bytes().to_vec();
            payload.extend_from_slice(&(target as i32).to_le_bytes());
            Ok(Command::new(
                "move_absolute",
                BinaryFrame::with_payload(0x0453, 0x50, 0x01, payload),
                Signature::Opcode(MOVE_COMPLETED),
            ))
        }

        fn completion(&self, _request: &MotionRequest) -> Completion {
            Completion::Notified(
                SignatureSet::new(Signature::Opcode(MOVE_COMPLETED)).or(Signature::Opcode(MOVE_STOPPED)),
            )
        }

        fn position_command(&self, axis: u8) -> Option<Command<BinaryFrame>> {
            Some(Command::new(
                "req_position",
                BinaryFrame::header(0x0411, axis, 0, 0x50, 0x01),
                Signature::Opcode(0x0412),
            ))
        }

        fn position_from(&self, reply: &BinaryFrame) -> Option<i64> {
            reply.payload_i32(2).map(i64::from)
        }

        fn stop_command(&self, axis: u8) -> Option<Command<BinaryFrame>> {
            self.stoppable.then(|| {
                Command::new(
                    "stop",
                    BinaryFrame::header(0x0465, axis, 0x02, 0x50, 0x01),
                    Signature::Opcode(MOVE_STOPPED),
                )
            })
        }

        fn supports_query_while_moving(&self) -> bool {
            self.query_while_moving
        }

        fn is_completion(&self, request: &MotionRequest, reply: &BinaryFrame) -> bool {
            matches!(reply.opcode, MOVE_COMPLETED | MOVE_STOPPED)
                && reply.payload_u16(0) == Some(u16::from(request.axis))
        }
    }

    fn status_frame(opcode: u16, channel: u8, position: i32) -> Vec<u8> {
        let mut payload = u16::from(channel).to_le_bytes().to_vec();
        payload.extend_from_slice(&position.to_le_bytes());
        payload.extend_from_slice(&[0; 8]);
        BinaryCodec::apt().encode(&BinaryFrame::with_payload(opcode, 0x01, 0x50, payload))
    }

    fn position_frame(channel: u8, position: i32) -> Vec<u8> {
        let mut payload = u16::from(channel).to_le_bytes().to_vec();
        payload.extend_from_slice(&position.to_le_bytes());
        BinaryCodec::apt().encode(&BinaryFrame::with_payload(0x0412, 0x01, 0x50, payload))
    }

    fn config() -> MotionConfig {
        MotionConfig {
            poll_interval: Duration::from_millis(20),
            query_timeout: Duration::from_millis(200),
        }
    }

    fn setup(stage: Stage) -> (MotionCoordinator<Stage>, mock_serial::MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let transport = SharedTransport::serial("mock", port, Duration::ZERO);
        let engine = Arc::new(CommandEngine::new(transport, BinaryCodec::apt()));
        let coordinator = MotionCoordinator::new("stage", 1, engine, Arc::new(stage), config());
        (coordinator, harness)
    }

    #[tokio::test]
    async fn test_notified_completion() {
        let (stage, mut harness) = setup(Stage::default());

        stage
            .start_move(MotionRequest::absolute(1, 20_000, Duration::from_secs(2)))
            .unwrap();
        assert!(stage.is_moving());

        let written = harness.recv_write().await.unwrap();
        assert_eq!(&written[..2], &[0x53, 0x04]);
        harness.send_response(&status_frame(MOVE_COMPLETED, 1, 20_000)).unwrap();

        let reply = stage.wait_for_outcome(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.opcode, MOVE_COMPLETED);
        assert_eq!(stage.last_known_position(), Some(20_000));
        assert_eq!(stage.state(), MotionPhase::Idle);
    }

    #[tokio::test]
    async fn test_second_start_move_is_busy() {
        let (stage, mut harness) = setup(Stage::default());
        let request = MotionRequest::absolute(1, 500, Duration::from_secs(2));

        stage.start_move(request.clone()).unwrap();
        let err = stage.start_move(request).unwrap_err();
        assert!(matches!(err, LinkError::Busy(_)));

        harness.recv_write().await.unwrap();
        harness.send_response(&status_frame(MOVE_COMPLETED, 1, 500)).unwrap();
        stage.wait_for_outcome(Duration::from_secs(2)).await.unwrap();

        assert_eq!(stage.engine().transport().stats().peak_holders, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_move_admits_one() {
        const CALLERS: usize = 8;
        let (stage, mut harness) = setup(Stage::default());
        let stage = Arc::new(stage);
        let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let stage = stage.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    stage.start_move(MotionRequest::absolute(1, 700, Duration::from_secs(2)))
                })
            })
            .collect();

        let mut started = 0;
        let mut busy = 0;
        for caller in callers {
            match caller.await.unwrap() {
                Ok(()) => started += 1,
                Err(LinkError::Busy(_)) => busy += 1,
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(busy, CALLERS - 1);

        let written = harness.recv_write().await.unwrap();
        assert_eq!(&written[..2], &[0x53, 0x04]);
        harness.expect_silence(Duration::from_millis(50)).await;

        harness.send_response(&status_frame(MOVE_COMPLETED, 1, 700)).unwrap();
        stage.wait_for_outcome(Duration::from_secs(2)).await.unwrap();
        assert_eq!(stage.engine().transport().stats().peak_holders, 1);
    }

    #[tokio::test]
    async fn test_position_query_settles_completion_race() {
        let (stage, mut harness) = setup(Stage::default());
        stage
            .start_move(MotionRequest::absolute(1, 20_000, Duration::from_secs(2)))
            .unwrap();
        harness.recv_write().await.unwrap();

        let device = tokio::spawn(async move {
            let query = harness.recv_write().await.unwrap();
            assert_eq!(&query[..2], &[0x11, 0x04]);
            harness.send_response(&status_frame(MOVE_COMPLETED, 1, 20_000)).unwrap();
            harness
        });

        assert_eq!(stage.position().await.unwrap(), 20_000);
        assert_eq!(stage.state(), MotionPhase::Completed);
        assert!(stage.take_outcome().unwrap().is_ok());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_split_behind_position_reply() {
        let (stage, mut harness) = setup(Stage::default());
        stage
            .start_move(MotionRequest::absolute(1, 20_000, Duration::from_secs(1)))
            .unwrap();
        harness.recv_write().await.unwrap();

        let device = tokio::spawn(async move {
            let query = harness.recv_write().await.unwrap();
            assert_eq!(&query[..2], &[0x11, 0x04]);
            let completion = status_frame(MOVE_COMPLETED, 1, 20_000);
            let mut first = position_frame(1, 19_990);
            first.extend_from_slice(&completion[..6]);
            harness.send_response(&first).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            harness.send_response(&completion[6..]).unwrap();
            harness
        });

        assert_eq!(stage.position().await.unwrap(), 19_990);
        let reply = stage.wait_for_outcome(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.opcode, MOVE_COMPLETED);
        assert_eq!(stage.last_known_position(), Some(20_000));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_position_when_idle_queries_device() {
        let (stage, mut harness) = setup(Stage::default());
        let device = tokio::spawn(async move {
            harness.recv_write().await.unwrap();
            harness.send_response(&position_frame(1, -42)).unwrap();
            harness
        });

        assert_eq!(stage.position().await.unwrap(), -42);
        assert_eq!(stage.last_known_position(), Some(-42));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_position_refused_while_moving_without_query_support() {
        let (stage, mut harness) = setup(Stage {
            query_while_moving: false,
            ..Stage::default()
        });
        stage
            .start_move(MotionRequest::absolute(1, 10, Duration::from_secs(2)))
            .unwrap();
        harness.recv_write().await.unwrap();

        let err = stage.position().await.unwrap_err();
        assert!(matches!(err, LinkError::Busy(_)));

        harness.send_response(&status_frame(MOVE_COMPLETED, 1, 10)).unwrap();
        stage.wait_for_outcome(Duration::from_secs(2)).await.unwrap();
        assert_eq!(stage.last_known_position(), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_timeout_fails() {
        let (stage, mut harness) = setup(Stage::default());
        stage
            .start_move(MotionRequest::absolute(1, 10, Duration::from_millis(200)))
            .unwrap();
        harness.recv_write().await.unwrap();

        let err = stage.wait_for_outcome(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert_eq!(stage.state(), MotionPhase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_sends_stop() {
        let (stage, mut harness) = setup(Stage::default());
        stage
            .start_move(MotionRequest::absolute(1, 10_000, Duration::from_secs(2)))
            .unwrap();
        harness.recv_write().await.unwrap();

        stage.cancel().await.unwrap();
        harness.expect_write(&[0x65, 0x04, 0x01, 0x02, 0x50, 0x01]).await;
        harness.send_response(&status_frame(MOVE_STOPPED, 1, 4_321)).unwrap();

        let reply = stage.wait_for_outcome(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.opcode, MOVE_STOPPED);
        assert_eq!(stage.last_known_position(), Some(4_321));
    }

    #[tokio::test]
    async fn test_cancel_without_stop_command() {
        let (stage, mut harness) = setup(Stage {
            stoppable: false,
            ..Stage::default()
        });
        assert!(stage.cancel().await.is_ok());

        stage
            .start_move(MotionRequest::absolute(1, 10, Duration::from_secs(2)))
            .unwrap();
        harness.recv_write().await.unwrap();
        let err = stage.cancel().await.unwrap_err();
        assert!(matches!(err, LinkError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_halt_sends_stop_when_idle() {
        let (stage, mut harness) = setup(Stage::default());
        stage.halt().await.unwrap();
        harness.expect_write(&[0x65, 0x04, 0x01, 0x02, 0x50, 0x01]).await;
        assert_eq!(stage.state(), MotionPhase::Idle);
    }

    #[tokio::test]
    async fn test_request_for_other_axis_is_rejected() {
        let (stage, _harness) = setup(Stage::default());
        let err = stage
            .start_move(MotionRequest::absolute(2, 10, Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
        assert_eq!(stage.state(), MotionPhase::Idle);
    }

    #[tokio::test]
    async fn test_unsupported_move_is_refused_up_front() {
        let (stage, _harness) = setup(Stage::default());
        let err = stage
            .start_move(MotionRequest::home(1, Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, LinkError::Unsupported(_)));
        assert_eq!(stage.state(), MotionPhase::Idle);
    }

    #[tokio::test]
    async fn test_wait_without_motion() {
        let (stage, _harness) = setup(Stage::default());
        let err = stage.wait_for_outcome(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, LinkError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn test_completion_for_other_channel_reaches_its_axis() {
        let (port, mut harness) = mock_serial::new();
        let transport = SharedTransport::serial("mock", port, Duration::ZERO);
        let engine = Arc::new(CommandEngine::new(transport, BinaryCodec::apt()));
        let protocol = Arc::new(Stage::default());
        let first = MotionCoordinator::new("x", 1, engine.clone(), protocol.clone(), config());
        let second = MotionCoordinator::new("y", 2, engine, protocol, config());

        first
            .start_move(MotionRequest::absolute(1, 100, Duration::from_secs(2)))
            .unwrap();
        second
            .start_move(MotionRequest::absolute(2, 200, Duration::from_secs(2)))
            .unwrap();
        harness.recv_write().await.unwrap();
        harness.recv_write().await.unwrap();

        harness.send_response(&status_frame(MOVE_COMPLETED, 2, 200)).unwrap();
        second.wait_for_outcome(Duration::from_secs(2)).await.unwrap();
        assert_eq!(second.last_known_position(), Some(200));
        assert!(first.is_moving());

        harness.send_response(&status_frame(MOVE_COMPLETED, 1, 100)).unwrap();
        first.wait_for_outcome(Duration::from_secs(2)).await.unwrap();
        assert_eq!(first.last_known_position(), Some(100));
    }
}
