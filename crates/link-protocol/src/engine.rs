//! Command/Response engine.
//!
//! [`CommandEngine`] drives one round trip at a time over a
//! [`SharedTransport`]: take ownership, purge stale input, write the encoded
//! command, then accumulate bytes until the codec yields a frame or the
//! timeout elapses. The reply's signature is checked against the command's
//! signature set before it is returned.
//!
//! # Unsolicited frames
//!
//! Devices talk without being asked: motion-complete notifications, alerts,
//! late replies to abandoned commands. Such frames are offered to registered
//! [`FrameObserver`]s wherever the engine runs into them (purged input, frames
//! read while waiting for a different reply, bytes left over after a reply).
//! A frame nobody claims is discarded, or, if it arrived in place of the
//! expected reply, reported as [`LinkError::UnexpectedResponse`].
//!
//! # Retries
//!
//! The engine never retries. Replaying a command the device may already have
//! acted on (a relative move, a shutter toggle) is the caller's decision.

use crate::codec::{Decoded, FrameCodec, Hex};
use crate::command::{Command, Reply, SignatureSet};
use link_core::{LinkError, LinkResult, SharedTransport, TransportOwnership};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Timing knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget used by [`CommandEngine::execute_default`].
    pub default_timeout: Duration,
    /// Pause between reads when nothing has arrived.
    pub read_poll: Duration,
    /// Extra time a partial frame gets to complete at the end of a poll step.
    pub frame_timeout: Duration,
    /// Largest single read from the transport.
    pub read_chunk: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(500),
            read_poll: Duration::from_millis(2),
            frame_timeout: Duration::from_millis(50),
            read_chunk: 256,
        }
    }
}

/// Something that may claim frames the engine did not ask for.
pub trait FrameObserver<R>: Send + Sync {
    /// Return `true` to claim `frame`; claimed frames are not passed on.
    fn offer(&self, frame: &R) -> bool;
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observers<R> = Vec<(ObserverId, Arc<dyn FrameObserver<R>>)>;

/// Request/response engine for one codec over one shared transport.
///
/// Axes sharing a port should share one engine so that each axis's observer
/// sees the frames read on behalf of the others.
pub struct CommandEngine<C: FrameCodec> {
    transport: SharedTransport,
    codec: C,
    config: EngineConfig,
    observers: RwLock<Observers<C::Reply>>,
    next_observer: AtomicU64,
}

impl<C: FrameCodec> std::fmt::Debug for CommandEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEngine")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl<C: FrameCodec> CommandEngine<C> {
    /// Engine with default timing.
    pub fn new(transport: SharedTransport, codec: C) -> Self {
        Self::with_config(transport, codec, EngineConfig::default())
    }

    pub fn with_config(transport: SharedTransport, codec: C, config: EngineConfig) -> Self {
        Self {
            transport,
            codec,
            config,
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an observer for unsolicited frames.
    pub fn register_observer(&self, observer: Arc<dyn FrameObserver<C::Reply>>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Remove an observer; returns whether it was registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    // =========================================================================
    // Round trips
    // =========================================================================

    /// Send `command` and wait up to `timeout` for a reply matching its
    /// signature set.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Timeout`] if no complete frame arrived in time
    /// - [`LinkError::MalformedResponse`] if the codec rejected the bytes
    /// - [`LinkError::UnexpectedResponse`] for an unclaimed frame with the
    ///   wrong signature
    /// - [`LinkError::Rejected`] if the device refused the command
    /// - [`LinkError::Io`] on transport failure
    #[instrument(skip_all, fields(port = %self.transport.name(), command = %command.label))]
    pub async fn execute(
        &self,
        command: &Command<C::Request>,
        timeout: Duration,
    ) -> LinkResult<C::Reply> {
        let mut owned = self.transport.acquire().await;
        let result = self.round_trip(&mut owned, command, timeout).await;

        if let Err(e) = &result {
            warn!(error = %e, kind = %e.kind(), "Round trip failed");
            if matches!(
                e,
                LinkError::Timeout { .. } | LinkError::MalformedResponse { .. }
            ) {
                if let Err(purge_err) = self.purge_owned(&mut owned).await {
                    warn!(error = %purge_err, "Purge after failed round trip also failed");
                }
            }
        }
        result
    }

    /// [`execute`](Self::execute) with the configured default timeout.
    pub async fn execute_default(&self, command: &Command<C::Request>) -> LinkResult<C::Reply> {
        self.execute(command, self.config.default_timeout).await
    }

    async fn round_trip(
        &self,
        owned: &mut TransportOwnership,
        command: &Command<C::Request>,
        timeout: Duration,
    ) -> LinkResult<C::Reply> {
        let wire = self.encode(command)?;
        self.purge_owned(owned).await?;

        debug!(tx = %Hex(&wire), "Sending command");
        owned.write(&wire).await?;

        let started = Instant::now();
        let mut buffer = Vec::new();

        loop {
            let chunk = owned.read_available(self.config.read_chunk).await?;
            let received = !chunk.is_empty();
            buffer.extend_from_slice(&chunk);

            while let Some(reply) = self.next_frame(&mut buffer, &command.label)? {
                let signature = reply.signature();
                if command.expect.matches(&signature) {
                    self.finish_trailing(owned, buffer).await;
                    if let Some(reason) = reply.rejection() {
                        return Err(LinkError::rejected(&command.label, reason));
                    }
                    debug!(
                        signature = %signature,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Reply received"
                    );
                    return Ok(reply);
                }

                if self.dispatch(&reply) {
                    debug!(signature = %signature, "Unsolicited frame claimed by observer");
                    continue;
                }

                return Err(LinkError::UnexpectedResponse {
                    command: command.label.clone(),
                    expected: command.expect.to_string(),
                    received: signature.to_string(),
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LinkError::timeout(&command.label, elapsed));
            }
            if !received {
                tokio::time::sleep(self.config.read_poll.min(timeout - elapsed)).await;
            }
        }
    }

    fn encode(&self, command: &Command<C::Request>) -> LinkResult<Vec<u8>> {
        self.codec
            .check_request(&command.request)
            .map_err(|reason| LinkError::Configuration(format!("{}: {}", command.label, reason)))?;
        Ok(self.codec.encode(&command.request))
    }

    /// Purge, then write `command` without waiting for any reply.
    #[instrument(skip_all, fields(port = %self.transport.name(), command = %command.label))]
    pub async fn send(&self, command: &Command<C::Request>) -> LinkResult<()> {
        let wire = self.encode(command)?;
        let mut owned = self.transport.acquire().await;
        self.purge_owned(&mut owned).await?;

        debug!(tx = %Hex(&wire), "Sending command (no reply expected)");
        owned.write(&wire).await?;
        Ok(())
    }

    /// One owned poll step: read without writing for up to `window`, returning
    /// the first frame that matches `expect`.
    ///
    /// Non-matching frames go to observers. A frame still partial when the
    /// window closes gets up to the configured frame timeout to finish, so a
    /// frame is never split across poll steps. Rejection is not checked here;
    /// the caller decides what a matching frame means.
    pub async fn await_frame(
        &self,
        expect: &SignatureSet,
        window: Duration,
    ) -> LinkResult<Option<C::Reply>> {
        self.await_frame_where(|reply: &C::Reply| expect.matches(&reply.signature()), window)
            .await
    }

    /// [`await_frame`](Self::await_frame) with an arbitrary acceptance test.
    pub async fn await_frame_where<F>(
        &self,
        accept: F,
        window: Duration,
    ) -> LinkResult<Option<C::Reply>>
    where
        F: Fn(&C::Reply) -> bool + Send + Sync,
    {
        let mut owned = self.transport.acquire().await;
        let mut deadline = Instant::now() + window;
        let mut extended = false;
        let mut buffer = Vec::new();

        loop {
            let chunk = owned.read_available(self.config.read_chunk).await?;
            let received = !chunk.is_empty();
            buffer.extend_from_slice(&chunk);

            loop {
                match self.codec.try_decode(&buffer) {
                    Decoded::Incomplete => break,
                    Decoded::Invalid(reason) => {
                        warn!(port = %self.transport.name(), %reason, "Discarding malformed input while polling");
                        buffer.clear();
                        self.purge_owned(&mut owned).await?;
                        break;
                    }
                    Decoded::Frame { consumed, reply } => {
                        buffer.drain(..consumed);
                        if accept(&reply) {
                            self.finish_trailing(&mut owned, buffer).await;
                            return Ok(Some(reply));
                        }
                        if !self.dispatch(&reply) {
                            debug!(signature = %reply.signature(), "Discarding unsolicited frame");
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if buffer.is_empty() {
                    return Ok(None);
                }
                if extended {
                    warn!(
                        port = %self.transport.name(),
                        bytes = buffer.len(),
                        "Dropping frame that did not complete within the frame timeout"
                    );
                    return Ok(None);
                }
                deadline = now + self.config.frame_timeout;
                extended = true;
                continue;
            }
            if !received {
                tokio::time::sleep(self.config.read_poll.min(deadline - now)).await;
            }
        }
    }

    /// Take ownership and purge pending input, offering it to observers.
    pub async fn purge(&self) -> LinkResult<()> {
        let mut owned = self.transport.acquire().await;
        self.purge_owned(&mut owned).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn purge_owned(&self, owned: &mut TransportOwnership) -> LinkResult<()> {
        let stale = owned.purge().await?;
        if !stale.is_empty() {
            debug!(port = %self.transport.name(), bytes = stale.len(), "Purged stale input");
            self.offer_stale(&stale);
        }
        Ok(())
    }

    fn next_frame(&self, buffer: &mut Vec<u8>, label: &str) -> LinkResult<Option<C::Reply>> {
        match self.codec.try_decode(buffer) {
            Decoded::Incomplete => Ok(None),
            Decoded::Invalid(reason) => Err(LinkError::malformed(label, reason)),
            Decoded::Frame { consumed, reply } => {
                buffer.drain(..consumed);
                Ok(Some(reply))
            }
        }
    }

    /// Offer the frames that arrived behind a reply to the observers, while
    /// still owning the transport. A trailing partial frame gets up to the
    /// frame timeout to complete. Failures here are logged only: the reply
    /// itself has already been received.
    async fn finish_trailing(&self, owned: &mut TransportOwnership, mut buffer: Vec<u8>) {
        let deadline = Instant::now() + self.config.frame_timeout;
        loop {
            match self.codec.try_decode(&buffer) {
                Decoded::Frame { consumed, reply } => {
                    buffer.drain(..consumed);
                    if !self.dispatch(&reply) {
                        debug!(signature = %reply.signature(), "Discarding trailing frame");
                    }
                }
                Decoded::Invalid(reason) => {
                    debug!(%reason, bytes = buffer.len(), "Discarding malformed trailing input");
                    return;
                }
                Decoded::Incomplete if buffer.is_empty() => return,
                Decoded::Incomplete => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            port = %self.transport.name(),
                            bytes = buffer.len(),
                            "Dropping trailing frame that did not complete within the frame timeout"
                        );
                        return;
                    }
                    match owned.read_available(self.config.read_chunk).await {
                        Ok(chunk) if chunk.is_empty() => {
                            tokio::time::sleep(self.config.read_poll.min(deadline - now)).await;
                        }
                        Ok(chunk) => buffer.extend_from_slice(&chunk),
                        Err(e) => {
                            warn!(error = %e, "Read failed while completing a trailing frame");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Decode whole frames out of `bytes` and offer each to observers.
    /// Trailing partial or malformed data is dropped.
    fn offer_stale(&self, bytes: &[u8]) {
        let mut rest = bytes;
        while let Decoded::Frame { consumed, reply } = self.codec.try_decode(rest) {
            rest = &rest[consumed..];
            if !self.dispatch(&reply) {
                debug!(signature = %reply.signature(), "Discarding stale frame");
            }
        }
    }

    /// Offer `frame` to the registered observers; returns whether one claimed it.
    pub fn dispatch(&self, frame: &C::Reply) -> bool {
        let observers: Vec<_> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        observers.iter().any(|o| o.offer(frame))
    }
}
