//! Sutter Lambda-style shutter and filter wheel controller.
//!
//! Each command is a single byte and each reply a single byte. After a
//! command the controller either echoes the command byte, meaning it is
//! still busy and will send a CR (13) when done, or answers CR straight
//! away. A shutter is then given a configurable settle delay before it is
//! reported idle.
//!
//! Shutter state maps onto motion targets: `Absolute(1)` opens,
//! `Absolute(0)` closes, and the last known position is the last state the
//! controller confirmed.
//!
//! Filter wheels are stages with positions `0..=9`. The command byte packs
//! the position in bits 0-3 and the speed in bits 4-6; bit 7 selects wheel B.
//! Wheel C is addressed by sending [`WHEEL_C_PREFIX`] first.

use crate::capabilities::{CoordinatedStage, Shutter};
use crate::factory::{open_port, shared_engine, Capability, DeviceComponents, DriverContext, DriverFactory};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use link_core::{LinkError, LinkResult};
use link_protocol::codec::{FixedLengthCodec, FixedReply};
use link_protocol::{
    wait_until_idle, BusySource, Command, Completion, CompositeBusy, MotionCoordinator, MotionKind,
    MotionProtocol, MotionRequest, Signature, SignatureSet, SettleTimer,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// Carriage return: "done".
pub const CR: u8 = 13;

const OPEN_A: u8 = 170;
const CLOSE_A: u8 = 172;
const OPEN_B: u8 = 186;
const CLOSE_B: u8 = 188;

/// Byte sent ahead of every wheel C command.
pub const WHEEL_C_PREFIX: u8 = 252;

/// Positions on one filter wheel.
pub const WHEEL_POSITIONS: u8 = 10;

/// Fastest-to-slowest speed settings run from 0 to this value.
pub const MAX_WHEEL_SPEED: u8 = 7;

const WHEEL_B_FLAG: u8 = 0x80;

/// Wire bytes moving `wheel` (0 = A, 1 = B, 2 = C) to `position` at `speed`.
pub fn wheel_command(wheel: u8, speed: u8, position: u8) -> LinkResult<Vec<u8>> {
    if position >= WHEEL_POSITIONS {
        return Err(LinkError::Configuration(format!(
            "wheel position {} out of range 0..{}",
            position, WHEEL_POSITIONS
        )));
    }
    if speed > MAX_WHEEL_SPEED {
        return Err(LinkError::Configuration(format!(
            "wheel speed {} out of range 0..={}",
            speed, MAX_WHEEL_SPEED
        )));
    }
    let byte = speed * 16 + position;
    match wheel {
        0 => Ok(vec![byte]),
        1 => Ok(vec![WHEEL_B_FLAG | byte]),
        2 => Ok(vec![WHEEL_C_PREFIX, byte]),
        _ => Err(LinkError::Configuration(format!("no filter wheel {}", wheel))),
    }
}

/// Command byte for `shutter` (0 = A, 1 = B).
pub fn shutter_command(shutter: u8, open: bool) -> LinkResult<u8> {
    match (shutter, open) {
        (0, true) => Ok(OPEN_A),
        (0, false) => Ok(CLOSE_A),
        (1, true) => Ok(OPEN_B),
        (1, false) => Ok(CLOSE_B),
        _ => Err(LinkError::Configuration(format!("no shutter {}", shutter))),
    }
}

/// Single-byte vocabulary of the controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct LambdaProtocol;

impl MotionProtocol for LambdaProtocol {
    type Codec = FixedLengthCodec;

    fn move_command(&self, request: &MotionRequest) -> LinkResult<Command<Vec<u8>>> {
        let open = match request.kind {
            MotionKind::Absolute(1) => true,
            MotionKind::Absolute(0) => false,
            other => {
                return Err(LinkError::Unsupported(format!(
                    "shutters only open (1) or close (0), not {:?}",
                    other
                )))
            }
        };
        let byte = shutter_command(request.axis, open)?;
        let label = if open { "shutter_open" } else { "shutter_close" };
        Ok(Command::new(label, vec![byte], Signature::Byte(byte)).or_reply(Signature::Byte(CR)))
    }

    fn completion(&self, _request: &MotionRequest) -> Completion {
        Completion::Acknowledged(SignatureSet::new(Signature::Byte(CR)))
    }

    fn position_command(&self, _axis: u8) -> Option<Command<Vec<u8>>> {
        None
    }

    fn position_from(&self, _reply: &FixedReply) -> Option<i64> {
        None
    }

    fn stop_command(&self, _axis: u8) -> Option<Command<Vec<u8>>> {
        None
    }

    fn is_completion(&self, _request: &MotionRequest, reply: &FixedReply) -> bool {
        reply.lead() == CR
    }
}

/// One filter wheel of a Lambda controller, moved at a fixed speed.
#[derive(Debug, Clone, Copy)]
pub struct LambdaWheel {
    wheel: u8,
    speed: u8,
}

impl LambdaWheel {
    pub fn new(wheel: u8, speed: u8) -> LinkResult<Self> {
        // Validates both settings up front.
        wheel_command(wheel, speed, 0)?;
        Ok(Self { wheel, speed })
    }

    pub fn wheel(&self) -> u8 {
        self.wheel
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }
}

impl MotionProtocol for LambdaWheel {
    type Codec = FixedLengthCodec;

    fn move_command(&self, request: &MotionRequest) -> LinkResult<Command<Vec<u8>>> {
        let position = match request.kind {
            MotionKind::Absolute(target) => u8::try_from(target)
                .ok()
                .filter(|p| *p < WHEEL_POSITIONS)
                .ok_or_else(|| {
                    LinkError::Unsupported(format!(
                        "filter wheel positions are 0..{}, not {}",
                        WHEEL_POSITIONS, target
                    ))
                })?,
            other => {
                return Err(LinkError::Unsupported(format!(
                    "filter wheels only move to absolute positions, not {:?}",
                    other
                )))
            }
        };
        let wire = wheel_command(self.wheel, self.speed, position)?;
        // Echo is the command byte itself, never the wheel C prefix.
        let byte = wire[wire.len() - 1];

        let mut command = Command::new("wheel_move", wire, Signature::Byte(byte)).or_reply(Signature::Byte(CR));
        if self.wheel == 2 {
            // The prefix may be echoed ahead of the command byte.
            command = command.or_reply(Signature::Byte(WHEEL_C_PREFIX));
        }
        Ok(command)
    }

    fn completion(&self, _request: &MotionRequest) -> Completion {
        Completion::Acknowledged(SignatureSet::new(Signature::Byte(CR)))
    }

    fn position_command(&self, _axis: u8) -> Option<Command<Vec<u8>>> {
        None
    }

    fn position_from(&self, _reply: &FixedReply) -> Option<i64> {
        None
    }

    fn stop_command(&self, _axis: u8) -> Option<Command<Vec<u8>>> {
        None
    }

    fn is_completion(&self, _request: &MotionRequest, reply: &FixedReply) -> bool {
        reply.lead() == CR
    }
}

/// A filter wheel as a [`Stage`](crate::Stage).
pub type LambdaWheelStage = CoordinatedStage<LambdaWheel>;

/// One shutter of a Lambda controller.
pub struct LambdaShutter {
    coordinator: Arc<MotionCoordinator<LambdaProtocol>>,
    settle: Arc<SettleTimer>,
    busy: CompositeBusy,
    poll_interval: Duration,
    timeout: Duration,
}

impl LambdaShutter {
    /// Busy while the controller is working on a command or within `settle`
    /// of the last accepted command.
    pub fn new(coordinator: MotionCoordinator<LambdaProtocol>, settle: Duration, timeout: Duration) -> Self {
        let poll_interval = coordinator.config().poll_interval;
        let coordinator = Arc::new(coordinator);
        let settle = Arc::new(SettleTimer::new(settle));
        let busy = CompositeBusy::new()
            .with(coordinator.clone())
            .with(settle.clone());

        Self {
            coordinator,
            settle,
            busy,
            poll_interval,
            timeout,
        }
    }

    pub fn settle_timer(&self) -> &SettleTimer {
        &self.settle
    }

    pub fn coordinator(&self) -> &MotionCoordinator<LambdaProtocol> {
        &self.coordinator
    }
}

#[async_trait]
impl Shutter for LambdaShutter {
    #[instrument(skip(self), fields(shutter = %self.coordinator.name()))]
    async fn set_open(&self, open: bool) -> LinkResult<()> {
        if self.coordinator.is_moving() {
            wait_until_idle(self.coordinator.as_ref(), self.poll_interval, self.timeout).await?;
        }
        if let Some(Err(previous)) = self.coordinator.take_outcome() {
            warn!(error = %previous, "Previous shutter command had failed");
        }

        let request = MotionRequest::absolute(self.coordinator.axis_id(), i64::from(open), self.timeout);
        self.coordinator.start_move(request)?;
        self.settle.mark();

        self.coordinator.wait_for_outcome(self.timeout).await?;
        Ok(())
    }

    fn is_open(&self) -> Option<bool> {
        self.coordinator.last_known_position().map(|state| state != 0)
    }

    async fn is_busy(&self) -> bool {
        self.busy.is_busy().await
    }

    async fn wait_until_idle(&self, timeout: Duration) -> LinkResult<()> {
        wait_until_idle(&self.busy, self.poll_interval, timeout).await
    }
}

// =============================================================================
// LambdaFactory - DriverFactory implementation
// =============================================================================

/// Configuration for one Lambda shutter.
#[derive(Debug, Clone, Deserialize)]
pub struct LambdaConfig {
    /// Serial port path (e.g., "/dev/ttyUSB2")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// "A" or "B"
    #[serde(default = "default_shutter")]
    pub shutter: String,
    /// Extra time the shutter is reported busy after each command
    #[serde(default)]
    pub settle_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_shutter() -> String {
    "A".to_string()
}

fn shutter_index(name: &str) -> Result<u8> {
    match name {
        "A" | "a" => Ok(0),
        "B" | "b" => Ok(1),
        other => anyhow::bail!("unknown shutter '{}', expected A or B", other),
    }
}

/// Factory for Lambda shutters.
pub struct LambdaFactory;

static LAMBDA_CAPABILITIES: &[Capability] = &[Capability::Shutter];

impl DriverFactory for LambdaFactory {
    fn driver_type(&self) -> &'static str {
        "lambda"
    }

    fn name(&self) -> &'static str {
        "Sutter Lambda shutter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        LAMBDA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: LambdaConfig = config.clone().try_into()?;
        shutter_index(&cfg.shutter)?;
        Ok(())
    }

    fn build(&self, config: toml::Value, context: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: LambdaConfig = config.try_into().context("Invalid Lambda config")?;
            let shutter = shutter_index(&cfg.shutter)?;
            let transport = open_port(&cfg.port, cfg.baud_rate, context.purge_window).await?;
            let engine = shared_engine(&transport, || FixedLengthCodec::new(1), &context.engine);

            let coordinator = MotionCoordinator::new(
                format!("{}:{}", cfg.port, cfg.shutter),
                shutter,
                engine,
                Arc::new(LambdaProtocol),
                context.motion,
            );

            Ok(DeviceComponents {
                shutter: Some(Arc::new(LambdaShutter::new(
                    coordinator,
                    Duration::from_millis(cfg.settle_ms),
                    context.operation_timeout,
                ))),
                ..Default::default()
            })
        })
    }
}

/// Configuration for one Lambda filter wheel.
#[derive(Debug, Clone, Deserialize)]
pub struct LambdaWheelConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// "A", "B" or "C"
    #[serde(default = "default_wheel")]
    pub wheel: String,
    /// 0 (fastest) to 7
    #[serde(default = "default_wheel_speed")]
    pub speed: u8,
}

fn default_wheel() -> String {
    "A".to_string()
}

fn default_wheel_speed() -> u8 {
    3
}

fn wheel_index(name: &str) -> Result<u8> {
    match name {
        "A" | "a" => Ok(0),
        "B" | "b" => Ok(1),
        "C" | "c" => Ok(2),
        other => anyhow::bail!("unknown filter wheel '{}', expected A, B or C", other),
    }
}

/// Factory for Lambda filter wheels.
pub struct LambdaWheelFactory;

static LAMBDA_WHEEL_CAPABILITIES: &[Capability] = &[Capability::Stage];

impl DriverFactory for LambdaWheelFactory {
    fn driver_type(&self) -> &'static str {
        "lambda_wheel"
    }

    fn name(&self) -> &'static str {
        "Sutter Lambda filter wheel"
    }

    fn capabilities(&self) -> &'static [Capability] {
        LAMBDA_WHEEL_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: LambdaWheelConfig = config.clone().try_into()?;
        LambdaWheel::new(wheel_index(&cfg.wheel)?, cfg.speed)?;
        Ok(())
    }

    fn build(&self, config: toml::Value, context: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: LambdaWheelConfig = config.try_into().context("Invalid Lambda wheel config")?;
            let protocol = LambdaWheel::new(wheel_index(&cfg.wheel)?, cfg.speed)?;
            let transport = open_port(&cfg.port, cfg.baud_rate, context.purge_window).await?;
            // Same codec as the shutters, so both share the controller's engine.
            let engine = shared_engine(&transport, || FixedLengthCodec::new(1), &context.engine);

            let coordinator = MotionCoordinator::new(
                format!("{}:wheel-{}", cfg.port, cfg.wheel),
                protocol.wheel(),
                engine,
                Arc::new(protocol),
                context.motion,
            );

            Ok(DeviceComponents {
                stage: Some(Arc::new(LambdaWheelStage::new(coordinator))),
                ..Default::default()
            })
        })
    }
}
