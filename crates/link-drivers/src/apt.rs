//! Thorlabs APT stage (binary protocol).
//!
//! Messages use the 6-byte APT header. Moves and position replies carry a
//! data packet, flagged by `0x80` in the destination byte:
//!
//! | Message | Id | Payload |
//! |---------|----|---------|
//! | `MOT_MOVE_ABSOLUTE` | `0x0453` | `u16` channel, `i32` position |
//! | `MOT_MOVE_RELATIVE` | `0x0448` | `u16` channel, `i32` distance |
//! | `MOT_MOVE_HOME` | `0x0443` | header only, param1 = channel |
//! | `MOT_MOVE_STOP` | `0x0465` | header only, param1 = channel, param2 = stop mode |
//! | `MOT_REQ_POSCOUNTER` | `0x0411` | header only |
//! | `MOT_GET_POSCOUNTER` | `0x0412` | `u16` channel, `i32` position |
//! | `MOT_MOVE_COMPLETED` | `0x0464` | 14-byte status, position at bytes 2..6 |
//! | `MOT_MOVE_STOPPED` | `0x0466` | 14-byte status, position at bytes 2..6 |
//! | `MOT_MOVE_HOMED` | `0x0444` | header only, param1 = channel |
//!
//! Moves are not answered until they finish, and the controller keeps
//! answering position requests meanwhile, so a position request issued
//! during a move may be answered by the move's completion instead.
//!
//! ## Configuration
//!
//! ```toml
//! [[devices]]
//! id = "stage-x"
//! driver = "apt"
//! [devices.config]
//! port = "/dev/ttyUSB0"
//! channel = 1
//! ```

use crate::capabilities::CoordinatedStage;
use crate::factory::{open_port, shared_engine, Capability, DeviceComponents, DriverContext, DriverFactory};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use link_core::{LinkError, LinkResult};
use link_protocol::codec::{BinaryCodec, BinaryFrame};
use link_protocol::{
    Command, Completion, MotionCoordinator, MotionKind, MotionProtocol, MotionRequest, Reply, Signature,
    SignatureSet,
};
use serde::Deserialize;
use std::sync::Arc;

pub const MOVE_ABSOLUTE: u16 = 0x0453;
pub const MOVE_RELATIVE: u16 = 0x0448;
pub const MOVE_HOME: u16 = 0x0443;
pub const MOVE_HOMED: u16 = 0x0444;
pub const MOVE_STOP: u16 = 0x0465;
pub const MOVE_COMPLETED: u16 = 0x0464;
pub const MOVE_STOPPED: u16 = 0x0466;
pub const REQ_POSCOUNTER: u16 = 0x0411;
pub const GET_POSCOUNTER: u16 = 0x0412;

/// Host (PC) source address.
pub const HOST: u8 = 0x01;
/// Generic USB controller destination.
pub const CONTROLLER: u8 = 0x50;

/// Profiled (decelerating) stop.
const STOP_PROFILED: u8 = 0x02;

/// APT vocabulary for one controller.
#[derive(Debug, Clone)]
pub struct AptProtocol {
    destination: u8,
    source: u8,
}

impl Default for AptProtocol {
    fn default() -> Self {
        Self::new(CONTROLLER, HOST)
    }
}

impl AptProtocol {
    pub fn new(destination: u8, source: u8) -> Self {
        Self { destination, source }
    }

    fn header(&self, opcode: u16, param1: u8, param2: u8) -> BinaryFrame {
        BinaryFrame::header(opcode, param1, param2, self.destination, self.source)
    }

    fn channel_move(&self, opcode: u16, channel: u8, value: i64) -> LinkResult<BinaryFrame> {
        let value = i32::try_from(value)
            .map_err(|_| LinkError::Configuration(format!("{} is outside the APT position range", value)))?;
        let mut payload = u16::from(channel).to_le_bytes().to_vec();
        payload.extend_from_slice(&value.to_le_bytes());
        Ok(BinaryFrame::with_payload(opcode, self.destination, self.source, payload))
    }

    /// Channel a reply refers to.
    fn channel_of(reply: &BinaryFrame) -> Option<u8> {
        match reply.opcode {
            MOVE_HOMED => Some(reply.param1),
            _ => reply.payload_u16(0).and_then(|c| u8::try_from(c).ok()),
        }
    }
}

impl MotionProtocol for AptProtocol {
    type Codec = BinaryCodec;

    fn move_command(&self, request: &MotionRequest) -> LinkResult<Command<BinaryFrame>> {
        let command = match request.kind {
            MotionKind::Absolute(target) => Command::new(
                "move_absolute",
                self.channel_move(MOVE_ABSOLUTE, request.axis, target)?,
                Signature::Opcode(MOVE_COMPLETED),
            ),
            MotionKind::Relative(distance) => Command::new(
                "move_relative",
                self.channel_move(MOVE_RELATIVE, request.axis, distance)?,
                Signature::Opcode(MOVE_COMPLETED),
            ),
            MotionKind::Home => Command::new(
                "move_home",
                self.header(MOVE_HOME, request.axis, 0),
                Signature::Opcode(MOVE_HOMED),
            ),
        };
        Ok(command.or_reply(Signature::Opcode(MOVE_STOPPED)))
    }

    fn completion(&self, request: &MotionRequest) -> Completion {
        let done = match request.kind {
            MotionKind::Home => MOVE_HOMED,
            _ => MOVE_COMPLETED,
        };
        Completion::Notified(SignatureSet::new(Signature::Opcode(done)).or(Signature::Opcode(MOVE_STOPPED)))
    }

    fn position_command(&self, axis: u8) -> Option<Command<BinaryFrame>> {
        Some(Command::new(
            "req_poscounter",
            self.header(REQ_POSCOUNTER, axis, 0),
            Signature::Opcode(GET_POSCOUNTER),
        ))
    }

    fn position_from(&self, reply: &BinaryFrame) -> Option<i64> {
        match reply.opcode {
            GET_POSCOUNTER | MOVE_COMPLETED | MOVE_STOPPED => reply.payload_i32(2).map(i64::from),
            MOVE_HOMED => Some(0),
            _ => None,
        }
    }

    fn stop_command(&self, axis: u8) -> Option<Command<BinaryFrame>> {
        Some(Command::new(
            "move_stop",
            self.header(MOVE_STOP, axis, STOP_PROFILED),
            Signature::Opcode(MOVE_STOPPED),
        ))
    }

    fn supports_query_while_moving(&self) -> bool {
        true
    }

    fn is_completion(&self, request: &MotionRequest, reply: &BinaryFrame) -> bool {
        self.completion_signatures(request)
            .is_some_and(|set| set.matches(&reply.signature()))
            && Self::channel_of(reply) == Some(request.axis)
    }
}

/// An APT stage channel.
pub type AptStage = CoordinatedStage<AptProtocol>;

// =============================================================================
// AptFactory - DriverFactory implementation
// =============================================================================

/// Configuration for one APT channel.
#[derive(Debug, Clone, Deserialize)]
pub struct AptConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Motor channel, starting at 1
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Controller address (default: 0x50, generic USB device)
    #[serde(default)]
    pub destination: Option<u8>,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_channel() -> u8 {
    1
}

/// Factory for APT stage channels.
pub struct AptFactory;

static APT_CAPABILITIES: &[Capability] = &[Capability::Stage];

impl DriverFactory for AptFactory {
    fn driver_type(&self) -> &'static str {
        "apt"
    }

    fn name(&self) -> &'static str {
        "Thorlabs APT motor controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        APT_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: AptConfig = config.clone().try_into()?;
        anyhow::ensure!(cfg.channel >= 1, "APT channels start at 1");
        Ok(())
    }

    fn build(&self, config: toml::Value, context: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AptConfig = config.try_into().context("Invalid APT config")?;
            let transport = open_port(&cfg.port, cfg.baud_rate, context.purge_window).await?;
            let engine = shared_engine(&transport, BinaryCodec::apt, &context.engine);

            let protocol = AptProtocol::new(cfg.destination.unwrap_or(CONTROLLER), HOST);
            let coordinator = MotionCoordinator::new(
                format!("{}:ch{}", cfg.port, cfg.channel),
                cfg.channel,
                engine,
                Arc::new(protocol),
                context.motion,
            );

            Ok(DeviceComponents {
                stage: Some(Arc::new(AptStage::new(coordinator))),
                ..Default::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_protocol::FrameCodec;
    use std::time::Duration;

    fn status(opcode: u16, channel: u16, position: i32) -> BinaryFrame {
        let mut payload = channel.to_le_bytes().to_vec();
        payload.extend_from_slice(&position.to_le_bytes());
        payload.extend_from_slice(&[0; 8]);
        BinaryFrame::with_payload(opcode, HOST, CONTROLLER, payload)
    }

    #[test]
    fn test_move_absolute_wire_bytes() {
        let protocol = AptProtocol::default();
        let command = protocol
            .move_command(&MotionRequest::absolute(1, 20_000, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(
            BinaryCodec::apt().encode(&command.request),
            vec![0x53, 0x04, 0x06, 0x00, 0xD0, 0x01, 0x01, 0x00, 0x20, 0x4E, 0x00, 0x00]
        );
        assert!(command.expect.matches(&Signature::Opcode(MOVE_COMPLETED)));
        assert!(command.expect.matches(&Signature::Opcode(MOVE_STOPPED)));
    }

    #[test]
    fn test_home_and_stop_are_header_only() {
        let protocol = AptProtocol::default();
        let home = protocol
            .move_command(&MotionRequest::home(2, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(
            BinaryCodec::apt().encode(&home.request),
            vec![0x43, 0x04, 0x02, 0x00, 0x50, 0x01]
        );

        let stop = protocol.stop_command(2).unwrap();
        assert_eq!(
            BinaryCodec::apt().encode(&stop.request),
            vec![0x65, 0x04, 0x02, 0x02, 0x50, 0x01]
        );
    }

    #[test]
    fn test_out_of_range_target() {
        let err = AptProtocol::default()
            .move_command(&MotionRequest::absolute(1, i64::MAX, Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[test]
    fn test_completion_checks_channel() {
        let protocol = AptProtocol::default();
        let request = MotionRequest::relative(1, 500, Duration::from_secs(1));

        assert!(protocol.is_completion(&request, &status(MOVE_COMPLETED, 1, 500)));
        assert!(protocol.is_completion(&request, &status(MOVE_STOPPED, 1, 250)));
        assert!(!protocol.is_completion(&request, &status(MOVE_COMPLETED, 2, 500)));
        assert!(!protocol.is_completion(&request, &BinaryFrame::header(MOVE_HOMED, 1, 0, HOST, CONTROLLER)));

        let home = MotionRequest::home(1, Duration::from_secs(1));
        assert!(protocol.is_completion(&home, &BinaryFrame::header(MOVE_HOMED, 1, 0, HOST, CONTROLLER)));
    }

    #[test]
    fn test_positions() {
        let protocol = AptProtocol::default();
        assert_eq!(protocol.position_from(&status(MOVE_COMPLETED, 1, -1234)), Some(-1234));
        assert_eq!(
            protocol.position_from(&BinaryFrame::header(MOVE_HOMED, 1, 0, HOST, CONTROLLER)),
            Some(0)
        );

        let mut payload = 1u16.to_le_bytes().to_vec();
        payload.extend_from_slice(&777i32.to_le_bytes());
        let reply = BinaryFrame::with_payload(GET_POSCOUNTER, HOST, CONTROLLER, payload);
        assert_eq!(protocol.position_from(&reply), Some(777));
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = AptFactory;
        assert_eq!(factory.driver_type(), "apt");

        let valid = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            channel = 2
        });
        assert!(factory.validate(&valid).is_ok());

        let missing_port = toml::Value::Table(toml::toml! { channel = 1 });
        assert!(factory.validate(&missing_port).is_err());

        let zero_channel = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            channel = 0
        });
        assert!(factory.validate(&zero_channel).is_err());
    }
}
