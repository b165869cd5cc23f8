//! Zaber-style ASCII stage.
//!
//! Commands are `/<address> <axis> <verb> [args]`; every command is answered
//! by a `@` reply carrying the device status. Motion commands are answered
//! immediately with status `BUSY`, so completion is detected by polling
//! `get pos` until the status reads `IDLE`.
//!
//! `!` alerts and `#` info messages arrive unsolicited; an observer on the
//! engine logs and claims them so they never stand in for a reply.

use crate::capabilities::CoordinatedStage;
use crate::factory::{open_port, shared_engine_with, Capability, DeviceComponents, DriverContext, DriverFactory};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use link_core::LinkResult;
use link_protocol::codec::ascii::reply_signature;
use link_protocol::codec::{AsciiCodec, AsciiReply, AsciiRequest, MessageKind};
use link_protocol::{Command, Completion, FrameObserver, MotionCoordinator, MotionKind, MotionProtocol, MotionRequest};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// ASCII vocabulary for one device address.
#[derive(Debug, Clone)]
pub struct ZaberProtocol {
    address: u8,
}

impl ZaberProtocol {
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    fn command(&self, label: &str, axis: u8, verb: impl Into<String>) -> Command<AsciiRequest> {
        Command::new(label, AsciiRequest::new(self.address, axis, verb), reply_signature(self.address, axis))
    }
}

impl MotionProtocol for ZaberProtocol {
    type Codec = AsciiCodec;

    fn move_command(&self, request: &MotionRequest) -> LinkResult<Command<AsciiRequest>> {
        Ok(match request.kind {
            MotionKind::Absolute(target) => self.command("move_abs", request.axis, format!("move abs {}", target)),
            MotionKind::Relative(distance) => {
                self.command("move_rel", request.axis, format!("move rel {}", distance))
            }
            MotionKind::Home => self.command("home", request.axis, "home"),
        })
    }

    fn completion(&self, _request: &MotionRequest) -> Completion {
        Completion::Polled
    }

    fn position_command(&self, axis: u8) -> Option<Command<AsciiRequest>> {
        Some(self.command("get_pos", axis, "get pos"))
    }

    fn position_from(&self, reply: &AsciiReply) -> Option<i64> {
        match reply.kind {
            MessageKind::Reply => reply.data_i64(0),
            _ => None,
        }
    }

    fn stop_command(&self, axis: u8) -> Option<Command<AsciiRequest>> {
        Some(self.command("stop", axis, "stop"))
    }

    fn supports_query_while_moving(&self) -> bool {
        true
    }

    fn is_completion(&self, request: &MotionRequest, reply: &AsciiReply) -> bool {
        reply.kind == MessageKind::Reply
            && reply.address == self.address
            && reply.axis == request.axis
            && reply.is_idle()
    }
}

/// Logs and claims `!` alerts and `#` info messages.
#[derive(Debug)]
pub struct AlertLog {
    port: String,
}

impl AlertLog {
    pub fn new(port: impl Into<String>) -> Self {
        Self { port: port.into() }
    }
}

impl FrameObserver<AsciiReply> for AlertLog {
    fn offer(&self, frame: &AsciiReply) -> bool {
        match frame.kind {
            MessageKind::Alert | MessageKind::Info => {
                info!(
                    port = %self.port,
                    address = frame.address,
                    axis = frame.axis,
                    message = %frame.to_line(),
                    "Unsolicited device message"
                );
                true
            }
            MessageKind::Reply => false,
        }
    }
}

/// A Zaber-style axis.
pub type ZaberStage = CoordinatedStage<ZaberProtocol>;

// =============================================================================
// ZaberFactory - DriverFactory implementation
// =============================================================================

/// Configuration for one ASCII axis.
#[derive(Debug, Clone, Deserialize)]
pub struct ZaberConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Device address on the daisy chain, starting at 1
    #[serde(default = "default_one")]
    pub address: u8,
    /// Axis number, starting at 1
    #[serde(default = "default_one")]
    pub axis: u8,
    /// Append checksums to outgoing commands
    #[serde(default)]
    pub checksums: bool,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_one() -> u8 {
    1
}

/// Factory for ASCII stage axes.
pub struct ZaberFactory;

static ZABER_CAPABILITIES: &[Capability] = &[Capability::Stage];

impl DriverFactory for ZaberFactory {
    fn driver_type(&self) -> &'static str {
        "zaber"
    }

    fn name(&self) -> &'static str {
        "Zaber ASCII stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ZABER_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: ZaberConfig = config.clone().try_into()?;
        anyhow::ensure!(cfg.address >= 1, "Zaber device addresses start at 1");
        anyhow::ensure!(cfg.axis >= 1, "Zaber axes start at 1 (axis 0 addresses the whole device)");
        Ok(())
    }

    fn build(&self, config: toml::Value, context: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: ZaberConfig = config.try_into().context("Invalid Zaber config")?;
            let transport = open_port(&cfg.port, cfg.baud_rate, context.purge_window).await?;

            let checksums = cfg.checksums;
            let alert_port = cfg.port.clone();
            let engine = shared_engine_with(
                &transport,
                move || {
                    if checksums {
                        AsciiCodec::new().with_checksums()
                    } else {
                        AsciiCodec::new()
                    }
                },
                &context.engine,
                move |engine| {
                    engine.register_observer(Arc::new(AlertLog::new(alert_port)));
                },
            );

            let coordinator = MotionCoordinator::new(
                format!("{}:{}/{}", cfg.port, cfg.address, cfg.axis),
                cfg.axis,
                engine,
                Arc::new(ZaberProtocol::new(cfg.address)),
                context.motion,
            );

            Ok(DeviceComponents {
                stage: Some(Arc::new(ZaberStage::new(coordinator))),
                ..Default::default()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_protocol::codec::{DeviceStatus, ReplyFlag};
    use link_protocol::FrameCodec;
    use std::time::Duration;

    #[test]
    fn test_move_commands() {
        let protocol = ZaberProtocol::new(1);
        let codec = AsciiCodec::new();

        let abs = protocol
            .move_command(&MotionRequest::absolute(1, 5000, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(codec.encode(&abs.request), b"/1 1 move abs 5000\n".to_vec());

        let rel = protocol
            .move_command(&MotionRequest::relative(2, -10, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(codec.encode(&rel.request), b"/1 2 move rel -10\n".to_vec());
        assert_eq!(rel.expect.primary(), &reply_signature(1, 2));

        let home = protocol
            .move_command(&MotionRequest::home(1, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(codec.encode(&home.request), b"/1 1 home\n".to_vec());
    }

    #[test]
    fn test_completion_is_idle_reply_for_axis() {
        let protocol = ZaberProtocol::new(1);
        let request = MotionRequest::absolute(1, 10, Duration::from_secs(1));

        let idle = AsciiReply::reply(1, 1, ReplyFlag::Ok, DeviceStatus::Idle, "10");
        let busy = AsciiReply::reply(1, 1, ReplyFlag::Ok, DeviceStatus::Busy, "4");
        let other_axis = AsciiReply::reply(1, 2, ReplyFlag::Ok, DeviceStatus::Idle, "10");

        assert!(protocol.is_completion(&request, &idle));
        assert!(!protocol.is_completion(&request, &busy));
        assert!(!protocol.is_completion(&request, &other_axis));
        assert_eq!(protocol.position_from(&busy), Some(4));
        assert!(protocol.completion_signatures(&request).is_none());
    }

    #[test]
    fn test_alert_log_claims_alerts_only() {
        let log = AlertLog::new("bus");
        let codec = AsciiCodec::new();
        let alert = match codec.try_decode(b"!01 1 IDLE --\r\n") {
            link_protocol::Decoded::Frame { reply, .. } => reply,
            other => panic!("expected frame, got {:?}", other),
        };
        assert!(log.offer(&alert));

        let reply = AsciiReply::reply(1, 1, ReplyFlag::Ok, DeviceStatus::Idle, "0");
        assert!(!log.offer(&reply));
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = ZaberFactory;
        let valid = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            address = 2
            axis = 1
        });
        assert!(factory.validate(&valid).is_ok());

        let whole_device = toml::Value::Table(toml::toml! {
            port = "/dev/ttyUSB0"
            axis = 0
        });
        assert!(factory.validate(&whole_device).is_err());
    }
}
