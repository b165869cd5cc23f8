//! Adapters built through their factories, talking to scripted devices.

use link_core::{mock_serial, ports, LinkError, SharedTransport};
use link_drivers::{DeviceComponents, DriverContext, DriverRegistry};
use link_protocol::codec::{AsciiCodec, AsciiReply, BinaryCodec, BinaryFrame, DeviceStatus, ReplyFlag};
use link_protocol::{EngineConfig, FrameCodec, MotionConfig, MotionKind, MotionPhase};
use std::time::Duration;

fn context() -> DriverContext {
    DriverContext {
        engine: EngineConfig::default(),
        motion: MotionConfig {
            poll_interval: Duration::from_millis(10),
            query_timeout: Duration::from_millis(300),
        },
        purge_window: Duration::ZERO,
        operation_timeout: Duration::from_secs(2),
    }
}

fn mock_port(path: &str) -> mock_serial::MockDeviceHarness {
    let (port, harness) = mock_serial::new();
    ports::register_port(path, SharedTransport::serial(path, port, Duration::ZERO));
    harness
}

async fn build(driver: &str, config: toml::Value) -> DeviceComponents {
    DriverRegistry::with_builtin()
        .build("dut", driver, config, context())
        .await
        .unwrap()
}

fn apt_status(opcode: u16, channel: u16, position: i32) -> Vec<u8> {
    let mut payload = channel.to_le_bytes().to_vec();
    payload.extend_from_slice(&position.to_le_bytes());
    payload.extend_from_slice(&[0; 8]);
    BinaryCodec::apt().encode(&BinaryFrame::with_payload(opcode, 0x01, 0x50, payload))
}

fn zaber_reply(status: DeviceStatus, data: &str) -> Vec<u8> {
    AsciiCodec::new().encode_reply(&AsciiReply::reply(1, 1, ReplyFlag::Ok, status, data))
}

#[tokio::test]
async fn apt_position_query_consumes_completion() {
    let mut harness = mock_port("/mock/apt-race");
    let device = build(
        "apt",
        toml::Value::Table(toml::toml! {
            port = "/mock/apt-race"
            channel = 1
        }),
    )
    .await;
    let stage = device.stage.unwrap();

    stage
        .start_move(MotionKind::Absolute(20_000), Duration::from_secs(2))
        .unwrap();
    let moved = harness.recv_write().await.unwrap();
    assert_eq!(&moved[..2], &[0x53, 0x04]);

    let responder = tokio::spawn(async move {
        let query = harness.recv_write().await.unwrap();
        assert_eq!(query, vec![0x11, 0x04, 0x01, 0x00, 0x50, 0x01]);
        harness.send_response(&apt_status(0x0464, 1, 20_000)).unwrap();
        harness
    });

    assert_eq!(stage.position().await.unwrap(), 20_000);
    assert_eq!(stage.phase(), MotionPhase::Completed);
    assert_eq!(stage.wait_settled(Duration::from_secs(1)).await.unwrap(), Some(20_000));
    responder.await.unwrap();
}

#[tokio::test]
async fn apt_channels_on_one_port_share_completions() {
    let mut harness = mock_port("/mock/apt-bus");
    let x = build(
        "apt",
        toml::Value::Table(toml::toml! {
            port = "/mock/apt-bus"
            channel = 1
        }),
    )
    .await
    .stage
    .unwrap();
    let y = build(
        "apt",
        toml::Value::Table(toml::toml! {
            port = "/mock/apt-bus"
            channel = 2
        }),
    )
    .await
    .stage
    .unwrap();

    x.start_move(MotionKind::Relative(10), Duration::from_secs(2)).unwrap();
    y.start_move(MotionKind::Relative(20), Duration::from_secs(2)).unwrap();
    harness.recv_write().await.unwrap();
    harness.recv_write().await.unwrap();

    harness.send_response(&apt_status(0x0464, 2, 20)).unwrap();
    assert_eq!(y.wait_settled(Duration::from_secs(1)).await.unwrap(), Some(20));
    assert!(x.is_moving());

    harness.send_response(&apt_status(0x0464, 1, 10)).unwrap();
    assert_eq!(x.wait_settled(Duration::from_secs(1)).await.unwrap(), Some(10));
}

#[tokio::test]
async fn zaber_move_is_polled_until_idle() {
    let mut harness = mock_port("/mock/zaber");
    let stage = build(
        "zaber",
        toml::Value::Table(toml::toml! {
            port = "/mock/zaber"
        }),
    )
    .await
    .stage
    .unwrap();

    let device = tokio::spawn(async move {
        harness.expect_write(b"/1 1 move abs 5000\n").await;
        harness.send_response(&zaber_reply(DeviceStatus::Busy, "0")).unwrap();
        harness.expect_write(b"/1 1 get pos\n").await;
        harness.send_response(&zaber_reply(DeviceStatus::Busy, "2500")).unwrap();
        harness.expect_write(b"/1 1 get pos\n").await;
        harness.send_response(&zaber_reply(DeviceStatus::Idle, "5000")).unwrap();
        harness
    });

    stage
        .start_move(MotionKind::Absolute(5000), Duration::from_secs(2))
        .unwrap();
    assert_eq!(stage.wait_settled(Duration::from_secs(2)).await.unwrap(), Some(5000));
    assert!(!stage.is_moving());
    device.await.unwrap();
}

#[tokio::test]
async fn zaber_axes_on_one_port_share_one_alert_log() {
    let _harness = mock_port("/mock/zaber-chain");
    let mut stages = Vec::new();
    for axis in 1..=3 {
        let mut table = toml::map::Map::new();
        table.insert("port".into(), toml::Value::String("/mock/zaber-chain".into()));
        table.insert("axis".into(), toml::Value::Integer(axis));
        stages.push(build("zaber", toml::Value::Table(table)).await.stage.unwrap());
    }

    let transport = ports::get_existing_port("/mock/zaber-chain").unwrap();
    let engine = link_drivers::shared_engine(&transport, AsciiCodec::new, &EngineConfig::default());
    // One observer per axis plus the port's alert log.
    assert_eq!(engine.observer_count(), 4);
}

#[tokio::test]
async fn zaber_rejection_fails_the_motion() {
    let mut harness = mock_port("/mock/zaber-rj");
    let stage = build(
        "zaber",
        toml::Value::Table(toml::toml! {
            port = "/mock/zaber-rj"
        }),
    )
    .await
    .stage
    .unwrap();

    let device = tokio::spawn(async move {
        harness.recv_write().await.unwrap();
        let rejected = AsciiReply::reply(1, 1, ReplyFlag::Rejected, DeviceStatus::Idle, "BADDATA");
        harness
            .send_response(&AsciiCodec::new().encode_reply(&rejected))
            .unwrap();
        harness
    });

    stage
        .start_move(MotionKind::Absolute(-1), Duration::from_secs(2))
        .unwrap();
    let err = stage.wait_settled(Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, LinkError::Rejected { .. }));
    assert_eq!(stage.phase(), MotionPhase::Idle);
    device.await.unwrap();
}

#[tokio::test]
async fn lambda_shutter_round_trip() {
    let mut harness = mock_port("/mock/lambda");
    let shutter = build(
        "lambda",
        toml::Value::Table(toml::toml! {
            port = "/mock/lambda"
            shutter = "B"
            settle_ms = 20
        }),
    )
    .await
    .shutter
    .unwrap();

    let device = tokio::spawn(async move {
        harness.expect_and_respond(&[186], &[186]).await;
        harness.send_response(&[13]).unwrap();
        harness.expect_and_respond(&[188], &[13]).await;
        harness
    });

    shutter.set_open(true).await.unwrap();
    assert_eq!(shutter.is_open(), Some(true));
    shutter.wait_until_idle(Duration::from_secs(1)).await.unwrap();

    shutter.set_open(false).await.unwrap();
    assert_eq!(shutter.is_open(), Some(false));
    device.await.unwrap();
}

#[tokio::test]
async fn lambda_wheel_and_shutter_share_a_controller() {
    let mut harness = mock_port("/mock/lambda-10-3");
    let shutter = build(
        "lambda",
        toml::Value::Table(toml::toml! {
            port = "/mock/lambda-10-3"
            shutter = "A"
        }),
    )
    .await
    .shutter
    .unwrap();
    let wheel = build(
        "lambda_wheel",
        toml::Value::Table(toml::toml! {
            port = "/mock/lambda-10-3"
            wheel = "B"
            speed = 1
        }),
    )
    .await
    .stage
    .unwrap();

    let device = tokio::spawn(async move {
        harness.expect_and_respond(&[170], &[13]).await;
        // Wheel B, speed 1, position 6.
        harness.expect_and_respond(&[0x80 | 0x16], &[0x80 | 0x16]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.send_response(&[13]).unwrap();
        harness
    });

    shutter.set_open(true).await.unwrap();
    wheel.start_move(MotionKind::Absolute(6), Duration::from_secs(2)).unwrap();
    assert_eq!(wheel.wait_settled(Duration::from_secs(2)).await.unwrap(), Some(6));

    assert_eq!(shutter.is_open(), Some(true));
    assert!(matches!(
        wheel.start_move(MotionKind::Relative(1), Duration::from_secs(1)),
        Err(LinkError::Unsupported(_))
    ));
    device.await.unwrap();
}
