//! Several callers sharing one port through one engine.

use link_core::{mock_serial, LinkError, SharedTransport};
use link_protocol::codec::ascii::reply_signature;
use link_protocol::codec::{AsciiCodec, AsciiReply, AsciiRequest, DeviceStatus, ReplyFlag};
use link_protocol::{wait_until_idle, Command, CommandEngine, QueriedBusy};
use std::sync::Arc;
use std::time::Duration;

fn get_pos(axis: u8) -> Command<AsciiRequest> {
    Command::new("get_pos", AsciiRequest::new(1, axis, "get pos"), reply_signature(1, axis))
}

fn axis_of(write: &[u8]) -> u8 {
    let text = String::from_utf8_lossy(write);
    text.split_whitespace()
        .nth(1)
        .and_then(|t| t.parse().ok())
        .expect("axis token")
}

fn ascii_engine() -> (Arc<CommandEngine<AsciiCodec>>, mock_serial::MockDeviceHarness) {
    let (port, harness) = mock_serial::new();
    let transport = SharedTransport::serial("bus", port, Duration::ZERO);
    (Arc::new(CommandEngine::new(transport, AsciiCodec::new())), harness)
}

#[tokio::test]
async fn concurrent_round_trips_are_serialized() {
    let (engine, mut harness) = ascii_engine();
    let codec = AsciiCodec::new();

    let device = tokio::spawn(async move {
        for _ in 0..4 {
            let write = harness.recv_write().await.unwrap();
            let axis = axis_of(&write);
            let reply = AsciiReply::reply(1, axis, ReplyFlag::Ok, DeviceStatus::Idle, (axis as i64 * 10).to_string());
            harness.send_response(&codec.encode_reply(&reply)).unwrap();
        }
        harness
    });

    let mut callers = Vec::new();
    for axis in 1..=4u8 {
        let engine = engine.clone();
        callers.push(tokio::spawn(async move {
            let reply = engine.execute(&get_pos(axis), Duration::from_secs(1)).await?;
            Ok::<_, LinkError>((axis, reply.data_i64(0)))
        }));
    }

    for caller in callers {
        let (axis, position) = caller.await.unwrap().unwrap();
        assert_eq!(position, Some(axis as i64 * 10));
    }
    device.await.unwrap();

    let stats = engine.transport().stats();
    assert_eq!(stats.peak_holders, 1);
    assert!(stats.acquisitions >= 4);
    assert_eq!(stats.holders, 0);
}

#[tokio::test]
async fn late_reply_is_purged_before_next_command() {
    let (engine, mut harness) = ascii_engine();
    let codec = AsciiCodec::new();

    let err = engine.execute(&get_pos(1), Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, LinkError::Timeout { .. }));
    harness.recv_write().await.unwrap();

    let late = AsciiReply::reply(1, 1, ReplyFlag::Ok, DeviceStatus::Idle, "5");
    harness.send_response(&codec.encode_reply(&late)).unwrap();

    let device = tokio::spawn(async move {
        harness.recv_write().await.unwrap();
        let fresh = AsciiReply::reply(1, 1, ReplyFlag::Ok, DeviceStatus::Idle, "7");
        harness.send_response(&codec.encode_reply(&fresh)).unwrap();
        harness
    });

    let reply = engine.execute(&get_pos(1), Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply.data_i64(0), Some(7));
    device.await.unwrap();
}

#[tokio::test]
async fn rejected_command_surfaces_reason() {
    let (engine, mut harness) = ascii_engine();
    let codec = AsciiCodec::new();

    let device = tokio::spawn(async move {
        harness.recv_write().await.unwrap();
        let reply = AsciiReply::reply(1, 1, ReplyFlag::Rejected, DeviceStatus::Idle, "BADDATA");
        harness.send_response(&codec.encode_reply(&reply)).unwrap();
        harness
    });

    let command = Command::new(
        "move_abs",
        AsciiRequest::new(1, 1, "move abs -5"),
        reply_signature(1, 1),
    );
    let err = engine.execute(&command, Duration::from_secs(1)).await.unwrap_err();
    match err {
        LinkError::Rejected { reason, .. } => assert_eq!(reason, "BADDATA"),
        other => panic!("expected rejection, got {:?}", other),
    }
    device.await.unwrap();
}

#[tokio::test]
async fn status_polling_waits_for_idle() {
    let (engine, mut harness) = ascii_engine();
    let codec = AsciiCodec::new();

    let device = tokio::spawn(async move {
        for status in [DeviceStatus::Busy, DeviceStatus::Busy, DeviceStatus::Idle] {
            harness.recv_write().await.unwrap();
            let reply = AsciiReply::reply(1, 0, ReplyFlag::Ok, status, "");
            harness.send_response(&codec.encode_reply(&reply)).unwrap();
        }
        harness
    });

    let busy = QueriedBusy::new(
        engine,
        Command::new("status", AsciiRequest::new(1, 0, ""), reply_signature(1, 0)),
        Duration::from_millis(500),
        |reply: &AsciiReply| reply.is_busy(),
    );
    wait_until_idle(&busy, Duration::from_millis(10), Duration::from_secs(2))
        .await
        .unwrap();
    device.await.unwrap();
}
