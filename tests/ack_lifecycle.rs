//! Outbound send bookkeeping: ack registration, resolution, failure and timeout.

mod common;

use common::{connected_gateway, detached_gateway, packet, routing_reply, settle, text, MockLink};
use meshgate::gateway::{DeviceEvent, GatewayError, MessageStatus, RawPacket};
use serde_json::json;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn unanswered_send_times_out_exactly_once() {
    let (gateway, sink, link, tx) = connected_gateway(MockLink::default());

    let id = assert_ok!(gateway.send_message("ping", 0));
    assert_eq!(link.sent(), vec![(id, "ping".to_string(), 0)]);
    assert_eq!(gateway.pending_acks(), 1);
    assert_eq!(gateway.list_messages(None)[0].status, MessageStatus::Pending);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(sink.acks_for(id).is_empty(), "ack deadline fired early");

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(sink.acks_for(id), vec![MessageStatus::TimedOut]);
    assert_eq!(gateway.pending_acks(), 0);

    // a late routing ack changes nothing
    tx.send(DeviceEvent::Packet(routing_reply(0x55, id, "NONE")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(sink.acks_for(id), vec![MessageStatus::TimedOut]);
    assert_eq!(gateway.list_messages(None)[0].status, MessageStatus::TimedOut);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn routing_ack_resolves_once() {
    let (gateway, sink, _link, tx) = connected_gateway(MockLink::default());
    let id = gateway.send_message("hello mesh", 2).unwrap();

    tx.send(DeviceEvent::Queued(id)).await.unwrap();
    tx.send(DeviceEvent::Packet(routing_reply(0x55, id, "NONE")))
        .await
        .unwrap();
    tx.send(DeviceEvent::Packet(routing_reply(0x56, id, "NONE")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        sink.acks_for(id),
        vec![MessageStatus::Sent, MessageStatus::Acknowledged]
    );
    let messages = gateway.list_messages(Some(2));
    assert_eq!(messages[0].status, MessageStatus::Acknowledged);

    // past the deadline nothing more happens
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(sink.acks_for(id).len(), 2);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn routing_error_marks_message_failed() {
    let (gateway, sink, _link, tx) = connected_gateway(MockLink::default());
    let id = gateway.send_message("anyone?", 0).unwrap();

    tx.send(DeviceEvent::Packet(routing_reply(0x55, id, "MAX_RETRANSMIT")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(sink.acks_for(id), vec![MessageStatus::Failed]);
    let message = &gateway.list_messages(None)[0];
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.status_reason.as_deref(), Some("MAX_RETRANSMIT"));

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(sink.acks_for(id), vec![MessageStatus::Failed]);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ack_priority_packet_resolves_reply_id() {
    let (gateway, sink, _link, tx) = connected_gateway(MockLink::default());
    let id = gateway.send_message("direct", 0).unwrap();

    let ack = RawPacket::from_json(
        &json!({
            "from": 0x77,
            "id": 900,
            "priority": "ACK",
            "decoded": { "portnum": "ROUTING_APP", "replyId": id }
        })
        .to_string(),
    )
    .unwrap();
    tx.send(DeviceEvent::Packet(ack)).await.unwrap();
    settle().await;

    assert_eq!(sink.acks_for(id), vec![MessageStatus::Acknowledged]);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn inbound_text_reusing_local_id_does_not_steal_ack() {
    let (gateway, sink, _link, tx) = connected_gateway(MockLink::default());
    gateway.send_message_with_id(0x1234, "outbound", 0).unwrap();

    tx.send(DeviceEvent::Packet(text("!00000099", 0x1234, "inbound")))
        .await
        .unwrap();
    tx.send(DeviceEvent::Packet(routing_reply(0x55, 0x1234, "NONE")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(sink.acks_for(0x1234), vec![MessageStatus::Acknowledged]);
    let messages = gateway.list_messages(None);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text, "outbound");
    assert_eq!(messages[0].status, MessageStatus::Acknowledged);
    assert_eq!(messages[1].status, MessageStatus::Received);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ack_priority_nak_is_a_failure() {
    let (gateway, sink, _link, tx) = connected_gateway(MockLink::default());
    let id = gateway.send_message("are you there", 0).unwrap();

    tx.send(DeviceEvent::Packet(packet(json!({
        "from": 0x77,
        "id": 901,
        "priority": "ACK",
        "decoded": {
            "portnum": "ROUTING_APP",
            "replyId": id,
            "routing": { "errorReason": "MAX_RETRANSMIT" }
        }
    }))))
    .await
    .unwrap();
    settle().await;

    assert_eq!(sink.acks_for(id), vec![MessageStatus::Failed]);
    let message = &gateway.list_messages(None)[0];
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.status_reason.as_deref(), Some("MAX_RETRANSMIT"));
    gateway.shutdown().await;
}

#[tokio::test]
async fn failed_write_withdraws_ack() {
    let (gateway, sink, _link, _tx) = connected_gateway(MockLink::failing());

    let err = assert_err!(gateway.send_message_with_id(0x42, "lost", 0));
    assert!(matches!(err, GatewayError::TransportFailure(_)));
    assert_eq!(gateway.pending_acks(), 0);
    assert_eq!(sink.acks_for(0x42), vec![MessageStatus::Failed]);
    assert_eq!(gateway.list_messages(None)[0].status, MessageStatus::Failed);

    // the id is free again
    let err = gateway.send_message_with_id(0x42, "lost again", 0).unwrap_err();
    assert!(matches!(err, GatewayError::TransportFailure(_)));
    gateway.shutdown().await;
}

#[tokio::test]
async fn duplicate_packet_id_is_refused() {
    let (gateway, _sink, link, _tx) = connected_gateway(MockLink::default());

    assert_eq!(gateway.send_message_with_id(7, "first", 0), Ok(7));
    assert_eq!(
        gateway.send_message_with_id(7, "second", 0),
        Err(GatewayError::DuplicatePacketId(7))
    );
    assert_eq!(link.sent().len(), 1);
    assert_eq!(gateway.list_messages(None).len(), 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn sends_without_link_or_text_are_rejected() {
    let (gateway, _sink) = detached_gateway();
    assert_eq!(gateway.send_message("hi", 0), Err(GatewayError::NotConnected));

    let (gateway, sink, _link, _tx) = connected_gateway(MockLink::default());
    assert!(matches!(
        gateway.send_message("   ", 0),
        Err(GatewayError::InvalidMessage(_))
    ));
    let long = "x".repeat(gateway.settings().max_text_bytes + 1);
    assert!(matches!(
        gateway.send_message(&long, 0),
        Err(GatewayError::InvalidMessage(_))
    ));
    assert!(gateway.list_messages(None).is_empty());
    assert!(sink.events().is_empty());
    gateway.shutdown().await;
}

#[tokio::test]
async fn device_error_detaches_link() {
    let (gateway, sink, _link, tx) = connected_gateway(MockLink::default());
    assert!(gateway.is_connected());

    tx.send(DeviceEvent::Error("serial read failed".into()))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while gateway.is_connected() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("link dropped after device error");

    assert_eq!(gateway.send_message("hi", 0), Err(GatewayError::NotConnected));
    assert!(sink.kinds().contains(&"connectionError"));
    gateway.shutdown().await;
}
