// tests/integration/stateful_reconnect_test.rs

//! Integration tests for stateful reconnect: version negotiation, the acknowledgement
//! buffer, and sequence handling of inbound messages.

use super::test_helpers::*;
use hublink::core::protocol::ValueKind;
use hublink::core::transport::MemoryTransportOptions;
use hublink::{HubError, HubMessage};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;

fn stateful_server() -> TestServer {
    TestServer::with_options(MemoryTransportOptions {
        stateful_reconnect: true,
        ..Default::default()
    })
}

fn invocation(target: &str, argument: Value) -> HubMessage {
    HubMessage::Invocation {
        invocation_id: None,
        target: target.to_string(),
        arguments: vec![argument],
        stream_ids: vec![],
    }
}

#[tokio::test]
async fn test_negotiates_version_two_and_registers_resend() {
    let mut server = stateful_server();
    let client = server.builder().with_stateful_reconnect().build();
    let conn = connect(&mut server, &client).await;

    assert_eq!(conn.handshake.as_ref().unwrap().version, 2);
    let stateful = conn.stateful.clone().unwrap();
    assert!(stateful.has_callback());
    assert!(!stateful.is_disabled());
}

#[tokio::test]
async fn test_feature_disabled_without_opt_in() {
    let mut server = stateful_server();
    let client = server.builder().build();
    let conn = connect(&mut server, &client).await;

    assert_eq!(conn.handshake.as_ref().unwrap().version, 1);
    let stateful = conn.stateful.clone().unwrap();
    assert!(stateful.is_disabled());
    assert!(!stateful.has_callback());
}

#[tokio::test]
async fn test_stop_disables_feature() {
    let mut server = stateful_server();
    let client = server.builder().with_stateful_reconnect().build();
    let conn = connect(&mut server, &client).await;
    let stateful = conn.stateful.clone().unwrap();

    client.stop().await.unwrap();
    assert!(stateful.is_disabled());
}

#[tokio::test]
async fn test_unacknowledged_messages_are_replayed() {
    let mut server = stateful_server();
    let client = server.builder().with_stateful_reconnect().build();
    let mut conn = connect(&mut server, &client).await;
    let stateful = conn.stateful.clone().unwrap();

    client.send("first", vec![json!(1)]).await.unwrap();
    let sent = conn.expect_recv().await;

    let frames = stateful.resend_frames().unwrap().unwrap();
    let replay: Vec<HubMessage> = frames.iter().map(|f| parse_frame(f)).collect();
    assert_eq!(replay, vec![HubMessage::Sequence { sequence_id: 1 }, sent]);

    conn.send(&HubMessage::Ack { sequence_id: 1 }).await;

    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let frames = stateful.resend_frames().unwrap().unwrap();
            if frames.len() == 1 {
                assert_eq!(
                    parse_frame(&frames[0]),
                    HubMessage::Sequence { sequence_id: 2 }
                );
                break;
            }
            tokio::time::sleep(ms(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_client_acknowledges_received_messages() {
    let mut server = stateful_server();
    let client = server.builder().with_stateful_reconnect().build();
    client.on("notify", vec![ValueKind::Any], |_| async { Ok(()) });
    let mut conn = connect(&mut server, &client).await;

    conn.send(&invocation("notify", json!("hello"))).await;

    assert_eq!(
        conn.expect_recv().await,
        HubMessage::Ack { sequence_id: 1 }
    );
}

#[tokio::test]
async fn test_replayed_messages_are_skipped() {
    let mut server = stateful_server();
    let client = server.builder().with_stateful_reconnect().build();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    client.on("notify", vec![ValueKind::String], move |arguments| {
        let seen = recorder.clone();
        async move {
            seen.lock().push(arguments[0].clone());
            Ok(())
        }
    });
    let mut conn = connect(&mut server, &client).await;

    conn.send(&invocation("notify", json!("a"))).await;
    // The server resumes and replays from the first message.
    conn.send(&HubMessage::Sequence { sequence_id: 1 }).await;
    conn.send(&invocation("notify", json!("a"))).await;
    conn.send(&invocation("notify", json!("b"))).await;

    tokio::time::timeout(TEST_TIMEOUT, async {
        while seen.lock().len() < 2 {
            tokio::time::sleep(ms(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(ms(20)).await;
    assert_eq!(*seen.lock(), vec![json!("a"), json!("b")]);
}

#[tokio::test]
async fn test_sequence_beyond_received_is_protocol_error() {
    let mut server = stateful_server();
    let client = server.builder().with_stateful_reconnect().build();
    let mut events = record_events(&client);
    let mut conn = connect(&mut server, &client).await;

    conn.send(&HubMessage::Sequence { sequence_id: 5 }).await;

    assert_eq!(
        next_event(&mut events.closed).await,
        Some(HubError::InvalidData(
            "Sequence ID greater than amount of messages we've received.".to_string()
        ))
    );
}

#[tokio::test]
async fn test_reconnect_renegotiates_features() {
    let mut server = stateful_server();
    let client = server
        .builder()
        .with_stateful_reconnect()
        .with_reconnect_delays(vec![ms(0)])
        .build();
    let mut events = record_events(&client);
    let first = connect(&mut server, &client).await;
    assert_eq!(first.handshake.as_ref().unwrap().version, 2);

    // The next connection no longer offers stateful reconnect.
    server.set_options(MemoryTransportOptions::default());
    drop(first);

    let mut second = server.accept_handshake().await;
    next_event(&mut events.reconnected).await;
    assert_eq!(second.handshake.as_ref().unwrap().version, 1);
    assert!(second.stateful.is_none());

    // Without the buffer, messages carry no acknowledgements.
    client.send("plain", vec![json!(1)]).await.unwrap();
    assert!(matches!(
        second.expect_recv().await,
        HubMessage::Invocation { .. }
    ));
}
