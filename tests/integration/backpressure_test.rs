// tests/integration/backpressure_test.rs

//! Integration tests for writes that cannot complete: a server that stops reading,
//! and a full acknowledgement buffer.

use super::test_helpers::*;
use hublink::core::protocol::ValueKind;
use hublink::core::transport::MemoryTransportOptions;
use hublink::{Argument, HubError, HubMessage, SessionState};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Larger than the in-memory transport's buffer, so the write blocks part-way.
fn oversized_argument() -> Vec<Argument> {
    vec![Argument::Value(json!("x".repeat(256 * 1024)))]
}

#[tokio::test]
async fn test_cancel_interrupts_blocked_write() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut events = record_events(&client);
    // The server never reads past the handshake.
    let _conn = connect(&mut server, &client).await;

    let token = CancellationToken::new();
    let invoker = client.clone();
    let call_token = token.clone();
    let pending = tokio::spawn(async move {
        invoker
            .invoke_core("upload", ValueKind::Any, oversized_argument(), &call_token)
            .await
    });
    tokio::time::sleep(ms(100)).await;
    assert!(!pending.is_finished());

    token.cancel();
    let result = tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("invoke still blocked after cancel")
        .unwrap();
    assert!(result.unwrap_err().is_cancellation());

    // Half a frame is on the wire, so the connection cannot be reused.
    match next_event(&mut events.closed).await {
        Some(error) => assert!(error.is_cancellation(), "got {error:?}"),
        None => panic!("expected the torn write as close cause"),
    }
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_stop_interrupts_blocked_write() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let _conn = connect(&mut server, &client).await;

    let invoker = client.clone();
    let pending = tokio::spawn(async move {
        invoker
            .invoke_core(
                "upload",
                ValueKind::Any,
                oversized_argument(),
                &CancellationToken::new(),
            )
            .await
    });
    tokio::time::sleep(ms(100)).await;
    assert!(!pending.is_finished());

    tokio::time::timeout(TEST_TIMEOUT, client.stop())
        .await
        .expect("stop waited on a blocked write")
        .unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);

    let result = tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("invoke still blocked after stop")
        .unwrap();
    assert!(result.is_err());
}

fn tiny_buffer_server() -> TestServer {
    TestServer::with_options(MemoryTransportOptions {
        stateful_reconnect: true,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_acks_flow_while_writer_waits_for_buffer_space() {
    let mut server = tiny_buffer_server();
    let client = server
        .builder()
        .with_stateful_reconnect()
        .with_stateful_reconnect_buffer_size(1)
        .build();
    client.on("notify", vec![ValueKind::Any], |_| async { Ok(()) });
    let mut conn = connect(&mut server, &client).await;

    client.send("first", vec![json!(1)]).await.unwrap();
    assert!(matches!(conn.expect_recv().await, HubMessage::Invocation { .. }));

    // The buffer holds one unacknowledged message, so this send waits for an ack.
    let sender = client.clone();
    let parked = tokio::spawn(async move { sender.send("second", vec![json!(2)]).await });
    tokio::time::sleep(ms(50)).await;
    assert!(!parked.is_finished());

    // The client still acknowledges what it receives meanwhile.
    conn.send(&HubMessage::Invocation {
        invocation_id: None,
        target: "notify".to_string(),
        arguments: vec![json!("x")],
        stream_ids: vec![],
    })
    .await;
    assert_eq!(conn.expect_recv().await, HubMessage::Ack { sequence_id: 1 });

    conn.send(&HubMessage::Ack { sequence_id: 1 }).await;
    tokio::time::timeout(TEST_TIMEOUT, parked)
        .await
        .expect("send still waiting after ack")
        .unwrap()
        .unwrap();
    match conn.expect_recv().await {
        HubMessage::Invocation { target, .. } => assert_eq!(target, "second"),
        other => panic!("expected the second invocation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_while_waiting_for_buffer_space_keeps_connection() {
    let mut server = tiny_buffer_server();
    let client = server
        .builder()
        .with_stateful_reconnect()
        .with_stateful_reconnect_buffer_size(1)
        .build();
    let mut events = record_events(&client);
    let mut conn = connect(&mut server, &client).await;

    client.send("first", vec![json!(1)]).await.unwrap();
    conn.expect_recv().await;

    let token = CancellationToken::new();
    let sender = client.clone();
    let call_token = token.clone();
    let parked = tokio::spawn(async move {
        sender
            .send_core("second", vec![Argument::Value(json!(2))], &call_token)
            .await
    });
    tokio::time::sleep(ms(50)).await;
    token.cancel();
    let result = tokio::time::timeout(TEST_TIMEOUT, parked)
        .await
        .expect("send still waiting after cancel")
        .unwrap();
    assert_eq!(result, Err(HubError::canceled()));

    // Nothing reached the wire, so the connection carries on.
    tokio::time::sleep(ms(30)).await;
    assert_eq!(client.state(), SessionState::Connected);
    assert!(events.closed.try_recv().is_err());

    conn.send(&HubMessage::Ack { sequence_id: 1 }).await;
    client.send("third", vec![json!(3)]).await.unwrap();
    match conn.expect_recv().await {
        HubMessage::Invocation { target, .. } => assert_eq!(target, "third"),
        other => panic!("expected the third invocation, got {other:?}"),
    }
}
