// tests/integration/lifecycle_test.rs

//! Integration tests for the session lifecycle
//! Tests: start, handshake outcomes, stop, dispose, close frames and close events

use super::test_helpers::*;
use hublink::core::protocol::ValueKind;
use hublink::{HubError, HubMessage, SessionState};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ===== Start =====

#[tokio::test]
async fn test_start_and_stop() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut events = record_events(&client);
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(client.connection_id().is_none());

    let mut conn = connect(&mut server, &client).await;
    assert_eq!(client.state(), SessionState::Connected);
    assert_eq!(client.connection_id().as_deref(), Some(conn.connection_id.as_str()));

    client.stop().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(client.connection_id().is_none());
    assert_eq!(next_event(&mut events.closed).await, None);

    let messages = conn.drain().await;
    assert!(messages.contains(&HubMessage::Close {
        error: None,
        allow_reconnect: false,
    }));
}

#[tokio::test]
async fn test_handshake_negotiates_version_one_without_stateful_reconnect() {
    let mut server = TestServer::new();
    let client = server.builder().build();

    let conn = connect(&mut server, &client).await;
    let handshake = conn.handshake.clone().unwrap();
    assert_eq!(handshake.protocol, "json");
    assert_eq!(handshake.version, 1);
}

#[tokio::test]
async fn test_initial_ping_follows_handshake() {
    let mut server = TestServer::new();
    let client = server.builder().build();

    let mut conn = connect(&mut server, &client).await;
    assert_eq!(conn.recv_any().await, Some(HubMessage::Ping));
}

#[tokio::test]
async fn test_start_fails_on_handshake_error() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut events = record_events(&client);

    let (result, _conn) = tokio::join!(client.start(), async {
        let mut conn = server.accept().await;
        conn.read_handshake().await;
        conn.send_handshake_response(Some("Protocol not supported")).await;
        conn
    });

    assert_eq!(
        result.unwrap_err(),
        HubError::Handshake("Protocol not supported".to_string())
    );
    assert_eq!(client.state(), SessionState::Disconnected);
    // A failed start is not a close.
    assert!(events.closed.try_recv().is_err());
}

#[tokio::test]
async fn test_start_fails_on_handshake_timeout() {
    let mut server = TestServer::new();
    let client = server.builder().with_handshake_timeout(ms(50)).build();

    let (result, _conn) = tokio::join!(client.start(), server.accept());

    assert_eq!(result.unwrap_err(), HubError::HandshakeTimeout(ms(50)));
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_start_fails_when_server_disconnects_before_handshake() {
    let mut server = TestServer::new();
    let client = server.builder().build();

    let (result, ()) = tokio::join!(client.start(), async {
        let mut conn = server.accept().await;
        conn.read_handshake().await;
        drop(conn);
    });

    assert_eq!(result.unwrap_err(), HubError::DisconnectedBeforeHandshake);
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_start_fails_when_transport_refuses() {
    let server = TestServer::new();
    server.set_accepting(false);
    let client = server.builder().build();

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, HubError::Io(_)));
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_start_canceled_by_token() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let token = CancellationToken::new();

    let (result, _conn) = tokio::join!(client.start_with_token(&token), async {
        let conn = server.accept().await;
        token.cancel();
        conn
    });

    assert!(result.unwrap_err().is_cancellation());
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_start_when_already_connected_fails() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let _conn = connect(&mut server, &client).await;

    let err = client.start().await.unwrap_err();
    assert_eq!(
        err,
        HubError::InvalidOperation(
            "The HubConnection cannot be started if it is not in the Disconnected state."
                .to_string()
        )
    );
    assert_eq!(client.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let mut server = TestServer::new();
    let client = server.builder().build();

    let first = connect(&mut server, &client).await;
    client.stop().await.unwrap();

    let second = connect(&mut server, &client).await;
    assert_eq!(client.state(), SessionState::Connected);
    assert_ne!(first.connection_id, second.connection_id);
}

#[tokio::test]
async fn test_stop_when_never_started_is_noop() {
    let server = TestServer::new();
    let client = server.builder().build();

    client.stop().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);

    // The stop token was re-armed, so a start is still possible.
    let mut server = server;
    let _conn = connect(&mut server, &client).await;
    assert_eq!(client.state(), SessionState::Connected);
}

// ===== Dispose =====

#[tokio::test]
async fn test_dispose_prevents_further_use() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let _conn = connect(&mut server, &client).await;

    client.dispose().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);

    assert_eq!(client.start().await.unwrap_err(), HubError::Disposed);
    assert_eq!(client.stop().await.unwrap_err(), HubError::Disposed);
    assert_eq!(
        client.send("method", vec![]).await.unwrap_err(),
        HubError::Disposed
    );
    // A second dispose is a no-op.
    client.dispose().await.unwrap();
}

// ===== Stop =====

#[tokio::test]
async fn test_concurrent_stops_send_one_close_frame() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut conn = connect(&mut server, &client).await;

    let (first, second, third) = tokio::join!(client.stop(), client.stop(), client.stop());
    first.unwrap();
    second.unwrap();
    third.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);

    let closes = conn
        .drain()
        .await
        .into_iter()
        .filter(|m| matches!(m, HubMessage::Close { .. }))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_stop_fails_pending_invocations() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut conn = connect(&mut server, &client).await;

    let invoker = client.clone();
    let pending = tokio::spawn(async move { invoker.invoke::<Value>("slow", vec![]).await });
    assert!(matches!(conn.expect_recv().await, HubMessage::Invocation { .. }));

    client.stop().await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap_err(), HubError::ConnectionClosed);
}

#[tokio::test]
async fn test_stop_from_closed_listener_does_not_deadlock() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let listener_client = client.clone();
    client.on_closed(move |_| {
        let client = listener_client.clone();
        let done_tx = done_tx.clone();
        async move {
            client.stop().await?;
            let _ = done_tx.send(());
            Ok(())
        }
    });

    let conn = connect(&mut server, &client).await;
    drop(conn);

    next_event(&mut done_rx).await;
    assert_eq!(client.state(), SessionState::Disconnected);
}

// ===== Server-initiated close =====

#[tokio::test]
async fn test_server_eof_closes_session() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut events = record_events(&client);
    let conn = connect(&mut server, &client).await;

    drop(conn);

    assert_eq!(next_event(&mut events.closed).await, None);
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_server_close_without_reconnect_skips_reconnecting() {
    let mut server = TestServer::new();
    let client = server.builder().with_automatic_reconnect().build();
    let mut events = record_events(&client);
    let mut conn = connect(&mut server, &client).await;

    conn.send(&HubMessage::Close {
        error: Some("shutting down".to_string()),
        allow_reconnect: false,
    })
    .await;

    assert_eq!(
        next_event(&mut events.closed).await,
        Some(HubError::ServerClosed("shutting down".to_string()))
    );
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(events.reconnecting.try_recv().is_err());
    assert_eq!(server.connect_attempts(), 1);
}

#[tokio::test]
async fn test_invalid_frame_closes_session_with_error() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut events = record_events(&client);
    let mut conn = connect(&mut server, &client).await;

    conn.send_raw(b"not json\x1e").await;

    let closed = next_event(&mut events.closed).await;
    assert!(matches!(closed, Some(HubError::InvalidData(_))));
}

#[tokio::test]
async fn test_stream_invocation_from_server_is_protocol_error() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut events = record_events(&client);
    let mut conn = connect(&mut server, &client).await;

    conn.send(&HubMessage::StreamInvocation {
        invocation_id: "1".to_string(),
        target: "numbers".to_string(),
        arguments: vec![],
        stream_ids: vec![],
    })
    .await;

    assert_eq!(
        next_event(&mut events.closed).await,
        Some(HubError::InvalidData(
            "Unexpected message type: StreamInvocation".to_string()
        ))
    );
}

#[tokio::test]
async fn test_partial_frame_at_eof_is_an_error() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let mut events = record_events(&client);
    let mut conn = connect(&mut server, &client).await;

    conn.send_raw(b"{\"type\":6").await;
    drop(conn);

    assert_eq!(
        next_event(&mut events.closed).await,
        Some(HubError::InvalidData(
            "Connection terminated while reading a message.".to_string()
        ))
    );
}

// ===== Handshake buffering =====

#[tokio::test]
async fn test_messages_arriving_with_handshake_response_are_processed() {
    let mut server = TestServer::new();
    let client = server.builder().build();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("hello", vec![ValueKind::String], move |arguments| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(arguments);
            Ok(())
        }
    });

    let (result, _conn) = tokio::join!(client.start(), async {
        let mut conn = server.accept().await;
        conn.read_handshake().await;
        conn.send_raw(b"{}\x1e{\"type\":1,\"target\":\"hello\",\"arguments\":[\"world\"]}\x1e")
            .await;
        conn
    });
    result.unwrap();

    assert_eq!(next_event(&mut rx).await, vec![json!("world")]);
}

#[tokio::test]
async fn test_invalid_handshake_response_fails_start() {
    let mut server = TestServer::new();
    let client = server.builder().build();

    let (result, _conn) = tokio::join!(client.start(), async {
        let mut conn = server.accept().await;
        conn.read_handshake().await;
        conn.send_raw(b"{\"type\":6}\x1e").await;
        conn
    });

    assert_eq!(
        result.unwrap_err(),
        HubError::InvalidData("Expected a handshake response from the server.".to_string())
    );
    assert_eq!(client.state(), SessionState::Disconnected);
}
