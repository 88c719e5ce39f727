// tests/integration/test_helpers.rs

//! Test helpers for integration tests: a scripted hub server running over the
//! in-memory transport, and recorders for lifecycle events.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use hublink::core::protocol::framing::RECORD_SEPARATOR;
use hublink::core::protocol::{
    HandshakeRequest, HandshakeResponse, HubMessage, HubProtocol, JsonHubProtocol,
    PermissiveBinder, RecordSeparatorCodec,
};
use hublink::core::transport::{
    MemoryConnectionFactory, MemoryListener, MemoryServerConnection, MemoryStatefulReconnect,
    MemoryTransportOptions, memory_transport,
};
use hublink::{HubConnection, HubConnectionBuilder, HubError, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub fn init_tracing() {
    // Initialize tracing (ignore error if already initialized)
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// The server end of the in-memory transport.
pub struct TestServer {
    pub factory: MemoryConnectionFactory,
    listener: MemoryListener,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_options(MemoryTransportOptions::default())
    }

    pub fn with_options(options: MemoryTransportOptions) -> Self {
        init_tracing();
        let (factory, listener) = memory_transport(options);
        Self { factory, listener }
    }

    /// A client builder wired to this server, with a fast timer tick.
    pub fn builder(&self) -> HubConnectionBuilder {
        HubConnectionBuilder::new(Arc::new(self.factory.clone()), "memory://hub")
            .with_tick_rate(ms(10))
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.listener.set_accepting(accepting);
    }

    /// Changes the features advertised to later connections.
    pub fn set_options(&self, options: MemoryTransportOptions) {
        self.listener.set_options(options);
    }

    pub fn connect_attempts(&self) -> usize {
        self.listener.connect_attempts()
    }

    pub async fn accept(&mut self) -> ServerConnection {
        let connection = tokio::time::timeout(TEST_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("listener closed");
        ServerConnection::new(connection)
    }

    /// Accepts the next connection and completes its handshake successfully.
    pub async fn accept_handshake(&mut self) -> ServerConnection {
        let mut connection = self.accept().await;
        connection.read_handshake().await;
        connection.send_handshake_response(None).await;
        connection
    }
}

/// Starts `client` against `server` and returns the server's end of the connection.
pub async fn connect(server: &mut TestServer, client: &HubConnection) -> ServerConnection {
    let (started, connection) = tokio::join!(client.start(), server.accept_handshake());
    started.expect("client failed to start");
    connection
}

/// One accepted connection, seen from the server.
pub struct ServerConnection {
    pub connection_id: String,
    pub stateful: Option<Arc<MemoryStatefulReconnect>>,
    pub handshake: Option<HandshakeRequest>,
    framed: Framed<DuplexStream, RecordSeparatorCodec>,
    protocol: JsonHubProtocol,
}

impl ServerConnection {
    fn new(connection: MemoryServerConnection) -> Self {
        Self {
            connection_id: connection.connection_id,
            stateful: connection.stateful_reconnect,
            handshake: None,
            framed: Framed::new(connection.stream, RecordSeparatorCodec),
            protocol: JsonHubProtocol::new(),
        }
    }

    /// The next raw frame, or `None` once the client has closed its side.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        match tokio::time::timeout(TEST_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
        {
            Some(Ok(frame)) => Some(frame),
            Some(Err(e)) => panic!("error reading frame: {e}"),
            None => None,
        }
    }

    pub async fn read_handshake(&mut self) -> HandshakeRequest {
        let frame = self
            .next_frame()
            .await
            .expect("client closed before sending a handshake");
        let request: HandshakeRequest =
            serde_json::from_slice(&frame).expect("invalid handshake request");
        self.handshake = Some(request.clone());
        request
    }

    pub async fn send_handshake_response(&mut self, error: Option<&str>) {
        let response = HandshakeResponse {
            error: error.map(str::to_string),
        };
        let payload = serde_json::to_string(&response).unwrap();
        self.framed.send(payload.as_str()).await.unwrap();
    }

    /// The next message of any kind.
    pub async fn recv_any(&mut self) -> Option<HubMessage> {
        let frame = self.next_frame().await?;
        Some(parse_frame(&frame))
    }

    /// The next message that is not a ping.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        loop {
            match self.recv_any().await? {
                HubMessage::Ping => continue,
                message => return Some(message),
            }
        }
    }

    pub async fn expect_recv(&mut self) -> HubMessage {
        self.recv().await.expect("client closed the connection")
    }

    pub async fn send(&mut self, message: &HubMessage) {
        let mut buf = BytesMut::new();
        self.protocol.write_message(message, &mut buf).unwrap();
        // The codec appends the separator itself.
        buf.truncate(buf.len() - 1);
        self.framed.send(buf.freeze()).await.unwrap();
    }

    /// Writes bytes as-is, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Every message until the client closes its side.
    pub async fn drain(&mut self) -> Vec<HubMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv_any().await {
            messages.push(message);
        }
        messages
    }
}

/// Parses one frame, with or without its trailing separator.
pub fn parse_frame(frame: &[u8]) -> HubMessage {
    let mut buf = BytesMut::from(frame);
    if buf.last() != Some(&RECORD_SEPARATOR) {
        buf.extend_from_slice(&[RECORD_SEPARATOR]);
    }
    JsonHubProtocol::new()
        .try_parse_message(&mut buf, &PermissiveBinder)
        .expect("invalid hub message")
        .expect("incomplete hub message")
}

pub fn invocation_id(message: &HubMessage) -> String {
    match message {
        HubMessage::Invocation {
            invocation_id: Some(id),
            ..
        }
        | HubMessage::StreamInvocation {
            invocation_id: id, ..
        } => id.clone(),
        other => panic!("expected an invocation, got {other:?}"),
    }
}

/// Channels receiving every lifecycle event fired by a client.
pub struct Events {
    pub closed: mpsc::UnboundedReceiver<Option<HubError>>,
    pub reconnecting: mpsc::UnboundedReceiver<Option<HubError>>,
    pub reconnected: mpsc::UnboundedReceiver<Option<String>>,
}

pub fn record_events(client: &HubConnection) -> Events {
    let (closed_tx, closed) = mpsc::unbounded_channel();
    client.on_closed(move |error| {
        let tx = closed_tx.clone();
        async move {
            let _ = tx.send(error);
            Ok(())
        }
    });
    let (reconnecting_tx, reconnecting) = mpsc::unbounded_channel();
    client.on_reconnecting(move |error| {
        let tx = reconnecting_tx.clone();
        async move {
            let _ = tx.send(error);
            Ok(())
        }
    });
    let (reconnected_tx, reconnected) = mpsc::unbounded_channel();
    client.on_reconnected(move |connection_id| {
        let tx = reconnected_tx.clone();
        async move {
            let _ = tx.send(connection_id);
            Ok(())
        }
    });
    Events {
        closed,
        reconnecting,
        reconnected,
    }
}

pub async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

pub async fn wait_for_state(client: &HubConnection, state: SessionState) {
    let mut states = client.state_changes();
    tokio::time::timeout(TEST_TIMEOUT, states.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for a state change")
        .expect("state channel closed");
}
