// src/connection/handshake.rs

//! Brings one physical connection up: opens the transport, negotiates the protocol
//! version, runs the handshake, installs the connection as current and launches its
//! receive loop. Shared by `start` and every reconnect attempt.

use super::hub::HubInner;
use super::receive_loop::receive_loop;
use crate::core::HubError;
use crate::core::buffer::MessageBuffer;
use crate::core::cancellation::link;
use crate::core::protocol::HubMessage;
use crate::core::state::{ConnectionState, SessionCore};
use crate::core::transport::{TransportConnection, TransportReader};
use bytes::BytesMut;
use futures::FutureExt;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_BUFFER_CAPACITY: usize = 4096;

/// Starts a connection while the caller holds the session lock.
///
/// `token` is linked with the session's stop token, so a concurrent stop aborts the
/// connect and the handshake. On failure nothing is left installed.
pub(crate) async fn start_core(
    inner: &Arc<HubInner>,
    core: &mut SessionCore,
    token: &CancellationToken,
) -> Result<(), HubError> {
    let linked = link(token, &inner.session.stop_token());
    let token = linked.token();

    debug!("Starting HubConnection.");
    let TransportConnection {
        connection_id,
        reader,
        writer,
        mut features,
    } = inner.factory.connect(&inner.endpoint, token).await?;

    if !inner.stateful_reconnect
        && let Some(feature) = features.stateful_reconnect.take()
    {
        feature.disable();
    }

    let protocol = &inner.protocol;
    let version = if features.stateful_reconnect.is_none() && protocol.is_version_supported(1) {
        1
    } else {
        protocol.version()
    };
    if version < 2
        && let Some(feature) = features.stateful_reconnect.take()
    {
        debug!("Protocol version {} does not support stateful reconnect.", version);
        feature.disable();
    }

    let buffer = features
        .stateful_reconnect
        .as_ref()
        .map(|_| Arc::new(MessageBuffer::new(inner.options.stateful_reconnect_buffer_size)));
    if let (Some(feature), Some(buffer)) = (&features.stateful_reconnect, &buffer) {
        let buffer = Arc::downgrade(buffer);
        let protocol = protocol.clone();
        feature.on_reconnected(Arc::new(move || match buffer.upgrade() {
            Some(buffer) => buffer.resend_frames(protocol.as_ref()),
            None => Err(HubError::ConnectionClosed),
        }));
    }

    let connection = Arc::new(ConnectionState::new(
        connection_id,
        writer,
        features,
        buffer,
        inner.connection_settings(),
    ));

    let mut reader = reader;
    let mut read_buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    if let Err(e) = handshake(inner, &connection, &mut reader, &mut read_buf, version, token).await {
        error!("Error starting connection: {}", e);
        connection.close_transport().await;
        connection.dispose_buffer();
        return Err(e);
    }

    // Keep-alive and server-timeout deadlines count from the end of the handshake.
    connection.reset_timeout();
    connection.reset_send_ping();
    core.set_current(connection.clone());

    if !connection.features().inherent_keep_alive
        && let Err(e) = connection.send_message(&HubMessage::Ping, token).await
    {
        warn!("Failed to send the initial ping: {}", e);
        core.take_current();
        connection.close_transport().await;
        connection.dispose_buffer();
        return Err(e);
    }

    let receive = tokio::spawn(receive_loop(
        inner.clone(),
        connection.clone(),
        reader,
        read_buf,
    ));
    connection.set_receive_task(receive.map(|_| ()).boxed().shared());

    info!(
        "HubConnection connected with connection id {:?}, protocol '{}' version {}.",
        connection.connection_id(),
        protocol.name(),
        version
    );
    Ok(())
}

/// Sends the handshake request and reads until a complete response arrives. Bytes
/// that follow the response stay in `read_buf` for the receive loop.
async fn handshake(
    inner: &HubInner,
    connection: &ConnectionState,
    reader: &mut TransportReader,
    read_buf: &mut BytesMut,
    version: u32,
    token: &CancellationToken,
) -> Result<(), HubError> {
    let mut request = BytesMut::new();
    inner.protocol.write_handshake_request(version, &mut request)?;
    let request = request.freeze();

    let exchange = async {
        debug!("Sending Hub Handshake.");
        connection.write_raw(request.clone()).await?;
        loop {
            if let Some(response) = inner.protocol.try_parse_handshake_response(read_buf)? {
                if let Some(error) = response.error {
                    error!("Server returned handshake error: {}", error);
                    return Err(HubError::Handshake(error));
                }
                debug!("Handshake with server complete.");
                return Ok(());
            }
            if reader.read_buf(read_buf).await? == 0 {
                return Err(HubError::DisconnectedBeforeHandshake);
            }
        }
    };

    let handshake_timeout = inner.options.handshake_timeout;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(HubError::canceled()),
        outcome = tokio::time::timeout(handshake_timeout, exchange) => match outcome {
            Ok(result) => result,
            Err(_) => Err(HubError::HandshakeTimeout(handshake_timeout)),
        },
    }
}
