// src/connection/receive_loop.rs

//! The per-connection receive loop.
//!
//! One loop runs for every established connection. It parses inbound frames and
//! routes them by kind, hands server-to-client invocations to a separate dispatch
//! task so slow handlers never hold up completions and pings, and drives a timer
//! for keep-alive pings, the server timeout and acknowledgements. When the loop ends
//! for any reason it runs close handling.

use super::hub::HubInner;
use super::invocation::send_with_lock;
use super::reconnect::handle_connection_close;
use crate::core::HubError;
use crate::core::cancellation::link;
use crate::core::protocol::HubMessage;
use crate::core::state::{ConnectionState, SessionGuard};
use crate::core::transport::TransportReader;
use bytes::BytesMut;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A server-to-client call waiting for dispatch.
struct InboundInvocation {
    invocation_id: Option<String>,
    target: String,
    arguments: Vec<Value>,
}

enum Flow {
    Continue,
    Close,
}

/// Runs the receive loop of `connection` to completion, then its close handling.
///
/// `read_buf` may already hold bytes that arrived together with the handshake
/// response; they are processed before the first read.
pub(crate) fn receive_loop(
    inner: Arc<HubInner>,
    connection: Arc<ConnectionState>,
    mut reader: TransportReader,
    mut read_buf: BytesMut,
) -> BoxFuture<'static, ()> {
    async move {
        let (invocation_tx, invocation_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_invocations(
            inner.clone(),
            connection.clone(),
            invocation_rx,
        ));
        let timer_stop = CancellationToken::new();
        let timer = tokio::spawn(timer_loop(
            inner.clone(),
            connection.clone(),
            timer_stop.clone(),
        ));

        debug!("Receive loop starting.");
        if let Err(e) =
            read_messages(&inner, &connection, &mut reader, &mut read_buf, &invocation_tx).await
        {
            error!("The server connection was terminated with an error: {}", e);
            connection.set_close_error(e);
        }
        debug!("Receive loop stopped.");

        // Queued invocations still drain; the dispatcher exits once the queue is empty.
        drop(invocation_tx);
        timer_stop.cancel();
        let _ = timer.await;
        connection.cancel_uploads();

        handle_connection_close(&inner, &connection).await;
    }
    .boxed()
}

async fn read_messages(
    inner: &Arc<HubInner>,
    connection: &Arc<ConnectionState>,
    reader: &mut TransportReader,
    read_buf: &mut BytesMut,
    invocations: &mpsc::UnboundedSender<InboundInvocation>,
) -> Result<(), HubError> {
    let read_cancel = connection.read_cancel_token().clone();
    loop {
        while let Some(message) = connection
            .protocol()
            .try_parse_message(read_buf, connection.as_ref())?
        {
            if let Flow::Close = process_message(inner, connection, message, invocations)? {
                return Ok(());
            }
        }

        let read = tokio::select! {
            biased;
            _ = read_cancel.cancelled() => {
                debug!("Receive loop canceled.");
                return Ok(());
            }
            read = reader.read_buf(read_buf) => read?,
        };
        if read == 0 {
            if !read_buf.is_empty() {
                return Err(HubError::InvalidData(
                    "Connection terminated while reading a message.".to_string(),
                ));
            }
            debug!("The server closed the connection.");
            return Ok(());
        }
    }
}

fn process_message(
    inner: &Arc<HubInner>,
    connection: &Arc<ConnectionState>,
    message: HubMessage,
    invocations: &mpsc::UnboundedSender<InboundInvocation>,
) -> Result<Flow, HubError> {
    connection.reset_timeout();

    if let Some(buffer) = connection.buffer()
        && !buffer.should_process_message(&message)
    {
        return Ok(Flow::Continue);
    }

    match message {
        HubMessage::InvocationBindingFailure {
            invocation_id,
            target,
            error,
        } => {
            warn!(
                "Failed to bind arguments received in invocation '{:?}' of '{}': {}",
                invocation_id, target, error
            );
            if let Some(invocation_id) = invocation_id {
                let inner = inner.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    let reply = HubMessage::completion_with_error(
                        invocation_id,
                        "Client failed to parse argument(s).",
                    );
                    if let Err(e) = send_with_lock(&inner, &connection, &reply).await {
                        debug!("Failed to report the binding failure to the server: {}", e);
                    }
                });
            }
        }
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
            ..
        } => {
            debug!("Received Invocation '{:?}' for '{}'.", invocation_id, target);
            let _ = invocations.send(InboundInvocation {
                invocation_id,
                target,
                arguments,
            });
        }
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => match connection.try_remove_invocation(&invocation_id) {
            Some(irq) => irq.complete(result, error),
            None => warn!(
                "Dropped unsolicited Completion message for invocation '{}'.",
                invocation_id
            ),
        },
        HubMessage::StreamItem {
            invocation_id,
            item,
        } => match connection.try_get_invocation(&invocation_id) {
            Some(irq) if irq.token().is_cancelled() => {
                debug!("Dropping StreamItem for canceled invocation '{}'.", invocation_id);
            }
            Some(irq) => {
                if !irq.stream_item(item) {
                    debug!("Dropping StreamItem for invocation '{}' with no reader.", invocation_id);
                }
            }
            None => warn!(
                "Dropped unsolicited StreamItem message for invocation '{}'.",
                invocation_id
            ),
        },
        HubMessage::Close {
            error,
            allow_reconnect,
        } => {
            match error {
                Some(error) => {
                    error!("The server closed the connection with the following error: {}", error);
                    connection.set_close_error(HubError::ServerClosed(error));
                }
                None => debug!("Received a Close message from the server."),
            }
            if !allow_reconnect {
                connection.mark_stopping();
            }
            return Ok(Flow::Close);
        }
        HubMessage::Ping => debug!("Received a ping message."),
        HubMessage::Ack { sequence_id } => {
            if let Some(buffer) = connection.buffer() {
                buffer.ack(sequence_id);
            }
        }
        HubMessage::Sequence { sequence_id } => {
            if let Some(buffer) = connection.buffer() {
                buffer.reset_sequence(sequence_id)?;
            }
        }
        other @ (HubMessage::StreamInvocation { .. } | HubMessage::CancelInvocation { .. }) => {
            return Err(HubError::InvalidData(format!(
                "Unexpected message type: {}",
                other.kind()
            )));
        }
    }
    Ok(Flow::Continue)
}

/// Drains the invocation queue in arrival order.
///
/// Fire-and-forget calls are awaited inline so their handlers run in order. Calls
/// expecting a result run on their own task so a slow handler does not hold up the
/// rest of the queue.
async fn dispatch_invocations(
    inner: Arc<HubInner>,
    connection: Arc<ConnectionState>,
    mut invocations: mpsc::UnboundedReceiver<InboundInvocation>,
) {
    while let Some(invocation) = invocations.recv().await {
        match invocation.invocation_id {
            None => run_handlers(&inner, &invocation.target, invocation.arguments).await,
            Some(invocation_id) => {
                tokio::spawn(invoke_with_result(
                    inner.clone(),
                    connection.clone(),
                    invocation_id,
                    invocation.target,
                    invocation.arguments,
                ));
            }
        }
    }
}

async fn run_handlers(inner: &HubInner, target: &str, arguments: Vec<Value>) {
    let handlers = inner.handlers.snapshot(target);
    if handlers.is_empty() {
        warn!("Failed to find handler for '{}' method.", target);
        return;
    }
    for handler in handlers {
        if let Err(e) = handler.invoke(arguments.clone()).await {
            error!("Invoking client side method '{}' failed: {:#}", target, e);
        }
    }
}

async fn invoke_with_result(
    inner: Arc<HubInner>,
    connection: Arc<ConnectionState>,
    invocation_id: String,
    target: String,
    arguments: Vec<Value>,
) {
    let handlers = inner.handlers.snapshot(&target);
    let reply = match handlers.as_slice() {
        [] => {
            warn!("Failed to find a value returning handler for '{}' method.", target);
            HubMessage::completion_with_error(invocation_id.clone(), "Client didn't provide a result.")
        }
        [handler] => match handler.invoke(arguments).await {
            Ok(result) => {
                HubMessage::completion_with_result(invocation_id.clone(), result.unwrap_or(Value::Null))
            }
            Err(e) => {
                error!("Invoking client side method '{}' failed: {:#}", target, e);
                HubMessage::completion_with_error(invocation_id.clone(), e.to_string())
            }
        },
        _ => {
            warn!("There are multiple handlers registered for '{}' method which expects a result.", target);
            HubMessage::completion_with_error(invocation_id.clone(), "Client provided multiple results.")
        }
    };

    if let Err(e) = send_with_lock(&inner, &connection, &reply).await {
        warn!(
            "Error returning result for invocation '{}' for method '{}': {}",
            invocation_id, target, e
        );
    }
}

/// Ticks at the configured rate until `stop` fires.
///
/// The server-timeout check runs on every tick. Pings and acks are written by a
/// separate task, and no new one starts while the previous write is still blocked
/// on the transport, so a stalled writer never holds up the timeout.
async fn timer_loop(inner: Arc<HubInner>, connection: Arc<ConnectionState>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.options.tick_rate);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    let mut sending: Option<JoinHandle<()>> = None;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let keep_alive = !connection.features().inherent_keep_alive;
        if keep_alive && connection.server_timeout_elapsed() {
            connection.on_server_timeout();
            continue;
        }
        if sending.as_ref().is_some_and(|task| !task.is_finished()) {
            continue;
        }

        // A busy session lock means someone else is already sending; try next tick.
        let ping_guard = if keep_alive && connection.ping_due() && !connection.is_stopping() {
            inner
                .session
                .try_lock()
                .filter(|guard| guard.is_current(&connection))
        } else {
            None
        };
        let ack = connection.buffer().and_then(|buffer| buffer.take_pending_ack());
        if ping_guard.is_some() || ack.is_some() {
            sending = Some(tokio::spawn(send_timer_messages(
                inner.clone(),
                connection.clone(),
                ping_guard,
                ack,
            )));
        }
    }
    if let Some(task) = sending {
        task.abort();
    }
}

async fn send_timer_messages(
    inner: Arc<HubInner>,
    connection: Arc<ConnectionState>,
    ping_guard: Option<SessionGuard>,
    ack: Option<u64>,
) {
    if let Some(guard) = ping_guard {
        let token = inner.session.stop_token();
        if let Err(e) = connection.send_message(&HubMessage::Ping, &token).await {
            debug!("Error sending ping: {}", e);
        }
        drop(guard);
    }

    if let Some(sequence_id) = ack {
        let linked = link(connection.read_cancel_token(), &inner.session.stop_token());
        if let Err(e) = connection
            .send_message(&HubMessage::Ack { sequence_id }, linked.token())
            .await
        {
            debug!("Error sending ack {}: {}", sequence_id, e);
        }
    }
}
