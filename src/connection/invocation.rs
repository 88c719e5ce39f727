// src/connection/invocation.rs

//! Client-to-server calls: `invoke`, `send` and `stream`, plus the upload pumps that
//! feed streamed arguments to the server.

use super::hub::{HubConnection, HubInner};
use crate::core::HubError;
use crate::core::cancellation::link;
use crate::core::protocol::{HubMessage, ValueKind};
use crate::core::state::{ConnectionState, InvocationRequest};
use crate::core::streams::{Argument, HubStreamReader, UploadSource};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Serialized arguments, the stream ids advertised to the server, and the upload
/// sources those ids belong to.
type PackagedArguments = (Vec<Value>, Vec<String>, Vec<(String, UploadSource)>);

/// Splits plain values from upload sources. Each upload takes the next id from the
/// connection's invocation-id sequence.
fn package_arguments(connection: &ConnectionState, arguments: Vec<Argument>) -> PackagedArguments {
    let mut values = Vec::with_capacity(arguments.len());
    let mut stream_ids = Vec::new();
    let mut uploads = Vec::new();
    for argument in arguments {
        match argument {
            Argument::Value(value) => values.push(value),
            Argument::Upload(source) => {
                let stream_id = connection.next_invocation_id();
                stream_ids.push(stream_id.clone());
                uploads.push((stream_id, source));
            }
        }
    }
    (values, stream_ids, uploads)
}

fn launch_streams(
    inner: &Arc<HubInner>,
    connection: &Arc<ConnectionState>,
    uploads: Vec<(String, UploadSource)>,
    token: &CancellationToken,
) {
    for (stream_id, source) in uploads {
        tokio::spawn(pump_upload(
            inner.clone(),
            connection.clone(),
            stream_id,
            source,
            token.clone(),
        ));
    }
}

/// Forwards every item of `source` as a `StreamItem`, then completes the stream.
///
/// Stops early when the caller cancels or the connection closes, completing the
/// stream with an error in that case.
async fn pump_upload(
    inner: Arc<HubInner>,
    connection: Arc<ConnectionState>,
    stream_id: String,
    source: UploadSource,
    caller_token: CancellationToken,
) {
    let linked = link(connection.upload_token(), &caller_token);
    let token = linked.token();
    let mut items = source.into_stream();
    debug!("Starting upload stream '{}'.", stream_id);

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break Err("Stream canceled by client.".to_string()),
            next = items.next() => next,
        };
        match next {
            Some(Ok(item)) => {
                let message = HubMessage::StreamItem {
                    invocation_id: stream_id.clone(),
                    item,
                };
                if let Err(e) = send_with_lock(&inner, &connection, &message).await {
                    break Err(format!("Stream errored by client: '{e}'"));
                }
            }
            Some(Err(e)) => break Err(format!("Stream errored by client: '{e}'")),
            None => break Ok(()),
        }
    };

    let completion = match outcome {
        Ok(()) => {
            debug!("Completing upload stream '{}'.", stream_id);
            HubMessage::empty_completion(stream_id.clone())
        }
        Err(error) => {
            debug!("Upload stream '{}' ended with an error: {}", stream_id, error);
            HubMessage::completion_with_error(stream_id.clone(), error)
        }
    };
    if let Err(e) = send_with_lock(&inner, &connection, &completion).await {
        debug!("Failed to complete upload stream '{}': {}", stream_id, e);
    }
}

/// Sends on a connection the caller already holds the session lock for. The write
/// gives up when either `token` or the session's stop token fires, so a stop never
/// waits behind a blocked transport.
async fn send_hub_message(
    inner: &HubInner,
    connection: &ConnectionState,
    message: &HubMessage,
    token: &CancellationToken,
) -> Result<(), HubError> {
    let linked = link(token, &inner.session.stop_token());
    connection.send_message(message, linked.token()).await
}

/// Takes the session lock and sends `message`, but only while `expected` is still
/// the current connection.
pub(crate) async fn send_with_lock(
    inner: &HubInner,
    expected: &Arc<ConnectionState>,
    message: &HubMessage,
) -> Result<(), HubError> {
    let (guard, connection) = inner
        .session
        .wait_for_active_connection("send", &CancellationToken::new())
        .await?;
    if !Arc::ptr_eq(&connection, expected) {
        return Err(HubError::InvalidOperation(
            "The connection was replaced before the message could be sent.".to_string(),
        ));
    }
    let result = connection
        .send_message(message, &inner.session.stop_token())
        .await;
    drop(guard);
    result
}

impl HubConnection {
    /// Invokes `method` and waits for its completion.
    ///
    /// The result is checked against `result_kind` when it arrives. Cancelling
    /// `token` abandons the call locally; the server is not told.
    pub async fn invoke_core(
        &self,
        method: &str,
        result_kind: ValueKind,
        arguments: Vec<Argument>,
        token: &CancellationToken,
    ) -> Result<Option<Value>, HubError> {
        let inner = &self.inner;
        inner.check_disposed()?;
        let (guard, connection) = inner.session.wait_for_active_connection("invoke", token).await?;

        let (values, stream_ids, uploads) = package_arguments(&connection, arguments);
        let invocation_id = connection.next_invocation_id();
        let (irq, rx) = InvocationRequest::single(invocation_id.clone(), result_kind, token.clone());
        let irq = Arc::new(irq);
        connection.add_invocation(irq.clone())?;

        debug!("Sending Invocation '{}' for '{}'.", invocation_id, method);
        let message = HubMessage::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments: values,
            stream_ids,
        };
        if let Err(e) = send_hub_message(inner, &connection, &message, token).await {
            connection.try_remove_invocation(&invocation_id);
            irq.fail(e.clone());
            return Err(e);
        }
        launch_streams(inner, &connection, uploads, token);
        drop(guard);

        tokio::select! {
            result = rx => result.unwrap_or_else(|_| Err(HubError::ConnectionClosed)),
            _ = token.cancelled() => {
                if let Some(irq) = connection.try_remove_invocation(&invocation_id) {
                    irq.cancel();
                }
                Err(HubError::canceled())
            }
        }
    }

    /// Sends a fire-and-forget invocation. Returns once the message is written.
    pub async fn send_core(
        &self,
        method: &str,
        arguments: Vec<Argument>,
        token: &CancellationToken,
    ) -> Result<(), HubError> {
        let inner = &self.inner;
        inner.check_disposed()?;
        let (guard, connection) = inner.session.wait_for_active_connection("send", token).await?;

        let (values, stream_ids, uploads) = package_arguments(&connection, arguments);
        debug!("Sending Invocation for '{}' without a result.", method);
        let message = HubMessage::Invocation {
            invocation_id: None,
            target: method.to_string(),
            arguments: values,
            stream_ids,
        };
        send_hub_message(inner, &connection, &message, token).await?;
        launch_streams(inner, &connection, uploads, token);
        drop(guard);
        Ok(())
    }

    /// Starts a server-to-client stream.
    ///
    /// Cancelling `token` or dropping the returned reader cancels the stream: the
    /// reader ends cleanly and the server receives a `CancelInvocation`.
    pub async fn stream_as_channel_core(
        &self,
        method: &str,
        item_kind: ValueKind,
        arguments: Vec<Argument>,
        token: &CancellationToken,
    ) -> Result<HubStreamReader, HubError> {
        let inner = &self.inner;
        inner.check_disposed()?;
        let stream_token = token.child_token();
        let (guard, connection) = inner.session.wait_for_active_connection("stream", token).await?;

        let (values, stream_ids, uploads) = package_arguments(&connection, arguments);
        let invocation_id = connection.next_invocation_id();
        let (irq, rx) = InvocationRequest::stream(invocation_id.clone(), item_kind, stream_token.clone());
        let irq = Arc::new(irq);
        connection.add_invocation(irq.clone())?;

        debug!("Sending StreamInvocation '{}' for '{}'.", invocation_id, method);
        let message = HubMessage::StreamInvocation {
            invocation_id: invocation_id.clone(),
            target: method.to_string(),
            arguments: values,
            stream_ids,
        };
        if let Err(e) = send_hub_message(inner, &connection, &message, token).await {
            connection.try_remove_invocation(&invocation_id);
            irq.fail(e.clone());
            return Err(e);
        }
        launch_streams(inner, &connection, uploads, &stream_token);
        drop(guard);

        let done = irq.done_token();
        let cancel_token = stream_token.clone();
        let inner = inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = cancel_token.cancelled() => {
                    let Some(irq) = connection.try_remove_invocation(&invocation_id) else {
                        return;
                    };
                    irq.cancel();
                    debug!("Sending CancelInvocation for '{}'.", invocation_id);
                    let cancel = HubMessage::CancelInvocation { invocation_id };
                    if let Err(e) = send_with_lock(&inner, &connection, &cancel).await {
                        debug!("Failed to send CancelInvocation: {}", e);
                    }
                }
            }
        });

        Ok(HubStreamReader::new(rx, stream_token.drop_guard()))
    }

    /// Invokes `method` with plain arguments and deserializes its result.
    pub async fn invoke<T>(&self, method: &str, arguments: Vec<Value>) -> Result<T, HubError>
    where
        T: DeserializeOwned,
    {
        let arguments = arguments.into_iter().map(Argument::Value).collect();
        let result = self
            .invoke_core(method, ValueKind::Any, arguments, &CancellationToken::new())
            .await?;
        Ok(serde_json::from_value(result.unwrap_or(Value::Null))?)
    }

    pub async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        let arguments = arguments.into_iter().map(Argument::Value).collect();
        self.send_core(method, arguments, &CancellationToken::new()).await
    }

    /// Streams `method` with plain arguments, deserializing every item.
    pub async fn stream<T>(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<BoxStream<'static, Result<T, HubError>>, HubError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let arguments = arguments.into_iter().map(Argument::Value).collect();
        let mut reader = self
            .stream_as_channel_core(method, ValueKind::Any, arguments, &CancellationToken::new())
            .await?;
        Ok(Box::pin(async_stream::try_stream! {
            while let Some(item) = reader.next().await {
                let value = item?;
                yield serde_json::from_value::<T>(value)?;
            }
        }))
    }
}
