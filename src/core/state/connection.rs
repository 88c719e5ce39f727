// src/core/state/connection.rs

//! State owned by one physical connection: the writer, the pending-invocation table,
//! the keep-alive and server-timeout deadlines, and the stop sequence.

use super::invocation::InvocationRequest;
use super::session::TaskCompletion;
use crate::core::HubError;
use crate::core::buffer::MessageBuffer;
use crate::core::handlers::HandlerRegistry;
use crate::core::protocol::{HubMessage, HubProtocol, InvocationBinder, ValueKind};
use crate::core::transport::{TransportFeatures, TransportWriter};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a connection needs besides the transport itself.
pub struct ConnectionSettings {
    pub protocol: Arc<dyn HubProtocol>,
    pub handlers: Arc<HandlerRegistry>,
    pub server_timeout: Duration,
    pub keep_alive_interval: Duration,
}

pub struct ConnectionState {
    connection_id: Option<String>,
    protocol: Arc<dyn HubProtocol>,
    handlers: Arc<HandlerRegistry>,
    writer: AsyncMutex<TransportWriter>,
    features: TransportFeatures,
    buffer: Option<Arc<MessageBuffer>>,

    next_invocation_id: AtomicU64,
    pending: Mutex<HashMap<String, Arc<InvocationRequest>>>,

    /// Set once, never cleared. Suppresses reconnection and new invocations.
    stopping: AtomicBool,
    close_error: Mutex<Option<HubError>>,
    close_sent: AtomicBool,
    transport_closed: AtomicBool,
    write_failed: AtomicBool,

    // Deadlines in milliseconds since `epoch`.
    epoch: Instant,
    next_server_timeout_ms: AtomicU64,
    next_ping_ms: AtomicU64,
    server_timeout: Duration,
    keep_alive_interval: Duration,

    /// Cancels the pending read, ending the receive loop.
    read_cancel: CancellationToken,
    /// Cancels every upload stream pumping on this connection.
    upload_cancel: CancellationToken,
    receive_task: Mutex<Option<TaskCompletion>>,
    stop_task: Mutex<Option<TaskCompletion>>,
}

impl ConnectionState {
    pub fn new(
        connection_id: Option<String>,
        writer: TransportWriter,
        features: TransportFeatures,
        buffer: Option<Arc<MessageBuffer>>,
        settings: ConnectionSettings,
    ) -> Self {
        let state = Self {
            connection_id,
            protocol: settings.protocol,
            handlers: settings.handlers,
            writer: AsyncMutex::new(writer),
            features,
            buffer,
            next_invocation_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            close_error: Mutex::new(None),
            close_sent: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            epoch: Instant::now(),
            next_server_timeout_ms: AtomicU64::new(0),
            next_ping_ms: AtomicU64::new(0),
            server_timeout: settings.server_timeout,
            keep_alive_interval: settings.keep_alive_interval,
            read_cancel: CancellationToken::new(),
            upload_cancel: CancellationToken::new(),
            receive_task: Mutex::new(None),
            stop_task: Mutex::new(None),
        };
        state.reset_timeout();
        state.reset_send_ping();
        state
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn protocol(&self) -> &Arc<dyn HubProtocol> {
        &self.protocol
    }

    pub fn features(&self) -> &TransportFeatures {
        &self.features
    }

    pub fn buffer(&self) -> Option<&Arc<MessageBuffer>> {
        self.buffer.as_ref()
    }

    // --- Invocation ids and the pending table ---

    /// The next id, stringified. Shared by invocations and upload streams.
    pub fn next_invocation_id(&self) -> String {
        (self.next_invocation_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub fn add_invocation(&self, request: Arc<InvocationRequest>) -> Result<(), HubError> {
        let mut pending = self.pending.lock();
        let id = request.invocation_id().to_string();
        if pending.contains_key(&id) {
            return Err(HubError::Internal(format!(
                "Invocation ID '{id}' is already in use."
            )));
        }
        pending.insert(id, request);
        Ok(())
    }

    pub fn try_get_invocation(&self, invocation_id: &str) -> Option<Arc<InvocationRequest>> {
        self.pending.lock().get(invocation_id).cloned()
    }

    pub fn try_remove_invocation(&self, invocation_id: &str) -> Option<Arc<InvocationRequest>> {
        self.pending.lock().remove(invocation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fails every pending invocation with `error`, or a generic close error.
    pub fn cancel_outstanding_invocations(&self, error: Option<HubError>) {
        let drained: Vec<_> = self.pending.lock().drain().map(|(_, irq)| irq).collect();
        if drained.is_empty() {
            return;
        }
        debug!("Canceling {} outstanding invocation(s).", drained.len());
        let error = error.unwrap_or(HubError::ConnectionClosed);
        for irq in drained {
            irq.fail(error.clone());
        }
    }

    // --- Stopping and close cause ---

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn close_error(&self) -> Option<HubError> {
        self.close_error.lock().clone()
    }

    pub fn set_close_error(&self, error: HubError) {
        *self.close_error.lock() = Some(error);
    }

    /// Records `error` as the close cause unless one is already known, then ends the
    /// receive loop so close handling runs.
    pub fn abort(&self, error: HubError) {
        {
            let mut close_error = self.close_error.lock();
            if close_error.is_none() {
                *close_error = Some(error);
            }
        }
        self.read_cancel.cancel();
    }

    /// Returns true exactly once, for the caller that should send the close frame.
    pub fn claim_close_frame(&self) -> bool {
        !self.close_sent.swap(true, Ordering::AcqRel)
    }

    // --- Deadlines ---

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Pushes the server-timeout deadline out. Called for every inbound message.
    pub fn reset_timeout(&self) {
        let deadline = self.now_ms() + self.server_timeout.as_millis() as u64;
        self.next_server_timeout_ms.store(deadline, Ordering::Release);
    }

    /// Pushes the keep-alive deadline out. Called for every outbound message.
    pub fn reset_send_ping(&self) {
        let deadline = self.now_ms() + self.keep_alive_interval.as_millis() as u64;
        self.next_ping_ms.store(deadline, Ordering::Release);
    }

    pub fn server_timeout_elapsed(&self) -> bool {
        self.now_ms() > self.next_server_timeout_ms.load(Ordering::Acquire)
    }

    pub fn ping_due(&self) -> bool {
        self.now_ms() > self.next_ping_ms.load(Ordering::Acquire)
    }

    /// Fails the connection for server silence.
    pub fn on_server_timeout(&self) {
        warn!(
            "Server timeout ({}ms) elapsed without receiving a message from the server.",
            self.server_timeout.as_millis()
        );
        self.set_close_error(HubError::ServerTimeout(self.server_timeout));
        self.read_cancel.cancel();
    }

    // --- Writing ---

    /// Serializes and writes one message, giving up when `token` fires.
    ///
    /// Sequenced messages wait for room in the acknowledgement buffer before the
    /// writer lock is taken, then get their sequence id under it so ids match wire
    /// order. Serialization failures and cancellation before anything was committed
    /// fail only this call. A transport failure, or a cancellation once part of the
    /// frame is on the wire or sequenced, fails the connection: the error is recorded
    /// as the close cause and the receive loop is stopped.
    pub async fn send_message(
        &self,
        message: &HubMessage,
        token: &CancellationToken,
    ) -> Result<(), HubError> {
        let mut frame = BytesMut::new();
        self.protocol.write_message(message, &mut frame)?;
        let frame = frame.freeze();

        if self.write_failed.load(Ordering::Acquire) {
            return Err(HubError::ConnectionClosed);
        }
        let sequencing = self.buffer.as_ref().filter(|_| message.is_sequenced());

        let mut writer = loop {
            if let Some(buffer) = sequencing {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(HubError::canceled()),
                    space = buffer.wait_for_space() => space?,
                }
            }
            let writer = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(HubError::canceled()),
                writer = self.writer.lock() => writer,
            };
            if self.write_failed.load(Ordering::Acquire) {
                return Err(HubError::ConnectionClosed);
            }
            if let Some(buffer) = sequencing
                && buffer.try_track(frame.clone())?.is_none()
            {
                continue;
            }
            break writer;
        };

        let (written, result) = write_frame(&mut writer, &frame, token).await;
        match result {
            Ok(()) => {
                drop(writer);
                self.reset_send_ping();
                Ok(())
            }
            Err(error) if error.is_cancellation() && written == 0 && sequencing.is_none() => {
                Err(error)
            }
            Err(error) => {
                // Later writes would land in the middle of a torn frame.
                self.write_failed.store(true, Ordering::Release);
                drop(writer);
                warn!("Failed to send {} message: {}", message.kind(), error);
                self.abort(error.clone());
                Err(error)
            }
        }
    }

    /// True once a write failed or was cut off; the connection is unusable.
    pub fn write_failed(&self) -> bool {
        self.write_failed.load(Ordering::Acquire)
    }

    /// Writes pre-framed bytes, bypassing the protocol and the acknowledgement buffer.
    pub async fn write_raw(&self, bytes: Bytes) -> Result<(), HubError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shuts the transport's write side down. Later calls do nothing.
    pub async fn close_transport(&self) {
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Error while closing the transport: {}", e);
        }
    }

    /// Releases connection-level resources once the connection is gone.
    pub fn dispose_buffer(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.dispose();
        }
    }

    // --- Receive loop and stop sequence ---

    pub fn read_cancel_token(&self) -> &CancellationToken {
        &self.read_cancel
    }

    pub fn upload_token(&self) -> &CancellationToken {
        &self.upload_cancel
    }

    pub fn cancel_uploads(&self) {
        self.upload_cancel.cancel();
    }

    pub fn set_receive_task(&self, task: TaskCompletion) {
        *self.receive_task.lock() = Some(task);
    }

    /// Starts the stop sequence: marks the connection stopping, cancels the pending
    /// read, and returns a future resolving once the receive loop has ended. Every
    /// call returns the same future.
    pub fn stop(&self) -> TaskCompletion {
        let mut stop_task = self.stop_task.lock();
        if let Some(task) = stop_task.as_ref() {
            return task.clone();
        }
        debug!("Stopping connection {:?}.", self.connection_id);
        self.mark_stopping();
        self.read_cancel.cancel();
        let receive_task = self.receive_task.lock().clone();
        let task = async move {
            if let Some(receive_task) = receive_task {
                receive_task.await;
            }
        }
        .boxed()
        .shared();
        *stop_task = Some(task.clone());
        task
    }
}

/// Writes `frame` and flushes, stopping when `token` fires. Returns how many bytes
/// reached the transport alongside the outcome.
async fn write_frame(
    writer: &mut TransportWriter,
    frame: &[u8],
    token: &CancellationToken,
) -> (usize, Result<(), HubError>) {
    let mut written = 0;
    while written < frame.len() {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return (written, Err(HubError::canceled())),
            result = writer.write(&frame[written..]) => result,
        };
        match result {
            Ok(0) => {
                let error = std::io::Error::from(std::io::ErrorKind::WriteZero);
                return (written, Err(error.into()));
            }
            Ok(n) => written += n,
            Err(e) => return (written, Err(e.into())),
        }
    }
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(HubError::canceled()),
        result = writer.flush() => result.map_err(HubError::from),
    };
    (written, result)
}

impl InvocationBinder for ConnectionState {
    fn parameter_kinds(&self, target: &str) -> Option<Vec<ValueKind>> {
        self.handlers.parameter_kinds(target)
    }

    fn return_kind(&self, invocation_id: &str) -> Option<ValueKind> {
        self.try_get_invocation(invocation_id)
            .map(|irq| irq.result_kind())
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("connection_id", &self.connection_id)
            .field("stopping", &self.is_stopping())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
