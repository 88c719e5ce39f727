// src/connection/hub.rs

//! Defines `HubConnection`, the public face of a hub session: start, stop and
//! dispose, client method registration and lifecycle events. Outgoing invocations
//! live in `invocation.rs`.

use super::handshake::start_core;
use crate::config::HubConnectionOptions;
use crate::core::HubError;
use crate::core::events::LifecycleEvents;
use crate::core::handlers::{HandlerFn, HandlerRegistry, Subscription};
use crate::core::protocol::{HubMessage, HubProtocol, ValueKind};
use crate::core::retry::RetryPolicy;
use crate::core::state::{
    ConnectionSettings, ReconnectingConnectionState, SessionCore, SessionState,
};
use crate::core::transport::ConnectionFactory;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `stop` waits for the transport to accept the close frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state behind every clone of a `HubConnection` and every background task it
/// spawns.
pub(crate) struct HubInner {
    pub(crate) session: ReconnectingConnectionState,
    pub(crate) factory: Arc<dyn ConnectionFactory>,
    pub(crate) endpoint: String,
    pub(crate) protocol: Arc<dyn HubProtocol>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) options: HubConnectionOptions,
    pub(crate) stateful_reconnect: bool,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) events: LifecycleEvents,
    pub(crate) disposed: AtomicBool,
}

impl HubInner {
    pub(crate) fn check_disposed(&self) -> Result<(), HubError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(HubError::Disposed);
        }
        Ok(())
    }

    pub(crate) fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            protocol: self.protocol.clone(),
            handlers: self.handlers.clone(),
            server_timeout: self.options.server_timeout,
            keep_alive_interval: self.options.keep_alive_interval,
        }
    }

    /// The session has just reached `Disconnected`: arm a fresh stop token for the
    /// next start and notify `closed` listeners.
    pub(crate) fn complete_close(&self, core: &mut SessionCore, error: Option<HubError>) {
        self.session.reset_stop_token(core);
        core.set_reconnect_task(None);
        self.events.closed.fire(error);
    }
}

/// A persistent, bidirectional RPC session with a hub.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct HubConnection {
    pub(crate) inner: Arc<HubInner>,
}

impl HubConnection {
    pub(crate) fn from_inner(inner: HubInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// Id of the current transport connection, when connected.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.session.connection_id()
    }

    /// Observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.session.subscribe()
    }

    pub fn options(&self) -> &HubConnectionOptions {
        &self.inner.options
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    // --- Lifecycle ---

    pub async fn start(&self) -> Result<(), HubError> {
        self.start_with_token(&CancellationToken::new()).await
    }

    /// Connects and completes the handshake. Only valid from `Disconnected`.
    pub async fn start_with_token(&self, token: &CancellationToken) -> Result<(), HubError> {
        let inner = &self.inner;
        inner.check_disposed()?;
        let mut guard = inner.session.wait_lock(token).await?;
        inner.check_disposed()?;

        if inner.session.stop_token().is_cancelled() {
            return Err(HubError::InvalidOperation(
                "The HubConnection cannot be started while stop is running.".to_string(),
            ));
        }
        if !guard.try_change_state(SessionState::Disconnected, SessionState::Connecting) {
            return Err(HubError::InvalidOperation(
                "The HubConnection cannot be started if it is not in the Disconnected state."
                    .to_string(),
            ));
        }

        match start_core(inner, &mut guard, token).await {
            Ok(()) => {
                guard.change_state(SessionState::Connecting, SessionState::Connected)?;
                info!("HubConnection started.");
                Ok(())
            }
            Err(e) => {
                warn!("HubConnection failed to start: {}", e);
                if guard.try_change_state(SessionState::Connecting, SessionState::Disconnected) {
                    inner.session.reset_stop_token(&guard);
                }
                Err(e)
            }
        }
    }

    /// Stops the session. Concurrent calls all return once the single underlying
    /// stop has finished.
    pub async fn stop(&self) -> Result<(), HubError> {
        self.inner.check_disposed()?;
        self.stop_core(false).await
    }

    /// Stops the session and marks it disposed. Later calls do nothing.
    pub async fn dispose(&self) -> Result<(), HubError> {
        self.stop_core(true).await
    }

    async fn stop_core(&self, disposing: bool) -> Result<(), HubError> {
        let inner = &self.inner;
        // Cut any reconnect delay or in-flight connect short before queueing for the lock.
        inner.session.stop_token().cancel();

        let mut guard = inner.session.lock().await;
        if inner.disposed.load(Ordering::Acquire) {
            return Ok(());
        }

        // The reconnect task needs the lock to finish, so wait for it outside the lock.
        if let Some(reconnect_task) = guard.reconnect_task() {
            drop(guard);
            debug!("Waiting for the reconnect loop to finish before stopping.");
            reconnect_task.await;
            guard = inner.session.lock().await;
        }

        let stop_task = match guard.current().cloned() {
            Some(connection) => {
                info!("Stopping HubConnection.");
                connection.mark_stopping();
                // Writers blocked on a full acknowledgement buffer would otherwise hold
                // the writer lock forever.
                connection.dispose_buffer();
                if connection.claim_close_frame() {
                    let close = HubMessage::Close {
                        error: None,
                        allow_reconnect: false,
                    };
                    // The stop token is already cancelled, so the close frame gets its
                    // own bound.
                    let sent = tokio::time::timeout(
                        CLOSE_FRAME_TIMEOUT,
                        connection.send_message(&close, &CancellationToken::new()),
                    )
                    .await;
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Error sending Close message: {}", e),
                        Err(_) => debug!("Timed out sending Close message."),
                    }
                }
                if let Some(feature) = &connection.features().stateful_reconnect {
                    feature.disable();
                }
                Some(connection.stop())
            }
            None => {
                // Nothing will run close handling, so re-arm the stop token here.
                inner.session.reset_stop_token(&guard);
                None
            }
        };

        if disposing {
            inner.disposed.store(true, Ordering::Release);
        }
        drop(guard);

        if let Some(stop_task) = stop_task {
            stop_task.await;
        }
        debug!("HubConnection stopped.");
        Ok(())
    }

    // --- Client methods ---

    /// Registers a handler for server invocations of `method`. Arguments are checked
    /// against `parameter_kinds` before the handler runs.
    pub fn on<F, Fut>(&self, method: &str, parameter_kinds: Vec<ValueKind>, handler: F) -> Subscription
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: HandlerFn = Arc::new(move |arguments| {
            let call = handler(arguments);
            async move { call.await.map(|()| None) }.boxed()
        });
        let id = self.inner.handlers.add(method, parameter_kinds, callback);
        Subscription::new(&self.inner.handlers, method, id)
    }

    /// Registers a handler whose return value answers server invocations that expect
    /// a result.
    pub fn on_invoke<F, Fut>(
        &self,
        method: &str,
        parameter_kinds: Vec<ValueKind>,
        handler: F,
    ) -> Subscription
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let callback: HandlerFn = Arc::new(move |arguments| {
            let call = handler(arguments);
            async move { call.await.map(Some) }.boxed()
        });
        let id = self.inner.handlers.add(method, parameter_kinds, callback);
        Subscription::new(&self.inner.handlers, method, id)
    }

    /// Removes every handler registered for `method`.
    pub fn remove(&self, method: &str) {
        self.inner.handlers.remove_method(method);
    }

    // --- Lifecycle events ---

    pub fn on_closed<F, Fut>(&self, listener: F)
    where
        F: Fn(Option<HubError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .events
            .closed
            .add(Arc::new(move |error| listener(error).boxed()));
    }

    pub fn on_reconnecting<F, Fut>(&self, listener: F)
    where
        F: Fn(Option<HubError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .events
            .reconnecting
            .add(Arc::new(move |error| listener(error).boxed()));
    }

    pub fn on_reconnected<F, Fut>(&self, listener: F)
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .events
            .reconnected
            .add(Arc::new(move |connection_id| listener(connection_id).boxed()));
    }
}
