// src/core/state/session.rs

//! The session-wide state machine and the single lock that serializes it.
//!
//! `SessionCore` is only reachable through an `OwnedMutexGuard`, so every method
//! that reads or swaps the current connection, or transitions the session state,
//! can only be called by a task that holds the session lock. The guard is owned
//! rather than borrowed so close handling can move it into the reconnect task
//! without releasing the lock in between.

use super::connection::ConnectionState;
use crate::core::HubError;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// The overall state of a hub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// A task-completion future that any number of waiters can await.
pub type TaskCompletion = Shared<BoxFuture<'static, ()>>;

/// Proof of holding the session lock. Dropping it releases the lock.
pub type SessionGuard = OwnedMutexGuard<SessionCore>;

/// State guarded by the session lock.
#[derive(Debug)]
pub struct SessionCore {
    overall_state: SessionState,
    current: Option<Arc<ConnectionState>>,
    reconnect_task: Option<TaskCompletion>,
    state_tx: watch::Sender<SessionState>,
    connection_id: Arc<RwLock<Option<String>>>,
}

impl SessionCore {
    pub fn state(&self) -> SessionState {
        self.overall_state
    }

    /// Moves from `expected` to `next`. Returns false, changing nothing, when the
    /// session is not in `expected`.
    pub fn try_change_state(&mut self, expected: SessionState, next: SessionState) -> bool {
        if self.overall_state != expected {
            return false;
        }
        debug!("The HubConnection is transitioning from the {} state to the {} state.", expected, next);
        self.overall_state = next;
        self.state_tx.send_replace(next);
        true
    }

    /// Like `try_change_state`, for transitions the caller has already guaranteed.
    /// A mismatch is an internal consistency failure.
    pub fn change_state(&mut self, expected: SessionState, next: SessionState) -> Result<(), HubError> {
        if self.try_change_state(expected, next) {
            return Ok(());
        }
        let message = format!(
            "The HubConnection failed to transition from the {expected} state to the {next} state because it was actually in the {} state.",
            self.overall_state
        );
        error!("{}", message);
        Err(HubError::Internal(message))
    }

    pub fn current(&self) -> Option<&Arc<ConnectionState>> {
        self.current.as_ref()
    }

    /// Whether `connection` is the one the session currently runs on.
    pub fn is_current(&self, connection: &Arc<ConnectionState>) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }

    pub fn set_current(&mut self, connection: Arc<ConnectionState>) {
        *self.connection_id.write() = connection.connection_id().map(str::to_string);
        self.current = Some(connection);
    }

    pub fn take_current(&mut self) -> Option<Arc<ConnectionState>> {
        *self.connection_id.write() = None;
        self.current.take()
    }

    pub fn reconnect_task(&self) -> Option<TaskCompletion> {
        self.reconnect_task.clone()
    }

    pub fn set_reconnect_task(&mut self, task: Option<TaskCompletion>) {
        self.reconnect_task = task;
    }
}

/// Owns the session lock, the lock-free mirrors of state that callers may read
/// without it, and the stop token.
pub struct ReconnectingConnectionState {
    core: Arc<AsyncMutex<SessionCore>>,
    state_rx: watch::Receiver<SessionState>,
    connection_id: Arc<RwLock<Option<String>>>,
    /// Kept outside the lock so a stop can cancel it without waiting.
    stop_token: Mutex<CancellationToken>,
}

impl ReconnectingConnectionState {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let connection_id = Arc::new(RwLock::new(None));
        Self {
            core: Arc::new(AsyncMutex::new(SessionCore {
                overall_state: SessionState::Disconnected,
                current: None,
                reconnect_task: None,
                state_tx,
                connection_id: connection_id.clone(),
            })),
            state_rx,
            connection_id,
            stop_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Acquires the session lock, giving up if `token` is cancelled first.
    pub async fn wait_lock(&self, token: &CancellationToken) -> Result<SessionGuard, HubError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HubError::canceled()),
            guard = self.core.clone().lock_owned() => Ok(guard),
        }
    }

    /// Acquires the session lock unconditionally.
    pub async fn lock(&self) -> SessionGuard {
        self.core.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Option<SessionGuard> {
        self.core.clone().try_lock_owned().ok()
    }

    /// Acquires the lock and returns the current connection with the lock still
    /// held. Fails, releasing the lock, when there is no active connection.
    pub async fn wait_for_active_connection(
        &self,
        method_name: &str,
        token: &CancellationToken,
    ) -> Result<(SessionGuard, Arc<ConnectionState>), HubError> {
        let guard = self.wait_lock(token).await?;
        match guard.current() {
            Some(connection) if !connection.is_stopping() => {
                let connection = connection.clone();
                Ok((guard, connection))
            }
            _ => Err(HubError::InvalidOperation(format!(
                "The '{method_name}' method cannot be called if the connection is not active"
            ))),
        }
    }

    /// Current state, read without the lock.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.read().clone()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.lock().clone()
    }

    /// Replaces a (possibly cancelled) stop token. The `SessionCore` borrow proves
    /// the caller holds the session lock.
    pub fn reset_stop_token(&self, _core: &SessionCore) {
        *self.stop_token.lock() = CancellationToken::new();
    }
}

impl Default for ReconnectingConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
