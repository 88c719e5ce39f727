// src/connection/reconnect.rs

//! Close handling for a connection whose receive loop has ended, and the reconnect
//! loop it hands off to when the close was unexpected.

use super::handshake::start_core;
use super::hub::HubInner;
use crate::core::HubError;
use crate::core::retry::RetryContext;
use crate::core::state::{ConnectionState, SessionGuard, SessionState};
use futures::FutureExt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Tears a finished connection down and decides what the session does next: move
/// to `Disconnected`, or start reconnecting.
pub(crate) async fn handle_connection_close(inner: &Arc<HubInner>, connection: &Arc<ConnectionState>) {
    let mut guard = inner.session.lock().await;
    if guard.is_current(connection) {
        guard.take_current();
    }

    connection.close_transport().await;
    let close_error = connection.close_error();
    connection.cancel_outstanding_invocations(close_error.clone());
    connection.dispose_buffer();

    if connection.is_stopping() || inner.retry_policy.is_none() {
        match &close_error {
            Some(e) => info!("HubConnection closed with an error: {}", e),
            None => info!("HubConnection closed."),
        }
        let _ = guard.change_state(SessionState::Connected, SessionState::Disconnected);
        inner.complete_close(&mut guard, close_error);
        return;
    }

    // The reconnect task takes over the lock without releasing it, after the task is
    // recorded so a later stop can wait for it.
    let (guard_tx, guard_rx) = oneshot::channel();
    let task = tokio::spawn(reconnect(inner.clone(), guard_rx, close_error));
    guard.set_reconnect_task(Some(task.map(|_| ()).boxed().shared()));
    let _ = guard_tx.send(guard);
}

/// Asks the retry policy for the next delay. A panicking policy counts as giving up.
fn next_retry_delay(
    inner: &HubInner,
    previous_retry_count: u64,
    elapsed: Duration,
    retry_reason: Option<HubError>,
) -> Option<Duration> {
    let policy = inner.retry_policy.as_ref()?;
    let context = RetryContext {
        previous_retry_count,
        elapsed,
        retry_reason,
    };
    match catch_unwind(AssertUnwindSafe(|| policy.next_retry_delay(&context))) {
        Ok(delay) => delay,
        Err(_) => {
            error!("The reconnect policy panicked. Giving up on reconnecting.");
            None
        }
    }
}

async fn reconnect(
    inner: Arc<HubInner>,
    guard_rx: oneshot::Receiver<SessionGuard>,
    close_error: Option<HubError>,
) {
    let Ok(mut guard) = guard_rx.await else {
        return;
    };
    let started = Instant::now();
    let mut failed_attempts: u64 = 0;
    let mut retry_reason = close_error.clone();

    let Some(mut delay) = next_retry_delay(&inner, failed_attempts, Duration::ZERO, retry_reason.clone())
    else {
        info!("Reconnect policy declined to reconnect. Disconnecting.");
        let _ = guard.change_state(SessionState::Connected, SessionState::Disconnected);
        inner.complete_close(&mut guard, close_error);
        return;
    };

    let _ = guard.change_state(SessionState::Connected, SessionState::Reconnecting);
    match &close_error {
        Some(e) => warn!("HubConnection reconnecting due to an error: {}", e),
        None => info!("HubConnection reconnecting."),
    }
    inner.events.reconnecting.fire(close_error);
    let stop_token = inner.session.stop_token();
    drop(guard);

    loop {
        debug!(
            "Reconnect attempt number {} will start in {:?}.",
            failed_attempts + 1,
            delay
        );
        tokio::select! {
            biased;
            _ = stop_token.cancelled() => {
                debug!("Connection stopped during reconnect delay. Done reconnecting.");
                let mut guard = inner.session.lock().await;
                let _ = guard.change_state(SessionState::Reconnecting, SessionState::Disconnected);
                inner.complete_close(
                    &mut guard,
                    Some(HubError::Canceled(
                        "Connection stopped during reconnect delay. Done reconnecting.".to_string(),
                    )),
                );
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let mut guard = inner.session.lock().await;
        match start_core(&inner, &mut guard, &stop_token).await {
            Ok(()) => {
                let _ = guard.change_state(SessionState::Reconnecting, SessionState::Connected);
                guard.set_reconnect_task(None);
                info!(
                    "HubConnection reconnected successfully after {} attempt(s) and {:?} elapsed.",
                    failed_attempts + 1,
                    started.elapsed()
                );
                inner.events.reconnected.fire(inner.session.connection_id());
                return;
            }
            Err(e) => {
                info!("Reconnect attempt failed: {}", e);
                retry_reason = Some(e);
                failed_attempts += 1;
                if stop_token.is_cancelled() {
                    debug!("Connection stopped during reconnect attempt. Done reconnecting.");
                    let _ = guard.change_state(SessionState::Reconnecting, SessionState::Disconnected);
                    inner.complete_close(
                        &mut guard,
                        Some(HubError::Canceled(
                            "Connection stopped during reconnect attempt. Done reconnecting."
                                .to_string(),
                        )),
                    );
                    return;
                }
            }
        }
        drop(guard);

        match next_retry_delay(&inner, failed_attempts, started.elapsed(), retry_reason.clone()) {
            Some(next) => delay = next,
            None => break,
        }
    }

    let elapsed = started.elapsed();
    info!(
        "Reconnect retries have been exhausted after {} failed attempts and {:?} elapsed. Disconnecting.",
        failed_attempts, elapsed
    );
    let mut guard = inner.session.lock().await;
    let _ = guard.change_state(SessionState::Reconnecting, SessionState::Disconnected);
    inner.complete_close(
        &mut guard,
        Some(HubError::ReconnectExhausted {
            attempts: failed_attempts,
            elapsed,
        }),
    );
}
