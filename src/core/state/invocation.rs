// src/core/state/invocation.rs

//! One outstanding client-to-server call awaiting its completion or streamed items.

use crate::core::HubError;
use crate::core::protocol::ValueKind;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What the awaiting caller eventually receives for a single-result invocation.
/// `None` means the server completed without a result.
pub type InvocationResult = Result<Option<Value>, HubError>;

/// What the consumer of a server stream receives per item.
pub type StreamResult = Result<Value, HubError>;

enum Slot {
    Single(Mutex<Option<oneshot::Sender<InvocationResult>>>),
    Stream(Mutex<Option<mpsc::UnboundedSender<StreamResult>>>),
}

/// A pending invocation registered in a connection's pending table.
///
/// Completes exactly once: by a completion frame, an error, a cancellation or the
/// teardown of its connection. Later attempts are ignored.
pub struct InvocationRequest {
    invocation_id: String,
    result_kind: ValueKind,
    token: CancellationToken,
    slot: Slot,
    completed: AtomicBool,
    /// Cancelled once the request has been resolved.
    done: CancellationToken,
}

impl InvocationRequest {
    /// A request resolved by a single completion.
    pub fn single(
        invocation_id: String,
        result_kind: ValueKind,
        token: CancellationToken,
    ) -> (Self, oneshot::Receiver<InvocationResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                invocation_id,
                result_kind,
                token,
                slot: Slot::Single(Mutex::new(Some(tx))),
                completed: AtomicBool::new(false),
                done: CancellationToken::new(),
            },
            rx,
        )
    }

    /// A request whose results arrive as stream items, ended by a completion.
    pub fn stream(
        invocation_id: String,
        item_kind: ValueKind,
        token: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<StreamResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                invocation_id,
                result_kind: item_kind,
                token,
                slot: Slot::Stream(Mutex::new(Some(tx))),
                completed: AtomicBool::new(false),
                done: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// The declared result kind, or the item kind for streams.
    pub fn result_kind(&self) -> ValueKind {
        self.result_kind
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.slot, Slot::Stream(_))
    }

    /// Cancelled when the caller gives up on this invocation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// A token cancelled when the request resolves, however it resolves.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    fn mark_completed(&self) -> bool {
        let first = !self.completed.swap(true, Ordering::AcqRel);
        if first {
            self.done.cancel();
        }
        first
    }

    /// Delivers a completion frame.
    pub fn complete(&self, result: Option<Value>, error: Option<String>) {
        if let Some(error) = error {
            self.fail(HubError::Server(error));
            return;
        }
        match &self.slot {
            Slot::Single(tx) => {
                if !self.mark_completed() {
                    return;
                }
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Ok(result));
                }
            }
            Slot::Stream(tx) => {
                if result.is_some() {
                    self.fail(HubError::InvalidData(
                        "Server provided a result to a streaming invocation.".to_string(),
                    ));
                    return;
                }
                if !self.mark_completed() {
                    return;
                }
                // Dropping the sender ends the consumer's stream cleanly.
                tx.lock().take();
            }
        }
    }

    /// Resolves the invocation with an error.
    pub fn fail(&self, error: HubError) {
        if !self.mark_completed() {
            return;
        }
        debug!("Invocation {} failed: {}", self.invocation_id, error);
        match &self.slot {
            Slot::Single(tx) => {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Err(error));
                }
            }
            Slot::Stream(tx) => {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Err(error));
                }
            }
        }
    }

    /// Appends a streamed item. Returns false when the consumer has gone away or the
    /// request is not a stream.
    pub fn stream_item(&self, item: Value) -> bool {
        match &self.slot {
            Slot::Stream(tx) => match tx.lock().as_ref() {
                Some(tx) => tx.send(Ok(item)).is_ok(),
                None => false,
            },
            Slot::Single(_) => {
                warn!(
                    "Received a stream item for non-streaming invocation {}.",
                    self.invocation_id
                );
                false
            }
        }
    }

    /// Resolves the invocation as cancelled by the caller. Single results fail with a
    /// cancellation error; streams end without one.
    pub fn cancel(&self) {
        if !self.mark_completed() {
            return;
        }
        match &self.slot {
            Slot::Single(tx) => {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Err(HubError::canceled()));
                }
            }
            Slot::Stream(tx) => {
                tx.lock().take();
            }
        }
    }
}

impl std::fmt::Debug for InvocationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationRequest")
            .field("invocation_id", &self.invocation_id)
            .field("result_kind", &self.result_kind)
            .field("streaming", &self.is_streaming())
            .field("completed", &self.is_completed())
            .finish()
    }
}
