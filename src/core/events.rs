// src/core/events.rs

//! Lifecycle notifications: `closed`, `reconnecting` and `reconnected`.
//!
//! Each firing runs its listeners on a fresh task so a slow or failing listener can
//! never stall the receive loop or the reconnect loop. Listeners run one after
//! another in registration order; an error or panic in one is logged and the rest
//! still run.

use crate::core::HubError;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A registered lifecycle listener taking an event payload of type `A`.
pub type Listener<A> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// An ordered list of listeners for one event.
pub struct ListenerList<A> {
    name: &'static str,
    listeners: RwLock<Vec<Listener<A>>>,
}

impl<A: Clone + Send + 'static> ListenerList<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Listener<A>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Runs every listener on a spawned task. Returns `None` when nothing is
    /// registered, in which case no task is started.
    pub fn fire(&self, payload: A) -> Option<JoinHandle<()>> {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return None;
        }
        let name = self.name;
        Some(tokio::spawn(async move {
            debug!("Invoking the {} event handler.", name);
            for listener in listeners {
                let payload = payload.clone();
                let outcome = AssertUnwindSafe(async move { listener(payload).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("An exception was thrown in the handler for the {} event: {:#}", name, e),
                    Err(_) => error!("A handler for the {} event panicked.", name),
                }
            }
        }))
    }
}

/// The three lifecycle events of a hub session.
pub struct LifecycleEvents {
    /// Fired once the session reaches `Disconnected`, with the terminal error if any.
    pub closed: ListenerList<Option<HubError>>,
    /// Fired when an unexpected close starts the reconnect loop.
    pub reconnecting: ListenerList<Option<HubError>>,
    /// Fired after a reconnect attempt succeeds, with the new connection id.
    pub reconnected: ListenerList<Option<String>>,
}

impl LifecycleEvents {
    pub fn new() -> Self {
        Self {
            closed: ListenerList::new("Closed"),
            reconnecting: ListenerList::new("Reconnecting"),
            reconnected: ListenerList::new("Reconnected"),
        }
    }
}

impl Default for LifecycleEvents {
    fn default() -> Self {
        Self::new()
    }
}
