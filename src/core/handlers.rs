// src/core/handlers.rs

//! Registry of client methods the server may invoke.

use crate::core::protocol::ValueKind;
use anyhow::anyhow;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// What a client method returns: a value for invocations that expect a result, or
/// `None` for fire-and-forget calls.
pub type HandlerResult = anyhow::Result<Option<Value>>;

/// A type-erased client method.
pub type HandlerFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// One registered client method.
pub struct InvocationHandler {
    id: u64,
    parameter_kinds: Vec<ValueKind>,
    callback: HandlerFn,
}

impl InvocationHandler {
    pub fn parameter_kinds(&self) -> &[ValueKind] {
        &self.parameter_kinds
    }

    /// Runs the handler. A panic inside user code is reported as an error.
    pub async fn invoke(&self, arguments: Vec<Value>) -> HandlerResult {
        let callback = self.callback.clone();
        match AssertUnwindSafe(async move { callback(arguments).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!("handler panicked")),
        }
    }
}

/// Maps method names to their handlers. Dispatch works on snapshots, so handlers
/// added or removed while an invocation is running do not affect it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Vec<Arc<InvocationHandler>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler and returns its id within the method.
    pub fn add(&self, method: &str, parameter_kinds: Vec<ValueKind>, callback: HandlerFn) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::new(InvocationHandler {
            id,
            parameter_kinds,
            callback,
        });
        self.handlers
            .entry(method.to_string())
            .or_default()
            .push(handler);
        debug!("Registered handler {} for method '{}'.", id, method);
        id
    }

    /// Removes every handler for `method`.
    pub fn remove_method(&self, method: &str) {
        if self.handlers.remove(method).is_some() {
            debug!("Removed all handlers for method '{}'.", method);
        }
    }

    /// Removes one handler. The method entry goes away with its last handler.
    pub fn remove_handler(&self, method: &str, id: u64) {
        self.handlers.remove_if_mut(method, |_, list| {
            list.retain(|h| h.id != id);
            list.is_empty()
        });
    }

    /// A copy of the handlers currently registered for `method`.
    pub fn snapshot(&self, method: &str) -> Vec<Arc<InvocationHandler>> {
        self.handlers
            .get(method)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Parameter kinds of the first handler for `method`.
    pub fn parameter_kinds(&self, method: &str) -> Option<Vec<ValueKind>> {
        self.handlers
            .get(method)
            .and_then(|list| list.first().map(|h| h.parameter_kinds.clone()))
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }
}

/// Returned by `on`. Disposing it removes exactly the handler it was created for;
/// dropping it leaves the handler registered.
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    method: String,
    id: u64,
    disposed: AtomicBool,
}

impl Subscription {
    /// Ties handler `id` of `method` to a new subscription.
    pub fn new(registry: &Arc<HandlerRegistry>, method: &str, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            method: method.to_string(),
            id,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_handler(&self.method, self.id);
        }
    }
}
