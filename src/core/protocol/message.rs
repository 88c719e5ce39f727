// src/core/protocol/message.rs

//! The hub message model exchanged once the handshake has completed, plus the
//! runtime type tags used to bind inbound arguments and results.

use serde_json::Value;
use strum_macros::Display;

/// A single hub protocol message, independent of its wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A call of `target`. An invocation id means the caller expects a completion.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },
    /// A call whose results are streamed back as `StreamItem`s.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
    },
    /// Terminates an invocation. `result` and `error` are mutually exclusive.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    CancelInvocation {
        invocation_id: String,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Produced by the parser when an inbound invocation's arguments do not match
    /// the registered handler.
    InvocationBindingFailure {
        invocation_id: Option<String>,
        target: String,
        error: String,
    },
    Ack {
        sequence_id: u64,
    },
    Sequence {
        sequence_id: u64,
    },
}

impl HubMessage {
    /// A completion carrying a result value.
    pub fn completion_with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// A completion carrying an error.
    pub fn completion_with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// A completion with neither result nor error.
    pub fn empty_completion(invocation_id: impl Into<String>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: None,
        }
    }

    /// Messages that take part in stateful-reconnect sequencing.
    pub fn is_sequenced(&self) -> bool {
        matches!(
            self,
            HubMessage::Invocation { .. }
                | HubMessage::StreamInvocation { .. }
                | HubMessage::StreamItem { .. }
                | HubMessage::Completion { .. }
                | HubMessage::CancelInvocation { .. }
                | HubMessage::InvocationBindingFailure { .. }
        )
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Invocation { .. } => "Invocation",
            HubMessage::StreamInvocation { .. } => "StreamInvocation",
            HubMessage::StreamItem { .. } => "StreamItem",
            HubMessage::Completion { .. } => "Completion",
            HubMessage::CancelInvocation { .. } => "CancelInvocation",
            HubMessage::Ping => "Ping",
            HubMessage::Close { .. } => "Close",
            HubMessage::InvocationBindingFailure { .. } => "InvocationBindingFailure",
            HubMessage::Ack { .. } => "Ack",
            HubMessage::Sequence { .. } => "Sequence",
        }
    }
}

/// A runtime type tag for values crossing the protocol boundary.
///
/// `null` satisfies every kind, so absent optional values bind cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ValueKind {
    Any,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueKind::Any, _) | (_, Value::Null) => true,
            (ValueKind::Bool, Value::Bool(_)) => true,
            (ValueKind::Number, Value::Number(_)) => true,
            (ValueKind::String, Value::String(_)) => true,
            (ValueKind::Array, Value::Array(_)) => true,
            (ValueKind::Object, Value::Object(_)) => true,
            _ => false,
        }
    }

    /// The kind describing `value` itself.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

/// Supplies the type information a protocol needs to bind inbound messages.
pub trait InvocationBinder: Send + Sync {
    /// Parameter kinds of the handler registered for `target`, or `None` when no
    /// handler is registered.
    fn parameter_kinds(&self, target: &str) -> Option<Vec<ValueKind>>;

    /// Declared result (or stream item) kind of a pending invocation, or `None` when
    /// the id is not pending.
    fn return_kind(&self, invocation_id: &str) -> Option<ValueKind>;

    /// Whether inbound invocation arguments are checked against `parameter_kinds`.
    fn validates_arguments(&self) -> bool {
        true
    }
}

/// A binder that accepts everything. Used by servers and tools that decode frames
/// without a handler registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveBinder;

impl InvocationBinder for PermissiveBinder {
    fn parameter_kinds(&self, _target: &str) -> Option<Vec<ValueKind>> {
        None
    }

    fn return_kind(&self, _invocation_id: &str) -> Option<ValueKind> {
        Some(ValueKind::Any)
    }

    fn validates_arguments(&self) -> bool {
        false
    }
}
