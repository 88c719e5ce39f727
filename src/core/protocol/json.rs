// src/core/protocol/json.rs

//! The JSON hub protocol: each message is a JSON object tagged with a numeric
//! `type`, framed with the record separator.

use super::framing::{try_split_frame, write_frame};
use super::message::{HubMessage, InvocationBinder, ValueKind};
use super::HubProtocol;
use crate::core::HubError;
use bytes::BytesMut;
use serde_json::{Map, Value, json};
use tracing::debug;

const INVOCATION_TYPE: u64 = 1;
const STREAM_ITEM_TYPE: u64 = 2;
const COMPLETION_TYPE: u64 = 3;
const STREAM_INVOCATION_TYPE: u64 = 4;
const CANCEL_INVOCATION_TYPE: u64 = 5;
const PING_TYPE: u64 = 6;
const CLOSE_TYPE: u64 = 7;
const ACK_TYPE: u64 = 8;
const SEQUENCE_TYPE: u64 = 9;

/// The text-based hub protocol, version 2 (version 1 peers are also supported).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    pub const NAME: &'static str = "json";
    pub const VERSION: u32 = 2;

    pub fn new() -> Self {
        Self
    }

    fn to_json(message: &HubMessage) -> Value {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(INVOCATION_TYPE));
                if let Some(id) = invocation_id {
                    obj.insert("invocationId".into(), json!(id));
                }
                obj.insert("target".into(), json!(target));
                obj.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    obj.insert("streamIds".into(), json!(stream_ids));
                }
                Value::Object(obj)
            }
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(STREAM_INVOCATION_TYPE));
                obj.insert("invocationId".into(), json!(invocation_id));
                obj.insert("target".into(), json!(target));
                obj.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    obj.insert("streamIds".into(), json!(stream_ids));
                }
                Value::Object(obj)
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => json!({ "type": STREAM_ITEM_TYPE, "invocationId": invocation_id, "item": item }),
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(COMPLETION_TYPE));
                obj.insert("invocationId".into(), json!(invocation_id));
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                } else if let Some(result) = result {
                    obj.insert("result".into(), result.clone());
                }
                Value::Object(obj)
            }
            HubMessage::CancelInvocation { invocation_id } => {
                json!({ "type": CANCEL_INVOCATION_TYPE, "invocationId": invocation_id })
            }
            HubMessage::Ping => json!({ "type": PING_TYPE }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(CLOSE_TYPE));
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                }
                if *allow_reconnect {
                    obj.insert("allowReconnect".into(), json!(true));
                }
                Value::Object(obj)
            }
            // Binding failures are a local parse outcome and never go on the wire; they
            // are reported to the server as an error completion instead.
            HubMessage::InvocationBindingFailure {
                invocation_id,
                error,
                ..
            } => json!({
                "type": COMPLETION_TYPE,
                "invocationId": invocation_id,
                "error": error,
            }),
            HubMessage::Ack { sequence_id } => json!({ "type": ACK_TYPE, "sequenceId": sequence_id }),
            HubMessage::Sequence { sequence_id } => {
                json!({ "type": SEQUENCE_TYPE, "sequenceId": sequence_id })
            }
        }
    }

    /// Converts one decoded frame into a message. `Ok(None)` means the frame carried a
    /// message type this client does not know and should be skipped.
    fn from_json(value: Value, binder: &dyn InvocationBinder) -> Result<Option<HubMessage>, HubError> {
        let Value::Object(mut obj) = value else {
            return Err(HubError::InvalidData("Message is not a JSON object.".to_string()));
        };
        let message_type = obj
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| HubError::InvalidData("Missing required property 'type'.".to_string()))?;

        let message = match message_type {
            INVOCATION_TYPE => {
                let invocation_id = optional_string(&obj, "invocationId")?;
                let target = required_string(&obj, "target")?;
                let stream_ids = string_array(&obj, "streamIds")?;
                let arguments = take_arguments(&mut obj)?;
                match bind_arguments(binder, &target, &arguments) {
                    Ok(()) => HubMessage::Invocation {
                        invocation_id,
                        target,
                        arguments,
                        stream_ids,
                    },
                    Err(error) => HubMessage::InvocationBindingFailure {
                        invocation_id,
                        target,
                        error,
                    },
                }
            }
            STREAM_INVOCATION_TYPE => {
                let invocation_id = required_string(&obj, "invocationId")?;
                let target = required_string(&obj, "target")?;
                let stream_ids = string_array(&obj, "streamIds")?;
                let arguments = take_arguments(&mut obj)?;
                HubMessage::StreamInvocation {
                    invocation_id,
                    target,
                    arguments,
                    stream_ids,
                }
            }
            STREAM_ITEM_TYPE => {
                let invocation_id = required_string(&obj, "invocationId")?;
                let item = obj.remove("item").unwrap_or(Value::Null);
                match binder.return_kind(&invocation_id) {
                    Some(kind) if !kind.matches(&item) => HubMessage::completion_with_error(
                        invocation_id,
                        binding_error(kind, &item),
                    ),
                    _ => HubMessage::StreamItem {
                        invocation_id,
                        item,
                    },
                }
            }
            COMPLETION_TYPE => {
                let invocation_id = required_string(&obj, "invocationId")?;
                let error = optional_string(&obj, "error")?;
                let result = obj.remove("result");
                if error.is_some() && result.is_some() {
                    return Err(HubError::InvalidData(
                        "The 'error' and 'result' properties are mutually exclusive.".to_string(),
                    ));
                }
                match (&result, binder.return_kind(&invocation_id)) {
                    (Some(value), Some(kind)) if !kind.matches(value) => {
                        HubMessage::completion_with_error(invocation_id, binding_error(kind, value))
                    }
                    _ => HubMessage::Completion {
                        invocation_id,
                        result,
                        error,
                    },
                }
            }
            CANCEL_INVOCATION_TYPE => HubMessage::CancelInvocation {
                invocation_id: required_string(&obj, "invocationId")?,
            },
            PING_TYPE => HubMessage::Ping,
            CLOSE_TYPE => HubMessage::Close {
                error: optional_string(&obj, "error")?,
                allow_reconnect: obj
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            ACK_TYPE => HubMessage::Ack {
                sequence_id: required_u64(&obj, "sequenceId")?,
            },
            SEQUENCE_TYPE => HubMessage::Sequence {
                sequence_id: required_u64(&obj, "sequenceId")?,
            },
            other => {
                debug!("Ignoring hub message with unknown type {}.", other);
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn is_version_supported(&self, version: u32) -> bool {
        version == 1 || version == 2
    }

    fn write_message(&self, message: &HubMessage, dst: &mut BytesMut) -> Result<(), HubError> {
        let payload = serde_json::to_vec(&Self::to_json(message))?;
        write_frame(&payload, dst);
        Ok(())
    }

    fn try_parse_message(
        &self,
        src: &mut BytesMut,
        binder: &dyn InvocationBinder,
    ) -> Result<Option<HubMessage>, HubError> {
        while let Some(frame) = try_split_frame(src)? {
            let value: Value = serde_json::from_slice(&frame)
                .map_err(|e| HubError::InvalidData(format!("Error reading JSON: {e}")))?;
            if let Some(message) = Self::from_json(value, binder)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

fn bind_arguments(binder: &dyn InvocationBinder, target: &str, arguments: &[Value]) -> Result<(), String> {
    if !binder.validates_arguments() {
        return Ok(());
    }
    let kinds = binder
        .parameter_kinds(target)
        .ok_or_else(|| format!("There are no callbacks registered for the method '{target}'"))?;
    if kinds.len() != arguments.len() {
        return Err(format!(
            "Invocation provides {} argument(s) but target expects {}.",
            arguments.len(),
            kinds.len()
        ));
    }
    for (index, (kind, value)) in kinds.iter().zip(arguments).enumerate() {
        if !kind.matches(value) {
            return Err(format!(
                "Error binding arguments. Argument {index} expected {kind}, got {}.",
                ValueKind::of(value)
            ));
        }
    }
    Ok(())
}

fn binding_error(kind: ValueKind, value: &Value) -> String {
    format!(
        "Error trying to deserialize result to {kind}: got {}.",
        ValueKind::of(value)
    )
}

fn take_arguments(obj: &mut Map<String, Value>) -> Result<Vec<Value>, HubError> {
    match obj.remove("arguments") {
        Some(Value::Array(arguments)) => Ok(arguments),
        Some(_) => Err(HubError::InvalidData(
            "Expected 'arguments' to be of type Array.".to_string(),
        )),
        None => Err(HubError::InvalidData(
            "Missing required property 'arguments'.".to_string(),
        )),
    }
}

fn required_string(obj: &Map<String, Value>, key: &str) -> Result<String, HubError> {
    optional_string(obj, key)?
        .ok_or_else(|| HubError::InvalidData(format!("Missing required property '{key}'.")))
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, HubError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(HubError::InvalidData(format!(
            "Expected '{key}' to be of type String."
        ))),
    }
}

fn required_u64(obj: &Map<String, Value>, key: &str) -> Result<u64, HubError> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| HubError::InvalidData(format!("Missing required property '{key}'.")))
}

fn string_array(obj: &Map<String, Value>, key: &str) -> Result<Vec<String>, HubError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    HubError::InvalidData(format!("Expected '{key}' to contain strings."))
                })
            })
            .collect(),
        Some(_) => Err(HubError::InvalidData(format!(
            "Expected '{key}' to be of type Array."
        ))),
    }
}
