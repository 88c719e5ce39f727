// src/core/protocol/handshake.rs

//! The handshake exchanged before any hub message may flow. Both directions are a
//! single JSON object terminated by the record separator, regardless of which hub
//! protocol is negotiated.

use super::framing::{try_split_frame, write_frame};
use crate::core::HubError;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// Sent by the client to select a hub protocol and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

/// The server's answer. An absent error means the handshake succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn write_handshake_request(request: &HandshakeRequest, dst: &mut BytesMut) -> Result<(), HubError> {
    let payload = serde_json::to_vec(request)?;
    write_frame(&payload, dst);
    Ok(())
}

/// Parses the server's handshake response off the front of `src`.
///
/// Bytes after the response frame are left in `src`; they belong to the first hub
/// messages and must not be discarded.
pub fn try_parse_handshake_response(src: &mut BytesMut) -> Result<Option<HandshakeResponse>, HubError> {
    let Some(frame) = try_split_frame(src)? else {
        return Ok(None);
    };
    let value: serde_json::Value = serde_json::from_slice(&frame)
        .map_err(|e| HubError::InvalidData(format!("Error reading handshake response: {e}")))?;
    let Some(object) = value.as_object() else {
        return Err(HubError::InvalidData(
            "Error reading handshake response: expected a JSON object".to_string(),
        ));
    };
    if object.contains_key("type") {
        return Err(HubError::InvalidData(
            "Expected a handshake response from the server.".to_string(),
        ));
    }
    let error = match object.get("error") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(HubError::InvalidData(format!(
                "Error reading handshake response: 'error' must be a string, got {other}"
            )));
        }
    };
    Ok(Some(HandshakeResponse { error }))
}

// --- Server side of the exchange ---

pub fn try_parse_handshake_request(src: &mut BytesMut) -> Result<Option<HandshakeRequest>, HubError> {
    let Some(frame) = try_split_frame(src)? else {
        return Ok(None);
    };
    serde_json::from_slice(&frame)
        .map(Some)
        .map_err(|e| HubError::InvalidData(format!("Error reading handshake request: {e}")))
}

pub fn write_handshake_response(response: &HandshakeResponse, dst: &mut BytesMut) -> Result<(), HubError> {
    let payload = serde_json::to_vec(response)?;
    write_frame(&payload, dst);
    Ok(())
}
