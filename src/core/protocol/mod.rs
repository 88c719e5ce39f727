// src/core/protocol/mod.rs

//! Wire-level collaborators of the hub connection: framing, the handshake, the
//! message model and the hub protocol codecs.

pub mod framing;
pub mod handshake;
pub mod json;
pub mod message;

use crate::core::HubError;
use bytes::BytesMut;

pub use framing::RecordSeparatorCodec;
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use json::JsonHubProtocol;
pub use message::{HubMessage, InvocationBinder, PermissiveBinder, ValueKind};

/// A hub protocol: encodes outbound messages and parses inbound ones.
///
/// Implementations are shared between every connection a session makes, so they
/// must not hold per-connection state.
pub trait HubProtocol: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// The highest protocol version this implementation speaks.
    fn version(&self) -> u32;

    fn is_version_supported(&self, version: u32) -> bool;

    /// Serializes one message, framing included, onto `dst`.
    fn write_message(&self, message: &HubMessage, dst: &mut BytesMut) -> Result<(), HubError>;

    /// Parses the next complete message from the front of `src`, consuming its bytes.
    /// Returns `Ok(None)` when more data is needed.
    fn try_parse_message(
        &self,
        src: &mut BytesMut,
        binder: &dyn InvocationBinder,
    ) -> Result<Option<HubMessage>, HubError>;

    fn write_handshake_request(&self, version: u32, dst: &mut BytesMut) -> Result<(), HubError> {
        let request = HandshakeRequest {
            protocol: self.name().to_string(),
            version,
        };
        handshake::write_handshake_request(&request, dst)
    }

    fn try_parse_handshake_response(
        &self,
        src: &mut BytesMut,
    ) -> Result<Option<HandshakeResponse>, HubError> {
        handshake::try_parse_handshake_response(src)
    }
}
