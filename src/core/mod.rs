// src/core/mod.rs

//! The central module containing the building blocks of a hub session: errors, the
//! wire protocol, transports, session and connection state, handlers, lifecycle
//! events, reconnect policies and the acknowledgement buffer.

pub mod buffer;
pub mod cancellation;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod protocol;
pub mod retry;
pub mod state;
pub mod streams;
pub mod transport;

pub use errors::HubError;
pub use protocol::{HubMessage, HubProtocol, ValueKind};
pub use state::SessionState;
