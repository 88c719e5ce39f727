// src/core/state/mod.rs

//! Session and per-connection state. This module is broken down into the session
//! lock and state machine, the state of one physical connection, and the pending
//! invocations that connection tracks.

pub mod connection;
pub mod invocation;
pub mod session;

pub use connection::{ConnectionSettings, ConnectionState};
pub use invocation::{InvocationRequest, InvocationResult, StreamResult};
pub use session::{ReconnectingConnectionState, SessionCore, SessionGuard, SessionState, TaskCompletion};
