// src/connection/mod.rs

//! The hub connection: the public session API and the machinery behind it, split
//! into the start/handshake path, the receive loop, close handling with the
//! reconnect loop, and outgoing invocations.

mod builder;
mod handshake;
mod hub;
mod invocation;
mod receive_loop;
mod reconnect;

pub use builder::HubConnectionBuilder;
pub use hub::HubConnection;
