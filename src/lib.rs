// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;

// Re-export
pub use crate::config::{HubConfig, HubConnectionOptions};
pub use crate::connection::{HubConnection, HubConnectionBuilder};
pub use crate::core::handlers::Subscription;
pub use crate::core::retry::{DefaultRetryPolicy, ExponentialBackoffPolicy, RetryContext, RetryPolicy};
pub use crate::core::streams::{Argument, HubStreamReader};
pub use crate::core::{HubError, HubMessage, HubProtocol, SessionState, ValueKind};
