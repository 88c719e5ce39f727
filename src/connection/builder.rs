// src/connection/builder.rs

//! Assembles a `HubConnection` from a transport factory, an endpoint and options.

use super::hub::{HubConnection, HubInner};
use crate::config::{HubConfig, HubConnectionOptions};
use crate::core::events::LifecycleEvents;
use crate::core::handlers::HandlerRegistry;
use crate::core::protocol::{HubProtocol, JsonHubProtocol};
use crate::core::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::core::state::ReconnectingConnectionState;
use crate::core::transport::ConnectionFactory;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

pub struct HubConnectionBuilder {
    factory: Arc<dyn ConnectionFactory>,
    endpoint: String,
    protocol: Arc<dyn HubProtocol>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    options: HubConnectionOptions,
    stateful_reconnect: bool,
}

impl HubConnectionBuilder {
    /// Starts from the JSON protocol, default options and no automatic reconnect.
    pub fn new(factory: Arc<dyn ConnectionFactory>, endpoint: impl Into<String>) -> Self {
        Self {
            factory,
            endpoint: endpoint.into(),
            protocol: Arc::new(JsonHubProtocol::new()),
            retry_policy: None,
            options: HubConnectionOptions::default(),
            stateful_reconnect: false,
        }
    }

    /// Applies every setting of a loaded configuration file.
    pub fn from_config(config: &HubConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let mut builder = Self::new(factory, config.url.clone()).with_options(config.connection_options());
        builder.retry_policy = config.reconnect.build_policy();
        builder.stateful_reconnect = config.stateful_reconnect.enabled;
        builder
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn HubProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Reconnects after 0, 2, 10 and 30 seconds, then gives up.
    pub fn with_automatic_reconnect(mut self) -> Self {
        self.retry_policy = Some(Arc::new(DefaultRetryPolicy::new()));
        self
    }

    /// Reconnects after each of `delays` in turn, then gives up.
    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_policy = Some(Arc::new(DefaultRetryPolicy::with_delays(delays)));
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Lets transports that support it resume silently, replaying unacknowledged
    /// messages.
    pub fn with_stateful_reconnect(mut self) -> Self {
        self.stateful_reconnect = true;
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.options.server_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.options.keep_alive_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    /// How often keep-alive and server-timeout deadlines are checked.
    pub fn with_tick_rate(mut self, tick_rate: Duration) -> Self {
        self.options.tick_rate = tick_rate;
        self
    }

    pub fn with_stateful_reconnect_buffer_size(mut self, bytes: usize) -> Self {
        self.options.stateful_reconnect_buffer_size = bytes;
        self
    }

    pub fn with_options(mut self, options: HubConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> HubConnection {
        HubConnection::from_inner(HubInner {
            session: ReconnectingConnectionState::new(),
            factory: self.factory,
            endpoint: self.endpoint,
            protocol: self.protocol,
            retry_policy: self.retry_policy,
            options: self.options,
            stateful_reconnect: self.stateful_reconnect,
            handlers: Arc::new(HandlerRegistry::new()),
            events: LifecycleEvents::new(),
            disposed: AtomicBool::new(false),
        })
    }
}
