// src/core/transport/mod.rs

//! Contracts between the hub connection and the byte-stream transports it runs on,
//! plus the transports shipped with the crate.

pub mod memory;
pub mod tcp;

use crate::core::HubError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use memory::{
    MemoryConnectionFactory, MemoryListener, MemoryServerConnection, MemoryStatefulReconnect,
    MemoryTransportOptions, memory_transport,
};
pub use tcp::TcpConnectionFactory;

pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Produces the frames a resumed transport must write before any new traffic: a
/// `Sequence` frame followed by every unacknowledged message.
pub type ResendCallback = Arc<dyn Fn() -> Result<Vec<Bytes>, HubError> + Send + Sync>;

/// Implemented by transports that can silently drop and resume the underlying
/// link without the hub session noticing.
pub trait StatefulReconnect: Send + Sync {
    /// Registers the callback the transport runs after it has resumed.
    fn on_reconnected(&self, resend: ResendCallback);

    /// Stops the transport from resuming; the next drop closes the connection.
    fn disable(&self);
}

/// Optional capabilities advertised by a transport connection.
#[derive(Clone, Default)]
pub struct TransportFeatures {
    /// The transport keeps the link alive by itself, so the hub layer neither sends
    /// pings nor enforces the server timeout.
    pub inherent_keep_alive: bool,
    pub stateful_reconnect: Option<Arc<dyn StatefulReconnect>>,
}

impl fmt::Debug for TransportFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFeatures")
            .field("inherent_keep_alive", &self.inherent_keep_alive)
            .field("stateful_reconnect", &self.stateful_reconnect.is_some())
            .finish()
    }
}

/// One physical duplex connection handed to the hub layer.
pub struct TransportConnection {
    pub connection_id: Option<String>,
    pub reader: TransportReader,
    pub writer: TransportWriter,
    pub features: TransportFeatures,
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("connection_id", &self.connection_id)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

/// Opens transport connections for a hub session. Called once per start and once
/// per reconnect attempt.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(
        &self,
        endpoint: &str,
        token: &CancellationToken,
    ) -> Result<TransportConnection, HubError>;
}
