// src/core/transport/memory.rs

//! An in-process transport built on `tokio::io::duplex`. Every `connect` hands the
//! peer half to a `MemoryListener`, which plays the server.

use super::{
    ConnectionFactory, ResendCallback, StatefulReconnect, TransportConnection, TransportFeatures,
};
use crate::core::HubError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{DuplexStream, split};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Capabilities advertised by connections from a memory transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryTransportOptions {
    pub inherent_keep_alive: bool,
    pub stateful_reconnect: bool,
}

struct Shared {
    accept_tx: mpsc::UnboundedSender<MemoryServerConnection>,
    accepting: AtomicBool,
    connect_attempts: AtomicUsize,
    options: Mutex<MemoryTransportOptions>,
}

/// The client side of the memory transport.
#[derive(Clone)]
pub struct MemoryConnectionFactory {
    shared: Arc<Shared>,
}

/// The server side: yields one `MemoryServerConnection` per accepted connect.
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryServerConnection>,
    shared: Arc<Shared>,
}

/// The server's end of one accepted connection.
pub struct MemoryServerConnection {
    pub connection_id: String,
    pub stream: DuplexStream,
    /// Present when the connection advertised stateful reconnect.
    pub stateful_reconnect: Option<Arc<MemoryStatefulReconnect>>,
}

/// Creates a connected factory/listener pair.
pub fn memory_transport(options: MemoryTransportOptions) -> (MemoryConnectionFactory, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        accept_tx,
        accepting: AtomicBool::new(true),
        connect_attempts: AtomicUsize::new(0),
        options: Mutex::new(options),
    });
    (
        MemoryConnectionFactory {
            shared: shared.clone(),
        },
        MemoryListener { accept_rx, shared },
    )
}

impl MemoryConnectionFactory {
    /// Number of `connect` calls made so far, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }
}

impl MemoryListener {
    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryServerConnection> {
        self.accept_rx.recv().await
    }

    /// When false, every `connect` fails with `ConnectionRefused`.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn set_options(&self, options: MemoryTransportOptions) {
        *self.shared.options.lock() = options;
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(
        &self,
        _endpoint: &str,
        token: &CancellationToken,
    ) -> Result<TransportConnection, HubError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if token.is_cancelled() {
            return Err(HubError::canceled());
        }
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener is not accepting").into());
        }

        let options = *self.shared.options.lock();
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let connection_id = uuid::Uuid::new_v4().to_string();
        let stateful = options
            .stateful_reconnect
            .then(|| Arc::new(MemoryStatefulReconnect::default()));

        self.shared
            .accept_tx
            .send(MemoryServerConnection {
                connection_id: connection_id.clone(),
                stream: server,
                stateful_reconnect: stateful.clone(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener was dropped"))?;

        let (reader, writer) = split(client);
        Ok(TransportConnection {
            connection_id: Some(connection_id),
            reader: Box::new(reader),
            writer: Box::new(writer),
            features: TransportFeatures {
                inherent_keep_alive: options.inherent_keep_alive,
                stateful_reconnect: stateful.map(|s| s as Arc<dyn StatefulReconnect>),
            },
        })
    }
}

/// Records what the hub layer registered for stateful reconnect so a test server can
/// replay the resend a resumed transport would perform.
#[derive(Default)]
pub struct MemoryStatefulReconnect {
    callback: Mutex<Option<ResendCallback>>,
    disabled: AtomicBool,
}

impl MemoryStatefulReconnect {
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Runs the registered resend callback, as the transport would after resuming.
    pub fn resend_frames(&self) -> Option<Result<Vec<Bytes>, HubError>> {
        let callback = self.callback.lock().clone();
        callback.map(|cb| cb())
    }
}

impl StatefulReconnect for MemoryStatefulReconnect {
    fn on_reconnected(&self, resend: ResendCallback) {
        *self.callback.lock() = Some(resend);
    }

    fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }
}
