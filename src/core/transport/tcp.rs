// src/core/transport/tcp.rs

//! A raw TCP transport with optional TLS, addressed as `tcp://host:port` or
//! `tls://host:port`.

use super::{ConnectionFactory, TransportConnection, TransportFeatures};
use crate::core::HubError;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, split};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsConnector, rustls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// An enum to wrap plain TCP and TLS client streams into a single type.
enum HubStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for HubStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            HubStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HubStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            HubStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            HubStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HubStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            HubStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connects over TCP, upgrading to TLS for `tls://` endpoints or when forced.
#[derive(Debug, Clone, Default)]
pub struct TcpConnectionFactory {
    force_tls: bool,
}

impl TcpConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always negotiate TLS, whatever the endpoint scheme says.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.force_tls = enabled;
        self
    }

    async fn open(&self, endpoint: &str) -> Result<TransportConnection, HubError> {
        let url = Url::parse(endpoint)
            .map_err(|e| HubError::InvalidOperation(format!("Invalid endpoint '{endpoint}': {e}")))?;
        let tls_enabled = match url.scheme() {
            "tcp" => self.force_tls,
            "tls" => true,
            other => {
                return Err(HubError::InvalidOperation(format!(
                    "Unsupported endpoint scheme '{other}'; expected 'tcp' or 'tls'."
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| HubError::InvalidOperation(format!("Endpoint '{endpoint}' has no host.")))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| HubError::InvalidOperation(format!("Endpoint '{endpoint}' has no port.")))?;

        let addr = format!("{host}:{port}");
        debug!("Opening TCP connection to {}", addr);
        let tcp_stream = TcpStream::connect(&addr).await?;
        tcp_stream.set_nodelay(true)?;

        let stream = if tls_enabled {
            info!("Establishing TLS connection with {addr}");
            let mut root_cert_store = rustls::RootCertStore::empty();
            root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));

            let domain = rustls::pki_types::ServerName::try_from(host.as_str())
                .map_err(|_| HubError::InvalidOperation("Invalid TLS domain name".into()))?
                .to_owned();

            let tls_stream = connector.connect(domain, tcp_stream).await?;
            HubStream::Tls(Box::new(tls_stream))
        } else {
            HubStream::Tcp(tcp_stream)
        };

        let (reader, writer) = split(stream);
        Ok(TransportConnection {
            connection_id: Some(uuid::Uuid::new_v4().to_string()),
            reader: Box::new(reader),
            writer: Box::new(writer),
            features: TransportFeatures::default(),
        })
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(
        &self,
        endpoint: &str,
        token: &CancellationToken,
    ) -> Result<TransportConnection, HubError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HubError::canceled()),
            result = self.open(endpoint) => result,
        }
    }
}
