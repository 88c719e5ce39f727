// src/core/streams.rs

//! Streaming in both directions: arguments that upload a stream of items to the
//! server, and the reader handed out for server-to-client streams.

use crate::core::HubError;
use crate::core::state::StreamResult;
use futures::Stream;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::DropGuard;

/// A source of items uploaded to the server as a streamed argument.
pub enum UploadSource {
    /// Items pushed by the caller through a bounded channel. Dropping the sender
    /// completes the upload.
    Channel(mpsc::Receiver<Value>),
    /// Any async sequence. An `Err` item ends the upload with that error.
    Stream(BoxStream<'static, Result<Value, HubError>>),
}

impl UploadSource {
    /// Unifies both variants so one pump drives either.
    pub fn into_stream(self) -> BoxStream<'static, Result<Value, HubError>> {
        match self {
            UploadSource::Channel(rx) => ReceiverStream::new(rx).map(Ok).boxed(),
            UploadSource::Stream(stream) => stream,
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadSource::Channel(_) => f.write_str("UploadSource::Channel"),
            UploadSource::Stream(_) => f.write_str("UploadSource::Stream"),
        }
    }
}

/// One argument of an outgoing invocation.
#[derive(Debug)]
pub enum Argument {
    Value(Value),
    Upload(UploadSource),
}

impl Argument {
    pub fn channel(rx: mpsc::Receiver<Value>) -> Self {
        Argument::Upload(UploadSource::Channel(rx))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, HubError>> + Send + 'static,
    {
        Argument::Upload(UploadSource::Stream(stream.boxed()))
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

/// Items of a server-to-client stream, in arrival order.
///
/// The stream ends cleanly when the server completes it or the caller cancels it,
/// and yields one `Err` when it fails. Dropping the reader before the end cancels
/// the invocation and tells the server to stop producing.
pub struct HubStreamReader {
    items: UnboundedReceiverStream<StreamResult>,
    _cancel_on_drop: DropGuard,
}

impl HubStreamReader {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<StreamResult>, cancel_on_drop: DropGuard) -> Self {
        Self {
            items: UnboundedReceiverStream::new(rx),
            _cancel_on_drop: cancel_on_drop,
        }
    }
}

impl Stream for HubStreamReader {
    type Item = StreamResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.items).poll_next(cx)
    }
}
