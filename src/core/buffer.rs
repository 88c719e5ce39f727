// src/core/buffer.rs

//! Implements the acknowledgement buffer used for stateful reconnect.
//!
//! Every sequenced message the client sends is numbered and retained until the
//! server acknowledges it. If the transport drops and resumes underneath the hub
//! session, the retained frames are replayed behind a `Sequence` frame so the server
//! sees every message exactly once. In the other direction the buffer numbers the
//! sequenced messages it receives, so duplicates replayed by the server after a
//! resume are skipped, and it tracks the highest id that still needs acknowledging.

use crate::core::HubError;
use crate::core::protocol::{HubMessage, HubProtocol};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The default number of unacknowledged bytes retained before writers must wait.
pub const DEFAULT_BUFFER_SIZE: usize = 100_000;

/// Retains sent frames until acknowledged and deduplicates received ones.
#[derive(Debug)]
pub struct MessageBuffer {
    inner: Mutex<Inner>,
    /// Woken whenever an ack frees space.
    space_available: Notify,
    disposed: CancellationToken,
    capacity: usize,
}

#[derive(Debug)]
struct Inner {
    /// `(sequence_id, frame)` for every sent message not yet acknowledged.
    buffer: VecDeque<(u64, Bytes)>,
    /// Sequence id of the last sequenced message sent.
    total_sent: u64,
    buffered_bytes: usize,
    /// The id the next received sequenced message will carry.
    current_receiving_sequence_id: u64,
    /// The highest id processed so far.
    latest_received_sequence_id: u64,
    /// The id carried by the last ack frame handed out by `take_pending_ack`.
    last_ack_sent: u64,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                total_sent: 0,
                buffered_bytes: 0,
                current_receiving_sequence_id: 1,
                latest_received_sequence_id: 0,
                last_ack_sent: 0,
            }),
            space_available: Notify::new(),
            disposed: CancellationToken::new(),
            capacity,
        }
    }

    /// Assigns the next sequence id to `frame` and retains it, waiting while the
    /// retained bytes are at capacity. Fails once the buffer has been disposed.
    pub async fn track(&self, frame: Bytes) -> Result<u64, HubError> {
        loop {
            self.wait_for_space().await?;
            if let Some(sequence_id) = self.try_track(frame.clone())? {
                return Ok(sequence_id);
            }
        }
    }

    /// Resolves once a frame would be accepted. Another writer may take the space
    /// before the caller does, so `try_track` can still refuse.
    pub async fn wait_for_space(&self) -> Result<(), HubError> {
        loop {
            let notified = self.space_available.notified();
            {
                let inner = self.inner.lock();
                if self.disposed.is_cancelled() {
                    return Err(HubError::ConnectionClosed);
                }
                if self.has_space(&inner) {
                    return Ok(());
                }
            }
            debug!("Acknowledgement buffer is full; waiting for the server to ack.");
            tokio::select! {
                _ = notified => {}
                _ = self.disposed.cancelled() => return Err(HubError::ConnectionClosed),
            }
        }
    }

    /// Assigns the next sequence id to `frame` and retains it if there is room.
    ///
    /// Never waits. Writers call this under their write lock so sequence ids follow
    /// wire order, and wait for space with `wait_for_space` before taking that lock.
    pub fn try_track(&self, frame: Bytes) -> Result<Option<u64>, HubError> {
        let mut inner = self.inner.lock();
        if self.disposed.is_cancelled() {
            return Err(HubError::ConnectionClosed);
        }
        if !self.has_space(&inner) {
            return Ok(None);
        }
        inner.total_sent += 1;
        let sequence_id = inner.total_sent;
        inner.buffered_bytes += frame.len();
        inner.buffer.push_back((sequence_id, frame));
        Ok(Some(sequence_id))
    }

    fn has_space(&self, inner: &Inner) -> bool {
        inner.buffered_bytes < self.capacity || inner.buffer.is_empty()
    }

    /// Releases every retained message with an id at or below `sequence_id`.
    pub fn ack(&self, sequence_id: u64) {
        let mut inner = self.inner.lock();
        let mut released = false;
        while let Some((id, frame)) = inner.buffer.front() {
            if *id > sequence_id {
                break;
            }
            let len = frame.len();
            inner.buffer.pop_front();
            inner.buffered_bytes -= len;
            released = true;
        }
        drop(inner);
        if released {
            self.space_available.notify_waiters();
        }
    }

    /// Numbers a received message and reports whether it is new.
    ///
    /// Non-sequenced messages are always processed. A sequenced message whose id was
    /// already processed is a replay after a resume and must be skipped.
    pub fn should_process_message(&self, message: &HubMessage) -> bool {
        if !message.is_sequenced() {
            return true;
        }
        let mut inner = self.inner.lock();
        let current = inner.current_receiving_sequence_id;
        inner.current_receiving_sequence_id += 1;
        if current <= inner.latest_received_sequence_id {
            debug!("Skipping duplicate message with sequence id {}.", current);
            return false;
        }
        inner.latest_received_sequence_id = current;
        true
    }

    /// Handles a `Sequence` frame: the next received message carries `sequence_id`.
    pub fn reset_sequence(&self, sequence_id: u64) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        if sequence_id > inner.current_receiving_sequence_id {
            return Err(HubError::InvalidData(
                "Sequence ID greater than amount of messages we've received.".to_string(),
            ));
        }
        inner.current_receiving_sequence_id = sequence_id;
        Ok(())
    }

    /// Returns the id to acknowledge if it advanced since the last call.
    pub fn take_pending_ack(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.latest_received_sequence_id > inner.last_ack_sent {
            inner.last_ack_sent = inner.latest_received_sequence_id;
            Some(inner.last_ack_sent)
        } else {
            None
        }
    }

    /// The frames to write after the transport resumes: a `Sequence` frame naming the
    /// first retained id, then every retained frame in order.
    pub fn resend_frames(&self, protocol: &dyn HubProtocol) -> Result<Vec<Bytes>, HubError> {
        let inner = self.inner.lock();
        let first_id = inner
            .buffer
            .front()
            .map(|(id, _)| *id)
            .unwrap_or(inner.total_sent + 1);
        let mut sequence = BytesMut::new();
        protocol.write_message(
            &HubMessage::Sequence {
                sequence_id: first_id,
            },
            &mut sequence,
        )?;
        let mut frames = Vec::with_capacity(inner.buffer.len() + 1);
        frames.push(sequence.freeze());
        frames.extend(inner.buffer.iter().map(|(_, frame)| frame.clone()));
        Ok(frames)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().buffered_bytes
    }

    /// Number of retained, unacknowledged messages.
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    /// Drops every retained frame and fails writers waiting for space.
    pub fn dispose(&self) {
        self.disposed.cancel();
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.buffered_bytes = 0;
    }
}
