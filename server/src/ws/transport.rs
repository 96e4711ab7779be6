//! Per-connection transport.
//!
//! Turns structured calls into frames on the connection's outbound queue.
//! The queue is drained by a single writer task, which gives per-socket
//! send ordering. Buffered bytes are counted so callers can apply
//! backpressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use super::messages::Packet;
use crate::error::ServerError;

/// An outbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Serialized packet.
    Text(Utf8Bytes),
    /// Ping control frame.
    Ping,
    /// Close handshake, after which the writer stops.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Drop the connection without a close handshake.
    Terminate,
}

impl Frame {
    /// Returns the number of bytes this frame adds to the send buffer.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Text(text) => text.as_str().len(),
            Self::Close { reason, .. } => reason.len() + 2,
            Self::Ping | Self::Terminate => 0,
        }
    }
}

/// Creates a connected sink/queue pair.
#[must_use]
pub fn frame_channel() -> (FrameSink, FrameQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Notify::new());
    (
        FrameSink {
            tx,
            buffered: Arc::clone(&buffered),
            drained: Arc::clone(&drained),
        },
        FrameQueue {
            rx,
            buffered,
            drained,
        },
    )
}

/// Producer side of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
    buffered: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl FrameSink {
    /// Queues a frame. Returns false if the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        let len = frame.byte_len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(frame).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Queues a frame unless more than `limit` bytes are already buffered.
    pub fn send_bounded(&self, frame: Frame, limit: usize) -> bool {
        if self.buffered() > limit {
            return false;
        }
        self.send(frame)
    }

    /// Returns the number of queued bytes not yet taken by the writer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Returns true once the writer side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits until at most `mark` bytes are buffered or the writer is gone.
    pub async fn drained_below(&self, mark: usize) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.buffered() <= mark || self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Consumer side of a connection's outbound queue, owned by the writer.
#[derive(Debug)]
pub struct FrameQueue {
    rx: mpsc::UnboundedReceiver<Frame>,
    buffered: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl FrameQueue {
    /// Waits for the next frame.
    pub async fn recv(&mut self) -> Option<Frame> {
        let frame = self.rx.recv().await?;
        self.taken(&frame);
        Some(frame)
    }

    /// Takes the next frame if one is queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.taken(&frame);
        Some(frame)
    }

    fn taken(&self, frame: &Frame) {
        self.buffered.fetch_sub(frame.byte_len(), Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        self.rx.close();
        self.drained.notify_waiters();
    }
}

/// A packet serialized once and sent to many sockets.
#[derive(Debug, Clone)]
pub struct PreparedPackage(Utf8Bytes);

impl PreparedPackage {
    /// Serializes a packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be serialized.
    pub fn prepare(packet: &Packet) -> Result<Self, ServerError> {
        Ok(Self(serde_json::to_string(packet)?.into()))
    }

    /// Returns a frame sharing the serialized bytes.
    #[must_use]
    pub fn frame(&self) -> Frame {
        Frame::Text(self.0.clone())
    }

    /// Returns the serialized packet.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

type PendingInvoke = oneshot::Sender<Result<Value, ServerError>>;

/// Structured send/receive operations over one connection.
#[derive(Debug)]
pub struct Transport {
    sink: FrameSink,
    ack_timeout: Duration,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingInvoke>>,
    outbound: Mutex<Vec<Packet>>,
    flush_scheduled: AtomicBool,
}

impl Transport {
    /// Creates a transport writing to `sink`.
    #[must_use]
    pub fn new(sink: FrameSink, ack_timeout: Duration) -> Self {
        Self {
            sink,
            ack_timeout,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
        }
    }

    /// Returns the outbound sink.
    #[must_use]
    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    /// Sends a packet immediately, after anything still in the batch buffer.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the writer is gone.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), ServerError> {
        self.flush_buffer()?;
        self.write(packet)
    }

    /// Sends a prepared package.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the writer is gone.
    pub fn send_prepared(&self, package: &PreparedPackage) -> Result<(), ServerError> {
        self.flush_buffer()?;
        if self.sink.send(package.frame()) {
            Ok(())
        } else {
            Err(ServerError::NotOpen)
        }
    }

    /// Sends a transmit. Batched transmits are coalesced with the others
    /// queued in the same tick.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the writer is gone.
    pub fn transmit(self: &Arc<Self>, receiver: &str, data: Value, batch: bool) -> Result<(), ServerError> {
        let packet = Packet::transmit(receiver, data);
        if !batch {
            return self.send_packet(&packet);
        }
        if self.sink.is_closed() {
            return Err(ServerError::NotOpen);
        }

        self.outbound.lock().push(packet);
        if !self.flush_scheduled.swap(true, Ordering::AcqRel) {
            let transport = Arc::clone(self);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                if let Err(e) = transport.flush_buffer() {
                    debug!("Dropped batched transmits: {}", e);
                }
            });
        }
        Ok(())
    }

    /// Invokes a procedure on the peer and waits for its answer.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no answer arrives within the ack timeout,
    /// `Remote` if the peer rejects, or `NotOpen` if the socket closes.
    pub async fn invoke(&self, procedure: &str, data: Value) -> Result<Value, ServerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.send_packet(&Packet::invoke(id, procedure, data)) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServerError::NotOpen),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ServerError::Timeout(format!(
                    "Response to invoke \"{procedure}\" timed out"
                )))
            }
        }
    }

    /// Writes every batched packet as a single frame.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the writer is gone.
    pub fn flush_buffer(&self) -> Result<(), ServerError> {
        let packets = {
            let mut outbound = self.outbound.lock();
            self.flush_scheduled.store(false, Ordering::Release);
            std::mem::take(&mut *outbound)
        };
        if packets.is_empty() {
            return Ok(());
        }
        self.write(&Packet::batch(packets))
    }

    /// Drops every batched packet.
    pub fn clear_buffer(&self) {
        self.outbound.lock().clear();
    }

    /// Returns the number of packets waiting in the batch buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Returns the number of queued bytes not yet written.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.sink.buffered()
    }

    /// Settles a pending invoke.
    pub(crate) fn resolve(&self, id: u64, result: Result<Value, ServerError>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("Response for unknown invoke id {}", id),
        }
    }

    /// Fails every pending invoke with `NotOpen`.
    pub(crate) fn reject_pending(&self) {
        let pending: Vec<PendingInvoke> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(ServerError::NotOpen));
        }
    }

    /// Returns the number of invokes awaiting an answer.
    #[must_use]
    pub fn pending_invokes(&self) -> usize {
        self.pending.lock().len()
    }

    fn write(&self, packet: &Packet) -> Result<(), ServerError> {
        let text = serde_json::to_string(packet)?;
        if self.sink.send(Frame::Text(text.into())) {
            Ok(())
        } else {
            Err(ServerError::NotOpen)
        }
    }
}

/// Decodes an inbound text frame.
///
/// # Errors
///
/// Returns `InvalidArguments` if the frame is not a packet.
pub fn decode(text: &str) -> Result<Packet, ServerError> {
    serde_json::from_str(text).map_err(|e| ServerError::InvalidArguments(format!("Bad message: {e}")))
}

/// Decodes an inbound binary frame.
///
/// # Errors
///
/// Returns `InvalidArguments` if the frame is not a packet.
pub fn decode_binary(bytes: &[u8]) -> Result<Packet, ServerError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ServerError::InvalidArguments(format!("Bad message: {e}")))
}
