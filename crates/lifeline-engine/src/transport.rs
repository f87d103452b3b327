//! Transport seam.
//!
//! The engine never speaks a wire protocol. It only needs to send a frame,
//! run a liveness round-trip and close. [`ChannelTransport`] adapts any
//! writer task fed by an mpsc channel to that contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use lifeline_core::TransportError;
use tokio::sync::{Notify, mpsc};

/// Outbound unit handed to a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 payload.
    Text(String),
    /// Opaque binary payload.
    Binary(Bytes),
    /// Several payloads delivered together by the batching engine.
    Batch(Vec<Bytes>),
    /// Liveness probe.
    Ping,
}

/// Capability to talk to one client connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write a frame.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Liveness round-trip. Resolves once the peer answers.
    ///
    /// Callers apply their own deadline; implementations may wait forever.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Close the transport. Callers treat errors as best-effort.
    async fn close(&self) -> Result<(), TransportError>;
}

/// [`Transport`] backed by a bounded mpsc channel to a writer task.
///
/// Probes push [`Frame::Ping`]; the reader side calls
/// [`ChannelTransport::acknowledge_pong`] when the peer answers.
pub struct ChannelTransport {
    tx: mpsc::Sender<Frame>,
    pong: Notify,
    closed: AtomicBool,
    dropped_frames: AtomicU64,
}

impl ChannelTransport {
    /// Create a transport and the receiver its writer task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(tx), rx)
    }

    /// Wrap an existing sender.
    pub fn from_sender(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            tx,
            pong: Notify::new(),
            closed: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Wake every probe currently waiting for an answer.
    pub fn acknowledge_pong(&self) {
        self.pong.notify_waiters();
    }

    /// Frames dropped because the channel was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Whether [`Transport::close`] was called or the writer went away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn push(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Send("outbound channel full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.push(frame)
    }

    async fn probe(&self) -> Result<(), TransportError> {
        // Register interest before the ping leaves so a fast pong is not missed.
        let notified = self.pong.notified();
        tokio::pin!(notified);
        let _ = notified.as_mut().enable();
        self.push(Frame::Ping)?;
        notified.await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        // Release probes parked on a pong that will never come.
        self.pong.notify_waiters();
        Ok(())
    }
}
