//! Channel-modelled native exchange: read half, write half, abort.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One chunk of request body data; `last` marks the final chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodyChunk {
    /// Chunk payload (may be empty on the final marker).
    pub data: Bytes,
    /// Whether this is the final chunk of the body.
    pub last: bool,
}

impl BodyChunk {
    /// A data chunk that is not the last.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last: false,
        }
    }

    /// The final chunk, possibly carrying trailing data.
    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last: true,
        }
    }
}

/// Read half of one native transaction, re-expressed as channels and tokens.
///
/// The embedding transport keeps the matching [`ExchangeHandles`]: it feeds
/// body chunks into `body`, cancels `abort` when the client goes away, and
/// stops feeding when `read_release` fires (the consumer gave up early).
pub struct ExchangeParts {
    /// Request method as received (any case).
    pub method: String,
    /// Request path.
    pub path: String,
    /// Raw query string, empty when absent.
    pub query: String,
    /// Ordered multi-value headers as received.
    pub headers: Vec<(String, String)>,
    /// In-order body chunks with a final-chunk marker.
    pub body: mpsc::Receiver<BodyChunk>,
    /// Fired by the transport when the client disconnects.
    ///
    /// Cancellation is synchronous: every continuation that checks the token
    /// after the transport cancels it observes the abort.
    pub abort: CancellationToken,
    /// Fired by the consumer when it stops reading before completion.
    pub read_release: CancellationToken,
}

/// Transport-side handles matching one [`ExchangeParts`].
pub struct ExchangeHandles {
    /// Producer for body chunks.
    pub body: mpsc::Sender<BodyChunk>,
    /// Cancel to signal client disconnect.
    pub abort: CancellationToken,
    /// Fires when the consumer released the read side early.
    pub read_release: CancellationToken,
}

impl ExchangeParts {
    /// Create an exchange and the transport-side handles for it.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: Vec<(String, String)>,
        body_capacity: usize,
    ) -> (Self, ExchangeHandles) {
        let (body_tx, body_rx) = mpsc::channel(body_capacity);
        let abort = CancellationToken::new();
        let read_release = CancellationToken::new();
        let parts = Self {
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
            body: body_rx,
            abort: abort.clone(),
            read_release: read_release.clone(),
        };
        let handles = ExchangeHandles {
            body: body_tx,
            abort,
            read_release,
        };
        (parts, handles)
    }
}

/// Outcome of a single non-blocking write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The chunk was accepted by the transport.
    Written,
    /// The send buffer is full; wait for [`ResponseSink::writable`] and
    /// retry the same chunk.
    Backpressure,
    /// The peer is gone; stop writing.
    Closed,
}

/// Write half of one native transaction.
#[async_trait]
pub trait ResponseSink: Send {
    /// Write the status line and every header.
    ///
    /// Implementations must emit the whole head in one atomic region, never
    /// interleaved with output belonging to other exchanges. Multi-value
    /// headers arrive as repeated entries and are written repeatedly.
    fn write_head(&mut self, status: u16, headers: &[(String, String)]);

    /// Attempt to write one body chunk without blocking.
    fn try_write(&mut self, data: &Bytes) -> WriteOutcome;

    /// Wait until the transport reports it is writable again.
    async fn writable(&mut self);

    /// Finish the exchange. Called exactly once on the success path.
    fn end(&mut self);
}

/// Response head captured by a [`ChannelSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Headers in write order, multi-value names repeated.
    pub headers: Vec<(String, String)>,
}

/// [`ResponseSink`] backed by channels.
///
/// The bounded body channel is the send buffer: a full channel reports
/// [`WriteOutcome::Backpressure`] and `writable` resolves when capacity
/// frees up. Used by the Axum gateway and by tests.
pub struct ChannelSink {
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    /// Create a sink plus the receiving halves.
    pub fn new(
        capacity: usize,
    ) -> (
        Self,
        oneshot::Receiver<ResponseHead>,
        mpsc::Receiver<Bytes>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(capacity);
        (
            Self {
                head_tx: Some(head_tx),
                body_tx: Some(body_tx),
            },
            head_rx,
            body_rx,
        )
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    fn write_head(&mut self, status: u16, headers: &[(String, String)]) {
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(ResponseHead {
                status,
                headers: headers.to_vec(),
            });
        }
    }

    fn try_write(&mut self, data: &Bytes) -> WriteOutcome {
        let Some(tx) = &self.body_tx else {
            return WriteOutcome::Closed;
        };
        match tx.try_send(data.clone()) {
            Ok(()) => WriteOutcome::Written,
            Err(mpsc::error::TrySendError::Full(_)) => WriteOutcome::Backpressure,
            Err(mpsc::error::TrySendError::Closed(_)) => WriteOutcome::Closed,
        }
    }

    async fn writable(&mut self) {
        if let Some(tx) = &self.body_tx {
            // The reserved permit is released immediately; if another writer
            // steals the slot the pump loop simply waits again.
            let _ = tx.reserve().await;
        }
    }

    fn end(&mut self) {
        self.head_tx = None;
        self.body_tx = None;
    }
}
