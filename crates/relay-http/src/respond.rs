//! Response delivery: atomic head, backpressure-aware body pump.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exchange::{ResponseSink, WriteOutcome};

/// Response body shapes.
pub enum ResponseBody {
    /// No body.
    Empty,
    /// Fully materialized body.
    Full(Bytes),
    /// Streamed body; chunks are written as they arrive.
    Stream(BoxStream<'static, Bytes>),
}

/// Response under construction: status, headers, body.
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Headers in write order; multi-value names appear repeatedly.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: ResponseBody,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    /// Override the status code.
    #[must_use]
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Append a header (repeat the name for multi-value headers).
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a materialized body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Attach a streamed body.
    #[must_use]
    pub fn stream(mut self, stream: BoxStream<'static, Bytes>) -> Self {
        self.body = ResponseBody::Stream(stream);
        self
    }

    /// A JSON response: serialized value plus content type.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        Self::new(status)
            .header("content-type", "application/json")
            .body(bytes)
    }
}

/// Write one chunk, waiting out backpressure.
///
/// The same chunk is retried until the transport accepts it; returns `false`
/// when the exchange aborted or the peer closed, in which case nothing more
/// must be written.
async fn write_chunk(
    sink: &mut dyn ResponseSink,
    abort: &CancellationToken,
    chunk: &Bytes,
) -> bool {
    loop {
        if abort.is_cancelled() {
            return false;
        }
        match sink.try_write(chunk) {
            WriteOutcome::Written => return true,
            WriteOutcome::Closed => return false,
            WriteOutcome::Backpressure => {
                tokio::select! {
                    biased;
                    () = abort.cancelled() => return false,
                    () = sink.writable() => {}
                }
            }
        }
    }
}

/// Deliver a response onto the native exchange.
///
/// A no-op if the exchange already aborted. The head is written in one
/// atomic region, then the body is pumped chunk by chunk: backpressure
/// pauses the pump until the transport is writable again and retries the
/// same chunk, an abort terminates the pump immediately, and completion
/// ends the exchange exactly once.
pub async fn send(sink: &mut dyn ResponseSink, abort: &CancellationToken, response: Response) {
    if abort.is_cancelled() {
        debug!("exchange aborted before response; skipping write");
        return;
    }

    sink.write_head(response.status, &response.headers);

    match response.body {
        ResponseBody::Empty => sink.end(),
        ResponseBody::Full(bytes) => {
            if write_chunk(sink, abort, &bytes).await {
                sink.end();
            }
        }
        ResponseBody::Stream(mut stream) => loop {
            let chunk = tokio::select! {
                biased;
                () = abort.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(bytes) => {
                    if !write_chunk(sink, abort, &bytes).await {
                        return;
                    }
                }
                None => {
                    sink.end();
                    return;
                }
            }
        },
    }
}
