//! Bounded ingestion of a chunked request body.

use bytes::{Bytes, BytesMut};
use relay_core::RelayError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::exchange::BodyChunk;

/// Lazy, single-consumer view of a chunked request body.
///
/// Chunks are delivered in arrival order. The cumulative size is checked as
/// each chunk arrives: the first chunk that would push the total past the
/// limit terminates the stream with `PAYLOAD_TOO_LARGE` and is not
/// delivered. A transport abort terminates the stream with
/// `CLIENT_CLOSED_REQUEST`; termination is idempotent and later reads
/// observe end-of-stream. Dropping the reader before completion releases
/// the transport read side via the read-release token.
#[derive(Debug)]
pub struct BodyReader {
    rx: Option<mpsc::Receiver<BodyChunk>>,
    abort: CancellationToken,
    read_release: CancellationToken,
    limit: Option<usize>,
    received: usize,
    done: bool,
}

impl BodyReader {
    pub(crate) fn new(
        rx: mpsc::Receiver<BodyChunk>,
        abort: CancellationToken,
        read_release: CancellationToken,
        limit: Option<usize>,
    ) -> Self {
        Self {
            rx: Some(rx),
            abort,
            read_release,
            limit,
            received: 0,
            done: false,
        }
    }

    /// An already-completed empty body (GET/HEAD requests).
    pub fn closed() -> Self {
        Self {
            rx: None,
            abort: CancellationToken::new(),
            read_release: CancellationToken::new(),
            limit: None,
            received: 0,
            done: true,
        }
    }

    /// Whether the body has been fully consumed or terminated.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Total bytes delivered so far.
    pub fn bytes_received(&self) -> usize {
        self.received
    }

    fn terminate(&mut self, release: bool) {
        self.done = true;
        self.rx = None;
        if release {
            self.read_release.cancel();
        }
    }

    /// Next chunk of the body.
    ///
    /// Returns `None` once the final chunk has been delivered or after a
    /// terminal error; errors are yielded exactly once.
    pub async fn next(&mut self) -> Option<Result<Bytes, RelayError>> {
        loop {
            if self.done {
                return None;
            }
            let abort = self.abort.clone();
            let received = {
                let rx = self.rx.as_mut()?;
                tokio::select! {
                    biased;
                    () = abort.cancelled() => None,
                    chunk = rx.recv() => Some(chunk),
                }
            };
            let Some(chunk) = received else {
                self.terminate(true);
                return Some(Err(RelayError::ClientClosedRequest));
            };
            let Some(BodyChunk { data, last }) = chunk else {
                // Producer went away without a final marker.
                self.terminate(false);
                return Some(Err(RelayError::ClientClosedRequest));
            };
            if let Some(limit) = self.limit {
                if self.received + data.len() > limit {
                    self.terminate(true);
                    return Some(Err(RelayError::PayloadTooLarge { limit }));
                }
            }
            self.received += data.len();
            if last {
                self.terminate(false);
            }
            if data.is_empty() {
                if self.done {
                    return None;
                }
                continue;
            }
            return Some(Ok(data));
        }
    }

    /// Materialize the whole body.
    ///
    /// An empty body (single empty final chunk) completes without ever
    /// allocating an accumulator.
    pub async fn concat(mut self) -> Result<Bytes, RelayError> {
        let mut buf: Option<BytesMut> = None;
        while let Some(item) = self.next().await {
            let data = item?;
            buf.get_or_insert_with(BytesMut::new).extend_from_slice(&data);
        }
        Ok(buf.map_or_else(Bytes::new, BytesMut::freeze))
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        // Consumer stopped reading before completion: release the read side
        // so the transport does not keep a half-read connection open.
        if !self.done {
            self.read_release.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeParts;

    fn make_reader(limit: Option<usize>) -> (BodyReader, crate::exchange::ExchangeHandles) {
        let (parts, handles) = ExchangeParts::new("POST", "/p", "", vec![], 8);
        let reader = BodyReader::new(
            parts.body,
            parts.abort.clone(),
            parts.read_release.clone(),
            limit,
        );
        (reader, handles)
    }

    #[tokio::test]
    async fn chunks_concatenate_in_order() {
        let (reader, handles) = make_reader(None);
        handles.body.send(BodyChunk::data("hel")).await.unwrap();
        handles.body.send(BodyChunk::data("lo ")).await.unwrap();
        handles.body.send(BodyChunk::last("world")).await.unwrap();
        let body = reader.concat().await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn empty_body_completes_without_accumulating() {
        let (reader, handles) = make_reader(Some(100));
        handles.body.send(BodyChunk::last("")).await.unwrap();
        let body = reader.concat().await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn lazy_reader_yields_chunks_then_none() {
        let (mut reader, handles) = make_reader(None);
        handles.body.send(BodyChunk::data("a")).await.unwrap();
        handles.body.send(BodyChunk::last("b")).await.unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert!(reader.next().await.is_none());
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn limit_exceeded_on_third_chunk() {
        let (mut reader, handles) = make_reader(Some(250));
        let chunk = vec![0u8; 100];
        handles.body.send(BodyChunk::data(chunk.clone())).await.unwrap();
        handles.body.send(BodyChunk::data(chunk.clone())).await.unwrap();
        handles.body.send(BodyChunk::last(chunk)).await.unwrap();

        assert_eq!(reader.next().await.unwrap().unwrap().len(), 100);
        assert_eq!(reader.next().await.unwrap().unwrap().len(), 100);
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_TOO_LARGE");
        // The offending chunk's bytes were never delivered.
        assert_eq!(reader.bytes_received(), 200);
        // Terminal: subsequent reads see end-of-stream, not a second error.
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn limit_exact_fit_is_allowed() {
        let (reader, handles) = make_reader(Some(6));
        handles.body.send(BodyChunk::data("abc")).await.unwrap();
        handles.body.send(BodyChunk::last("def")).await.unwrap();
        assert_eq!(reader.concat().await.unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn abort_terminates_pending_read() {
        let (mut reader, handles) = make_reader(None);
        let abort = handles.abort.clone();
        let pending = tokio::spawn(async move { reader.next().await });
        abort.cancel();
        let err = pending.await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.code(), "CLIENT_CLOSED_REQUEST");
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let (mut reader, handles) = make_reader(None);
        handles.abort.cancel();
        handles.abort.cancel();
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), "CLIENT_CLOSED_REQUEST");
        // Error is delivered exactly once.
        assert!(reader.next().await.is_none());
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn abort_wins_over_buffered_chunk() {
        let (mut reader, handles) = make_reader(None);
        handles.body.send(BodyChunk::data("late")).await.unwrap();
        handles.abort.cancel();
        // Abort flipped before the read ran, so the chunk is never seen.
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), "CLIENT_CLOSED_REQUEST");
    }

    #[tokio::test]
    async fn dropped_producer_is_client_closed() {
        let (mut reader, handles) = make_reader(None);
        drop(handles.body);
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), "CLIENT_CLOSED_REQUEST");
    }

    #[tokio::test]
    async fn dropping_reader_releases_read_side() {
        let (reader, handles) = make_reader(None);
        assert!(!handles.read_release.is_cancelled());
        drop(reader);
        assert!(handles.read_release.is_cancelled());
    }

    #[tokio::test]
    async fn completed_reader_does_not_release_on_drop() {
        let (mut reader, handles) = make_reader(None);
        handles.body.send(BodyChunk::last("x")).await.unwrap();
        let _ = reader.next().await.unwrap().unwrap();
        assert!(reader.next().await.is_none());
        drop(reader);
        assert!(!handles.read_release.is_cancelled());
    }

    #[tokio::test]
    async fn oversized_failure_releases_read_side() {
        let (mut reader, handles) = make_reader(Some(2));
        handles.body.send(BodyChunk::data("abc")).await.unwrap();
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_TOO_LARGE");
        assert!(handles.read_release.is_cancelled());
    }

    #[tokio::test]
    async fn closed_reader_is_empty_and_finished() {
        let mut reader = BodyReader::closed();
        assert!(reader.is_finished());
        assert!(reader.next().await.is_none());
        let body = reader.concat().await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn interior_empty_chunk_is_skipped() {
        let (mut reader, handles) = make_reader(None);
        handles.body.send(BodyChunk::data("a")).await.unwrap();
        handles.body.send(BodyChunk::data("")).await.unwrap();
        handles.body.send(BodyChunk::last("b")).await.unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn trailing_empty_final_chunk_after_data() {
        let (reader, handles) = make_reader(None);
        handles.body.send(BodyChunk::data("payload")).await.unwrap();
        handles.body.send(BodyChunk::last("")).await.unwrap();
        assert_eq!(reader.concat().await.unwrap(), Bytes::from_static(b"payload"));
    }
}
