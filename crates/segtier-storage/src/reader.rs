//! Cold range reads
//!
//! [`ColdRangeReader::open_range`] returns at once with a [`RangeStream`];
//! a background task lists the bucket, picks the objects whose key range
//! overlaps the query, and pushes their decompressed bytes through a bounded
//! channel. The channel capacity is the only buffering between the network
//! and the consumer, so a slow consumer stalls the downloads.
//!
//! Reads are best-effort. A malformed key, a failed download or a corrupt
//! object is reported to the event sink and skipped; the timeout ends the
//! stream early. None of these surface to the consumer as errors.

use crate::blob_store::BlobStore;
use crate::compression::GzipStreamDecoder;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use segtier_core::{
    CoreError, Event, EventSink, ListingOrder, QueryRange, SegmentKey, TierConfig,
};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::Instrument;

const OP: &str = "range_read";

/// Streams the archived content overlapping a query.
#[derive(Clone)]
pub struct ColdRangeReader {
    store: Arc<dyn BlobStore>,
    config: TierConfig,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
}

impl ColdRangeReader {
    pub fn new(store: Arc<dyn BlobStore>, config: TierConfig, sink: Arc<dyn EventSink>) -> Self {
        let timeout = config.read_timeout();
        Self {
            store,
            config,
            sink,
            timeout,
        }
    }

    /// Override the read budget taken from the config.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start a range read.
    ///
    /// Must be called from within a tokio runtime; the worker is spawned on
    /// it. Dropping the returned stream stops the worker at its next send.
    pub fn open_range(&self, query: QueryRange) -> RangeStream {
        let (tx, rx) = mpsc::channel(self.config.pipe_capacity.max(1));

        let worker = RangeWorker {
            store: self.store.clone(),
            bucket: self.config.bucket.clone(),
            order: self.config.listing_order,
            sink: self.sink.clone(),
            query,
            tx,
            copied: 0,
        };
        let span = tracing::debug_span!(
            "range_read",
            bucket = %self.config.bucket,
            from = %query.from.id,
            to = %query.to.id,
        );
        tokio::spawn(worker.run(self.timeout).instrument(span));

        RangeStream::new(rx)
    }
}

/// Why copying one object stopped early.
enum Interrupt {
    /// The object is unusable; move on to the next one.
    Object(CoreError),
    /// The consumer dropped the stream.
    Closed,
}

struct RangeWorker {
    store: Arc<dyn BlobStore>,
    bucket: String,
    order: ListingOrder,
    sink: Arc<dyn EventSink>,
    query: QueryRange,
    tx: mpsc::Sender<Bytes>,
    copied: u64,
}

impl RangeWorker {
    /// Consumes the worker; dropping `tx` on return ends the stream.
    async fn run(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.scan()).await.is_err() {
            tracing::debug!(secs = timeout.as_secs_f64(), "Range read timed out");
        }

        self.sink.report_event(Event::debug(
            OP,
            &self.bucket,
            format!("Copied {} bytes", self.copied),
        ));
    }

    async fn scan(&mut self) {
        let listing = match self.store.list_objects(&self.bucket).await {
            Ok(listing) => listing,
            Err(e) => {
                self.sink.report_event(Event::error(
                    OP,
                    &self.bucket,
                    &e,
                    "Could not list objects",
                ));
                return;
            }
        };

        let mut selected = Vec::new();
        for object in listing {
            let key = match SegmentKey::decode(&object.key) {
                Ok(key) => key,
                Err(e) => {
                    self.sink.report_event(Event::warning(OP, &object.key, &e));
                    continue;
                }
            };
            if self.query.overlaps(&key.range()) {
                selected.push((key, object.key));
            }
        }

        if self.order == ListingOrder::Sorted {
            selected.sort_by_key(|(key, _)| key.range());
        }

        for (key, name) in selected {
            match self.copy_object(&name, key.is_compressed()).await {
                Ok(()) => {}
                Err(Interrupt::Object(e)) => {
                    self.sink.report_event(Event::error(
                        OP,
                        &name,
                        &e,
                        "Skipping unreadable object",
                    ));
                }
                Err(Interrupt::Closed) => {
                    tracing::debug!("Range stream dropped by consumer");
                    return;
                }
            }
        }
    }

    async fn copy_object(&mut self, name: &str, compressed: bool) -> Result<(), Interrupt> {
        let mut body = self
            .store
            .download_object(&self.bucket, name)
            .await
            .map_err(|e| {
                Interrupt::Object(CoreError::DownloadOpenFailed {
                    key: name.to_string(),
                    source: Box::new(e),
                })
            })?;

        // Objects without the `.gz` suffix are copied as stored.
        let mut decoder = compressed.then(GzipStreamDecoder::new);
        let decompress_failed = |e: std::io::Error| {
            Interrupt::Object(CoreError::DecompressFailed {
                key: name.to_string(),
                source: Box::new(e.into()),
            })
        };

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                Interrupt::Object(CoreError::CopyFailed {
                    key: name.to_string(),
                    source: Box::new(e),
                })
            })?;
            let plain = match decoder.as_mut() {
                Some(decoder) => decoder.decompress(&chunk).map_err(decompress_failed)?,
                None => chunk,
            };
            self.send(plain).await?;
        }

        if let Some(decoder) = decoder {
            let tail = decoder.finish().map_err(decompress_failed)?;
            self.send(tail).await?;
        }
        Ok(())
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), Interrupt> {
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;
        self.tx.send(chunk).await.map_err(|_| Interrupt::Closed)?;
        self.copied += len;
        Ok(())
    }
}

/// Consumer end of a range read.
///
/// Usable either as a `Stream` of chunks or as an `AsyncRead`. The stream
/// ends once the worker has finished, whatever the reason.
pub struct RangeStream {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl RangeStream {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }

    /// Next chunk of content, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.next().await
    }

    /// Drain the stream into one buffer.
    pub async fn read_all(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

impl Stream for RangeStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            return Poll::Ready(Some(std::mem::take(&mut this.pending)));
        }
        this.rx.poll_recv(cx)
    }
}

impl AsyncRead for RangeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{MockBlobStore, MockFailure, MockOp};
    use crate::compression::GzipStreamEncoder;
    use segtier_core::{MemoryEventSink, SegmentId, SegmentRange};
    use tokio::io::AsyncReadExt;

    fn range(low_ms: u64, high_ms: u64) -> SegmentRange {
        SegmentRange::new(
            SegmentId::from_parts(low_ms, 0),
            SegmentId::from_parts(high_ms, 0),
        )
        .unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzipStreamEncoder::new(6);
        let mut out = encoder.compress(data).unwrap().to_vec();
        out.extend_from_slice(&encoder.finish().unwrap());
        out
    }

    fn query(from_ms: u64, to_ms: u64) -> QueryRange {
        QueryRange::new(
            segtier_core::TimeBound::from_id(SegmentId::from_parts(from_ms, 0)),
            segtier_core::TimeBound::from_id(SegmentId::from_parts(to_ms, u128::MAX)),
        )
    }

    async fn setup() -> (MockBlobStore, Arc<MemoryEventSink>, ColdRangeReader) {
        let mock = MockBlobStore::new();
        mock.ensure_bucket("cold").await.unwrap();
        let sink = Arc::new(MemoryEventSink::new());
        let config = TierConfig::default().with_bucket("cold");
        let reader = ColdRangeReader::new(Arc::new(mock.clone()), config, sink.clone());
        (mock, sink, reader)
    }

    #[tokio::test]
    async fn test_reads_only_overlapping_objects() {
        let (mock, sink, reader) = setup().await;
        mock.put_raw("cold", &SegmentKey::encode(&range(10, 20), true), gzip(b"inside"));
        mock.put_raw("cold", &SegmentKey::encode(&range(30, 40), true), gzip(b"outside"));

        let out = reader.open_range(query(15, 25)).read_all().await;
        assert_eq!(out, b"inside");
        assert!(sink.errors().is_empty());
        assert_eq!(sink.with_msg("Copied 6 bytes").len(), 1);
    }

    #[tokio::test]
    async fn test_async_read_with_small_buffer() {
        let (mock, _sink, reader) = setup().await;
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        mock.put_raw("cold", &SegmentKey::encode(&range(1, 2), true), gzip(&data));

        let mut stream = reader.open_range(query(0, 100));
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_uncompressed_objects_are_copied_raw() {
        let (mock, _sink, reader) = setup().await;
        mock.put_raw("cold", &SegmentKey::encode(&range(1, 2), false), "plain");

        let out = reader.open_range(query(0, 100)).read_all().await;
        assert_eq!(out, b"plain");
    }

    #[tokio::test]
    async fn test_malformed_key_is_warned_and_skipped() {
        let (mock, sink, reader) = setup().await;
        mock.put_raw("cold", "README", "not a segment");
        mock.put_raw("cold", &SegmentKey::encode(&range(1, 2), true), gzip(b"ok"));

        let out = reader.open_range(query(0, 100)).read_all().await;
        assert_eq!(out, b"ok");

        let warnings = sink.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].file, "README");
    }

    #[tokio::test]
    async fn test_download_failure_skips_object() {
        let (mock, sink, reader) = setup().await;
        let bad = SegmentKey::encode(&range(1, 2), true);
        mock.put_raw("cold", &bad, gzip(b"lost"));
        mock.put_raw("cold", &SegmentKey::encode(&range(3, 4), true), gzip(b"kept"));
        mock.fail_download_of(bad.clone());

        let out = reader.open_range(query(0, 100)).read_all().await;
        assert_eq!(out, b"kept");

        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, bad);
        assert!(errors[0]
            .error
            .as_deref()
            .unwrap()
            .contains("download open failed"));
    }

    #[tokio::test]
    async fn test_broken_body_skips_rest_of_object() {
        let (mock, sink, reader) = setup().await;
        let bad = SegmentKey::encode(&range(1, 2), false);
        mock.put_raw("cold", &bad, vec![b'a'; 3000]);
        mock.put_raw("cold", &SegmentKey::encode(&range(3, 4), false), "kept");
        mock.fail_download_body_of(bad.clone(), 1);

        let out = reader.open_range(query(0, 100)).read_all().await;
        let mut expected = vec![b'a'; 1024];
        expected.extend_from_slice(b"kept");
        assert_eq!(out, expected);

        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, bad);
        assert!(errors[0].error.as_deref().unwrap().contains("copy failed"));
    }

    #[tokio::test]
    async fn test_listing_failure_ends_stream() {
        let (mock, sink, reader) = setup().await;
        mock.put_raw("cold", &SegmentKey::encode(&range(1, 2), true), gzip(b"x"));
        mock.fail_next(MockOp::List, MockFailure::Transient("503"));

        let out = reader.open_range(query(0, 100)).read_all().await;
        assert!(out.is_empty());
        assert_eq!(sink.with_msg("Could not list objects").len(), 1);
        assert_eq!(sink.with_msg("Copied 0 bytes").len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_quiet_end_of_stream() {
        let (mock, sink, reader) = setup().await;
        mock.put_raw("cold", &SegmentKey::encode(&range(1, 2), true), gzip(b"x"));
        mock.stall(MockOp::Download, Duration::from_secs(5));
        let reader = reader.with_timeout(Duration::from_millis(50));

        let out = reader.open_range(query(0, 100)).read_all().await;
        assert!(out.is_empty());
        assert!(sink.errors().is_empty());
        assert_eq!(sink.with_msg("Copied 0 bytes").len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_worker() {
        let (mock, sink, reader) = setup().await;
        for i in 0..10 {
            let data = vec![i as u8; 4096];
            mock.put_raw("cold", &SegmentKey::encode(&range(i, i), false), data);
        }

        let mut stream = reader.open_range(query(0, 100));
        assert!(stream.next_chunk().await.is_some());
        drop(stream);

        // Completion is still reported once the worker notices
        for _ in 0..100 {
            if !sink.with_msg("Copied").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.with_msg("Copied").len(), 1);
        assert!(mock.count_calls(MockOp::Download, true) < 10);
    }
}
