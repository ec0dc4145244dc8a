//! Frame streaming pipeline
//!
//! One long-lived GET to the data endpoint feeds a producer task:
//!
//! ```text
//! HTTP body ──> FrameParser ──> FrameDecoder ──> FrameCache ──> take()
//!  (chunks)     (encoded frames) (decoded frames) (bounded)     (consumer)
//! ```
//!
//! The cache never blocks the producer. When it is full the newly decoded
//! frame is discarded and counted as dropped, so frames already waiting for
//! the consumer are kept (drop-newest). Frames that fail to decode are counted
//! the same way.
//!
//! Cancellation is cooperative: [`FramePipeline::set_finished`] is observed by
//! the producer at every iteration boundary, during the pacing sleep and while
//! it waits for the next body chunk.

use crate::codec::{FrameDecoder, FrameParser};
use crate::config::StreamRequest;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Bounded FIFO of decoded frames shared by the producer and the consumer
///
/// `offer` never blocks; `take` waits until a frame is available or the
/// cache is finished and empty.
pub struct FrameCache<F> {
    frames: Mutex<VecDeque<F>>,
    capacity: usize,
    frame_ready: Notify,
    finished: AtomicBool,
    cancel: CancellationToken,
    received: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl<F> FrameCache<F> {
    /// Create an empty cache; a capacity of 0 is raised to 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            frame_ready: Notify::new(),
            finished: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            received: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a frame; returns false and counts a drop when the cache is full
    pub fn offer(&self, frame: F) -> bool {
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.capacity {
                drop(frames);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            frames.push_back(frame);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.frame_ready.notify_one();
        true
    }

    /// Wait for the next frame
    ///
    /// Returns `None` once the cache is finished and empty. Frames cached
    /// before the finish are still handed out first.
    pub async fn take(&self) -> Option<F> {
        loop {
            if let Some(frame) = self.try_take() {
                return Some(frame);
            }
            if self.is_finished() {
                return None;
            }
            tokio::select! {
                _ = self.frame_ready.notified() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Next frame if one is cached, without waiting
    pub fn try_take(&self) -> Option<F> {
        self.frames.lock().pop_front()
    }

    /// Mark the cache finished; idempotent and never reverts
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            debug!("Frame cache finished with {} frames waiting", self.len());
        }
        self.cancel.cancel();
    }

    /// Whether the stream has ended or was asked to stop
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Resolves once the cache is finished
    pub async fn finished(&self) {
        self.cancel.cancelled().await
    }

    /// Count a frame dropped before it reached the cache
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Frames discarded because the cache was full or decoding failed
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Encoded frames read from the connection
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Frames accepted into the cache
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames currently waiting for the consumer
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether no frame is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum frames held at once
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<F> std::fmt::Debug for FrameCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("finished", &self.is_finished())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

/// Pulls encoded frames out of a response body
struct FrameReader {
    parser: FrameParser,
    body: BoxStream<'static, Result<Bytes>>,
    eof: bool,
}

impl FrameReader {
    async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.parser.next_frame()? {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(self.parser.finish());
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.eof = true,
            }
        }
    }
}

/// A running frame stream
///
/// Dropping the handle requests the producer to stop.
pub struct FramePipeline<F> {
    cache: Arc<FrameCache<F>>,
    producer: Option<JoinHandle<()>>,
}

impl<F: Send + 'static> FramePipeline<F> {
    /// Open the streaming request and start the producer
    ///
    /// `client` must not carry a total request timeout: the response body is
    /// expected to stay open for as long as frames are wanted.
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - request failed or the server answered non-2xx
    /// * `Error::Protocol` - a motion format response without multipart boundary
    pub async fn connect<D>(
        client: &reqwest::Client,
        data_url: &Url,
        request: &StreamRequest,
        decoder: Arc<D>,
    ) -> Result<Self>
    where
        D: FrameDecoder<Frame = F>,
    {
        request.validate()?;
        info!("Opening frame stream {}", data_url);

        let response = client
            .get(data_url.clone())
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Stream request to {} failed: {}", data_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Connection(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                error_text.trim()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let parser = FrameParser::for_response(request.format, content_type.as_deref())?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Connection(format!("Frame stream read failed: {}", e))));

        Ok(Self::from_body(body, parser, request, decoder))
    }

    /// Start the producer over an already-open body
    pub fn from_body<D, S>(body: S, parser: FrameParser, request: &StreamRequest, decoder: Arc<D>) -> Self
    where
        D: FrameDecoder<Frame = F>,
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        let cache = Arc::new(FrameCache::new(request.cache_capacity));
        let reader = FrameReader {
            parser,
            body: body.boxed(),
            eof: false,
        };
        let producer = tokio::spawn(produce(
            reader,
            decoder,
            Arc::clone(&cache),
            request.poll_interval,
            request.max_frames,
        ));

        Self {
            cache,
            producer: Some(producer),
        }
    }

    /// Wait for the next frame; `None` is end of stream
    ///
    /// End of stream looks the same whether the server closed the stream or
    /// [`set_finished`](Self::set_finished) was called.
    pub async fn take(&self) -> Option<F> {
        self.cache.take().await
    }

    /// Next frame if one is cached, without waiting
    pub fn try_take(&self) -> Option<F> {
        self.cache.try_take()
    }

    /// Consume the pipeline as a stream of frames
    pub fn into_stream(self) -> impl Stream<Item = F> + Send {
        futures::stream::unfold(self, |pipeline| async move {
            let frame = pipeline.take().await?;
            Some((frame, pipeline))
        })
    }

    /// Wait until the producer task has exited
    pub async fn stopped(&mut self) {
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.await {
                if e.is_panic() {
                    error!("Frame producer panicked: {}", e);
                }
            }
        }
    }
}

impl<F> FramePipeline<F> {
    /// Whether the stream has ended or was asked to stop
    pub fn is_finished(&self) -> bool {
        self.cache.is_finished()
    }

    /// Ask the producer to stop and close the connection
    ///
    /// Idempotent. Callers abandoning consumption after an unrelated failure
    /// should call this before propagating it.
    pub fn set_finished(&self) {
        self.cache.finish();
    }

    /// Frames discarded because the cache was full or decoding failed
    pub fn dropped_count(&self) -> u64 {
        self.cache.dropped_count()
    }

    /// Encoded frames read from the connection
    pub fn received_count(&self) -> u64 {
        self.cache.received_count()
    }

    /// Frames currently waiting for the consumer
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Shared cache, for observers that outlive this handle
    pub fn cache(&self) -> &Arc<FrameCache<F>> {
        &self.cache
    }
}

impl<F> Drop for FramePipeline<F> {
    fn drop(&mut self) {
        self.cache.finish();
    }
}

impl<F> std::fmt::Debug for FramePipeline<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePipeline")
            .field("cache", &self.cache)
            .field("received", &self.received_count())
            .finish()
    }
}

async fn produce<D: FrameDecoder>(
    mut reader: FrameReader,
    decoder: Arc<D>,
    cache: Arc<FrameCache<D::Frame>>,
    poll_interval: Duration,
    max_frames: Option<u64>,
) {
    loop {
        if cache.is_finished() {
            debug!("Frame producer stopping on request");
            break;
        }

        let next = tokio::select! {
            biased;
            _ = cache.finished() => break,
            next = reader.next_frame() => next,
        };
        let raw = match next {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("Frame stream ended after {} frames", cache.received_count());
                break;
            }
            Err(e) => {
                error!("Frame stream failed: {}", e);
                break;
            }
        };

        let seq = cache.record_received();
        match decoder.decode(raw) {
            Ok(frame) => {
                if !cache.offer(frame) {
                    debug!(
                        "Frame cache full ({}), dropped frame {}",
                        cache.capacity(),
                        seq
                    );
                }
            }
            Err(e) => {
                cache.record_dropped();
                warn!("Dropping frame {}: {}", seq, e);
            }
        }

        if matches!(max_frames, Some(max) if cache.accepted_count() >= max) {
            info!("Frame limit of {} reached", cache.accepted_count());
            break;
        }

        tokio::select! {
            biased;
            _ = cache.finished() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    cache.finish();
    // Dropping the reader closes the connection
    drop(reader);
    debug!(
        "Frame producer exited: received={} dropped={}",
        cache.received_count(),
        cache.dropped_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FnDecoder, RawFrameDecoder};
    use crate::error::DecodeError;

    fn multipart_body(frames: &[&str]) -> Vec<Result<Bytes>> {
        frames
            .iter()
            .map(|payload| {
                Ok(Bytes::from(format!(
                    "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n{}\r\n",
                    payload.len(),
                    payload
                )))
            })
            .collect()
    }

    fn request(capacity: usize) -> StreamRequest {
        StreamRequest::builder("RANDOM:512x512")
            .cache_capacity(capacity)
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_cache_drops_newest_when_full() {
        let cache = FrameCache::new(3);
        let accepted: Vec<bool> = (1..=5).map(|i| cache.offer(i)).collect();
        assert_eq!(accepted, vec![true, true, true, false, false]);
        assert_eq!(cache.dropped_count(), 2);
        assert_eq!(cache.len(), 3);

        // Previously cached frames survive the overflow, in order
        assert_eq!(cache.try_take(), Some(1));
        assert_eq!(cache.try_take(), Some(2));
        assert_eq!(cache.try_take(), Some(3));
        assert_eq!(cache.try_take(), None);
    }

    #[test]
    fn test_drop_count_for_any_overflow() {
        for (arrivals, capacity) in [(11usize, 10usize), (100, 1), (37, 5)] {
            let cache = FrameCache::new(capacity);
            for i in 0..arrivals {
                cache.offer(i);
            }
            assert_eq!(cache.dropped_count(), (arrivals - capacity) as u64);
            let held: Vec<usize> = std::iter::from_fn(|| cache.try_take()).collect();
            assert_eq!(held, (0..capacity).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_take_after_finish_returns_immediately() {
        let cache = FrameCache::<u32>::new(2);
        cache.offer(7);
        cache.finish();
        cache.finish();
        assert!(cache.is_finished());

        // Waiting frames are still delivered, then end of stream
        assert_eq!(cache.take().await, Some(7));
        let end = tokio::time::timeout(Duration::from_millis(100), cache.take()).await;
        assert_eq!(end.unwrap(), None);
    }

    #[test]
    fn test_take_pending_until_offer() {
        let cache = FrameCache::new(1);
        let mut take = tokio_test::task::spawn(cache.take());
        tokio_test::assert_pending!(take.poll());

        cache.offer(5u8);
        assert!(take.is_woken());
        assert_eq!(tokio_test::assert_ready!(take.poll()), Some(5));
    }

    #[tokio::test]
    async fn test_take_waits_for_offer() {
        let cache = Arc::new(FrameCache::new(2));
        let producer = Arc::clone(&cache);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.offer("late");
        });
        assert_eq!(cache.take().await, Some("late"));
    }

    #[tokio::test]
    async fn test_finish_wakes_waiting_consumer() {
        let cache = Arc::new(FrameCache::<u8>::new(2));
        let waiter = Arc::clone(&cache);
        let handle = tokio::spawn(async move { waiter.take().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.finish();
        let taken = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_eq!(taken.unwrap().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_delivers_all_frames_then_ends() {
        let body = futures::stream::iter(multipart_body(&["a", "b", "c", "d", "e"]));
        let pipeline = FramePipeline::from_body(
            body,
            FrameParser::multipart("frame"),
            &request(10),
            Arc::new(RawFrameDecoder),
        );

        let mut frames = Vec::new();
        while let Some(frame) = pipeline.take().await {
            frames.push(frame);
        }
        assert_eq!(frames, vec!["a", "b", "c", "d", "e"]);
        assert!(pipeline.is_finished());
        assert_eq!(pipeline.dropped_count(), 0);
        assert_eq!(pipeline.received_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failures_are_counted_not_fatal() {
        let body = futures::stream::iter(multipart_body(&["ok1", "bad", "ok2", "bad", "ok3"]));
        let decoder = FnDecoder(|raw: Bytes| {
            if raw.as_ref() == b"bad" {
                Err(DecodeError::new("corrupt"))
            } else {
                Ok(raw)
            }
        });
        let pipeline = FramePipeline::from_body(
            body,
            FrameParser::multipart("frame"),
            &request(10),
            Arc::new(decoder),
        );

        let frames: Vec<Bytes> = pipeline.into_stream().collect().await;
        assert_eq!(frames, vec!["ok1", "ok2", "ok3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconsumed_stream_drops_newest() {
        let payloads: Vec<String> = (0..50).map(|i| format!("f{}", i)).collect();
        let refs: Vec<&str> = payloads.iter().map(String::as_str).collect();
        let body = futures::stream::iter(multipart_body(&refs));
        let mut pipeline = FramePipeline::from_body(
            body,
            FrameParser::multipart("frame"),
            &request(4),
            Arc::new(RawFrameDecoder),
        );

        pipeline.stopped().await;
        assert!(pipeline.is_finished());
        assert_eq!(pipeline.received_count(), 50);
        assert_eq!(pipeline.dropped_count(), 46);

        let held: Vec<Bytes> = std::iter::from_fn(|| pipeline.try_take()).collect();
        assert_eq!(held, vec!["f0", "f1", "f2", "f3"]);
    }

    #[tokio::test]
    async fn test_set_finished_stops_stalled_read() {
        let body = futures::stream::pending::<Result<Bytes>>();
        let mut pipeline = FramePipeline::from_body(
            body,
            FrameParser::multipart("frame"),
            &request(2),
            Arc::new(RawFrameDecoder),
        );

        pipeline.set_finished();
        tokio::time::timeout(Duration::from_secs(1), pipeline.stopped())
            .await
            .expect("producer should observe the finish request");
        assert_eq!(pipeline.take().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_frames_finishes_early() {
        let body = futures::stream::iter(multipart_body(&["1", "2", "3", "4", "5"]));
        let request = StreamRequest::builder("RANDOM:8x8")
            .max_frames(2)
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let pipeline = FramePipeline::from_body(
            body,
            FrameParser::multipart("frame"),
            &request,
            Arc::new(RawFrameDecoder),
        );

        let frames: Vec<Bytes> = pipeline.into_stream().collect().await;
        assert_eq!(frames, vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_ends_stream() {
        let mut chunks = multipart_body(&["first"]);
        chunks.push(Err(Error::Connection("reset by peer".to_string())));
        chunks.extend(multipart_body(&["never"]));
        let pipeline = FramePipeline::from_body(
            futures::stream::iter(chunks),
            FrameParser::multipart("frame"),
            &request(4),
            Arc::new(RawFrameDecoder),
        );

        let frames: Vec<Bytes> = pipeline.into_stream().collect().await;
        assert_eq!(frames, vec!["first"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_body_format_yields_one_frame() {
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from("\u{89}PN")), Ok(Bytes::from("G..."))];
        let pipeline = FramePipeline::from_body(
            futures::stream::iter(chunks),
            FrameParser::whole_body(),
            &request(4),
            Arc::new(RawFrameDecoder),
        );
        let frames: Vec<Bytes> = pipeline.into_stream().collect().await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].ends_with(b"G..."));
    }
}
