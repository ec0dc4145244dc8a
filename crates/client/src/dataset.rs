//! Remote array adapter
//!
//! [`RemoteDataset`] composes the pieces of a connection to one dataset:
//! endpoints, the metadata fetch, the shape-event channel and the frame
//! pipeline. It reads like a local N-dimensional array through [`Array`] while
//! frames stream in the background.
//!
//! ```no_run
//! use remotedata_client::{Array, ClientConfig, RawFrameDecoder, RemoteDataset, StreamRequest};
//!
//! # async fn run() -> remotedata_client::Result<()> {
//! let config = ClientConfig::new("localhost", 8080);
//! let request = StreamRequest::builder("RANDOM:512x512").build()?;
//! let mut dataset = RemoteDataset::new(config, request, RawFrameDecoder)?;
//!
//! dataset.connect().await?;
//! println!("{} {:?}", dataset.name(), dataset.shape());
//! while let Some(frame) = dataset.take().await? {
//!     println!("frame of {} bytes", frame.len());
//! }
//! dataset.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::codec::FrameDecoder;
use crate::config::{ClientConfig, StreamRequest};
use crate::descriptor::{DType, DatasetDescriptor};
use crate::endpoint::Endpoints;
use crate::error::{Error, Result};
use crate::events::{EventChannel, ShapeListener, ShapeTracker};
use crate::metadata::MetadataFetcher;
use crate::pipeline::FramePipeline;
use crate::slice::SliceSpec;
use std::sync::Arc;
use tracing::{info, warn};

/// Read-only view of an N-dimensional array's metadata
pub trait Array {
    /// Dataset name
    fn name(&self) -> String;

    /// Current shape
    fn shape(&self) -> Vec<i64>;

    /// Element type
    fn dtype(&self) -> DType;

    /// Bytes per element
    fn item_size(&self) -> usize;

    /// Largest shape the array may grow to
    fn max_shape(&self) -> Option<Vec<i64>>;

    /// Storage chunk shape
    fn chunking(&self) -> Option<Vec<i64>>;

    /// Number of dimensions
    fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Total element count, or [`TOO_LARGE`](crate::descriptor::TOO_LARGE)
    fn size(&self) -> i64 {
        crate::descriptor::element_count(&self.shape())
    }
}

impl Array for DatasetDescriptor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn shape(&self) -> Vec<i64> {
        self.shape.clone()
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn item_size(&self) -> usize {
        self.item_size
    }

    fn max_shape(&self) -> Option<Vec<i64>> {
        self.max_shape.clone()
    }

    fn chunking(&self) -> Option<Vec<i64>> {
        self.chunking.clone()
    }

    fn rank(&self) -> usize {
        self.shape.len()
    }

    fn size(&self) -> i64 {
        self.total_element_count
    }
}

/// A remote dataset streamed as decoded frames
pub struct RemoteDataset<D: FrameDecoder> {
    request: StreamRequest,
    endpoints: Endpoints,
    fetcher: MetadataFetcher,
    stream_client: reqwest::Client,
    decoder: Arc<D>,
    shapes: Arc<ShapeTracker>,
    events: Option<EventChannel>,
    pipeline: Option<FramePipeline<D::Frame>>,
}

impl<D: FrameDecoder> RemoteDataset<D> {
    /// Prepare a dataset; no I/O happens until [`connect`](Self::connect)
    ///
    /// Until connected the dataset reports a placeholder descriptor named
    /// `unknown` with shape `[1]`.
    pub fn new(config: ClientConfig, request: StreamRequest, decoder: D) -> Result<Self> {
        request.validate()?;
        let endpoints = Endpoints::new(&config, &request)?;
        let fetcher = MetadataFetcher::new(&config)?;
        // The frame body stays open indefinitely, so only connecting is bounded
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            request,
            endpoints,
            fetcher,
            stream_client,
            decoder: Arc::new(decoder),
            shapes: Arc::new(ShapeTracker::new(DatasetDescriptor::placeholder())),
            events: None,
            pipeline: None,
        })
    }

    /// Fetch metadata, then open the event channel and the frame stream
    ///
    /// Nothing streams if the metadata fetch fails. If either channel fails
    /// the other one is shut down before the error is returned. Connecting a
    /// connected dataset reconnects it.
    pub async fn connect(&mut self) -> Result<()> {
        if self.events.is_some() || self.pipeline.is_some() {
            warn!("Dataset {} was connected before, reconnecting", self.request.path);
            self.disconnect().await?;
            self.pipeline = None;
        }

        let descriptor = self.fetcher.fetch_descriptor(&self.endpoints.info).await?;
        self.shapes.reset(descriptor);

        let (events, pipeline) = tokio::join!(
            EventChannel::connect(&self.endpoints.event, &self.request.path, Arc::clone(&self.shapes)),
            FramePipeline::connect(
                &self.stream_client,
                &self.endpoints.data,
                &self.request,
                Arc::clone(&self.decoder),
            ),
        );

        match (events, pipeline) {
            (Ok(events), Ok(pipeline)) => {
                self.events = Some(events);
                self.pipeline = Some(pipeline);
                info!("Connected to dataset {}", self.request.path);
                Ok(())
            }
            (Err(e), pipeline) => {
                if let Ok(pipeline) = pipeline {
                    pipeline.set_finished();
                }
                Err(e)
            }
            (Ok(mut events), Err(e)) => {
                events.close().await?;
                Err(e)
            }
        }
    }

    /// Close the event channel and stop the frame stream
    ///
    /// Frames already cached can still be taken; after them `take` reports
    /// end of stream.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_finished();
        }
        if let Some(mut events) = self.events.take() {
            events.close().await?;
        }
        info!("Disconnected from dataset {}", self.request.path);
        Ok(())
    }

    /// Whether `connect` succeeded and the stream has not been stopped
    pub fn is_connected(&self) -> bool {
        self.events.is_some() && self.pipeline.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Whether the shape-event channel is still open
    pub fn is_event_channel_open(&self) -> bool {
        self.events.as_ref().is_some_and(EventChannel::is_open)
    }

    /// Wait for the next decoded frame; `Ok(None)` is end of stream
    ///
    /// # Errors
    ///
    /// * `Error::NotConnected` - `connect` has not succeeded yet
    pub async fn take(&self) -> Result<Option<D::Frame>> {
        Ok(self.pipeline()?.take().await)
    }

    /// Next frame if one is cached, without waiting
    pub fn try_take(&self) -> Result<Option<D::Frame>> {
        Ok(self.pipeline()?.try_take())
    }

    /// Whether the frame stream has ended or was asked to stop
    pub fn is_finished(&self) -> bool {
        self.pipeline.as_ref().is_some_and(FramePipeline::is_finished)
    }

    /// Ask the frame stream to stop; the event channel stays open
    pub fn set_finished(&self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_finished();
        }
    }

    /// Frames discarded because the consumer fell behind or decoding failed
    pub fn dropped_count(&self) -> u64 {
        self.pipeline.as_ref().map_or(0, FramePipeline::dropped_count)
    }

    /// Encoded frames received so far
    pub fn received_count(&self) -> u64 {
        self.pipeline.as_ref().map_or(0, FramePipeline::received_count)
    }

    /// Turn immediate application of shape events on or off
    pub fn set_dynamic_shape(&self, dynamic: bool) {
        self.shapes.set_dynamic_shape(dynamic);
    }

    /// Whether shape events are applied immediately
    pub fn is_dynamic_shape(&self) -> bool {
        self.shapes.is_dynamic_shape()
    }

    /// Newest shape staged while dynamic shape is off
    pub fn pending_shape(&self) -> Option<Vec<i64>> {
        self.shapes.pending_shape()
    }

    /// Register a shape listener
    pub fn add_shape_listener(&self, listener: Arc<dyn ShapeListener>) {
        self.shapes.add_listener(listener);
    }

    /// Remove a shape listener; returns whether it was registered
    pub fn remove_shape_listener(&self, listener: &Arc<dyn ShapeListener>) -> bool {
        self.shapes.remove_listener(listener)
    }

    /// Snapshot of the descriptor
    pub fn descriptor(&self) -> DatasetDescriptor {
        self.shapes.descriptor()
    }

    /// Shape of `slice` applied to the current shape
    pub fn slice_shape(&self, slice: &SliceSpec) -> Result<Vec<i64>> {
        self.shapes.with_descriptor(|descriptor| slice.resolve(&descriptor.shape))
    }

    /// Stream request this dataset was created with
    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    /// Server endpoints
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn pipeline(&self) -> Result<&FramePipeline<D::Frame>> {
        self.pipeline.as_ref().ok_or(Error::NotConnected)
    }
}

impl<D: FrameDecoder> Array for RemoteDataset<D> {
    fn name(&self) -> String {
        self.shapes.with_descriptor(|d| d.name.clone())
    }

    fn shape(&self) -> Vec<i64> {
        self.shapes.shape()
    }

    fn dtype(&self) -> DType {
        self.shapes.with_descriptor(|d| d.dtype)
    }

    fn item_size(&self) -> usize {
        self.shapes.with_descriptor(|d| d.item_size)
    }

    fn max_shape(&self) -> Option<Vec<i64>> {
        self.shapes.with_descriptor(|d| d.max_shape.clone())
    }

    fn chunking(&self) -> Option<Vec<i64>> {
        self.shapes.with_descriptor(|d| d.chunking.clone())
    }

    fn rank(&self) -> usize {
        self.shapes.with_descriptor(DatasetDescriptor::rank)
    }

    fn size(&self) -> i64 {
        self.shapes.with_descriptor(|d| d.total_element_count)
    }
}

impl<D: FrameDecoder> std::fmt::Debug for RemoteDataset<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDataset")
            .field("path", &self.request.path)
            .field("endpoints", &self.endpoints)
            .field("shapes", &self.shapes)
            .field("events", &self.events)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawFrameDecoder;

    fn dataset() -> RemoteDataset<RawFrameDecoder> {
        let config = ClientConfig::new("127.0.0.1", 9)
            .with_connect_timeout(std::time::Duration::from_millis(500));
        let request = StreamRequest::builder("RANDOM:512x512").build().unwrap();
        RemoteDataset::new(config, request, RawFrameDecoder).unwrap()
    }

    #[tokio::test]
    async fn test_unconnected_dataset() {
        let dataset = dataset();
        assert_eq!(dataset.name(), "unknown");
        assert_eq!(dataset.shape(), vec![1]);
        assert_eq!(dataset.max_shape(), Some(vec![-1]));
        assert_eq!(dataset.rank(), 1);
        assert!(!dataset.is_connected());
        assert!(!dataset.is_finished());
        assert_eq!(dataset.dropped_count(), 0);
        assert!(matches!(dataset.take().await, Err(Error::NotConnected)));
        assert!(matches!(dataset.try_take(), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let mut dataset = dataset();
        let err = dataset.connect().await.unwrap_err();
        assert!(err.is_connection());
        assert!(!dataset.is_connected());
        assert!(matches!(dataset.take().await, Err(Error::NotConnected)));
    }

    #[test]
    fn test_invalid_config_rejected_early() {
        let request = StreamRequest::builder("a.h5").build().unwrap();
        let result = RemoteDataset::new(ClientConfig::new("", 8080), request, RawFrameDecoder);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_descriptor_as_array() {
        let descriptor =
            DatasetDescriptor::parse("image\n[10, 4, 4]\n5\n4\nnull\n[1, 4, 4]").unwrap();
        assert_eq!(Array::name(&descriptor), "image");
        assert_eq!(Array::rank(&descriptor), 3);
        assert_eq!(Array::size(&descriptor), 160);
        assert_eq!(Array::dtype(&descriptor), DType::Float32);
        assert_eq!(Array::chunking(&descriptor), Some(vec![1, 4, 4]));
    }

    #[test]
    fn test_slice_shape_uses_current_shape() {
        let dataset = dataset();
        let slice: SliceSpec = "[:1]".parse().unwrap();
        assert_eq!(dataset.slice_shape(&slice).unwrap(), vec![1]);
    }
}
