//! Remote Data Client - streaming access to remote N-dimensional datasets
//!
//! A data server publishes large arrays (image stacks, tomography volumes,
//! detector output) through three endpoints:
//!
//! - `info/` answers with the dataset descriptor: name, shape, element type
//! - `slice/` streams the selected slice as a continuous sequence of frames
//! - `event/` is a WebSocket pushing shape changes while a dataset grows
//!
//! [`RemoteDataset`] ties them together: it fetches metadata, keeps the shape
//! current from events and buffers decoded frames in a bounded cache that the
//! consumer drains with [`RemoteDataset::take`].
//!
//! # Example
//!
//! ```no_run
//! use remotedata_client::{ClientConfig, Format, RawFrameDecoder, RemoteDataset, StreamRequest};
//!
//! #[tokio::main]
//! async fn main() -> remotedata_client::Result<()> {
//!     remotedata_client::init_logging();
//!
//!     let config = ClientConfig::new("localhost", 8080);
//!     let request = StreamRequest::builder("RANDOM:512x512")
//!         .format(Format::Mjpg)
//!         .cache_capacity(10)
//!         .build()?;
//!
//!     let mut dataset = RemoteDataset::new(config, request, RawFrameDecoder)?;
//!     dataset.connect().await?;
//!     if let Some(frame) = dataset.take().await? {
//!         println!("first frame: {} bytes", frame.len());
//!     }
//!     dataset.disconnect().await
//! }
//! ```

#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod dataset;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod metadata;
pub mod pipeline;
pub mod slice;

pub use codec::{FnDecoder, FrameDecoder, FrameParser, RawFrameDecoder, DEFAULT_MAX_PART_BYTES};
#[cfg(feature = "image")]
pub use codec::ImageFrameDecoder;
pub use config::{
    ClientConfig, Format, HistogramMethod, StreamRequest, StreamRequestBuilder,
    DEFAULT_CACHE_CAPACITY, DEFAULT_POLL_INTERVAL,
};
pub use dataset::{Array, RemoteDataset};
pub use descriptor::{DType, DatasetDescriptor, TOO_LARGE, UNBOUNDED};
pub use endpoint::Endpoints;
pub use error::{DecodeError, Error, Result};
pub use events::{EventChannel, ShapeEvent, ShapeListener, ShapeTracker};
pub use metadata::MetadataFetcher;
pub use pipeline::{FrameCache, FramePipeline};
pub use slice::{BinMethod, BinSpec, DimSelection, SliceSpec};

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info`
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
