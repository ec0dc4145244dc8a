//! Configuration types for connecting to a data server
//!
//! [`ClientConfig`] says where the server is and how patient to be with it.
//! [`StreamRequest`] says what to stream: which file and dataset, how to slice
//! and bin it, and how the client paces and buffers the resulting frames.

use crate::error::{Error, Result};
use crate::slice::{BinSpec, SliceSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default pause between frame reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default number of decoded frames held for the consumer
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Connection parameters for a data server
///
/// # Example
///
/// ```
/// use remotedata_client::ClientConfig;
///
/// let config = ClientConfig::new("localhost", 8080);
/// assert_eq!(config.port, 8080);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or IP address, without scheme
    pub host: String,

    /// Server port
    pub port: u16,

    /// Use https/wss instead of http/ws
    #[serde(default)]
    pub secure: bool,

    /// TCP connect timeout for every endpoint
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Total timeout for the metadata request. Never applied to the frame
    /// stream, which is expected to stay open indefinitely.
    #[serde(default = "default_request_timeout", with = "duration_millis")]
    pub request_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            secure: false,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    /// Create a config for `host:port` with default timeouts
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Use TLS for every endpoint
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the metadata request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Parse a config from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidConfig(format!("Invalid TOML config: {}", e)))
    }

    /// Load a config from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// Encoding of the frames sent on the streaming endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Format {
    /// A single JPEG image
    Jpg,
    /// A single PNG image
    Png,
    /// Motion JPEG: a multipart stream of JPEG images
    #[default]
    Mjpg,
    /// Motion PNG: a multipart stream of PNG images
    Mpng,
}

impl Format {
    /// Wire name of the format
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Jpg => "JPG",
            Format::Png => "PNG",
            Format::Mjpg => "MJPG",
            Format::Mpng => "MPNG",
        }
    }

    /// Whether the response body carries many frames
    pub fn is_streaming(&self) -> bool {
        matches!(self, Format::Mjpg | Format::Mpng)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JPG" | "JPEG" => Ok(Format::Jpg),
            "PNG" => Ok(Format::Png),
            "MJPG" | "MJPEG" => Ok(Format::Mjpg),
            "MPNG" => Ok(Format::Mpng),
            other => Err(Error::InvalidConfig(format!("Unknown format '{}'", other))),
        }
    }
}

/// How the server scales frame contrast
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum HistogramMethod {
    #[default]
    Mean,
    Median,
    /// Any other method name the server understands, sent verbatim
    Other(String),
}

impl HistogramMethod {
    /// Wire name of the method
    pub fn as_str(&self) -> &str {
        match self {
            HistogramMethod::Mean => "MEAN",
            HistogramMethod::Median => "MEDIAN",
            HistogramMethod::Other(name) => name,
        }
    }
}

impl fmt::Display for HistogramMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for HistogramMethod {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEAN" => HistogramMethod::Mean,
            "MEDIAN" => HistogramMethod::Median,
            other => HistogramMethod::Other(other.to_string()),
        }
    }
}

impl From<String> for HistogramMethod {
    fn from(s: String) -> Self {
        HistogramMethod::from(s.as_str())
    }
}

impl From<HistogramMethod> for String {
    fn from(method: HistogramMethod) -> Self {
        method.as_str().to_string()
    }
}

/// What to stream from the server and how to buffer it
///
/// Immutable once the pipeline starts; build it with [`StreamRequest::builder`].
///
/// # Example
///
/// ```
/// use remotedata_client::{Format, StreamRequest};
///
/// let request = StreamRequest::builder("RANDOM:512x512")
///     .format(Format::Mjpg)
///     .histogram("MEAN")
///     .cache_capacity(10)
///     .build()
///     .unwrap();
/// assert_eq!(request.cache_capacity, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// File path (or generator such as `RANDOM:512x512`) on the server
    pub path: String,

    /// Dataset inside the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,

    /// Sub-range of the dataset to send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice: Option<SliceSpec>,

    /// Block reduction applied before sending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<BinSpec>,

    /// Frame encoding
    #[serde(default)]
    pub format: Format,

    /// Contrast scaling method
    #[serde(default)]
    pub histogram: HistogramMethod,

    /// Pause between frame reads
    #[serde(default = "default_poll_interval", with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum decoded frames waiting for the consumer
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Finish the stream after this many frames were accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frames: Option<u64>,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

impl StreamRequest {
    /// Start building a request for `path`
    pub fn builder(path: impl Into<String>) -> StreamRequestBuilder {
        StreamRequestBuilder {
            request: StreamRequest {
                path: path.into(),
                dataset: None,
                slice: None,
                bin: None,
                format: Format::default(),
                histogram: HistogramMethod::default(),
                poll_interval: DEFAULT_POLL_INTERVAL,
                cache_capacity: DEFAULT_CACHE_CAPACITY,
                max_frames: None,
            },
        }
    }

    /// Check the invariants a deserialized request may have skipped
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::InvalidConfig("Stream path cannot be empty".to_string()));
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidConfig(
                "Cache capacity must be at least 1".to_string(),
            ));
        }
        if self.max_frames == Some(0) {
            return Err(Error::InvalidConfig(
                "max_frames must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`StreamRequest`]
#[derive(Debug, Clone)]
pub struct StreamRequestBuilder {
    request: StreamRequest,
}

impl StreamRequestBuilder {
    /// Dataset name inside the file
    pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
        self.request.dataset = Some(dataset.into());
        self
    }

    /// Slice to send
    pub fn slice(mut self, slice: SliceSpec) -> Self {
        self.request.slice = Some(slice);
        self
    }

    /// Bin reduction to apply
    pub fn bin(mut self, bin: BinSpec) -> Self {
        self.request.bin = Some(bin);
        self
    }

    /// Frame encoding
    pub fn format(mut self, format: Format) -> Self {
        self.request.format = format;
        self
    }

    /// Contrast scaling method
    pub fn histogram(mut self, histogram: impl Into<HistogramMethod>) -> Self {
        self.request.histogram = histogram.into();
        self
    }

    /// Pause between frame reads
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.request.poll_interval = interval;
        self
    }

    /// Maximum frames waiting for the consumer
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.request.cache_capacity = capacity;
        self
    }

    /// Finish after this many frames were accepted
    pub fn max_frames(mut self, frames: u64) -> Self {
        self.request.max_frames = Some(frames);
        self
    }

    /// Validate and build the request
    pub fn build(self) -> Result<StreamRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let request = StreamRequest::builder("RANDOM:512x512").build().unwrap();
        assert_eq!(request.format, Format::Mjpg);
        assert_eq!(request.histogram, HistogramMethod::Mean);
        assert_eq!(request.poll_interval, Duration::from_millis(100));
        assert_eq!(request.cache_capacity, 10);
        assert!(request.dataset.is_none());
        assert!(request.max_frames.is_none());
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(StreamRequest::builder("").build().is_err());
        assert!(StreamRequest::builder("a.h5").cache_capacity(0).build().is_err());
        assert!(StreamRequest::builder("a.h5").max_frames(0).build().is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("mjpg".parse::<Format>().unwrap(), Format::Mjpg);
        assert_eq!("JPEG".parse::<Format>().unwrap(), Format::Jpg);
        assert!("GIF".parse::<Format>().is_err());
        assert!(Format::Mpng.is_streaming());
        assert!(!Format::Png.is_streaming());
    }

    #[test]
    fn test_histogram_passthrough() {
        assert_eq!(HistogramMethod::from("median"), HistogramMethod::Median);
        let other = HistogramMethod::from("OUTLIER_VALUES");
        assert_eq!(other.as_str(), "OUTLIER_VALUES");
    }

    #[test]
    fn test_request_deserialization() {
        let json = r#"{
            "path": "c:/Work/results/TomographyDataSet.hdf5",
            "dataset": "/entry/exchange/data",
            "slice": "[700,:1024,:1024]",
            "bin": "MEAN:2x2",
            "format": "MJPG",
            "histogram": "MEDIAN",
            "cache_capacity": 25
        }"#;
        let request: StreamRequest = serde_json::from_str(json).unwrap();
        request.validate().unwrap();
        assert_eq!(request.histogram, HistogramMethod::Median);
        assert_eq!(request.cache_capacity, 25);
        assert_eq!(request.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(request.slice.unwrap().to_string(), "[700,:1024,:1024]");
    }

    #[test]
    fn test_client_config_from_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            host = "dataserver.example.org"
            port = 8690
            connect_timeout = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.host, "dataserver.example.org");
        assert_eq!(config.port, 8690);
        assert!(!config.secure);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_client_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "host = \"beamline\"\nport = 9000\nsecure = true\n").unwrap();

        let config = ClientConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.host, "beamline");
        assert!(config.secure);

        assert!(ClientConfig::from_toml_file(dir.path().join("missing.toml")).is_err());
        assert!(ClientConfig::from_toml_str("port = \"x\"").is_err());
    }
}
