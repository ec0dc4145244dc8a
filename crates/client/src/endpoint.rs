//! Endpoint URLs for a data server
//!
//! A server exposes three endpoints for each stream request:
//!
//! | Endpoint | Path      | Query                                           |
//! |----------|-----------|-------------------------------------------------|
//! | info     | `/info/`  | `path`, `dataset`, `slice`, `bin`               |
//! | data     | `/slice/` | info query plus `format`, `histo`               |
//! | event    | `/event/` | `path` only, scoping the shape subscription     |
//!
//! Building them does no I/O. Every query value is percent-encoded.

use crate::config::{ClientConfig, StreamRequest};
use crate::error::{Error, Result};
use url::Url;

/// The three URLs a remote dataset talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Metadata (dataset descriptor) endpoint
    pub info: Url,
    /// Long-lived frame streaming endpoint
    pub data: Url,
    /// WebSocket endpoint for shape-change events
    pub event: Url,
}

impl Endpoints {
    /// Build all three endpoints for `request` on the server in `config`
    pub fn new(config: &ClientConfig, request: &StreamRequest) -> Result<Self> {
        let base = base_url(config)?;

        let mut info = base.join("info/").map_err(invalid_url)?;
        append_dataset_query(&mut info, request);

        let mut data = base.join("slice/").map_err(invalid_url)?;
        append_dataset_query(&mut data, request);
        data.query_pairs_mut()
            .append_pair("format", request.format.as_str())
            .append_pair("histo", request.histogram.as_str());

        let mut event = base.join("event/").map_err(invalid_url)?;
        let ws_scheme = if config.secure { "wss" } else { "ws" };
        event
            .set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidConfig(format!("Cannot use scheme {}", ws_scheme)))?;
        event.query_pairs_mut().append_pair("path", &request.path);

        Ok(Self { info, data, event })
    }
}

fn base_url(config: &ClientConfig) -> Result<Url> {
    let host = config.host.trim();
    if host.is_empty() {
        return Err(Error::InvalidConfig("Server host cannot be empty".to_string()));
    }
    if host.contains("://") || host.contains(['/', '?', '#', '@']) {
        return Err(Error::InvalidConfig(format!(
            "Server host must be a bare host name, got: {}",
            host
        )));
    }
    if config.port == 0 {
        return Err(Error::InvalidConfig("Server port cannot be 0".to_string()));
    }

    let scheme = if config.secure { "https" } else { "http" };
    // IPv6 literals need brackets in a URL authority
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    Url::parse(&format!("{}://{}:{}/", scheme, host, config.port)).map_err(|e| {
        Error::InvalidConfig(format!("Invalid server address {}:{}: {}", host, config.port, e))
    })
}

fn append_dataset_query(url: &mut Url, request: &StreamRequest) {
    let mut query = url.query_pairs_mut();
    query.append_pair("path", &request.path);
    if let Some(dataset) = &request.dataset {
        query.append_pair("dataset", dataset);
    }
    if let Some(slice) = &request.slice {
        query.append_pair("slice", &slice.to_string());
    }
    if let Some(bin) = &request.bin {
        query.append_pair("bin", &bin.to_string());
    }
}

fn invalid_url(e: url::ParseError) -> Error {
    Error::InvalidConfig(format!("Invalid endpoint URL: {}", e))
}
