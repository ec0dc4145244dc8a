//! Frame framing and decoding
//!
//! The streaming endpoint sends either one image per response (`JPG`, `PNG`)
//! or a `multipart/x-mixed-replace` body with one image per part (`MJPG`,
//! `MPNG`). [`FrameParser`] cuts the raw body into encoded frames; a
//! [`FrameDecoder`] supplied by the caller turns each one into whatever the
//! consumer renders.

use crate::config::Format;
use crate::error::{DecodeError, Error, Result};
use bytes::{Buf, Bytes, BytesMut};

/// Largest part header block accepted before giving up on the stream
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Default cap on one part's body
pub const DEFAULT_MAX_PART_BYTES: usize = 64 * 1024 * 1024;

/// Turns one encoded frame into a decoded frame
///
/// Injected into the pipeline at construction. Failures are counted as
/// dropped frames and never stop the stream.
pub trait FrameDecoder: Send + Sync + 'static {
    /// Decoded frame handed to the consumer
    type Frame: Send + 'static;

    /// Decode one frame's bytes
    fn decode(&self, raw: Bytes) -> std::result::Result<Self::Frame, DecodeError>;
}

/// Hands the encoded bytes through untouched
///
/// Empty parts are rejected so a keep-alive part never reaches the consumer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrameDecoder;

impl FrameDecoder for RawFrameDecoder {
    type Frame = Bytes;

    fn decode(&self, raw: Bytes) -> std::result::Result<Bytes, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::new("empty frame"));
        }
        Ok(raw)
    }
}

/// Adapts a closure into a [`FrameDecoder`]
#[derive(Clone)]
pub struct FnDecoder<F>(pub F);

impl<F, T> FrameDecoder for FnDecoder<F>
where
    F: Fn(Bytes) -> std::result::Result<T, DecodeError> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Frame = T;

    fn decode(&self, raw: Bytes) -> std::result::Result<T, DecodeError> {
        (self.0)(raw)
    }
}

/// Decodes JPEG/PNG frames with the `image` crate
#[cfg(feature = "image")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFrameDecoder;

#[cfg(feature = "image")]
impl FrameDecoder for ImageFrameDecoder {
    type Frame = image::DynamicImage;

    fn decode(&self, raw: Bytes) -> std::result::Result<image::DynamicImage, DecodeError> {
        image::load_from_memory(&raw).map_err(|e| DecodeError::new(e.to_string()))
    }
}

#[derive(Debug)]
enum Framing {
    /// The whole response body is one frame
    WholeBody,
    /// `multipart/*` body; `delimiter` is `--boundary`, `marker` is
    /// `\r\n--boundary`
    Multipart {
        delimiter: Vec<u8>,
        marker: Vec<u8>,
        state: PartState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartState {
    /// Looking for the next delimiter line
    Delimiter,
    /// Delimiter consumed, skipping the rest of its line
    DelimiterLine,
    /// Reading part headers
    Headers,
    /// Reading a part body of known length
    Body(usize),
    /// Reading a part body up to the next delimiter; the first `usize` bytes
    /// are known not to start the delimiter
    BodyUntilDelimiter(usize),
    /// Closing delimiter seen
    Done,
}

/// Incremental splitter from response-body chunks to encoded frames
#[derive(Debug)]
pub struct FrameParser {
    framing: Framing,
    buffer: BytesMut,
    max_part_bytes: usize,
    finished: bool,
}

impl FrameParser {
    /// Parser for a body that is exactly one frame
    pub fn whole_body() -> Self {
        Self {
            framing: Framing::WholeBody,
            buffer: BytesMut::new(),
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
            finished: false,
        }
    }

    /// Parser for a multipart body with the given boundary
    ///
    /// A boundary declared with a leading `--` is accepted as well, as some
    /// motion-image servers repeat the dashes in the header.
    pub fn multipart(boundary: &str) -> Self {
        let boundary = boundary.trim_start_matches("--");
        let mut delimiter = b"--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        let mut marker = b"\r\n".to_vec();
        marker.extend_from_slice(&delimiter);
        Self {
            framing: Framing::Multipart {
                delimiter,
                marker,
                state: PartState::Delimiter,
            },
            buffer: BytesMut::new(),
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
            finished: false,
        }
    }

    /// Reject multipart parts larger than `max` bytes
    pub fn with_max_part_bytes(mut self, max: usize) -> Self {
        self.max_part_bytes = max;
        self
    }

    /// Pick the framing for a response in `format` with the given `Content-Type`
    pub fn for_response(format: Format, content_type: Option<&str>) -> Result<Self> {
        if !format.is_streaming() {
            return Ok(Self::whole_body());
        }
        let content_type = content_type.ok_or_else(|| {
            Error::protocol(format!("{} stream response has no Content-Type", format))
        })?;
        let boundary = multipart_boundary(content_type).ok_or_else(|| {
            Error::protocol(format!(
                "{} stream needs a multipart Content-Type with a boundary, got '{}'",
                format, content_type
            ))
        })?;
        Ok(Self::multipart(&boundary))
    }

    /// Append a chunk of the response body
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, if the buffered bytes contain one
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let Framing::Multipart {
            delimiter,
            marker,
            state,
        } = &mut self.framing
        else {
            return Ok(None);
        };

        loop {
            match *state {
                PartState::Done => {
                    self.buffer.clear();
                    return Ok(None);
                }
                PartState::Delimiter => match find(&self.buffer, delimiter) {
                    Some(pos) => {
                        self.buffer.advance(pos + delimiter.len());
                        *state = PartState::DelimiterLine;
                    }
                    None => {
                        // Keep a tail that may hold the start of a split delimiter
                        let keep = delimiter.len().saturating_sub(1);
                        if self.buffer.len() > keep {
                            let discard = self.buffer.len() - keep;
                            self.buffer.advance(discard);
                        }
                        return Ok(None);
                    }
                },
                PartState::DelimiterLine => {
                    if self.buffer.len() < 2 {
                        return Ok(None);
                    }
                    if self.buffer.starts_with(b"--") {
                        *state = PartState::Done;
                        continue;
                    }
                    match find(&self.buffer, b"\n") {
                        Some(pos) => {
                            self.buffer.advance(pos + 1);
                            *state = PartState::Headers;
                        }
                        None => return Ok(None),
                    }
                }
                PartState::Headers => {
                    let Some((header_len, body_start)) = header_block_end(&self.buffer) else {
                        if self.buffer.len() > MAX_HEADER_BYTES {
                            return Err(Error::protocol(format!(
                                "Part headers exceed {} bytes",
                                MAX_HEADER_BYTES
                            )));
                        }
                        return Ok(None);
                    };
                    let headers = String::from_utf8_lossy(&self.buffer[..header_len]).into_owned();
                    self.buffer.advance(body_start);
                    *state = match content_length(&headers)? {
                        Some(len) if len > self.max_part_bytes => {
                            return Err(Error::protocol(format!(
                                "Part of {} bytes exceeds {} bytes",
                                len, self.max_part_bytes
                            )));
                        }
                        Some(len) => PartState::Body(len),
                        None => PartState::BodyUntilDelimiter(0),
                    };
                }
                PartState::Body(len) => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let frame = self.buffer.split_to(len).freeze();
                    *state = PartState::Delimiter;
                    return Ok(Some(frame));
                }
                PartState::BodyUntilDelimiter(scanned) => {
                    match find(&self.buffer[scanned..], marker) {
                        Some(pos) => {
                            let frame = self.buffer.split_to(scanned + pos).freeze();
                            self.buffer.advance(2);
                            *state = PartState::Delimiter;
                            return Ok(Some(frame));
                        }
                        None => {
                            if self.buffer.len() > self.max_part_bytes + marker.len() {
                                return Err(Error::protocol(format!(
                                    "Part without Content-Length exceeds {} bytes",
                                    self.max_part_bytes
                                )));
                            }
                            // The marker may straddle the end of the buffer
                            let rescan = self.buffer.len().saturating_sub(marker.len() - 1);
                            *state = PartState::BodyUntilDelimiter(rescan.max(scanned));
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Signal end of body; returns the final frame of a whole-body response
    ///
    /// A multipart part cut off by the end of the body is discarded.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        self.finished = true;
        match self.framing {
            Framing::WholeBody if !self.buffer.is_empty() => Some(self.buffer.split().freeze()),
            _ => {
                if !self.buffer.is_empty() {
                    tracing::debug!("Discarding {} bytes of incomplete part", self.buffer.len());
                }
                self.buffer.clear();
                None
            }
        }
    }
}

/// Boundary parameter of a `multipart/*` content type
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// End of the part header block: (header bytes, offset of body start)
fn header_block_end(buffer: &[u8]) -> Option<(usize, usize)> {
    // A part without headers starts with the blank line
    if buffer.starts_with(b"\r\n") {
        return Some((0, 2));
    }
    if buffer.starts_with(b"\n") {
        return Some((0, 1));
    }
    if let Some(pos) = find(buffer, b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    find(buffer, b"\n\n").map(|pos| (pos, pos + 2))
}

fn content_length(headers: &str) -> Result<Option<usize>> {
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value
                    .trim()
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|_| Error::protocol(format!("Invalid Content-Length '{}'", value.trim())));
            }
        }
    }
    Ok(None)
}
