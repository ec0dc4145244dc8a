//! Dataset descriptor: shape, type and layout of a remote array
//!
//! The info endpoint answers with newline-delimited text:
//!
//! ```text
//! image                 <- dataset name
//! [1800, 2048, 2048]    <- shape, or `null`
//! 2                     <- dtype code
//! 2                     <- item size in bytes
//! [-1, 2048, 2048]      <- max shape (optional)
//! [1, 2048, 2048]       <- chunking (optional)
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Element count reported when the dataset is too large to materialize
pub const TOO_LARGE: i64 = i64::MAX;

/// Shape-dimension value meaning "unbounded"
pub const UNBOUNDED: i64 = -1;

/// Element type code as sent by the data server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum DType {
    String,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    /// A code this client does not know; kept verbatim
    Other(i32),
}

impl DType {
    /// Integer code used on the wire
    pub fn code(&self) -> i32 {
        match self {
            DType::String => -1,
            DType::Bool => 0,
            DType::Int8 => 1,
            DType::Int16 => 2,
            DType::Int32 => 3,
            DType::Int64 => 4,
            DType::Float32 => 5,
            DType::Float64 => 6,
            DType::Complex64 => 7,
            DType::Complex128 => 8,
            DType::Other(code) => *code,
        }
    }
}

impl From<i32> for DType {
    fn from(code: i32) -> Self {
        match code {
            -1 => DType::String,
            0 => DType::Bool,
            1 => DType::Int8,
            2 => DType::Int16,
            3 => DType::Int32,
            4 => DType::Int64,
            5 => DType::Float32,
            6 => DType::Float64,
            7 => DType::Complex64,
            8 => DType::Complex128,
            other => DType::Other(other),
        }
    }
}

impl From<DType> for i32 {
    fn from(dtype: DType) -> Self {
        dtype.code()
    }
}

/// Metadata record describing a remote array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Dataset name
    pub name: String,
    /// Current shape; `-1` marks an unbounded dimension
    pub shape: Vec<i64>,
    /// Element type
    pub dtype: DType,
    /// Bytes per element
    pub item_size: usize,
    /// Largest shape the dataset may grow to; `-1` entries are unbounded
    pub max_shape: Option<Vec<i64>>,
    /// Chunk shape used for storage
    pub chunking: Option<Vec<i64>>,
    /// Product of `shape`, or [`TOO_LARGE`]
    pub total_element_count: i64,
    /// The server sent no shape; `shape` is a rank-1 stand-in and the first
    /// shape event sets the real rank
    #[serde(default)]
    pub rank_unset: bool,
}

impl DatasetDescriptor {
    /// Parse the info endpoint's text body
    pub fn parse(body: &str) -> Result<Self> {
        let lines: Vec<&str> = body.lines().map(str::trim).collect();
        if lines.len() < 4 {
            return Err(Error::protocol(format!(
                "Dataset info needs at least 4 lines, got {}",
                lines.len()
            )));
        }

        let name = lines[0].to_string();
        let parsed_shape = parse_int_array(lines[1])?;
        let rank_unset = parsed_shape.is_none();
        let shape = parsed_shape.unwrap_or_else(|| vec![1]);
        let dtype = lines[2]
            .parse::<i32>()
            .map(DType::from)
            .map_err(|e| Error::protocol(format!("Invalid dtype '{}': {}", lines[2], e)))?;
        let item_size = lines[3]
            .parse::<usize>()
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| Error::protocol(format!("Invalid item size '{}'", lines[3])))?;

        let max_shape = match lines.get(4) {
            Some(line) if !line.is_empty() => parse_int_array(line)?,
            _ => None,
        };
        let chunking = match lines.get(5) {
            Some(line) if !line.is_empty() => parse_int_array(line)?,
            _ => None,
        };

        let descriptor = Self {
            name,
            total_element_count: element_count(&shape),
            max_shape: Some(max_shape.unwrap_or_else(|| unbounded_like(&shape))),
            shape,
            dtype,
            item_size,
            chunking,
            rank_unset,
        };
        descriptor.check()?;
        Ok(descriptor)
    }

    /// Stand-in reported before the first metadata fetch
    pub fn placeholder() -> Self {
        Self {
            name: "unknown".to_string(),
            shape: vec![1],
            dtype: DType::Int32,
            item_size: 4,
            max_shape: Some(vec![UNBOUNDED]),
            chunking: None,
            total_element_count: 1,
            rank_unset: true,
        }
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Whether the element count could not be represented
    pub fn is_too_large(&self) -> bool {
        self.total_element_count == TOO_LARGE
    }

    /// Replace the shape after a change event
    ///
    /// The max shape becomes all-unbounded with the new rank.
    pub fn resize(&mut self, shape: Vec<i64>) {
        if self.rank_unset || self.chunking.as_ref().is_some_and(|c| c.len() != shape.len()) {
            self.chunking = None;
        }
        self.rank_unset = false;
        self.max_shape = Some(unbounded_like(&shape));
        self.total_element_count = element_count(&shape);
        self.shape = shape;
    }

    fn check(&self) -> Result<()> {
        // Nothing to compare against until the real shape is known
        if self.rank_unset {
            return Ok(());
        }
        if let Some(max_shape) = &self.max_shape {
            if max_shape.len() != self.shape.len() {
                return Err(Error::protocol(format!(
                    "Max shape {:?} does not match rank of shape {:?}",
                    max_shape, self.shape
                )));
            }
            let exceeded = self
                .shape
                .iter()
                .zip(max_shape)
                .any(|(&dim, &max)| max != UNBOUNDED && dim > max);
            if exceeded {
                return Err(Error::protocol(format!(
                    "Shape {:?} exceeds max shape {:?}",
                    self.shape, max_shape
                )));
            }
        }
        if let Some(chunking) = &self.chunking {
            if chunking.len() != self.shape.len() {
                return Err(Error::protocol(format!(
                    "Chunking {:?} does not match rank of shape {:?}",
                    chunking, self.shape
                )));
            }
        }
        Ok(())
    }
}

/// Parse `[d0, d1, ...]`; the literal `null` means absent
pub fn parse_int_array(text: &str) -> Result<Option<Vec<i64>>> {
    let text = text.trim();
    if text == "null" {
        return Ok(None);
    }
    let inner = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| Error::protocol(format!("Expected [..] array, got '{}'", text)))?;
    if inner.trim().is_empty() {
        return Ok(Some(Vec::new()));
    }
    inner
        .split(',')
        .map(|token| {
            let token = token.trim();
            token
                .parse::<i64>()
                .map_err(|e| Error::protocol(format!("Invalid array entry '{}': {}", token, e)))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Product of the dimensions, or [`TOO_LARGE`] when it does not fit in an
/// `i64` or a dimension is unbounded
pub fn element_count(shape: &[i64]) -> i64 {
    shape
        .iter()
        .try_fold(1i64, |acc, &dim| {
            if dim < 0 {
                None
            } else {
                acc.checked_mul(dim)
            }
        })
        .unwrap_or(TOO_LARGE)
}

fn unbounded_like(shape: &[i64]) -> Vec<i64> {
    vec![UNBOUNDED; shape.len()]
}
