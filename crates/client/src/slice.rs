//! Slice and bin specifications
//!
//! The data server takes both as plain query strings. This module gives them a
//! typed form that round-trips through the wire syntax:
//!
//! - slice: `[700,:1024,:1024]` fixes dimension 0 at index 700 and takes the
//!   first 1024 entries of dimensions 1 and 2
//! - bin: `MEAN:2x2` reduces each 2x2 block to its mean before transmission

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Selection applied to one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimSelection {
    /// A single index; the dimension is removed from the result
    Index(i64),
    /// A `start:stop:step` range, any part may be omitted
    Range {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl DimSelection {
    /// The whole dimension (`:`)
    pub const ALL: DimSelection = DimSelection::Range {
        start: None,
        stop: None,
        step: None,
    };

    /// `:stop`
    pub fn up_to(stop: i64) -> Self {
        DimSelection::Range {
            start: None,
            stop: Some(stop),
            step: None,
        }
    }

    /// `start:stop`
    pub fn range(start: i64, stop: i64) -> Self {
        DimSelection::Range {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }
}

impl fmt::Display for DimSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimSelection::Index(i) => write!(f, "{}", i),
            DimSelection::Range { start, stop, step } => {
                if let Some(start) = start {
                    write!(f, "{}", start)?;
                }
                write!(f, ":")?;
                if let Some(stop) = stop {
                    write!(f, "{}", stop)?;
                }
                if let Some(step) = step {
                    write!(f, ":{}", step)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for DimSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.contains(':') {
            if s.is_empty() {
                return Ok(DimSelection::ALL);
            }
            return parse_bound(s).map(DimSelection::Index);
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(Error::InvalidConfig(format!(
                "Too many ':' in slice entry '{}'",
                s
            )));
        }
        let optional = |part: Option<&&str>| -> Result<Option<i64>> {
            match part.map(|p| p.trim()) {
                None | Some("") => Ok(None),
                Some(p) => parse_bound(p).map(Some),
            }
        };

        let step = optional(parts.get(2))?;
        if matches!(step, Some(step) if step <= 0) {
            return Err(Error::InvalidConfig(format!(
                "Slice step must be positive in '{}'",
                s
            )));
        }

        Ok(DimSelection::Range {
            start: optional(parts.first())?,
            stop: optional(parts.get(1))?,
            step,
        })
    }
}

fn parse_bound(s: &str) -> Result<i64> {
    s.parse::<i64>()
        .map_err(|_| Error::InvalidConfig(format!("Invalid slice bound '{}'", s)))
}

/// Per-dimension slice of a dataset, e.g. `[700,:1024,:1024]`
///
/// Dimensions beyond the listed selections are taken whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SliceSpec {
    dims: Vec<DimSelection>,
}

impl SliceSpec {
    /// Create a slice from per-dimension selections
    pub fn new(dims: Vec<DimSelection>) -> Self {
        Self { dims }
    }

    /// Selections in dimension order
    pub fn dims(&self) -> &[DimSelection] {
        &self.dims
    }

    /// Shape of the data this slice selects from an array of `shape`
    ///
    /// Index selections remove their dimension. Ranges are clamped to the
    /// dimension length; negative bounds count from the end. Unbounded
    /// dimensions (`-1`) stay unbounded unless the range gives an explicit stop.
    pub fn resolve(&self, shape: &[i64]) -> Result<Vec<i64>> {
        if self.dims.len() > shape.len() {
            return Err(Error::InvalidConfig(format!(
                "Slice {} has {} dimensions but the dataset has rank {}",
                self,
                self.dims.len(),
                shape.len()
            )));
        }

        let mut result = Vec::with_capacity(shape.len());
        for (axis, &len) in shape.iter().enumerate() {
            let selection = self.dims.get(axis).copied().unwrap_or(DimSelection::ALL);
            match selection {
                DimSelection::Index(index) => {
                    let resolved = if index < 0 && len >= 0 { index + len } else { index };
                    if resolved < 0 || (len >= 0 && resolved >= len) {
                        return Err(Error::InvalidConfig(format!(
                            "Index {} out of bounds for axis {} with length {}",
                            index, axis, len
                        )));
                    }
                }
                DimSelection::Range { start, stop, step } => {
                    let step = step.unwrap_or(1);
                    if len < 0 {
                        let extent = match stop {
                            Some(stop) if stop >= 0 => {
                                let start = start.unwrap_or(0).max(0);
                                div_ceil((stop - start).max(0), step)
                            }
                            _ => -1,
                        };
                        result.push(extent);
                        continue;
                    }
                    let clamp = |bound: i64| {
                        let bound = if bound < 0 { bound + len } else { bound };
                        bound.clamp(0, len)
                    };
                    let start = start.map(clamp).unwrap_or(0);
                    let stop = stop.map(clamp).unwrap_or(len);
                    result.push(div_ceil((stop - start).max(0), step));
                }
            }
        }
        Ok(result)
    }
}

// `numerator` is non-negative and `step` positive
fn div_ceil(numerator: i64, step: i64) -> i64 {
    if numerator == 0 {
        0
    } else {
        (numerator - 1) / step + 1
    }
}

impl fmt::Display for SliceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

impl FromStr for SliceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| {
                Error::InvalidConfig(format!("Slice '{}' must be enclosed in brackets", s))
            })?;
        if inner.trim().is_empty() {
            return Ok(Self::new(Vec::new()));
        }
        let dims = inner
            .split(',')
            .map(DimSelection::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(dims))
    }
}

impl TryFrom<String> for SliceSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SliceSpec> for String {
    fn from(spec: SliceSpec) -> Self {
        spec.to_string()
    }
}

/// Block-reduction method applied server side before transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinMethod {
    Mean,
    Median,
    Max,
    Min,
    Sum,
}

impl BinMethod {
    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            BinMethod::Mean => "MEAN",
            BinMethod::Median => "MEDIAN",
            BinMethod::Max => "MAX",
            BinMethod::Min => "MIN",
            BinMethod::Sum => "SUM",
        }
    }
}

impl FromStr for BinMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEAN" => Ok(BinMethod::Mean),
            "MEDIAN" => Ok(BinMethod::Median),
            "MAX" => Ok(BinMethod::Max),
            "MIN" => Ok(BinMethod::Min),
            "SUM" => Ok(BinMethod::Sum),
            other => Err(Error::InvalidConfig(format!(
                "Unknown bin method '{}'",
                other
            ))),
        }
    }
}

/// Bin specification, e.g. `MEAN:2x2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BinSpec {
    pub method: BinMethod,
    pub rows: u32,
    pub cols: u32,
}

impl BinSpec {
    /// Create a bin specification; block sides must be at least 1
    pub fn new(method: BinMethod, rows: u32, cols: u32) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(Error::InvalidConfig(format!(
                "Bin block must be at least 1x1, got {}x{}",
                rows, cols
            )));
        }
        Ok(Self { method, rows, cols })
    }
}

impl fmt::Display for BinSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}x{}", self.method.as_str(), self.rows, self.cols)
    }
}

impl FromStr for BinSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (method, block) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidConfig(format!("Bin '{}' must look like MEAN:2x2", s)))?;
        let (rows, cols) = block
            .to_ascii_lowercase()
            .split_once('x')
            .map(|(r, c)| (r.trim().to_string(), c.trim().to_string()))
            .ok_or_else(|| Error::InvalidConfig(format!("Bin block '{}' must look like 2x2", block)))?;
        let parse = |side: &str| {
            side.parse::<u32>()
                .map_err(|_| Error::InvalidConfig(format!("Invalid bin size '{}'", side)))
        };
        BinSpec::new(method.parse()?, parse(&rows)?, parse(&cols)?)
    }
}

impl TryFrom<String> for BinSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BinSpec> for String {
    fn from(spec: BinSpec) -> Self {
        spec.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tomography_slice() {
        let slice: SliceSpec = "[700,:1024,:1024]".parse().unwrap();
        assert_eq!(
            slice.dims(),
            &[
                DimSelection::Index(700),
                DimSelection::up_to(1024),
                DimSelection::up_to(1024)
            ]
        );
        assert_eq!(slice.to_string(), "[700,:1024,:1024]");
    }

    #[test]
    fn test_parse_full_ranges() {
        let slice: SliceSpec = "[ 2:10:2 , : , -1 ]".parse().unwrap();
        assert_eq!(
            slice.dims()[0],
            DimSelection::Range {
                start: Some(2),
                stop: Some(10),
                step: Some(2)
            }
        );
        assert_eq!(slice.dims()[1], DimSelection::ALL);
        assert_eq!(slice.dims()[2], DimSelection::Index(-1));
        assert_eq!(slice.to_string(), "[2:10:2,:,-1]");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("700,:1024".parse::<SliceSpec>().is_err());
        assert!("[a,:1]".parse::<SliceSpec>().is_err());
        assert!("[1:2:3:4]".parse::<SliceSpec>().is_err());
        assert!("[0:10:0]".parse::<SliceSpec>().is_err());
    }

    #[test]
    fn test_resolve_shape() {
        let slice: SliceSpec = "[700,:1024,:1024]".parse().unwrap();
        assert_eq!(slice.resolve(&[1800, 2048, 2048]).unwrap(), vec![1024, 1024]);

        // Ranges clamp to the dimension
        assert_eq!(slice.resolve(&[701, 512, 2048]).unwrap(), vec![512, 1024]);

        // Trailing dimensions are taken whole
        let slice: SliceSpec = "[0:10:3]".parse().unwrap();
        assert_eq!(slice.resolve(&[100, 64]).unwrap(), vec![4, 64]);

        // A step past the end still selects the first element
        let slice: SliceSpec = "[0:10:9223372036854775807]".parse().unwrap();
        assert_eq!(slice.resolve(&[100]).unwrap(), vec![1]);
        assert_eq!(slice.resolve(&[-1]).unwrap(), vec![1]);
        let slice: SliceSpec = "[5:5:9223372036854775807]".parse().unwrap();
        assert_eq!(slice.resolve(&[100]).unwrap(), vec![0]);
    }

    #[test]
    fn test_resolve_errors() {
        let slice: SliceSpec = "[5]".parse().unwrap();
        assert!(slice.resolve(&[5]).is_err());

        let slice: SliceSpec = "[0,0,0]".parse().unwrap();
        assert!(slice.resolve(&[4, 4]).is_err());
    }

    #[test]
    fn test_resolve_unbounded_dimension() {
        let slice: SliceSpec = "[:10,:]".parse().unwrap();
        assert_eq!(slice.resolve(&[-1, -1]).unwrap(), vec![10, -1]);
    }

    #[test]
    fn test_bin_spec() {
        let bin: BinSpec = "MEAN:2x2".parse().unwrap();
        assert_eq!(bin, BinSpec::new(BinMethod::Mean, 2, 2).unwrap());
        assert_eq!(bin.to_string(), "MEAN:2x2");

        let bin: BinSpec = "median:4X8".parse().unwrap();
        assert_eq!(bin.method, BinMethod::Median);
        assert_eq!((bin.rows, bin.cols), (4, 8));

        assert!("MEAN".parse::<BinSpec>().is_err());
        assert!("MODE:2x2".parse::<BinSpec>().is_err());
        assert!("MEAN:0x2".parse::<BinSpec>().is_err());
    }

    #[test]
    fn test_serde_as_strings() {
        let slice: SliceSpec = "[1,:2]".parse().unwrap();
        let json = serde_json::to_string(&slice).unwrap();
        assert_eq!(json, "\"[1,:2]\"");
        let back: SliceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, slice);

        let bin: BinSpec = serde_json::from_str("\"MAX:3x3\"").unwrap();
        assert_eq!(bin.method, BinMethod::Max);
    }
}
