//! Request and response body codecs for prediction endpoints.
//!
//! Data flowing through an endpoint is a batch of numeric rows. Three wire
//! formats are built in:
//! - `application/x-npy`: `NumPy` `.npy`, little-endian `f64`, C order
//! - `application/json`: array of arrays
//! - `text/csv`: one row per line

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

/// A batch of numeric rows.
pub type Rows = Vec<Vec<f64>>;

/// `NumPy` array content type. Default for prediction requests.
pub const CONTENT_TYPE_NPY: &str = "application/x-npy";
/// JSON content type.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// CSV content type.
pub const CONTENT_TYPE_CSV: &str = "text/csv";

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_ALIGN: usize = 64;
const F64_WIDTH: usize = 8;

/// Encoding or decoding failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Rows of different lengths cannot form a matrix.
    #[error("row {row} has {actual} columns, expected {expected}")]
    Ragged {
        /// Zero-based index of the offending row.
        row: usize,
        /// Column count of the first row.
        expected: usize,
        /// Column count of the offending row.
        actual: usize,
    },

    /// Malformed or unsupported `.npy` payload.
    #[error("invalid npy payload: {0}")]
    Npy(String),

    /// JSON has no representation for NaN or infinity.
    #[error("row {row} column {column} holds {value}, which JSON cannot represent")]
    NonFinite {
        /// Zero-based row index.
        row: usize,
        /// Zero-based column index.
        column: usize,
        /// The offending value.
        value: f64,
    },

    /// Malformed JSON payload.
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed CSV payload.
    #[error("invalid csv payload at line {line}: {message}")]
    Csv {
        /// One-based line number.
        line: usize,
        /// What is wrong with it.
        message: String,
    },
}

/// Turns rows into a request body.
pub trait Serializer: Send + Sync {
    /// Content type of the produced body.
    fn content_type(&self) -> &'static str;

    /// Encode `rows`.
    ///
    /// # Errors
    /// Returns an error if `rows` cannot be represented in this format.
    fn serialize(&self, rows: &[Vec<f64>]) -> Result<Vec<u8>, CodecError>;
}

/// Turns a response body back into rows.
pub trait Deserializer: Send + Sync {
    /// Content type this deserializer understands.
    fn accept(&self) -> &'static str;

    /// Decode `body`.
    ///
    /// # Errors
    /// Returns an error if `body` is not valid for this format.
    fn deserialize(&self, body: &[u8]) -> Result<Rows, CodecError>;
}

/// Strip parameters (`; charset=...`) and normalize case.
#[must_use]
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Built-in serializer for a content type.
#[must_use]
pub fn serializer_for(content_type: &str) -> Option<Arc<dyn Serializer>> {
    match essence(content_type).as_str() {
        CONTENT_TYPE_NPY => Some(Arc::new(NpyCodec)),
        CONTENT_TYPE_JSON => Some(Arc::new(JsonCodec)),
        CONTENT_TYPE_CSV => Some(Arc::new(CsvCodec)),
        _ => None,
    }
}

/// Built-in deserializer for a content type.
#[must_use]
pub fn deserializer_for(content_type: &str) -> Option<Arc<dyn Deserializer>> {
    match essence(content_type).as_str() {
        CONTENT_TYPE_NPY => Some(Arc::new(NpyCodec)),
        CONTENT_TYPE_JSON => Some(Arc::new(JsonCodec)),
        CONTENT_TYPE_CSV => Some(Arc::new(CsvCodec)),
        _ => None,
    }
}

/// Column count shared by every row.
fn column_count(rows: &[Vec<f64>]) -> Result<usize, CodecError> {
    let expected = rows.first().map_or(0, Vec::len);
    for (row, values) in rows.iter().enumerate() {
        if values.len() != expected {
            return Err(CodecError::Ragged {
                row,
                expected,
                actual: values.len(),
            });
        }
    }
    Ok(expected)
}

/// `NumPy` `.npy` codec for 2-D `<f8` arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpyCodec;

impl Serializer for NpyCodec {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_NPY
    }

    fn serialize(&self, rows: &[Vec<f64>]) -> Result<Vec<u8>, CodecError> {
        let cols = column_count(rows)?;
        let mut header = format!(
            "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {cols}), }}",
            rows.len()
        );
        // magic + version + u16 length + header + trailing newline
        let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
        let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
        header.push_str(&" ".repeat(padding));
        header.push('\n');

        let header_len = u16::try_from(header.len())
            .map_err(|_| CodecError::Npy("header too long for format version 1.0".to_owned()))?;

        let mut out = Vec::with_capacity(unpadded + padding + rows.len() * cols * F64_WIDTH);
        out.extend_from_slice(NPY_MAGIC);
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        for value in rows.iter().flatten() {
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(out)
    }
}

impl Deserializer for NpyCodec {
    fn accept(&self) -> &'static str {
        CONTENT_TYPE_NPY
    }

    fn deserialize(&self, body: &[u8]) -> Result<Rows, CodecError> {
        let rest = body
            .strip_prefix(NPY_MAGIC)
            .ok_or_else(|| CodecError::Npy("missing magic string".to_owned()))?;
        let (major, rest) = rest
            .split_first_chunk::<2>()
            .map(|(version, rest)| (version[0], rest))
            .ok_or_else(|| CodecError::Npy("truncated version".to_owned()))?;

        let (header_len, rest) = match major {
            1 => {
                let (len, rest) = rest
                    .split_first_chunk::<2>()
                    .ok_or_else(|| CodecError::Npy("truncated header length".to_owned()))?;
                (usize::from(u16::from_le_bytes(*len)), rest)
            }
            2 | 3 => {
                let (len, rest) = rest
                    .split_first_chunk::<4>()
                    .ok_or_else(|| CodecError::Npy("truncated header length".to_owned()))?;
                let len = usize::try_from(u32::from_le_bytes(*len))
                    .map_err(|_| CodecError::Npy("header length overflow".to_owned()))?;
                (len, rest)
            }
            other => return Err(CodecError::Npy(format!("unsupported version {other}"))),
        };

        if rest.len() < header_len {
            return Err(CodecError::Npy("truncated header".to_owned()));
        }
        let (header, data) = rest.split_at(header_len);
        let header = std::str::from_utf8(header)
            .map_err(|_| CodecError::Npy("header is not valid text".to_owned()))?;

        let descr = quoted_value(header, "descr")
            .ok_or_else(|| CodecError::Npy("header has no descr".to_owned()))?;
        if descr != "<f8" {
            return Err(CodecError::Npy(format!(
                "unsupported dtype '{descr}', expected '<f8'"
            )));
        }
        if header_field(header, "fortran_order").is_some_and(|v| v.starts_with("True")) {
            return Err(CodecError::Npy("fortran order is not supported".to_owned()));
        }
        let shape = shape_value(header)?;
        let (n_rows, n_cols) = match shape.as_slice() {
            [n] => (*n, 1),
            [n, m] => (*n, *m),
            _ => {
                return Err(CodecError::Npy(format!(
                    "expected a 1-D or 2-D array, got shape {shape:?}"
                )));
            }
        };
        // Zero columns carry no data bytes, so the row count is unbounded by the body.
        if n_cols == 0 && n_rows > 0 {
            return Err(CodecError::Npy(format!(
                "rows without columns are not supported, got shape {shape:?}"
            )));
        }

        let expected_len = n_rows
            .checked_mul(n_cols)
            .and_then(|count| count.checked_mul(F64_WIDTH))
            .ok_or_else(|| CodecError::Npy("shape overflow".to_owned()))?;
        if data.len() != expected_len {
            return Err(CodecError::Npy(format!(
                "expected {expected_len} data bytes, got {}",
                data.len()
            )));
        }

        let values: Vec<f64> = data
            .chunks_exact(F64_WIDTH)
            .map(|chunk| {
                let mut buf = [0_u8; F64_WIDTH];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect();
        if n_cols == 0 {
            return Ok(Vec::new());
        }
        Ok(values.chunks(n_cols).map(<[f64]>::to_vec).collect())
    }
}

/// Raw text following `'key':` in an `.npy` header dict.
fn header_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let start = header.find(&needle)? + needle.len();
    header.get(start..).map(str::trim_start)
}

fn quoted_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let raw = header_field(header, key)?.strip_prefix('\'')?;
    raw.find('\'').and_then(|end| raw.get(..end))
}

fn shape_value(header: &str) -> Result<Vec<usize>, CodecError> {
    let raw = header_field(header, "shape")
        .and_then(|v| v.strip_prefix('('))
        .ok_or_else(|| CodecError::Npy("header has no shape".to_owned()))?;
    let end = raw
        .find(')')
        .ok_or_else(|| CodecError::Npy("unterminated shape".to_owned()))?;
    raw.get(..end)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|_| CodecError::Npy(format!("invalid shape dimension '{dim}'")))
        })
        .collect()
}

/// JSON codec: `[[1.0, 2.0], [3.0, 4.0]]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonRows {
    Matrix(Rows),
    Vector(Vec<f64>),
}

impl Serializer for JsonCodec {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    fn serialize(&self, rows: &[Vec<f64>]) -> Result<Vec<u8>, CodecError> {
        for (row, values) in rows.iter().enumerate() {
            let non_finite = values.iter().enumerate().find(|(_, v)| !v.is_finite());
            if let Some((column, &value)) = non_finite {
                return Err(CodecError::NonFinite { row, column, value });
            }
        }
        Ok(serde_json::to_vec(rows)?)
    }
}

impl Deserializer for JsonCodec {
    fn accept(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    fn deserialize(&self, body: &[u8]) -> Result<Rows, CodecError> {
        match serde_json::from_slice::<JsonRows>(body)? {
            JsonRows::Matrix(rows) => Ok(rows),
            JsonRows::Vector(values) => Ok(values.into_iter().map(|v| vec![v]).collect()),
        }
    }
}

/// CSV codec: one row per line, comma-separated, no header.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvCodec;

impl Serializer for CsvCodec {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_CSV
    }

    fn serialize(&self, rows: &[Vec<f64>]) -> Result<Vec<u8>, CodecError> {
        let mut out = String::new();
        for (idx, row) in rows.iter().enumerate() {
            // An empty row would be an empty line, which reads back as no row.
            if row.is_empty() {
                return Err(CodecError::Csv {
                    line: idx + 1,
                    message: "row has no columns".to_owned(),
                });
            }
            let line: Vec<String> = row.iter().map(f64::to_string).collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        Ok(out.into_bytes())
    }
}

impl Deserializer for CsvCodec {
    fn accept(&self) -> &'static str {
        CONTENT_TYPE_CSV
    }

    fn deserialize(&self, body: &[u8]) -> Result<Rows, CodecError> {
        let text = std::str::from_utf8(body).map_err(|e| CodecError::Csv {
            line: 1,
            message: e.to_string(),
        })?;
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row = line
                .split(',')
                .map(|cell| {
                    cell.trim().parse::<f64>().map_err(|e| CodecError::Csv {
                        line: idx + 1,
                        message: format!("'{}': {e}", cell.trim()),
                    })
                })
                .collect::<Result<Vec<f64>, CodecError>>()?;
            rows.push(row);
        }
        Ok(rows)
    }
}
