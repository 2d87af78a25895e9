//! Cell values and row previews shared by every extraction path.
//!
//! - [`CellValue`]: tagged value used by worksheets, the compressed data model and the exports
//! - [`WorksheetPreview`]: a header row plus a capped set of data rows

use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::borrow::Cow;

/// A single typed cell.
///
/// Worksheets, decoded data-model columns and the export codecs all agree on this
/// representation, so a column may freely mix variants.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Bool(bool),
    DateUtc(DateTime<Utc>),
    Null,
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// `true` for nulls and empty strings, the two spellings of "missing".
    pub fn is_missing(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Plain-text rendering; `None` for null.
    pub fn display_text(&self) -> Option<Cow<'_, str>> {
        match self {
            CellValue::Null => None,
            CellValue::Text(s) => Some(Cow::Borrowed(s.as_str())),
            CellValue::Number(n) => Some(Cow::Owned(format_number(*n))),
            CellValue::Bool(b) => Some(Cow::Borrowed(if *b { "TRUE" } else { "FALSE" })),
            CellValue::DateUtc(dt) => Some(Cow::Owned(format_date(dt))),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Number(n) if n.is_finite() => serializer.serialize_f64(*n),
            CellValue::Number(n) => serializer.serialize_str(&n.to_string()),
            CellValue::Text(s) => serializer.serialize_str(s),
            CellValue::Bool(b) => serializer.serialize_bool(*b),
            CellValue::DateUtc(dt) => {
                serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            CellValue::Null => serializer.serialize_none(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn format_date(dt: &DateTime<Utc>) -> String {
    if dt.time() == NaiveTime::MIN {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Where a preview's rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewSource {
    Worksheet,
    DataModel,
}

/// Header row plus the first `preview_row_limit` data rows of a sheet or model table.
///
/// # Invariants
///
/// `rows.len() <= total_rows`, and when `truncated` is set `rows` holds exactly the
/// configured cap while `total_rows` keeps the true count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorksheetPreview {
    pub file_name: String,
    pub sheet_name: String,
    pub source: PreviewSource,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub total_rows: usize,
    pub truncated: bool,
}

impl WorksheetPreview {
    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    /// Values of column `idx`, with `Null` for rows that are shorter than the header.
    pub fn column(&self, idx: usize) -> impl Iterator<Item = &CellValue> + '_ {
        self.rows
            .iter()
            .map(move |row| row.get(idx).unwrap_or(&CellValue::Null))
    }

    /// Column-major text view used by the profiler and the export codecs.
    pub fn text_columns(&self) -> Vec<Vec<Option<String>>> {
        (0..self.column_count())
            .map(|idx| {
                self.column(idx)
                    .map(|value| value.display_text().map(Cow::into_owned))
                    .collect()
            })
            .collect()
    }
}
