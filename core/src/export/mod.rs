//! Tabular export codecs.
//!
//! Both codecs are [`Task`]s that do a bounded amount of work per step and only
//! hand out the finished [`ExportArtifact`] on their last step.

mod csv;
mod parquet;

pub use self::csv::{CsvExport, export_csv};
pub use self::parquet::{ParquetExport, export_parquet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error_codes;
use crate::progress::Task;
use crate::workbook::{CellValue, WorksheetPreview};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
    #[error("row {row} has {len} values but the table has {columns} columns")]
    RowTooWide { row: usize, len: usize, columns: usize },
    #[error("table has no columns")]
    NoColumns,
    #[error("CSV encoding failed: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("Parquet encoding failed: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),
    #[error("export already finished")]
    Finished,
}

impl ExportError {
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::RowTooWide { .. } | ExportError::NoColumns => {
                error_codes::EXPORT_INVALID_SHAPE
            }
            ExportError::Csv(_) | ExportError::Parquet(_) | ExportError::Finished => {
                error_codes::EXPORT_ENCODING
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Parquet,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Parquet => "parquet",
        }
    }
}

/// Encoded bytes plus how to label them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub extension: &'static str,
}

/// Borrowed header row and data rows. Rows shorter than the header read as null.
#[derive(Debug, Clone, Copy)]
pub struct TableRef<'a> {
    pub headers: &'a [String],
    pub rows: &'a [Vec<CellValue>],
}

impl<'a> TableRef<'a> {
    pub fn new(headers: &'a [String], rows: &'a [Vec<CellValue>]) -> Result<Self, ExportError> {
        if let Some((row, values)) = rows
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() > headers.len())
        {
            return Err(ExportError::RowTooWide {
                row,
                len: values.len(),
                columns: headers.len(),
            });
        }
        Ok(Self { headers, rows })
    }

    pub fn from_preview(preview: &'a WorksheetPreview) -> Result<Self, ExportError> {
        Self::new(&preview.headers, &preview.rows)
    }

    pub(crate) fn cell(&self, row: usize, column: usize) -> &'a CellValue {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&CellValue::Null)
    }
}

/// Encodes `table` in `format` in one go.
pub fn export_table(
    table: TableRef<'_>,
    format: ExportFormat,
    chunk_rows: usize,
) -> Result<ExportArtifact, ExportError> {
    match format {
        ExportFormat::Csv => CsvExport::new(table, chunk_rows).run_to_completion(),
        ExportFormat::Parquet => ParquetExport::new(table, chunk_rows)?.run_to_completion(),
    }
}
