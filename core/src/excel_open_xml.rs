//! Worksheet previews from Excel Open XML packages.
//!
//! Reads the shared-string table, the sheet list and each worksheet of an
//! opened package into [`WorksheetPreview`] values. A sheet that fails to parse
//! is reported on its own and does not hide the other sheets.

use crate::container::{ContainerError, OpcContainer};
use crate::error_codes;
use crate::grid_parser::{
    GridParseError, parse_relationships, parse_shared_strings, parse_sheet_rows,
    parse_workbook_xml, resolve_sheet_target,
};
use crate::workbook::{PreviewSource, WorksheetPreview};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use thiserror::Error;

pub const WORKBOOK_PART: &str = "xl/workbook.xml";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorksheetError {
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
    #[error("grid parse error in '{sheet_name}': {source}")]
    GridParse {
        sheet_name: String,
        #[source]
        source: GridParseError,
    },
    #[error("workbook.xml missing or unreadable")]
    WorkbookXmlMissing,
    #[error("worksheet XML missing for sheet {sheet_name}")]
    WorksheetXmlMissing { sheet_name: String },
}

impl WorksheetError {
    pub fn code(&self) -> &'static str {
        match self {
            WorksheetError::Container(err) => err.code(),
            WorksheetError::GridParse { source, .. } => source.code(),
            WorksheetError::WorkbookXmlMissing | WorksheetError::WorksheetXmlMissing { .. } => {
                error_codes::GRID_WORKBOOK_MISSING
            }
        }
    }
}

/// Previews of every sheet that could be read, plus per-sheet failures.
#[derive(Debug, Default)]
pub struct WorkbookPreviews {
    pub sheets: Vec<WorksheetPreview>,
    pub failures: Vec<WorksheetError>,
}

pub fn has_workbook(container: &OpcContainer<'_>) -> bool {
    container.has_part(WORKBOOK_PART)
}

/// Reads every worksheet of `container`, keeping at most `row_limit` data rows each.
///
/// Workbook-level problems (missing or unparsable `xl/workbook.xml`, broken
/// shared strings) fail the whole call; sheet-level problems land in `failures`.
pub fn read_worksheet_previews(
    container: &mut OpcContainer<'_>,
    file_name: &str,
    row_limit: usize,
) -> Result<WorkbookPreviews, WorksheetError> {
    let workbook_bytes = container
        .read_part_optional(WORKBOOK_PART)?
        .ok_or(WorksheetError::WorkbookXmlMissing)?;
    let sheets = parse_workbook_xml(&workbook_bytes).map_err(|source| WorksheetError::GridParse {
        sheet_name: WORKBOOK_PART.to_string(),
        source,
    })?;

    let shared_strings = match container.read_part_optional(SHARED_STRINGS_PART)? {
        Some(bytes) => parse_shared_strings(&bytes).map_err(|source| WorksheetError::GridParse {
            sheet_name: SHARED_STRINGS_PART.to_string(),
            source,
        })?,
        None => Vec::new(),
    };

    let relationships = match container.read_part_optional(WORKBOOK_RELS_PART)? {
        Some(bytes) => parse_relationships(&bytes).unwrap_or_else(|err| {
            warn!("'{file_name}': ignoring unreadable workbook relationships: {err}");
            FxHashMap::default()
        }),
        None => FxHashMap::default(),
    };

    let mut out = WorkbookPreviews::default();
    for (idx, sheet) in sheets.iter().enumerate() {
        let target = resolve_sheet_target(sheet, &relationships, idx);
        let bytes = match container.read_part_optional(&target) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                out.failures.push(WorksheetError::WorksheetXmlMissing {
                    sheet_name: sheet.name.clone(),
                });
                continue;
            }
            Err(err) => {
                out.failures.push(err.into());
                continue;
            }
        };

        match parse_sheet_rows(&bytes, &shared_strings, row_limit) {
            Ok(rows) => {
                debug!(
                    "'{file_name}' sheet '{}': {} rows ({} kept)",
                    sheet.name,
                    rows.total_rows,
                    rows.rows.len()
                );
                out.sheets.push(WorksheetPreview {
                    file_name: file_name.to_string(),
                    sheet_name: sheet.name.clone(),
                    source: PreviewSource::Worksheet,
                    headers: rows.headers,
                    rows: rows.rows,
                    total_rows: rows.total_rows,
                    truncated: rows.truncated,
                });
            }
            Err(source) => out.failures.push(WorksheetError::GridParse {
                sheet_name: sheet.name.clone(),
                source,
            }),
        }
    }

    Ok(out)
}
