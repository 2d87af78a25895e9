//! XML parsing for Excel worksheet previews.
//!
//! Handles shared strings, the workbook sheet list, relationship targets and
//! worksheet cell XML. Worksheets are streamed row by row so that only the
//! first `row_limit` data rows are ever materialized.

use crate::addressing::col_ref_to_index;
use crate::error_codes;
use crate::workbook::CellValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GridParseError {
    #[error("XML parse error: {0}")]
    XmlError(String),
    #[error("invalid cell address: {0}")]
    InvalidAddress(String),
    #[error("shared string index {0} out of bounds")]
    SharedStringOutOfBounds(usize),
}

impl GridParseError {
    pub fn code(&self) -> &'static str {
        match self {
            GridParseError::XmlError(_) => error_codes::GRID_XML,
            GridParseError::InvalidAddress(_) => error_codes::GRID_ADDRESS,
            GridParseError::SharedStringOutOfBounds(_) => error_codes::GRID_SHARED_STRING,
        }
    }
}

fn xml_err(err: impl std::fmt::Display) -> GridParseError {
    GridParseError::XmlError(err.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetDescriptor {
    pub name: String,
    pub rel_id: Option<String>,
    pub sheet_id: Option<u32>,
}

/// Header row and capped data rows read from one worksheet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SheetRows {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub total_rows: usize,
    pub truncated: bool,
}

/// Attributes of `element` as unescaped `(local key, value)` pairs.
fn attributes(element: &BytesStart<'_>) -> Result<Vec<(Vec<u8>, String)>, GridParseError> {
    element
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(xml_err)?;
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            Ok((attr.key.as_ref().to_vec(), value))
        })
        .collect()
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, GridParseError> {
    Ok(attributes(element)?
        .into_iter()
        .find_map(|(k, v)| (k == key).then_some(v)))
}

fn local_name(name: &[u8]) -> &[u8] {
    name.rsplit(|b| *b == b':').next().unwrap_or(name)
}

/// Shared-string table; rich-text runs are concatenated, phonetic runs dropped.
pub fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, GridParseError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_phonetic = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"si" => current = Some(String::new()),
                b"rPh" => in_phonetic = true,
                b"t" if !in_phonetic => {
                    let text = reader.read_text(e.name()).map_err(xml_err)?;
                    let unescaped = quick_xml::escape::unescape(&text).map_err(xml_err)?;
                    if let Some(current) = current.as_mut() {
                        current.push_str(&unescaped);
                    }
                }
                _ => {}
            },
            Event::Empty(e) if local_name(e.name().as_ref()) == b"si" => strings.push(String::new()),
            Event::End(e) => match local_name(e.name().as_ref()) {
                b"si" => strings.extend(current.take()),
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(strings)
}

/// Sheets listed in `xl/workbook.xml`, in workbook order.
pub fn parse_workbook_xml(xml: &[u8]) -> Result<Vec<SheetDescriptor>, GridParseError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) if local_name(e.name().as_ref()) == b"sheet" => {
                let mut descriptor = SheetDescriptor {
                    name: String::new(),
                    rel_id: None,
                    sheet_id: None,
                };
                for (key, value) in attributes(&e)? {
                    match key.as_slice() {
                        b"name" => descriptor.name = value,
                        b"sheetId" => descriptor.sheet_id = value.parse().ok(),
                        k if local_name(k) == b"id" => descriptor.rel_id = Some(value),
                        _ => {}
                    }
                }
                if !descriptor.name.is_empty() {
                    sheets.push(descriptor);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(sheets)
}

/// Worksheet relationships of `xl/_rels/workbook.xml.rels`: id to target.
pub fn parse_relationships(xml: &[u8]) -> Result<FxHashMap<String, String>, GridParseError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut map = FxHashMap::default();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e)
                if local_name(e.name().as_ref()) == b"Relationship" =>
            {
                let attrs = attributes(&e)?;
                let get = |key: &[u8]| attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v);
                if let (Some(id), Some(target), Some(kind)) = (get(b"Id"), get(b"Target"), get(b"Type"))
                    && kind.ends_with("/worksheet")
                {
                    map.insert(id.clone(), target.clone());
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(map)
}

/// Archive path of a sheet's XML: the relationship target when known, otherwise
/// the conventional `xl/worksheets/sheetN.xml`.
pub fn resolve_sheet_target(
    sheet: &SheetDescriptor,
    relationships: &FxHashMap<String, String>,
    index: usize,
) -> String {
    let target = sheet
        .rel_id
        .as_ref()
        .and_then(|id| relationships.get(id))
        .cloned()
        .unwrap_or_else(|| {
            let n = sheet.sheet_id.map_or(index + 1, |id| id as usize);
            format!("worksheets/sheet{n}.xml")
        });

    let trimmed = target.trim_start_matches('/');
    if trimmed.starts_with("xl/") {
        trimmed.to_string()
    } else {
        format!("xl/{trimmed}")
    }
}

/// Reads a worksheet into a header row plus at most `row_limit` data rows.
///
/// The first row with any value becomes the header; every later row with a value
/// counts toward `total_rows`. Gaps in sparse rows are filled with `Null`.
pub fn parse_sheet_rows(
    xml: &[u8],
    shared_strings: &[String],
    row_limit: usize,
) -> Result<SheetRows, GridParseError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut header: Option<Vec<CellValue>> = None;
    let mut out = SheetRows::default();
    let mut width = 0usize;
    let mut row: Vec<CellValue> = Vec::new();
    let mut next_col = 0u32;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if local_name(e.name().as_ref()) == b"row" => {
                row.clear();
                next_col = 0;
            }
            Event::Start(e) if local_name(e.name().as_ref()) == b"c" => {
                let e = e.into_owned();
                let (col, value) = parse_cell(&mut reader, &e, next_col, shared_strings)?;
                next_col = col + 1;
                place(&mut row, col, value);
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == b"c" => {
                let col = cell_column(&e, next_col)?;
                next_col = col + 1;
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"row" => {
                while row.last().is_some_and(CellValue::is_null) {
                    row.pop();
                }
                width = width.max(row.len());
                if row.is_empty() {
                    // blank or formatting-only row
                } else if header.is_none() {
                    header = Some(std::mem::take(&mut row));
                } else {
                    out.total_rows += 1;
                    if out.rows.len() < row_limit {
                        out.rows.push(std::mem::take(&mut row));
                    } else {
                        out.truncated = true;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let Some(header) = header else {
        return Ok(SheetRows::default());
    };
    out.headers = (0..width)
        .map(|idx| match header.get(idx).and_then(CellValue::display_text) {
            Some(text) if !text.trim().is_empty() => text.into_owned(),
            _ => format!("Column{}", idx + 1),
        })
        .collect();
    for row in &mut out.rows {
        row.resize(width, CellValue::Null);
    }
    Ok(out)
}

fn place(row: &mut Vec<CellValue>, col: u32, value: CellValue) {
    let idx = col as usize;
    if row.len() <= idx {
        row.resize(idx + 1, CellValue::Null);
    }
    row[idx] = value;
}

fn cell_column(element: &BytesStart<'_>, fallback: u32) -> Result<u32, GridParseError> {
    match attribute(element, b"r")? {
        Some(reference) => {
            col_ref_to_index(&reference).ok_or(GridParseError::InvalidAddress(reference))
        }
        None => Ok(fallback),
    }
}

fn parse_cell(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    fallback_col: u32,
    shared_strings: &[String],
) -> Result<(u32, CellValue), GridParseError> {
    let col = cell_column(start, fallback_col)?;
    let cell_type = attribute(start, b"t")?;

    let mut value_text: Option<String> = None;
    let mut inline_text: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"v" => {
                    let text = reader.read_text(e.name()).map_err(xml_err)?;
                    value_text = Some(quick_xml::escape::unescape(&text).map_err(xml_err)?.into_owned());
                }
                b"is" => inline_text = Some(read_inline_string(reader)?),
                b"f" => {
                    reader.read_to_end(e.name()).map_err(xml_err)?;
                }
                _ => {}
            },
            Event::End(e) if local_name(e.name().as_ref()) == b"c" => break,
            Event::Eof => return Err(xml_err("unexpected EOF inside cell")),
            _ => {}
        }
        buf.clear();
    }

    let value = match inline_text {
        Some(text) => CellValue::Text(text),
        None => convert_value(value_text.as_deref(), cell_type.as_deref(), shared_strings)?,
    };
    Ok((col, value))
}

fn read_inline_string(reader: &mut Reader<&[u8]>) -> Result<String, GridParseError> {
    let mut buf = Vec::new();
    let mut value = String::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if local_name(e.name().as_ref()) == b"t" => {
                let text = reader.read_text(e.name()).map_err(xml_err)?;
                value.push_str(&quick_xml::escape::unescape(&text).map_err(xml_err)?);
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"is" => break,
            Event::Eof => return Err(xml_err("unexpected EOF inside inline string")),
            _ => {}
        }
        buf.clear();
    }
    Ok(value)
}

fn convert_value(
    value_text: Option<&str>,
    cell_type: Option<&str>,
    shared_strings: &[String],
) -> Result<CellValue, GridParseError> {
    let Some(raw) = value_text else {
        return Ok(CellValue::Null);
    };
    let trimmed = raw.trim();

    match cell_type {
        Some("s") => {
            let idx: usize = trimmed.parse().map_err(xml_err)?;
            shared_strings
                .get(idx)
                .cloned()
                .map(CellValue::Text)
                .ok_or(GridParseError::SharedStringOutOfBounds(idx))
        }
        Some("b") => Ok(match trimmed {
            "1" | "true" => CellValue::Bool(true),
            "0" | "false" => CellValue::Bool(false),
            _ => CellValue::Text(trimmed.to_string()),
        }),
        Some("e") => Ok(CellValue::Text(trimmed.to_string())),
        Some("str") | Some("inlineStr") => Ok(CellValue::Text(raw.to_string())),
        Some("d") => Ok(parse_iso_date(trimmed)
            .map(CellValue::DateUtc)
            .unwrap_or_else(|| CellValue::Text(trimmed.to_string()))),
        _ if trimmed.is_empty() => Ok(CellValue::Null),
        _ => Ok(match trimmed.parse::<f64>() {
            Ok(n) => CellValue::Number(n),
            Err(_) => CellValue::Text(trimmed.to_string()),
        }),
    }
}

fn parse_iso_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
