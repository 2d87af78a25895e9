//! `DataModelSchema` reader for `.pbit` templates.
//!
//! Templates ship the tabular model as JSON (usually UTF-16LE). When the package
//! has no DataMashup, the M expressions of table partitions and shared model
//! expressions stand in for the section document.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::datamashup_framing::decode_utf16;
use crate::error_codes;

pub const DATA_MODEL_SCHEMA_PART: &str = "DataModelSchema";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchemaError {
    #[error("DataModelSchema text encoding: {0}")]
    Encoding(String),
    #[error("DataModelSchema JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchemaError {
    pub fn code(&self) -> &'static str {
        error_codes::MODEL_SCHEMA
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaQueryKind {
    Partition,
    Expression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaQuery {
    pub name: String,
    pub expression: String,
    pub kind: SchemaQueryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaColumn {
    pub name: String,
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaTable {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataModelSchema {
    pub tables: Vec<SchemaTable>,
    pub queries: Vec<SchemaQuery>,
}

impl DataModelSchema {
    /// Renders the recovered expressions as one M section document so they can go
    /// through the regular section analysis.
    pub fn section_source(&self) -> String {
        let mut out = String::from("section Section1;\n");
        for query in &self.queries {
            out.push_str("\nshared ");
            out.push_str(&quote_identifier(&query.name));
            out.push_str(" = ");
            out.push_str(query.expression.trim());
            out.push_str(";\n");
        }
        out
    }
}

/// `#"..."` form of `name`, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("#\"{}\"", name.replace('"', "\"\""))
}

pub fn decode_schema_text(bytes: &[u8]) -> Result<String, SchemaError> {
    let encoding_err = |err: crate::datamashup_framing::DataMashupError| {
        SchemaError::Encoding(err.to_string())
    };
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, true).map_err(encoding_err);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, false).map_err(encoding_err);
    }
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
    if bytes.len() >= 2 && bytes[0] != 0 && bytes[1] == 0 {
        return decode_utf16(bytes, true).map_err(encoding_err);
    }
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| SchemaError::Encoding(e.to_string()))
}

pub fn parse_data_model_schema(bytes: &[u8]) -> Result<DataModelSchema, SchemaError> {
    let text = decode_schema_text(bytes)?;
    let v: Value = serde_json::from_str(text.trim_start_matches('\u{FEFF}'))?;
    let mut out = DataModelSchema::default();

    let Some(model) = v.get("model") else {
        return Ok(out);
    };

    for t in array(model, "tables") {
        let Some(table_name) = str_field(t, "name") else {
            continue;
        };
        if is_auto_date_table(table_name) {
            continue;
        }

        out.tables.push(SchemaTable {
            name: table_name.to_string(),
            columns: array(t, "columns")
                .filter_map(|c| {
                    Some(SchemaColumn {
                        name: str_field(c, "name")?.to_string(),
                        data_type: str_field(c, "dataType").map(str::to_string),
                    })
                })
                .collect(),
        });

        let mut m_partitions = array(t, "partitions")
            .filter_map(|p| p.get("source"))
            .filter(|source| str_field(source, "type").is_none_or(|ty| ty.eq_ignore_ascii_case("m")))
            .filter_map(|source| source.get("expression").and_then(expression_text));
        if let Some(expression) = m_partitions.next() {
            push_query(&mut out, table_name, expression, SchemaQueryKind::Partition);
        }
    }

    for e in array(model, "expressions") {
        if let (Some(name), Some(expression)) =
            (str_field(e, "name"), e.get("expression").and_then(expression_text))
        {
            push_query(&mut out, name, expression, SchemaQueryKind::Expression);
        }
    }

    Ok(out)
}

fn push_query(out: &mut DataModelSchema, name: &str, expression: String, kind: SchemaQueryKind) {
    if expression.trim().is_empty() || out.queries.iter().any(|q| q.name == name) {
        return;
    }
    out.queries.push(SchemaQuery {
        name: name.to_string(),
        expression,
        kind,
    });
}

/// Expressions are stored either as one string or as an array of lines.
fn expression_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Array(lines) => Some(
            lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

fn array<'v>(v: &'v Value, key: &str) -> impl Iterator<Item = &'v Value> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|a| a.as_slice())
        .unwrap_or_default()
        .iter()
}

fn str_field<'v>(v: &'v Value, key: &str) -> Option<&'v str> {
    v.get(key).and_then(Value::as_str)
}

fn is_auto_date_table(name: &str) -> bool {
    name.starts_with("DateTableTemplate_") || name.starts_with("LocalDateTable_")
}
