//! Per-file extraction pipeline and batch orchestration.
//!
//! A file goes through, in order: container sniffing, worksheet previews,
//! the DataMashup section, the `DataModelSchema` expressions and finally the
//! compressed `DataModel`. Later sources are only consulted while nothing has
//! been recovered. Every failure is scoped to its file.

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::ExtractConfig;
use crate::container::{ContainerError, ContainerKind, OpcContainer, sniff_container};
use crate::data_model::{DATA_MODEL_PART, DataModelContents, DataModelDecoder, DataModelError, ModelColumn};
use crate::datamashup::build_data_mashup;
use crate::datamashup_framing::{DataMashupError, decode_mashup_payload};
use crate::error_codes;
use crate::excel_open_xml::{has_workbook, read_worksheet_previews};
use crate::graph::{DependencyGraph, build_dependency_graph};
use crate::m_deps::CrossFileRef;
use crate::m_section::{DependencyEdge, Query, SectionAnalysis, parse_section};
use crate::progress::{NoProgress, ProgressCallback, Task};
use crate::tabular_schema::{DATA_MODEL_SCHEMA_PART, DataModelSchema, SchemaQuery, SchemaQueryKind, parse_data_model_schema};
use crate::workbook::WorksheetPreview;
use crate::xpress::XpressError;

pub const MODEL_RECOVERY_NOTE: &str = "recovered from compressed model, not original M source";
pub const SCHEMA_RECOVERY_NOTE: &str = "recovered from DataModelSchema, not original M source";

/// File-scoped failure taxonomy. None of these abort a batch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PackageError {
    #[error("container unreadable: {0}")]
    ContainerUnreadable(#[source] ContainerError),
    #[error("malformed DataMashup: {0}")]
    MalformedEnvelope(#[source] DataMashupError),
    #[error("DataMashup has no Formulas/Section1.m")]
    NoFormulaSection,
    #[error("data model decompression failed: {0}")]
    DecompressionError(#[source] XpressError),
    #[error("unsupported data model layout: {0}")]
    UnsupportedModelLayout(String),
    #[error("no queries found")]
    NoQueriesFound,
}

impl PackageError {
    pub fn code(&self) -> &'static str {
        match self {
            PackageError::ContainerUnreadable(err) => err.code(),
            PackageError::MalformedEnvelope(err) => err.code(),
            PackageError::NoFormulaSection => error_codes::DM_NO_FORMULA_SECTION,
            PackageError::DecompressionError(_) => error_codes::MODEL_DECOMPRESSION,
            PackageError::UnsupportedModelLayout(_) => error_codes::MODEL_UNSUPPORTED_LAYOUT,
            PackageError::NoQueriesFound => error_codes::NO_QUERIES_FOUND,
        }
    }
}

impl From<DataMashupError> for PackageError {
    fn from(err: DataMashupError) -> Self {
        match err {
            DataMashupError::NoFormulaSection => PackageError::NoFormulaSection,
            other => PackageError::MalformedEnvelope(other),
        }
    }
}

impl From<DataModelError> for PackageError {
    fn from(err: DataModelError) -> Self {
        match err {
            DataModelError::Decompression(inner) => PackageError::DecompressionError(inner),
            DataModelError::UnsupportedModelLayout(message) => {
                PackageError::UnsupportedModelLayout(message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Workbook,
    PowerBiReport,
    PowerBiTemplate,
    Unknown,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xlsb" => FileKind::Workbook,
            "pbix" => FileKind::PowerBiReport,
            "pbit" => FileKind::PowerBiTemplate,
            _ => FileKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Ok,
    /// Read cleanly, nothing extractable. Informational.
    NoQueries,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIssue {
    pub code: &'static str,
    pub message: String,
}

impl FileIssue {
    fn from_error(err: &PackageError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Shape of a table recovered from the compressed model; rows live in the
/// matching `worksheets` preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ModelColumn>,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileResult {
    pub name: String,
    pub kind: FileKind,
    pub status: FileStatus,
    pub queries: Vec<Query>,
    pub edges: Vec<DependencyEdge>,
    pub cross_file_refs: Vec<CrossFileRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub worksheets: Vec<WorksheetPreview>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableInfo>,
    pub errors: Vec<FileIssue>,
    pub notes: Vec<String>,
}

impl FileResult {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FileKind::from_name(name),
            status: FileStatus::Ok,
            queries: Vec::new(),
            edges: Vec::new(),
            cross_file_refs: Vec::new(),
            worksheets: Vec::new(),
            tables: Vec::new(),
            errors: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == FileStatus::Failed
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }

    pub fn worksheet(&self, sheet_name: &str) -> Option<&WorksheetPreview> {
        self.worksheets.iter().find(|w| w.sheet_name == sheet_name)
    }

    fn recovered_anything(&self) -> bool {
        !self.queries.is_empty() || !self.tables.is_empty()
    }

    fn absorb(&mut self, analysis: SectionAnalysis) {
        for anomaly in &analysis.anomalies {
            self.notes.push(format!("{}: {anomaly}", anomaly.code()));
        }
        self.queries.extend(analysis.queries);
        self.edges.extend(analysis.edges);
        self.cross_file_refs.extend(analysis.cross_file_refs);
    }
}

/// One upload: display name plus its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub files: Vec<FileResult>,
}

impl BatchResult {
    pub fn dependency_graph(&self) -> DependencyGraph {
        build_dependency_graph(&self.files)
    }

    pub fn file(&self, name: &str) -> Option<&FileResult> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn has_failures(&self) -> bool {
        self.files.iter().any(FileResult::is_failed)
    }
}

pub fn process_file(name: &str, bytes: &[u8], config: &ExtractConfig) -> FileResult {
    process_file_with_progress(name, bytes, config, &NoProgress)
}

/// Runs the whole pipeline for one file. Never panics on malformed input and
/// never returns an error: failures are recorded on the result.
pub fn process_file_with_progress(
    name: &str,
    bytes: &[u8],
    config: &ExtractConfig,
    progress: &dyn ProgressCallback,
) -> FileResult {
    let mut result = FileResult::new(name);
    let mut extraction = Extraction {
        result: &mut result,
        config,
        progress,
        errors: Vec::new(),
    };

    match extraction.run(bytes) {
        Ok(()) => {}
        Err(PackageError::NoQueriesFound) => {
            debug!("'{name}': nothing extractable");
            result.status = FileStatus::NoQueries;
        }
        Err(err) => {
            warn!("'{name}': {err}");
            result.status = FileStatus::Failed;
            result.errors.insert(0, FileIssue::from_error(&err));
        }
    }

    info!(
        "'{name}': {:?}, {} queries, {} tables, {} sheets",
        result.status,
        result.queries.len(),
        result.tables.len(),
        result.worksheets.len()
    );
    result
}

/// Reads `path` and processes it under its file name.
#[cfg(feature = "std-fs")]
pub fn process_path(
    path: impl AsRef<std::path::Path>,
    config: &ExtractConfig,
) -> std::io::Result<FileResult> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(process_file(&name, &bytes, config))
}

pub fn process_batch(files: &[InputFile], config: &ExtractConfig) -> BatchResult {
    BatchResult {
        files: files
            .iter()
            .map(|file| process_file(&file.name, &file.bytes, config))
            .collect(),
    }
}

struct Extraction<'r, 'c> {
    result: &'r mut FileResult,
    config: &'c ExtractConfig,
    progress: &'c dyn ProgressCallback,
    errors: Vec<PackageError>,
}

impl Extraction<'_, '_> {
    fn run(&mut self, bytes: &[u8]) -> Result<(), PackageError> {
        if sniff_container(bytes) != ContainerKind::Zip {
            return Err(PackageError::ContainerUnreadable(
                ContainerError::NotZipContainer,
            ));
        }
        let mut container = OpcContainer::open_from_bytes_with_limits(bytes, self.config.container)
            .map_err(PackageError::ContainerUnreadable)?;
        self.progress.on_progress("container", 1.0);

        if self.config.include_worksheets && has_workbook(&container) {
            self.read_worksheets(&mut container);
        }

        match self.mashup_queries(&mut container) {
            Ok(()) => {}
            Err(PackageError::NoFormulaSection) => self
                .result
                .notes
                .push(PackageError::NoFormulaSection.to_string()),
            Err(err) => {
                warn!("'{}': {err}", self.result.name);
                self.errors.push(err);
            }
        }

        if self.result.queries.is_empty() {
            self.schema_queries(&mut container);
        }

        if !self.result.recovered_anything()
            && self.config.include_data_model
            && let Err(err) = self.model_contents(&mut container)
        {
            warn!("'{}': {err}", self.result.name);
            self.errors.push(err);
        }

        let mut errors = std::mem::take(&mut self.errors).into_iter();
        if self.result.recovered_anything() {
            self.result
                .errors
                .extend(errors.map(|err| FileIssue::from_error(&err)));
            return Ok(());
        }
        match errors.next() {
            Some(first) => {
                self.result
                    .errors
                    .extend(errors.map(|err| FileIssue::from_error(&err)));
                Err(first)
            }
            None => Err(PackageError::NoQueriesFound),
        }
    }

    fn read_worksheets(&mut self, container: &mut OpcContainer<'_>) {
        match read_worksheet_previews(container, &self.result.name, self.config.preview_row_limit) {
            Ok(previews) => {
                self.result.worksheets.extend(previews.sheets);
                for failure in previews.failures {
                    self.result.errors.push(FileIssue {
                        code: failure.code(),
                        message: failure.to_string(),
                    });
                }
            }
            Err(err) => {
                warn!("'{}': worksheets unreadable: {err}", self.result.name);
                self.result.errors.push(FileIssue {
                    code: err.code(),
                    message: err.to_string(),
                });
            }
        }
        self.progress.on_progress("worksheets", 1.0);
    }

    fn mashup_queries(&mut self, container: &mut OpcContainer<'_>) -> Result<(), PackageError> {
        let Some(located) = container
            .locate_data_mashup()
            .map_err(PackageError::ContainerUnreadable)?
        else {
            debug!("'{}': no DataMashup part", self.result.name);
            return Ok(());
        };
        let raw = decode_mashup_payload(&located.payload)?;
        let mashup = build_data_mashup(&raw, self.config.datamashup)?;
        debug!(
            "'{}': DataMashup v{} from '{}'",
            self.result.name, mashup.version, located.part_name
        );

        let name = self.result.name.clone();
        self.result
            .absorb(parse_section(&mashup.package_parts.main_section.source, &name));
        for embedded in &mashup.package_parts.embedded_contents {
            let source_file = format!("{name}/{}", embedded.name);
            self.result
                .absorb(parse_section(&embedded.section.source, &source_file));
        }
        self.progress.on_progress("mashup", 1.0);
        Ok(())
    }

    fn schema_queries(&mut self, container: &mut OpcContainer<'_>) {
        let bytes = match container.read_part_optional(DATA_MODEL_SCHEMA_PART) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(err) => {
                warn!("'{}': DataModelSchema unreadable: {err}", self.result.name);
                return;
            }
        };
        let schema = match parse_data_model_schema(&bytes) {
            Ok(schema) => schema,
            Err(err) => {
                self.result.errors.push(FileIssue {
                    code: err.code(),
                    message: err.to_string(),
                });
                return;
            }
        };
        if schema.queries.is_empty() {
            return;
        }
        debug!(
            "'{}': {} expressions in DataModelSchema",
            self.result.name,
            schema.queries.len()
        );
        let name = self.result.name.clone();
        self.result.absorb(parse_section(&schema.section_source(), &name));
        self.result.notes.push(SCHEMA_RECOVERY_NOTE.to_string());
    }

    fn model_contents(&mut self, container: &mut OpcContainer<'_>) -> Result<(), PackageError> {
        let Some(part) = container
            .read_part_optional(DATA_MODEL_PART)
            .map_err(PackageError::ContainerUnreadable)?
        else {
            return Ok(());
        };
        debug!("'{}': decoding {} byte DataModel", self.result.name, part.len());
        let contents = DataModelDecoder::new(&part, self.config.max_decompressed_bytes)
            .run_with_progress(self.progress)?;
        self.apply_model(contents);
        Ok(())
    }

    fn apply_model(&mut self, contents: DataModelContents) {
        let name = self.result.name.clone();
        for table in &contents.tables {
            self.result.tables.push(TableInfo {
                name: table.name.clone(),
                columns: table.columns.clone(),
                row_count: table.row_count(),
            });
            self.result
                .worksheets
                .push(table.to_preview(&name, self.config.preview_row_limit));
        }

        let partitions: Vec<SchemaQuery> = contents
            .partitions
            .into_iter()
            .map(|p| SchemaQuery {
                name: p.table,
                expression: p.expression,
                kind: SchemaQueryKind::Partition,
            })
            .collect();
        if !partitions.is_empty() {
            let schema = DataModelSchema {
                tables: Vec::new(),
                queries: partitions,
            };
            self.result.absorb(parse_section(&schema.section_source(), &name));
        }
        self.result.notes.push(MODEL_RECOVERY_NOTE.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::fixture::{sales_backup, stored_part};

    #[test]
    fn file_kind_follows_extension() {
        assert_eq!(FileKind::from_name("Book.XLSX"), FileKind::Workbook);
        assert_eq!(FileKind::from_name("report.pbix"), FileKind::PowerBiReport);
        assert_eq!(FileKind::from_name("t.pbit"), FileKind::PowerBiTemplate);
        assert_eq!(FileKind::from_name("notes"), FileKind::Unknown);
    }

    #[test]
    fn non_zip_input_fails_the_file_only() {
        let config = ExtractConfig::default();
        let batch = process_batch(
            &[
                InputFile::new("junk.xlsx", b"not a zip".to_vec()),
                InputFile::new("empty.pbix", Vec::new()),
            ],
            &config,
        );
        assert_eq!(batch.files.len(), 2);
        for file in &batch.files {
            assert_eq!(file.status, FileStatus::Failed);
            assert_eq!(file.errors[0].code, error_codes::CONTAINER_NOT_ZIP);
        }
        assert!(batch.has_failures());
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::{Cursor, Write};
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .expect("start file");
            writer.write_all(bytes).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    fn envelope_without_section() -> Vec<u8> {
        let inner = zip_bytes(&[("Config/Package.xml", b"<Package/>".as_slice())]);
        let mut raw = 0u32.to_le_bytes().to_vec();
        raw.extend_from_slice(&(inner.len() as u32).to_le_bytes());
        raw.extend_from_slice(&inner);
        raw
    }

    #[test]
    fn compressed_model_is_the_last_resort() {
        let part = stored_part(&sales_backup(), 1000);
        let mashup = envelope_without_section();
        let bytes = zip_bytes(&[("DataMashup", mashup.as_slice()), (DATA_MODEL_PART, part.as_slice())]);

        let seen = std::cell::RefCell::new(Vec::new());
        let record = |phase: &str, _: f32| seen.borrow_mut().push(phase.to_string());
        let file =
            process_file_with_progress("model.pbix", &bytes, &ExtractConfig::default(), &record);

        assert_eq!(file.status, FileStatus::Ok, "errors: {:?}", file.errors);
        assert!(file.notes.iter().any(|n| n.contains("Formulas/Section1.m")));
        assert!(file.notes.iter().any(|n| n == MODEL_RECOVERY_NOTE));
        assert_eq!(file.tables.len(), 1);
        assert_eq!(file.tables[0].name, "Sales");
        assert_eq!(file.tables[0].row_count, 3);

        let preview = file.worksheet("Sales").expect("model preview");
        assert_eq!(preview.source, crate::workbook::PreviewSource::DataModel);
        assert_eq!(preview.headers, vec!["Region", "Amount", "OrderDate"]);

        let sales = file.query("Sales").expect("partition query");
        assert!(sales.raw_code.contains("Csv.Document"));
        assert_eq!(file.cross_file_refs[0].file_name, "sales.csv");
        assert!(seen.borrow().iter().any(|p| p == "columns"));
    }

    #[test]
    fn model_is_skipped_when_disabled() {
        let part = stored_part(&sales_backup(), 1000);
        let bytes = zip_bytes(&[(DATA_MODEL_PART, part.as_slice())]);
        let file = process_file("model.pbix", &bytes, &ExtractConfig::queries_only());
        assert_eq!(file.status, FileStatus::NoQueries);
        assert!(file.tables.is_empty());
    }

    #[test]
    fn corrupt_model_fails_with_a_model_code() {
        let mut part = stored_part(&sales_backup(), 1000);
        part.truncate(400);
        let bytes = zip_bytes(&[(DATA_MODEL_PART, part.as_slice())]);
        let file = process_file("broken.pbix", &bytes, &ExtractConfig::default());
        assert_eq!(file.status, FileStatus::Failed);
        assert!(
            [error_codes::MODEL_DECOMPRESSION, error_codes::MODEL_UNSUPPORTED_LAYOUT]
                .contains(&file.errors[0].code)
        );
    }

    #[test]
    fn error_conversions_keep_the_taxonomy() {
        assert!(matches!(
            PackageError::from(DataMashupError::NoFormulaSection),
            PackageError::NoFormulaSection
        ));
        let malformed = PackageError::from(DataMashupError::MalformedEnvelope("short"));
        assert_eq!(malformed.code(), error_codes::DM_MALFORMED_ENVELOPE);
        let layout = PackageError::from(DataModelError::layout("odd"));
        assert_eq!(layout.code(), error_codes::MODEL_UNSUPPORTED_LAYOUT);
        assert_eq!(PackageError::NoQueriesFound.code(), error_codes::NO_QUERIES_FOUND);
    }
}
