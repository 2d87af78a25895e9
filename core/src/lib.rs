//! PQ Explorer: offline extraction of Power Query sources from Office and Power BI packages.
//!
//! This crate provides functionality for:
//! - Locating and unwrapping the DataMashup envelope of `.xlsx`, `.pbix` and `.pbit` files
//! - Recovering `shared` query declarations and their dependencies from M section text
//! - Decoding the compressed tabular data model when no M source is stored
//! - Previewing worksheet data, profiling columns and exporting rows to CSV or Parquet
//!
//! # Quick Start
//!
//! ```ignore
//! use pq_explorer::{ExtractConfig, InputFile, process_batch};
//!
//! let bytes = std::fs::read("report.pbix")?;
//! let batch = process_batch(&[InputFile::new("report.pbix", bytes)], &ExtractConfig::default());
//!
//! for query in &batch.files[0].queries {
//!     println!("{} = {}", query.name, query.raw_code);
//! }
//! ```

mod abf;
mod addressing;
mod config;
mod container;
mod data_model;
mod datamashup;
mod datamashup_framing;
mod datamashup_package;
pub mod error_codes;
mod excel_open_xml;
pub mod export;
mod graph;
mod grid_parser;
mod huffman;
mod m_deps;
mod m_lexer;
mod m_section;
mod output;
mod package;
mod profile;
mod progress;
mod session;
mod sqlite_pages;
mod tabular_schema;
mod vertipaq;
mod workbook;
mod xpress;

pub use abf::{AbfArchive, LogEntry, VirtualFile};
pub use addressing::{address_to_index, col_ref_to_index};
pub use config::{ConfigError, ExtractConfig, ExtractConfigBuilder};
pub use container::{
    ContainerError, ContainerKind, ContainerLimits, LocatedMashup, MashupPayload, OpcContainer,
    sniff_container,
};
pub use data_model::{
    DATA_MODEL_PART, DataModelContents, DataModelDecoder, DataModelError, ModelColumn, ModelTable,
    PartitionQuery, decode_data_model,
};
pub use datamashup::{DataMashup, Permissions, build_data_mashup, parse_permissions, trailer_sections};
pub use datamashup_framing::{
    DataMashupError, RawDataMashup, decode_datamashup_base64, decode_mashup_payload,
    parse_data_mashup, read_datamashup_text,
};
pub use datamashup_package::{
    DataMashupLimits, EmbeddedContent, PackageParts, SECTION_PART, SectionDocument,
    parse_package_parts, parse_package_parts_with_limits,
};
pub use excel_open_xml::{WorkbookPreviews, WorksheetError, has_workbook, read_worksheet_previews};
pub use export::{ExportArtifact, ExportError, ExportFormat, TableRef, export_table};
pub use graph::{DependencyGraph, build_dependency_graph};
pub use grid_parser::{GridParseError, SheetDescriptor};
pub use m_deps::{CrossFileRef, find_cross_file_refs, find_dependencies};
pub use m_lexer::{MaskedSource, QuotedSpan, StringSpan, mask_source};
pub use m_section::{
    DEFAULT_SECTION_NAME, DependencyEdge, Query, QueryKey, ScanAnomaly, SectionAnalysis,
    parse_section,
};
pub use output::json::{
    BatchDocument, serialize_batch_result, serialize_batch_result_pretty, serialize_file_result,
};
pub use output::json_lines::JsonLinesWriter;
pub use package::{
    BatchResult, FileIssue, FileKind, FileResult, FileStatus, InputFile, MODEL_RECOVERY_NOTE,
    PackageError, SCHEMA_RECOVERY_NOTE, TableInfo, process_batch, process_file,
    process_file_with_progress,
};
#[cfg(feature = "std-fs")]
pub use package::process_path;
pub use profile::{
    ColumnProfile, ColumnStats, ValueCount, compute_column_stats, profile_preview,
    render_data_profile,
};
pub use progress::{NoProgress, ProgressCallback, Step, Task};
pub use session::{ExtractSession, FileIdentity};
pub use tabular_schema::{DataModelSchema, SchemaError, parse_data_model_schema};
pub use vertipaq::{ColumnType, Dictionary, RawValue, SegmentMeta, decode_idf, parse_dictionary, parse_idfmeta};
pub use workbook::{CellValue, PreviewSource, WorksheetPreview};
pub use xpress::{ChunkFormat, Decompressor, XcaHuffman, XpressError, decompress_data_model};
