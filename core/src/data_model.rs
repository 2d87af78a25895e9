//! Compressed data-model decoding.
//!
//! Used when a package carries no readable M source but does carry a `DataModel`
//! part. The part is decompressed, opened as a backup stream, its SQLite metadata
//! catalog read, and then every column decoded from its storage files. Each stage
//! is a step of [`DataModelDecoder`] so large models do not stall the caller.
//!
//! The layout is only partially known; [`DataModelError::UnsupportedModelLayout`]
//! is an expected outcome for encodings this decoder does not handle.

use std::mem;
use std::ops::Range;

use log::{debug, warn};
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

use crate::abf::AbfArchive;
use crate::error_codes;
use crate::progress::{Step, Task};
use crate::sqlite_pages::{SqliteDb, SqliteTable};
use crate::vertipaq::{
    ColumnEncoding, ColumnType, decode_idf, materialize_column, parse_dictionary, parse_idfmeta,
};
use crate::workbook::{CellValue, PreviewSource, WorksheetPreview};
use crate::xpress::{ChunkedDecompression, Decompressor, XpressError, XcaHuffman};

pub const DATA_MODEL_PART: &str = "DataModel";
const METADATA_FILE: &str = "metadata.sqlitedb";
const INTERNAL_TABLE_PREFIXES: [&str; 3] = ["H$", "R$", "U$"];
const ROW_NUMBER_PREFIX: &str = "RowNumber-";
const PARTITION_TYPE_M: i64 = 4;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DataModelError {
    #[error("data model decompression failed: {0}")]
    Decompression(#[from] XpressError),
    #[error("unsupported data model layout: {0}")]
    UnsupportedModelLayout(String),
}

impl DataModelError {
    pub fn code(&self) -> &'static str {
        match self {
            DataModelError::Decompression(_) => error_codes::MODEL_DECOMPRESSION,
            DataModelError::UnsupportedModelLayout(_) => error_codes::MODEL_UNSUPPORTED_LAYOUT,
        }
    }

    pub(crate) fn layout(message: impl Into<String>) -> Self {
        DataModelError::UnsupportedModelLayout(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelColumn {
    pub name: String,
    pub data_type: ColumnType,
}

/// A model table with every row materialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelTable {
    pub name: String,
    pub columns: Vec<ModelColumn>,
    pub rows: Vec<Vec<CellValue>>,
}

impl ModelTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The first `row_limit` rows as a preview.
    pub fn to_preview(&self, file_name: &str, row_limit: usize) -> WorksheetPreview {
        WorksheetPreview {
            file_name: file_name.to_string(),
            sheet_name: self.name.clone(),
            source: PreviewSource::DataModel,
            headers: self.columns.iter().map(|c| c.name.clone()).collect(),
            rows: self.rows.iter().take(row_limit).cloned().collect(),
            total_rows: self.rows.len(),
            truncated: self.rows.len() > row_limit,
        }
    }
}

/// M expression of a table partition, as kept in the model metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionQuery {
    pub table: String,
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataModelContents {
    pub tables: Vec<ModelTable>,
    pub partitions: Vec<PartitionQuery>,
}

#[derive(Debug, Clone)]
enum PlannedEncoding {
    Dictionary { file: Range<usize>, base_id: i64 },
    Value { base_id: i64, magnitude: f64, nullable: bool },
}

#[derive(Debug, Clone)]
struct ColumnPlan {
    table: usize,
    name: String,
    data_type: ColumnType,
    idf: Range<usize>,
    idfmeta: Range<usize>,
    encoding: PlannedEncoding,
}

struct ColumnJob {
    backup: Vec<u8>,
    plans: Vec<ColumnPlan>,
    next: usize,
    tables: Vec<ModelTable>,
    columns: Vec<Vec<Vec<CellValue>>>,
    partitions: Vec<PartitionQuery>,
}

enum State<'a, D: Decompressor> {
    Decompressing(ChunkedDecompression<'a, D>),
    Catalog(Vec<u8>),
    Columns(ColumnJob),
    Finished,
}

/// Incremental decoder over one `DataModel` part.
pub struct DataModelDecoder<'a, D: Decompressor = XcaHuffman> {
    state: State<'a, D>,
    row_budget: u64,
}

impl<'a> DataModelDecoder<'a, XcaHuffman> {
    pub fn new(part: &'a [u8], max_decompressed_bytes: u64) -> Self {
        Self::with_codec(part, XcaHuffman, max_decompressed_bytes)
    }
}

impl<'a, D: Decompressor> DataModelDecoder<'a, D> {
    pub fn with_codec(part: &'a [u8], codec: D, max_decompressed_bytes: u64) -> Self {
        Self {
            state: State::Decompressing(ChunkedDecompression::new(
                part,
                codec,
                max_decompressed_bytes,
            )),
            row_budget: row_budget(max_decompressed_bytes),
        }
    }
}

impl<D: Decompressor> Task for DataModelDecoder<'_, D> {
    type Output = DataModelContents;
    type Error = DataModelError;

    fn step(&mut self) -> Result<Step<DataModelContents>, DataModelError> {
        match mem::replace(&mut self.state, State::Finished) {
            State::Decompressing(mut job) => {
                if job.step()? {
                    let progress = job.progress();
                    self.state = State::Decompressing(job);
                    return Ok(Step::Yield {
                        phase: "decompress",
                        progress,
                    });
                }
                let backup = job.finish();
                debug!("DataModel decompressed to {} bytes", backup.len());
                self.state = State::Catalog(backup);
                Ok(Step::Yield {
                    phase: "decompress",
                    progress: 1.0,
                })
            }
            State::Catalog(backup) => {
                let job = plan_columns(backup)?;
                debug!(
                    "model catalog: {} tables, {} columns, {} partitions",
                    job.tables.len(),
                    job.plans.len(),
                    job.partitions.len()
                );
                self.state = State::Columns(job);
                Ok(Step::Yield {
                    phase: "catalog",
                    progress: 1.0,
                })
            }
            State::Columns(mut job) => {
                if job.next >= job.plans.len() {
                    return Ok(Step::Done(job.assemble()));
                }
                let plan = &job.plans[job.next];
                debug!("decoding model column '{}'", plan.name);
                let table = plan.table;
                let values = decode_column(&job.backup, plan, self.row_budget)?;
                job.columns[table].push(values);
                job.next += 1;
                let progress = job.next as f32 / job.plans.len() as f32;
                self.state = State::Columns(job);
                Ok(Step::Yield {
                    phase: "columns",
                    progress,
                })
            }
            State::Finished => Err(DataModelError::layout("decoder already finished")),
        }
    }
}

/// Runs [`DataModelDecoder`] to completion with the built-in codec.
pub fn decode_data_model(
    part: &[u8],
    max_decompressed_bytes: u64,
) -> Result<DataModelContents, DataModelError> {
    DataModelDecoder::new(part, max_decompressed_bytes).run_to_completion()
}

impl ColumnJob {
    fn assemble(mut self) -> DataModelContents {
        for (table, columns) in self.tables.iter_mut().zip(self.columns) {
            let row_count = columns.iter().map(Vec::len).max().unwrap_or(0);
            if columns.iter().any(|c| c.len() != row_count) {
                warn!("model table '{}': columns disagree on row count", table.name);
            }
            let mut columns: Vec<_> = columns.into_iter().map(Vec::into_iter).collect();
            table.rows = (0..row_count)
                .map(|_| {
                    columns
                        .iter_mut()
                        .map(|c| c.next().unwrap_or(CellValue::Null))
                        .collect()
                })
                .collect();
        }
        DataModelContents {
            tables: self.tables,
            partitions: self.partitions,
        }
    }
}

/// Rows one column may declare: its data ids alone must fit in the
/// decompression budget.
fn row_budget(max_decompressed_bytes: u64) -> u64 {
    max_decompressed_bytes / mem::size_of::<u32>() as u64
}

fn decode_column(
    backup: &[u8],
    plan: &ColumnPlan,
    row_budget: u64,
) -> Result<Vec<CellValue>, DataModelError> {
    let segments = parse_idfmeta(&backup[plan.idfmeta.clone()])?;
    let ids = decode_idf(&backup[plan.idf.clone()], &segments, row_budget)?;
    let values = match &plan.encoding {
        PlannedEncoding::Dictionary { file, base_id } => {
            let dictionary = parse_dictionary(&backup[file.clone()])?;
            let encoding = ColumnEncoding::Dictionary {
                dictionary: &dictionary,
                base_id: *base_id,
            };
            materialize_column(&ids, &encoding, plan.data_type)
        }
        PlannedEncoding::Value {
            base_id,
            magnitude,
            nullable,
        } => {
            let encoding = ColumnEncoding::Value {
                base_id: *base_id,
                magnitude: *magnitude,
                nullable: *nullable,
            };
            materialize_column(&ids, &encoding, plan.data_type)
        }
    };
    Ok(values)
}

fn required(db: &SqliteDb<'_>, name: &str) -> Result<SqliteTable, DataModelError> {
    db.table(name)?
        .ok_or_else(|| DataModelError::layout(format!("metadata table '{name}' missing")))
}

/// Reads the metadata catalog and resolves every column's storage files.
fn plan_columns(backup: Vec<u8>) -> Result<ColumnJob, DataModelError> {
    let abf = AbfArchive::parse(&backup)?;
    let db = SqliteDb::open(abf.get_data_slice(METADATA_FILE)?)?;

    let table_rows = required(&db, "Table")?;
    let column_rows = required(&db, "Column")?;
    let storage_rows = required(&db, "ColumnStorage")?;
    let partition_storage_rows = required(&db, "ColumnPartitionStorage")?;
    let file_rows = required(&db, "StorageFile")?;
    let dictionary_rows = required(&db, "DictionaryStorage")?;

    let file_names: FxHashMap<i64, &str> = file_rows
        .rows()
        .filter_map(|r| Some((r.int("ID")?, r.text("FileName")?)))
        .collect();
    let dictionary_of_storage: FxHashMap<i64, i64> = storage_rows
        .rows()
        .filter_map(|r| Some((r.int("ID")?, r.int("DictionaryStorageID")?)))
        .collect();
    let mut file_of_storage: FxHashMap<i64, i64> = FxHashMap::default();
    for row in partition_storage_rows.rows() {
        if let (Some(storage), Some(file)) = (row.int("ColumnStorageID"), row.int("StorageFileID")) {
            file_of_storage.entry(storage).or_insert(file);
        }
    }
    let dictionaries: FxHashMap<i64, _> = dictionary_rows
        .rows()
        .filter_map(|r| r.int("ID").map(|id| (id, r)))
        .collect();

    let mut tables = Vec::new();
    let mut table_index: FxHashMap<i64, usize> = FxHashMap::default();
    for row in table_rows.rows() {
        let (Some(id), Some(name)) = (row.int("ID"), row.text("Name")) else {
            continue;
        };
        if INTERNAL_TABLE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        table_index.insert(id, tables.len());
        tables.push(ModelTable {
            name: name.to_string(),
            columns: Vec::new(),
            rows: Vec::new(),
        });
    }

    let mut plans = Vec::new();
    for row in column_rows.rows() {
        let Some(&table) = row.int("TableID").and_then(|id| table_index.get(&id)) else {
            continue;
        };
        let Some(name) = row.text("ExplicitName").or_else(|| row.text("InferredName")) else {
            continue;
        };
        if name.starts_with(ROW_NUMBER_PREFIX) {
            continue;
        }
        let Some(storage) = row.int("ColumnStorageID") else {
            continue;
        };
        let data_type = ColumnType::from_code(
            row.int("ExplicitDataType")
                .or_else(|| row.int("DataType"))
                .unwrap_or(0),
        );

        let idf_name = file_of_storage
            .get(&storage)
            .and_then(|file| file_names.get(file))
            .ok_or_else(|| DataModelError::layout(format!("column '{name}' has no storage file")))?;
        let idf = abf.get_data_range(idf_name)?;
        let idfmeta = abf.get_data_range(&format!("{idf_name}meta"))?;

        let dictionary = dictionary_of_storage
            .get(&storage)
            .and_then(|id| dictionaries.get(id));
        let base_id = dictionary.and_then(|d| d.int("BaseId")).unwrap_or(0);
        let dictionary_file = dictionary
            .and_then(|d| d.int("StorageFileID"))
            .and_then(|file| file_names.get(&file));
        let encoding = match dictionary_file {
            Some(file) => PlannedEncoding::Dictionary {
                file: abf.get_data_range(file)?,
                base_id,
            },
            None => PlannedEncoding::Value {
                base_id,
                magnitude: dictionary.and_then(|d| d.real("Magnitude")).unwrap_or(1.0),
                nullable: dictionary.and_then(|d| d.int("IsNullable")).unwrap_or(0) != 0,
            },
        };

        tables[table].columns.push(ModelColumn {
            name: name.to_string(),
            data_type,
        });
        plans.push(ColumnPlan {
            table,
            name: name.to_string(),
            data_type,
            idf,
            idfmeta,
            encoding,
        });
    }

    let partitions = read_partitions(&db, &tables, &table_index)?;
    let columns = vec![Vec::new(); tables.len()];
    Ok(ColumnJob {
        backup,
        plans,
        next: 0,
        tables,
        columns,
        partitions,
    })
}

fn read_partitions(
    db: &SqliteDb<'_>,
    tables: &[ModelTable],
    table_index: &FxHashMap<i64, usize>,
) -> Result<Vec<PartitionQuery>, DataModelError> {
    let Some(partition_rows) = db.table("Partition")? else {
        return Ok(Vec::new());
    };
    Ok(partition_rows
        .rows()
        .filter(|r| r.int("Type").is_none_or(|ty| ty == PARTITION_TYPE_M))
        .filter_map(|r| {
            let table = tables.get(*table_index.get(&r.int("TableID")?)?)?;
            let expression = r.text("QueryDefinition")?.trim();
            if expression.is_empty() {
                return None;
            }
            Some(PartitionQuery {
                table: table.name.clone(),
                name: r.text("Name").unwrap_or(&table.name).to_string(),
                expression: expression.to_string(),
            })
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod fixture {
    use crate::abf::build_abf;
    use crate::sqlite_pages::SqlValue::{self, Integer, Null, Real, Text};
    use crate::sqlite_pages::test_db::{TableSpec, build};
    use crate::vertipaq::dictionary::encode::{Page, string_dictionary};
    use crate::vertipaq::idf::{encode_idfmeta, encode_segment};
    use crate::vertipaq::SegmentMeta;

    fn t(s: &str) -> SqlValue {
        Text(s.to_string())
    }

    fn meta(rows: u64, width: u32) -> Vec<u8> {
        encode_idfmeta(&[SegmentMeta {
            row_count: rows,
            min_data_id: 0,
            bit_width: width,
        }])
    }

    /// Backup stream for a model with one `Sales` table of three rows
    /// (Region text, Amount decimal, OrderDate date), an internal `H$` table,
    /// a `RowNumber-` column and one M partition.
    pub(crate) fn sales_backup() -> Vec<u8> {
        let metadata = build(
            4096,
            16,
            &[
                TableSpec {
                    name: "Table",
                    sql: "CREATE TABLE [Table] (ID INTEGER PRIMARY KEY, Name TEXT)",
                    rows: vec![vec![Integer(1), t("Sales")], vec![Integer(2), t("H$Sales (12)$Region")]],
                },
                TableSpec {
                    name: "Column",
                    sql: "CREATE TABLE [Column] (ID INTEGER PRIMARY KEY, TableID INTEGER, ExplicitName TEXT, ExplicitDataType INTEGER, ColumnStorageID INTEGER)",
                    rows: vec![
                        vec![Integer(1), Integer(1), t("Region"), Integer(2), Integer(10)],
                        vec![Integer(2), Integer(1), t("Amount"), Integer(10), Integer(11)],
                        vec![Integer(3), Integer(1), t("RowNumber-2662979B"), Integer(6), Integer(12)],
                        vec![Integer(4), Integer(1), t("OrderDate"), Integer(9), Integer(13)],
                        vec![Integer(5), Integer(2), t("Key"), Integer(6), Integer(14)],
                    ],
                },
                TableSpec {
                    name: "ColumnStorage",
                    sql: "CREATE TABLE ColumnStorage (ID INTEGER PRIMARY KEY, DictionaryStorageID INTEGER)",
                    rows: vec![
                        vec![Integer(10), Integer(20)],
                        vec![Integer(11), Integer(21)],
                        vec![Integer(13), Integer(23)],
                    ],
                },
                TableSpec {
                    name: "DictionaryStorage",
                    sql: "CREATE TABLE DictionaryStorage (ID INTEGER PRIMARY KEY, BaseId INTEGER, Magnitude REAL, IsNullable INTEGER, StorageFileID INTEGER)",
                    rows: vec![
                        vec![Integer(20), Integer(0), Real(1.0), Integer(0), Integer(30)],
                        vec![Integer(21), Integer(0), Real(1.0), Integer(1), Null],
                        vec![Integer(23), Integer(44000), Real(1.0), Integer(0), Null],
                    ],
                },
                TableSpec {
                    name: "ColumnPartitionStorage",
                    sql: "CREATE TABLE ColumnPartitionStorage (ID INTEGER PRIMARY KEY, ColumnStorageID INTEGER, StorageFileID INTEGER)",
                    rows: vec![
                        vec![Integer(40), Integer(10), Integer(31)],
                        vec![Integer(41), Integer(11), Integer(32)],
                        vec![Integer(42), Integer(13), Integer(33)],
                    ],
                },
                TableSpec {
                    name: "StorageFile",
                    sql: "CREATE TABLE StorageFile (ID INTEGER PRIMARY KEY, FileName TEXT)",
                    rows: vec![
                        vec![Integer(30), t("Sales (12).tbl\\0.Sales (12).Region (45).dictionary")],
                        vec![Integer(31), t("Sales (12).tbl\\0.Sales (12).Region (45).0.idf")],
                        vec![Integer(32), t("Sales (12).tbl\\0.Sales (12).Amount (46).0.idf")],
                        vec![Integer(33), t("Sales (12).tbl\\0.Sales (12).OrderDate (47).0.idf")],
                    ],
                },
                TableSpec {
                    name: "Partition",
                    sql: "CREATE TABLE Partition (ID INTEGER PRIMARY KEY, TableID INTEGER, Name TEXT, QueryDefinition TEXT, Type INTEGER)",
                    rows: vec![
                        vec![Integer(50), Integer(1), t("Sales-7f3a"), t("let Source = Csv.Document(File.Contents(\"C:\\sales.csv\")) in Source"), Integer(4)],
                        vec![Integer(51), Integer(1), t("Calc"), t("ROW(1)"), Integer(2)],
                    ],
                },
            ],
        );

        let region_dictionary = string_dictionary(&[Page::Plain(&["EU", "US"])]);
        let region_idf = encode_segment(&[(0xFFFF_FFFF, 3)], &[0b010]);
        let amount_idf = encode_segment(&[(123_400, 1), (0, 1), (5_000, 1)], &[]);
        let date_idf = encode_segment(&[(927, 1), (928, 1), (927, 1)], &[]);

        build_abf(&[
            ("Model.db\\metadata.sqlitedb", &metadata),
            ("Model.db\\Sales (12).tbl\\0.Sales (12).Region (45).dictionary", &region_dictionary),
            ("Model.db\\Sales (12).tbl\\0.Sales (12).Region (45).0.idf", &region_idf),
            ("Model.db\\Sales (12).tbl\\0.Sales (12).Region (45).0.idfmeta", &meta(3, 1)),
            ("Model.db\\Sales (12).tbl\\0.Sales (12).Amount (46).0.idf", &amount_idf),
            ("Model.db\\Sales (12).tbl\\0.Sales (12).Amount (46).0.idfmeta", &meta(3, 0)),
            ("Model.db\\Sales (12).tbl\\0.Sales (12).OrderDate (47).0.idf", &date_idf),
            ("Model.db\\Sales (12).tbl\\0.Sales (12).OrderDate (47).0.idfmeta", &meta(3, 0)),
        ])
    }

    /// `backup` framed as a `DataModel` part of stored (uncompressed) chunks.
    pub(crate) fn stored_part(backup: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = crate::xpress::signature_bytes(crate::xpress::XPRESS_SIGNATURE);
        for piece in backup.chunks(chunk) {
            out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
            out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
            out.extend_from_slice(piece);
        }
        out
    }
}
