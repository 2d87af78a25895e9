//! Parquet export through the `parquet` crate's file writer.
//!
//! Every column is OPTIONAL. Columns whose present values are all numeric become
//! `DOUBLE`, everything else `BYTE_ARRAY` annotated as UTF8. Each step writes one
//! row group of at most `chunk_rows` rows; a table without rows has none.

use std::sync::Arc;

use parquet::basic::{ConvertedType, Repetition, Type as PhysicalType};
use parquet::data_type::{ByteArray, ByteArrayType, DoubleType};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::types::Type;

use super::{ExportArtifact, ExportError, TableRef};
use crate::progress::{Step, Task};
use crate::workbook::CellValue;

pub const PARQUET_MIME: &str = "application/vnd.apache.parquet";
const CREATED_BY: &str = concat!("pq_explorer version ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Double,
    Utf8,
}

fn numeric_value(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Number(n) => Some(*n),
        CellValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn column_kind(table: &TableRef<'_>, column: usize) -> ColumnKind {
    let mut present = (0..table.rows.len())
        .map(|row| table.cell(row, column))
        .filter(|cell| !cell.is_missing())
        .peekable();
    if present.peek().is_some() && present.all(|cell| numeric_value(cell).is_some()) {
        ColumnKind::Double
    } else {
        ColumnKind::Utf8
    }
}

fn build_schema(table: &TableRef<'_>, kinds: &[ColumnKind]) -> Result<Type, ExportError> {
    let fields = table
        .headers
        .iter()
        .zip(kinds)
        .map(|(name, kind)| {
            let field = match kind {
                ColumnKind::Double => Type::primitive_type_builder(name, PhysicalType::DOUBLE),
                ColumnKind::Utf8 => Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY)
                    .with_converted_type(ConvertedType::UTF8),
            };
            let field = field.with_repetition(Repetition::OPTIONAL).build()?;
            Ok::<_, ExportError>(Arc::new(field))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Type::group_type_builder("schema")
        .with_fields(fields)
        .build()?)
}

/// Parquet encoder writing one row group per step.
pub struct ParquetExport<'a> {
    table: TableRef<'a>,
    kinds: Vec<ColumnKind>,
    chunk_rows: usize,
    next_row: usize,
    writer: Option<SerializedFileWriter<Vec<u8>>>,
}

impl<'a> ParquetExport<'a> {
    pub fn new(table: TableRef<'a>, chunk_rows: usize) -> Result<Self, ExportError> {
        if table.headers.is_empty() {
            return Err(ExportError::NoColumns);
        }
        let kinds: Vec<_> = (0..table.headers.len())
            .map(|column| column_kind(&table, column))
            .collect();
        let schema = Arc::new(build_schema(&table, &kinds)?);
        let props = Arc::new(
            WriterProperties::builder()
                .set_created_by(CREATED_BY.to_string())
                .build(),
        );
        let writer = SerializedFileWriter::new(Vec::new(), schema, props)?;
        Ok(Self {
            table,
            kinds,
            chunk_rows: chunk_rows.max(1),
            next_row: 0,
            writer: Some(writer),
        })
    }

    fn write_row_group(
        &self,
        writer: &mut SerializedFileWriter<Vec<u8>>,
        rows: std::ops::Range<usize>,
    ) -> Result<(), ExportError> {
        let mut group = writer.next_row_group()?;
        let mut column = 0;
        while let Some(mut chunk) = group.next_column()? {
            let mut levels = Vec::with_capacity(rows.len());
            match self.kinds[column] {
                ColumnKind::Double => {
                    let mut values = Vec::new();
                    for row in rows.clone() {
                        let value = numeric_value(self.table.cell(row, column));
                        levels.push(i16::from(value.is_some()));
                        values.extend(value);
                    }
                    chunk
                        .typed::<DoubleType>()
                        .write_batch(&values, Some(levels.as_slice()), None)?;
                }
                ColumnKind::Utf8 => {
                    let mut values = Vec::new();
                    for row in rows.clone() {
                        let text = self.table.cell(row, column).display_text();
                        levels.push(i16::from(text.is_some()));
                        values.extend(text.map(|t| ByteArray::from(t.as_bytes().to_vec())));
                    }
                    chunk
                        .typed::<ByteArrayType>()
                        .write_batch(&values, Some(levels.as_slice()), None)?;
                }
            }
            chunk.close()?;
            column += 1;
        }
        group.close()?;
        Ok(())
    }
}

impl Task for ParquetExport<'_> {
    type Output = ExportArtifact;
    type Error = ExportError;

    fn step(&mut self) -> Result<Step<ExportArtifact>, ExportError> {
        let total = self.table.rows.len();
        let Some(mut writer) = self.writer.take() else {
            return Err(ExportError::Finished);
        };
        if self.next_row >= total {
            return Ok(Step::Done(ExportArtifact {
                bytes: writer.into_inner()?,
                mime: PARQUET_MIME,
                extension: "parquet",
            }));
        }
        let end = (self.next_row + self.chunk_rows).min(total);
        self.write_row_group(&mut writer, self.next_row..end)?;
        self.writer = Some(writer);
        self.next_row = end;
        Ok(Step::Yield {
            phase: "parquet",
            progress: self.next_row as f32 / total as f32,
        })
    }
}

pub fn export_parquet(table: TableRef<'_>, chunk_rows: usize) -> Result<ExportArtifact, ExportError> {
    ParquetExport::new(table, chunk_rows)?.run_to_completion()
}
