use csv::{QuoteStyle, Terminator, Writer, WriterBuilder};

use super::{ExportArtifact, ExportError, TableRef};
use crate::progress::{Step, Task};

pub const CSV_MIME: &str = "text/csv";

/// CSV encoder emitting `chunk_rows` rows per step. Fields are quoted only when
/// they hold a delimiter, quote or line break; missing cells are empty.
pub struct CsvExport<'a> {
    table: TableRef<'a>,
    chunk_rows: usize,
    next_row: usize,
    writer: Option<Writer<Vec<u8>>>,
    header_written: bool,
}

impl<'a> CsvExport<'a> {
    pub fn new(table: TableRef<'a>, chunk_rows: usize) -> Self {
        let writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Necessary)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        Self {
            table,
            chunk_rows: chunk_rows.max(1),
            next_row: 0,
            writer: Some(writer),
            header_written: false,
        }
    }
}

impl Task for CsvExport<'_> {
    type Output = ExportArtifact;
    type Error = ExportError;

    fn step(&mut self) -> Result<Step<ExportArtifact>, ExportError> {
        let total = self.table.rows.len();
        let table = self.table;
        let writer = self.writer.as_mut().ok_or(ExportError::Finished)?;
        if !self.header_written {
            writer.write_record(table.headers)?;
            self.header_written = true;
        } else if self.next_row < total {
            let end = (self.next_row + self.chunk_rows).min(total);
            for row in self.next_row..end {
                let fields = (0..table.headers.len()).map(|col| {
                    table
                        .cell(row, col)
                        .display_text()
                        .unwrap_or_default()
                        .into_owned()
                });
                writer.write_record(fields)?;
            }
            self.next_row = end;
        } else {
            let Some(writer) = self.writer.take() else {
                return Err(ExportError::Finished);
            };
            let bytes = writer
                .into_inner()
                .map_err(|e| ExportError::Csv(e.into_error().into()))?;
            return Ok(Step::Done(ExportArtifact {
                bytes,
                mime: CSV_MIME,
                extension: "csv",
            }));
        }
        Ok(Step::Yield {
            phase: "csv",
            progress: if total == 0 {
                1.0
            } else {
                self.next_row as f32 / total as f32
            },
        })
    }
}

pub fn export_csv(table: TableRef<'_>, chunk_rows: usize) -> Result<ExportArtifact, ExportError> {
    CsvExport::new(table, chunk_rows).run_to_completion()
}
