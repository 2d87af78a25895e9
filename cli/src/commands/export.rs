use anyhow::{Context, Result};
use pq_explorer::{ExportFormat, ExtractConfig, TableRef, export_table};
use std::path::Path;
use std::process::ExitCode;

pub fn run(
    path: &Path,
    sheet: Option<&str>,
    format: ExportFormat,
    output: &Path,
    rows: Option<usize>,
    mut config: ExtractConfig,
) -> Result<ExitCode> {
    // Exports read from the preview, so its cap is the requested row count.
    config.preview_row_limit = rows.unwrap_or(usize::MAX).max(1);
    config.include_data_model = true;

    let file = super::open_tables(path, &config)?;
    let preview = super::find_preview(&file, sheet)?;
    let table = TableRef::from_preview(preview)
        .with_context(|| format!("Cannot export \"{}\"", preview.sheet_name))?;

    let artifact = export_table(table, format, config.export_chunk_rows)
        .with_context(|| format!("Failed to encode \"{}\"", preview.sheet_name))?;
    std::fs::write(output, &artifact.bytes)
        .with_context(|| format!("Failed to write export: {}", output.display()))?;

    log::info!(
        "wrote {} rows of \"{}\" to {} ({}, {} bytes)",
        preview.rows.len(),
        preview.sheet_name,
        output.display(),
        artifact.mime,
        artifact.bytes.len()
    );
    Ok(ExitCode::SUCCESS)
}
