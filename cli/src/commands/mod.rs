pub mod export;
pub mod extract;
pub mod profile;

use anyhow::{Context, Result, bail};
use pq_explorer::{ExtractConfig, FileResult, InputFile, WorksheetPreview, process_path};
use std::path::Path;

pub fn read_input(path: &Path) -> Result<InputFile> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(InputFile::new(name, bytes))
}

/// Processes a single file for the table-oriented commands; a failed file is an error here.
pub fn open_tables(path: &Path, config: &ExtractConfig) -> Result<FileResult> {
    let file = process_path(path, config)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    if file.is_failed()
        && let Some(issue) = file.errors.first()
    {
        bail!("{} could not be read: [{}] {}", file.name, issue.code, issue.message);
    }
    Ok(file)
}

pub fn find_preview<'f>(file: &'f FileResult, sheet: Option<&str>) -> Result<&'f WorksheetPreview> {
    match sheet {
        Some(name) => file.worksheet(name).with_context(|| {
            let known: Vec<&str> = file.worksheets.iter().map(|w| w.sheet_name.as_str()).collect();
            format!("No sheet or table named \"{}\" in {} (found: {})", name, file.name, known.join(", "))
        }),
        None => file
            .worksheets
            .first()
            .with_context(|| format!("{} has no worksheet or model table to read", file.name)),
    }
}
