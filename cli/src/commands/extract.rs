use anyhow::{Context, Result};
use pq_explorer::{BatchResult, ExtractConfig, JsonLinesWriter, process_batch};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::OutputFormat;
use crate::output::{json::write_json_batch, text::write_text_batch};

pub fn run(
    paths: &[PathBuf],
    format: OutputFormat,
    profile: bool,
    config: &ExtractConfig,
) -> Result<ExitCode> {
    let inputs = paths
        .iter()
        .map(|path| super::read_input(path))
        .collect::<Result<Vec<_>>>()?;
    log::debug!("extracting {} file(s)", inputs.len());

    let batch = process_batch(&inputs, config);

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    match format {
        OutputFormat::Text => {
            write_text_batch(&mut handle, &batch, profile.then_some(config.top_k))?
        }
        OutputFormat::Json => write_json_batch(&mut handle, &batch)?,
        OutputFormat::Jsonl => write_jsonl_batch(&mut handle, &batch)?,
    }
    handle.flush()?;

    Ok(exit_code_for(&batch))
}

fn write_jsonl_batch<W: Write>(w: &mut W, batch: &BatchResult) -> Result<()> {
    let mut writer = JsonLinesWriter::new(w);
    writer
        .write_batch(batch)
        .context("Failed to write JSON lines")?;
    Ok(())
}

pub fn exit_code_for(batch: &BatchResult) -> ExitCode {
    if batch.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
