use anyhow::Result;
use pq_explorer::{ExtractConfig, render_data_profile};
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

pub fn run(path: &Path, sheet: Option<&str>, config: &ExtractConfig) -> Result<ExitCode> {
    let file = super::open_tables(path, config)?;

    let rendered = match sheet {
        Some(_) => {
            let preview = super::find_preview(&file, sheet)?;
            render_data_profile(std::slice::from_ref(preview), config.top_k)
        }
        None if file.worksheets.is_empty() => {
            anyhow::bail!("{} has no worksheet or model table to profile", file.name)
        }
        None => render_data_profile(&file.worksheets, config.top_k),
    };

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    write!(handle, "{rendered}")?;
    handle.flush()?;
    Ok(ExitCode::SUCCESS)
}
