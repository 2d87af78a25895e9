mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pq_explorer::{ExportFormat, ExtractConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "pq-explorer")]
#[command(about = "Extract Power Query sources and data previews from Excel and Power BI files")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Load extraction limits from a JSON file")]
    pub config: Option<PathBuf>,
    #[arg(long, short, global = true, help = "Log pipeline stages to stderr")]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Extract queries, dependencies and previews from one or more files")]
    Extract {
        #[arg(required = true, help = "Workbooks, reports or templates to read")]
        files: Vec<PathBuf>,
        #[arg(long, short, value_enum, default_value = "text", help = "Output format")]
        format: OutputFormat,
        #[arg(long, help = "Append a column profile of every preview (text format only)")]
        profile: bool,
    },
    #[command(about = "Export a worksheet or model table to CSV or Parquet")]
    Export {
        #[arg(help = "File holding the table")]
        file: PathBuf,
        #[arg(long, help = "Sheet or table name (defaults to the first one)")]
        sheet: Option<String>,
        #[arg(long, short, value_enum, help = "Export format")]
        format: ExportKind,
        #[arg(long, short, value_name = "PATH", help = "Where to write the export")]
        output: PathBuf,
        #[arg(long, value_name = "N", help = "Export at most N data rows")]
        rows: Option<usize>,
    },
    #[command(about = "Print column statistics for a worksheet or model table")]
    Profile {
        #[arg(help = "File holding the table")]
        file: PathBuf,
        #[arg(long, help = "Sheet or table name (defaults to every one)")]
        sheet: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Jsonl,
}

#[derive(Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ExportKind {
    Csv,
    Parquet,
}

impl From<ExportKind> for ExportFormat {
    fn from(kind: ExportKind) -> Self {
        match kind {
            ExportKind::Csv => ExportFormat::Csv,
            ExportKind::Parquet => ExportFormat::Parquet,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Extract {
            files,
            format,
            profile,
        } => commands::extract::run(&files, format, profile, &config),
        Commands::Export {
            file,
            sheet,
            format,
            output,
            rows,
        } => commands::export::run(&file, sheet.as_deref(), format.into(), &output, rows, config),
        Commands::Profile { file, sheet } => commands::profile::run(&file, sheet.as_deref(), &config),
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ExtractConfig> {
    let Some(path) = path else {
        return Ok(ExtractConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    ExtractConfig::from_json(&text)
        .with_context(|| format!("Invalid config: {}", path.display()))
}
