use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const SECTION: &str = r#"section Section1;

shared Source = Csv.Document(File.Contents("C:\data\sales.csv"));

shared Summary = Table.RowCount(Source);
"#;

const WORKBOOK_XML: &str = r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Data" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
const WORKBOOK_RELS: &str = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;
const SHEET_XML: &str = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="1"><c r="A1" t="str"><v>Name</v></c><c r="B1" t="str"><v>Score</v></c></row><row r="2"><c r="A2" t="str"><v>Ann, B</v></c><c r="B2"><v>3</v></c></row><row r="3"><c r="A3" t="str"><v>Cy</v></c><c r="B3"><v>5</v></c></row></sheetData></worksheet>"#;

fn pq_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pq-explorer"))
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(bytes).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

fn pbix_bytes() -> Vec<u8> {
    let package = zip_bytes(&[("Formulas/Section1.m", SECTION.as_bytes())]);
    let mut envelope = Vec::new();
    envelope.extend_from_slice(&0u32.to_le_bytes());
    envelope.extend_from_slice(&(package.len() as u32).to_le_bytes());
    envelope.extend_from_slice(&package);
    zip_bytes(&[("DataMashup", envelope.as_slice())])
}

fn workbook_bytes() -> Vec<u8> {
    zip_bytes(&[
        ("xl/workbook.xml", WORKBOOK_XML.as_bytes()),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS.as_bytes()),
        ("xl/worksheets/sheet1.xml", SHEET_XML.as_bytes()),
    ])
}

fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).expect("write fixture");
    path
}

fn run(args: &[&str]) -> Output {
    pq_cmd().args(args).output().expect("failed to run pq-explorer")
}

fn arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

#[test]
fn extract_text_lists_queries_and_exits_0() {
    let dir = TempDir::new().expect("temp dir");
    let pbix = write_file(&dir, "report.pbix", &pbix_bytes());

    let output = run(&["extract", arg(&pbix)]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("File: report.pbix (ok)"));
    assert!(stdout.contains("Queries: 2"));
    assert!(stdout.contains("\"Summary\" <- Source"));
    assert!(stdout.contains("sales.csv"));
}

#[test]
fn extract_json_is_a_versioned_document() {
    let dir = TempDir::new().expect("temp dir");
    let pbix = write_file(&dir, "report.pbix", &pbix_bytes());

    let output = run(&["extract", "--format", "json", arg(&pbix)]);
    assert!(output.status.success());
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid json");
    assert_eq!(doc["version"], "1");
    assert_eq!(doc["files"][0]["status"], "ok");
    assert_eq!(doc["files"][0]["kind"], "power_bi_report");
    assert_eq!(doc["files"][0]["queries"].as_array().map(Vec::len), Some(2));
}

#[test]
fn extract_jsonl_brackets_files_with_header_and_graph() {
    let dir = TempDir::new().expect("temp dir");
    let pbix = write_file(&dir, "report.pbix", &pbix_bytes());

    let output = run(&["extract", "--format", "jsonl", arg(&pbix)]);
    assert!(output.status.success());
    let lines: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["record"], "Header");
    assert_eq!(lines[1]["record"], "File");
    assert_eq!(lines[1]["name"], "report.pbix");
    assert_eq!(lines[1]["kind"], "power_bi_report");
    assert_eq!(lines[2]["record"], "Graph");
}

#[test]
fn one_corrupt_file_exits_1_but_reports_the_rest() {
    let dir = TempDir::new().expect("temp dir");
    let good = write_file(&dir, "report.pbix", &pbix_bytes());
    let bad = write_file(&dir, "broken.xlsx", b"this is not a zip archive");

    let output = run(&["extract", "--format", "json", arg(&bad), arg(&good)]);
    assert_eq!(output.status.code(), Some(1));
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid json");
    assert_eq!(doc["files"][0]["status"], "failed");
    assert_eq!(doc["files"][1]["status"], "ok");
}

#[test]
fn missing_input_exits_2() {
    let dir = TempDir::new().expect("temp dir");
    let missing = dir.path().join("nope.pbix");
    let output = run(&["extract", arg(&missing)]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read file"));
}

#[test]
fn invalid_config_exits_2() {
    let dir = TempDir::new().expect("temp dir");
    let pbix = write_file(&dir, "report.pbix", &pbix_bytes());
    let config = write_file(&dir, "config.json", br#"{ "preview_row_limit": 0 }"#);

    let output = run(&["--config", arg(&config), "extract", arg(&pbix)]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid config"));
}

#[test]
fn export_csv_writes_the_sheet() {
    let dir = TempDir::new().expect("temp dir");
    let xlsx = write_file(&dir, "scores.xlsx", &workbook_bytes());
    let out = dir.path().join("scores.csv");

    let output = run(&[
        "export",
        arg(&xlsx),
        "--sheet",
        "Data",
        "--format",
        "csv",
        "--output",
        arg(&out),
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let text = std::fs::read_to_string(&out).expect("export written");
    assert_eq!(text, "Name,Score\n\"Ann, B\",3\nCy,5\n");
}

#[test]
fn export_parquet_has_magic_bytes() {
    let dir = TempDir::new().expect("temp dir");
    let xlsx = write_file(&dir, "scores.xlsx", &workbook_bytes());
    let out = dir.path().join("scores.parquet");

    let output = run(&["export", arg(&xlsx), "--format", "parquet", "--output", arg(&out)]);
    assert!(output.status.success());
    let bytes = std::fs::read(&out).expect("export written");
    assert!(bytes.starts_with(b"PAR1"));
    assert!(bytes.ends_with(b"PAR1"));
}

#[test]
fn export_unknown_sheet_exits_2() {
    let dir = TempDir::new().expect("temp dir");
    let xlsx = write_file(&dir, "scores.xlsx", &workbook_bytes());
    let out = dir.path().join("x.csv");

    let output = run(&[
        "export",
        arg(&xlsx),
        "--sheet",
        "Missing",
        "--format",
        "csv",
        "--output",
        arg(&out),
    ]);
    assert_eq!(output.status.code(), Some(2));
    assert!(!out.exists());
}

#[test]
fn profile_prints_column_stats() {
    let dir = TempDir::new().expect("temp dir");
    let xlsx = write_file(&dir, "scores.xlsx", &workbook_bytes());

    let output = run(&["profile", arg(&xlsx), "--sheet", "Data"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("## Data Profile"));
    assert!(stdout.contains("- **Score** (numeric): distinct 2, nulls 0, min 3, max 5, avg 4"));
}
