use pq_explorer::{
    ExportFormat, ExtractConfig, ExtractSession, FileResult, TableRef, WorksheetPreview,
    export_table, process_file, render_data_profile, serialize_file_result,
};
use wasm_bindgen::prelude::*;

fn to_js(message: String) -> JsValue {
    JsValue::from_str(&message)
}

fn export_config() -> ExtractConfig {
    ExtractConfig {
        preview_row_limit: usize::MAX,
        ..ExtractConfig::default()
    }
}

fn pick_sheet<'f>(file: &'f FileResult, sheet: Option<&str>) -> Result<&'f WorksheetPreview, String> {
    let found = match sheet {
        Some(name) => file.worksheet(name),
        None => file.worksheets.first(),
    };
    found.ok_or_else(|| match sheet {
        Some(name) => format!("No sheet or table named \"{}\" in {}", name, file.name),
        None => format!("{} has no worksheet or model table", file.name),
    })
}

fn export_sheet(
    bytes: &[u8],
    name: &str,
    sheet: Option<&str>,
    format: ExportFormat,
) -> Result<Vec<u8>, String> {
    let config = export_config();
    let file = process_file(name, bytes, &config);
    let preview = pick_sheet(&file, sheet)?;
    let table = TableRef::from_preview(preview).map_err(|e| e.to_string())?;
    export_table(table, format, config.export_chunk_rows)
        .map(|artifact| artifact.bytes)
        .map_err(|e| format!("Failed to export \"{}\": {}", preview.sheet_name, e))
}

/// Extracts one file with default limits and returns its result as JSON.
#[wasm_bindgen]
pub fn process_file_json(bytes: &[u8], name: &str) -> Result<String, JsValue> {
    let file = process_file(name, bytes, &ExtractConfig::default());
    serialize_file_result(&file)
        .map_err(|e| to_js(format!("Failed to serialize result: {}", e)))
}

#[wasm_bindgen]
pub fn export_csv(bytes: &[u8], name: &str, sheet: Option<String>) -> Result<Vec<u8>, JsValue> {
    export_sheet(bytes, name, sheet.as_deref(), ExportFormat::Csv).map_err(to_js)
}

#[wasm_bindgen]
pub fn export_parquet(bytes: &[u8], name: &str, sheet: Option<String>) -> Result<Vec<u8>, JsValue> {
    export_sheet(bytes, name, sheet.as_deref(), ExportFormat::Parquet).map_err(to_js)
}

/// Markdown column profile of every preview in the file.
#[wasm_bindgen]
pub fn profile_markdown(bytes: &[u8], name: &str) -> String {
    let config = ExtractConfig::default();
    let file = process_file(name, bytes, &config);
    render_data_profile(&file.worksheets, config.top_k)
}

#[wasm_bindgen]
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Upload cache for a page session: identical re-uploads are answered from memory.
#[wasm_bindgen]
pub struct ExtractorSession {
    inner: ExtractSession,
}

#[wasm_bindgen]
impl ExtractorSession {
    #[wasm_bindgen(constructor)]
    pub fn new() -> ExtractorSession {
        ExtractorSession {
            inner: ExtractSession::new(ExtractConfig::default()),
        }
    }

    pub fn process_file_json(&mut self, bytes: &[u8], name: &str) -> Result<String, JsValue> {
        let file = self.inner.process_file(name, bytes);
        serialize_file_result(&file)
            .map_err(|e| to_js(format!("Failed to serialize result: {}", e)))
    }

    pub fn file_count(&self) -> usize {
        self.inner.len()
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl Default for ExtractorSession {
    fn default() -> Self {
        Self::new()
    }
}
