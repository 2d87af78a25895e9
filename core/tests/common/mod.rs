//! In-memory package fixtures shared across integration tests.

#![allow(dead_code)]

use std::io::{Cursor, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(bytes).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Inner DataMashup archive holding `section` as `Formulas/Section1.m`.
pub fn mashup_package(section: &str) -> Vec<u8> {
    zip_bytes(&[
        (
            "[Content_Types].xml",
            br#"<?xml version="1.0" encoding="utf-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="m" ContentType="application/x-ms-m"/></Types>"#
                .as_slice(),
        ),
        (
            "Config/Package.xml",
            br#"<?xml version="1.0" encoding="utf-8"?><Package xmlns="http://schemas.microsoft.com/DataMashup"><Version>2.0.0</Version></Package>"#
                .as_slice(),
        ),
        ("Formulas/Section1.m", section.as_bytes()),
    ])
}

/// `version | length | package | trailer`.
pub fn envelope(package: &[u8], trailer: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + package.len() + trailer.len());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(package.len() as u32).to_le_bytes());
    out.extend_from_slice(package);
    out.extend_from_slice(trailer);
    out
}

/// `customXml/item1.xml` body: UTF-16LE with BOM, base64 envelope inside `DataMashup`.
pub fn custom_xml_item(envelope: &[u8]) -> Vec<u8> {
    let xml = format!(
        r#"<?xml version="1.0" encoding="utf-16"?><DataMashup xmlns="http://schemas.microsoft.com/DataMashup">{}</DataMashup>"#,
        STANDARD.encode(envelope)
    );
    let mut out = vec![0xFF, 0xFE];
    for unit in xml.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// `sheet1.xml` with one `<row>` per entry; numbers are written as numeric cells,
/// everything else as inline `str` cells.
pub fn sheet_xml(rows: &[&[&str]]) -> String {
    let mut xml = String::from(
        r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let addr = format!("{}{}", column_letters(c), r + 1);
            if value.parse::<f64>().is_ok() {
                xml.push_str(&format!(r#"<c r="{addr}"><v>{value}</v></c>"#));
            } else {
                xml.push_str(&format!(r#"<c r="{addr}" t="str"><v>{value}</v></c>"#));
            }
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn column_letters(mut idx: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).expect("ascii")
}

pub const WORKBOOK_XML: &str = r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Data" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
pub const WORKBOOK_RELS: &str = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

/// An `.xlsx` with one sheet named `Data` and, optionally, a Power Query section.
pub fn workbook_bytes(rows: &[&[&str]], section: Option<&str>) -> Vec<u8> {
    let sheet = sheet_xml(rows);
    let item = section.map(|section| custom_xml_item(&envelope(&mashup_package(section), &[])));
    let mut entries: Vec<(&str, &[u8])> = vec![
        ("xl/workbook.xml", WORKBOOK_XML.as_bytes()),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS.as_bytes()),
        ("xl/worksheets/sheet1.xml", sheet.as_bytes()),
    ];
    if let Some(item) = &item {
        entries.push(("customXml/item1.xml", item.as_slice()));
    }
    zip_bytes(&entries)
}

/// A `.pbix`-style package with the envelope at the root `DataMashup` part.
pub fn pbix_bytes(section: &str) -> Vec<u8> {
    let raw = envelope(&mashup_package(section), &[]);
    zip_bytes(&[("DataMashup", raw.as_slice()), ("Version", b"1.28".as_slice())])
}

/// `DataModelSchema` JSON encoded as UTF-16LE, the way templates store it.
pub fn data_model_schema(json: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in json.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

pub const SALES_SECTION: &str = r#"section Section1;

shared Source = let
    Raw = Csv.Document(File.Contents("C:\data\sales.csv"), [Delimiter=","]),
    Typed = Table.TransformColumnTypes(Raw, {{"Amount", type number}})
in
    Typed;

shared #"FactOnlineSales Agg" = Table.Group(Source, {"Region"}, {{"Total", each List.Sum([Amount]), type number}});

shared Report = let
    // uses the aggregate, not "Source"
    Agg = #"FactOnlineSales Agg"
in
    Agg;
"#;
