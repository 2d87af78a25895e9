use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::RowAccessor;
use pq_explorer::export::{export_csv, export_parquet};
use pq_explorer::{
    CellValue, ExportFormat, ExtractConfig, TableRef, compute_column_stats, export_table,
    process_file, render_data_profile,
};

mod common;
use common::workbook_bytes;

fn sample() -> (Vec<String>, Vec<Vec<CellValue>>) {
    let headers = vec!["Region".to_string(), "Amount".to_string()];
    let rows = vec![
        vec![CellValue::Text("EU, West".into()), CellValue::Number(10.5)],
        vec![CellValue::Text("US".into()), CellValue::Number(20.0)],
        vec![CellValue::Null, CellValue::Number(-3.0)],
    ];
    (headers, rows)
}

#[test]
fn csv_quotes_only_fields_that_need_it() {
    let headers = vec!["Text".to_string(), "Note".to_string()];
    let rows = vec![
        vec![CellValue::Text("hello,world".into()), CellValue::Text("a\"b".into())],
        vec![CellValue::Text("simple".into()), CellValue::Text("line\nbreak".into())],
    ];
    let artifact = export_csv(TableRef::new(&headers, &rows).expect("shape"), 10).expect("csv");
    assert_eq!(
        String::from_utf8(artifact.bytes).expect("utf-8"),
        "Text,Note\n\"hello,world\",\"a\"\"b\"\nsimple,\"line\nbreak\"\n"
    );
}

#[test]
fn csv_export_has_header_and_every_row() {
    let (headers, rows) = sample();
    let artifact = export_csv(TableRef::new(&headers, &rows).expect("shape"), 2).expect("csv");
    let text = String::from_utf8(artifact.bytes).expect("utf-8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["Region,Amount", "\"EU, West\",10.5", "US,20", ",-3"]);
}

#[test]
fn parquet_output_reads_back_with_the_parquet_crate() {
    let (headers, rows) = sample();
    let artifact =
        export_parquet(TableRef::new(&headers, &rows).expect("shape"), 2).expect("parquet");
    assert!(artifact.bytes.starts_with(b"PAR1"));
    assert!(artifact.bytes.ends_with(b"PAR1"));
    assert!(artifact.bytes.len() > 50);

    let reader = SerializedFileReader::new(Bytes::from(artifact.bytes)).expect("valid parquet");
    let meta = reader.metadata().file_metadata();
    assert_eq!(meta.num_rows(), 3);
    assert_eq!(reader.metadata().num_row_groups(), 2);
    let schema = meta.schema_descr();
    assert_eq!(schema.num_columns(), 2);
    assert_eq!(schema.column(0).name(), "Region");
    assert_eq!(schema.column(1).name(), "Amount");

    let rows: Vec<_> = reader
        .get_row_iter(None)
        .expect("row iterator")
        .map(|row| row.expect("row"))
        .collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get_string(0).expect("text"), "EU, West");
    assert_eq!(rows[0].get_double(1).expect("number"), 10.5);
    assert_eq!(rows[1].get_string(0).expect("text"), "US");
    assert_eq!(rows[2].get_double(1).expect("number"), -3.0);
}

#[test]
fn empty_parquet_still_has_a_schema() {
    let headers = vec!["Only".to_string()];
    let rows: Vec<Vec<CellValue>> = Vec::new();
    let artifact = export_table(
        TableRef::new(&headers, &rows).expect("shape"),
        ExportFormat::Parquet,
        100,
    )
    .expect("parquet");
    assert_eq!(artifact.extension, "parquet");

    let reader = SerializedFileReader::new(Bytes::from(artifact.bytes)).expect("valid parquet");
    assert_eq!(reader.metadata().file_metadata().num_rows(), 0);
    assert_eq!(reader.metadata().num_row_groups(), 0);
    assert_eq!(reader.metadata().file_metadata().schema_descr().num_columns(), 1);
}

#[test]
fn worksheet_preview_exports_and_profiles() {
    let bytes = workbook_bytes(
        &[
            &["Color", "Score"],
            &["Red", "10"],
            &["Blue", "20"],
            &["Red", "30"],
            &["", "40"],
        ],
        None,
    );
    let file = process_file("colors.xlsx", &bytes, &ExtractConfig::default());
    let sheet = file.worksheet("Data").expect("sheet");

    let csv = export_table(TableRef::from_preview(sheet).expect("shape"), ExportFormat::Csv, 1)
        .expect("csv");
    assert_eq!(
        String::from_utf8(csv.bytes).expect("utf-8"),
        "Color,Score\nRed,10\nBlue,20\nRed,30\n,40\n"
    );

    let profile = render_data_profile(std::slice::from_ref(sheet), 5);
    assert!(profile.contains("Data Profile"));
    assert!(profile.contains("distinct"));
    assert!(profile.contains("- **Score** (numeric): distinct 4, nulls 0, min 10, max 40, avg 25"));
    assert!(profile.contains("- **Color** (text): distinct 2, nulls 1, top: Red (2), Blue (1)"));
}

#[test]
fn numeric_and_categorical_stats() {
    let numeric = compute_column_stats(["10", "20", "30", "", "40"].map(Some), 5);
    assert_eq!((numeric.distinct, numeric.nulls, numeric.is_numeric), (4, 1, true));
    assert_eq!((numeric.min, numeric.max, numeric.avg), (Some(10.0), Some(40.0), Some(25.0)));

    let categorical = compute_column_stats(["Red", "Blue", "Red", "Green", "Red", "Blue"].map(Some), 5);
    assert_eq!((categorical.distinct, categorical.nulls), (3, 0));
    assert!(!categorical.is_numeric);
    assert_eq!(categorical.top_values[0].value, "Red");
    assert_eq!(categorical.top_values[0].count, 3);
}
