//! Column statistics over preview data, computed on demand.

use std::fmt::Write as _;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::workbook::WorksheetPreview;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub distinct: usize,
    pub nulls: usize,
    pub is_numeric: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_values: Vec<ValueCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    pub stats: ColumnStats,
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Stats over one column; `None` and empty strings count as missing.
///
/// Numeric when every present value parses as a finite number (and at least one
/// is present): min/max/avg are filled. Otherwise the `top_k` most frequent values
/// are listed, ties broken by first appearance.
pub fn compute_column_stats<'v>(
    values: impl IntoIterator<Item = Option<&'v str>>,
    top_k: usize,
) -> ColumnStats {
    let mut counts: FxHashMap<&str, (usize, usize)> = FxHashMap::default();
    let mut nulls = 0;
    let mut numbers = Vec::new();
    let mut all_numeric = true;

    for value in values {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            nulls += 1;
            continue;
        };
        let first_seen = counts.len();
        counts.entry(value).or_insert((0, first_seen)).0 += 1;
        if all_numeric {
            match parse_number(value) {
                Some(n) => numbers.push(n),
                None => all_numeric = false,
            }
        }
    }

    let is_numeric = all_numeric && !counts.is_empty();
    let mut stats = ColumnStats {
        distinct: counts.len(),
        nulls,
        is_numeric,
        min: None,
        max: None,
        avg: None,
        top_values: Vec::new(),
    };

    if is_numeric {
        stats.min = numbers.iter().copied().reduce(f64::min);
        stats.max = numbers.iter().copied().reduce(f64::max);
        stats.avg = Some(numbers.iter().sum::<f64>() / numbers.len() as f64);
    } else {
        let mut ranked: Vec<(&str, usize, usize)> = counts
            .into_iter()
            .map(|(value, (count, first))| (value, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        stats.top_values = ranked
            .into_iter()
            .take(top_k)
            .map(|(value, count, _)| ValueCount {
                value: value.to_string(),
                count,
            })
            .collect();
    }
    stats
}

pub fn profile_preview(preview: &WorksheetPreview, top_k: usize) -> Vec<ColumnProfile> {
    preview
        .text_columns()
        .iter()
        .zip(&preview.headers)
        .map(|(column, name)| ColumnProfile {
            name: name.clone(),
            stats: compute_column_stats(column.iter().map(Option::as_deref), top_k),
        })
        .collect()
}

fn fmt_number(n: f64) -> String {
    let rounded = (n * 10_000.0).round() / 10_000.0;
    format!("{rounded}")
}

/// Markdown "Data Profile" block describing every column of `previews`.
pub fn render_data_profile(previews: &[WorksheetPreview], top_k: usize) -> String {
    let mut out = String::from("## Data Profile\n");
    for preview in previews {
        let _ = write!(
            out,
            "\n### {} / {} ({} rows",
            preview.file_name, preview.sheet_name, preview.total_rows
        );
        if preview.truncated {
            let _ = write!(out, ", profiled first {}", preview.rows.len());
        }
        out.push_str(")\n");

        for ColumnProfile { name, stats } in profile_preview(preview, top_k) {
            if stats.is_numeric {
                let _ = writeln!(
                    out,
                    "- **{name}** (numeric): distinct {}, nulls {}, min {}, max {}, avg {}",
                    stats.distinct,
                    stats.nulls,
                    stats.min.map(fmt_number).unwrap_or_default(),
                    stats.max.map(fmt_number).unwrap_or_default(),
                    stats.avg.map(fmt_number).unwrap_or_default(),
                );
            } else {
                let top: Vec<String> = stats
                    .top_values
                    .iter()
                    .map(|v| format!("{} ({})", v.value, v.count))
                    .collect();
                let _ = write!(
                    out,
                    "- **{name}** (text): distinct {}, nulls {}",
                    stats.distinct, stats.nulls
                );
                if !top.is_empty() {
                    let _ = write!(out, ", top: {}", top.join(", "));
                }
                out.push('\n');
            }
        }
    }
    out
}
