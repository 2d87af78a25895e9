use anyhow::Result;
use pq_explorer::{
    BatchResult, FileResult, FileStatus, PreviewSource, Query, WorksheetPreview,
    render_data_profile,
};
use std::io::Write;

/// Human-readable report; `profile_top_k` appends a data profile per file.
pub fn write_text_batch<W: Write>(
    w: &mut W,
    batch: &BatchResult,
    profile_top_k: Option<usize>,
) -> Result<()> {
    for file in &batch.files {
        write_file(w, file)?;
        if let Some(top_k) = profile_top_k
            && !file.worksheets.is_empty()
        {
            writeln!(w)?;
            write!(w, "{}", render_data_profile(&file.worksheets, top_k))?;
        }
        writeln!(w)?;
    }

    let graph = batch.dependency_graph();
    let cross: Vec<_> = graph.cross_file_edges().collect();
    if !cross.is_empty() {
        writeln!(w, "Cross-file dependencies:")?;
        for edge in cross {
            writeln!(w, "  {} -> {}", edge.from, edge.to)?;
        }
        writeln!(w)?;
    }

    write_summary(w, batch)
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Ok => "ok",
        FileStatus::NoQueries => "no Power Query found",
        FileStatus::Failed => "failed",
    }
}

fn write_file<W: Write>(w: &mut W, file: &FileResult) -> Result<()> {
    writeln!(w, "File: {} ({})", file.name, status_label(file.status))?;

    if !file.queries.is_empty() {
        writeln!(w, "Queries: {}", file.queries.len())?;
        for query in &file.queries {
            write_query(w, query)?;
        }
    }

    if !file.cross_file_refs.is_empty() {
        writeln!(w, "External files:")?;
        for reference in &file.cross_file_refs {
            let via = reference
                .function
                .as_deref()
                .map(|f| format!(" via {}", f))
                .unwrap_or_default();
            writeln!(w, "  - {} -> {}{}", reference.query, reference.path, via)?;
        }
    }

    if !file.tables.is_empty() {
        writeln!(w, "Model tables: {}", file.tables.len())?;
        for table in &file.tables {
            writeln!(
                w,
                "  - \"{}\" {} columns, {} rows",
                table.name,
                table.columns.len(),
                table.row_count
            )?;
        }
    }

    let sheets: Vec<&WorksheetPreview> = file
        .worksheets
        .iter()
        .filter(|p| p.source == PreviewSource::Worksheet)
        .collect();
    if !sheets.is_empty() {
        writeln!(w, "Worksheets: {}", sheets.len())?;
        for sheet in sheets {
            let shown = if sheet.truncated {
                format!(" (previewing {})", sheet.rows.len())
            } else {
                String::new()
            };
            writeln!(
                w,
                "  - \"{}\" {} columns, {} rows{}",
                sheet.sheet_name,
                sheet.column_count(),
                sheet.total_rows,
                shown
            )?;
        }
    }

    for note in &file.notes {
        writeln!(w, "Note: {}", note)?;
    }
    for issue in &file.errors {
        writeln!(w, "Error [{}]: {}", issue.code, issue.message)?;
    }
    Ok(())
}

fn write_query<W: Write>(w: &mut W, query: &Query) -> Result<()> {
    if query.depends_on.is_empty() {
        writeln!(w, "  - \"{}\"", query.name)?;
    } else {
        let deps: Vec<&str> = query.depends_on.iter().map(String::as_str).collect();
        writeln!(w, "  - \"{}\" <- {}", query.name, deps.join(", "))?;
    }
    Ok(())
}

fn write_summary<W: Write>(w: &mut W, batch: &BatchResult) -> Result<()> {
    let queries: usize = batch.files.iter().map(|f| f.queries.len()).sum();
    let failed = batch.files.iter().filter(|f| f.is_failed()).count();
    writeln!(w, "--- Summary ---")?;
    writeln!(w, "Files: {}", batch.files.len())?;
    writeln!(w, "Queries: {}", queries)?;
    if failed > 0 {
        writeln!(w, "Failed: {}", failed)?;
    }
    Ok(())
}
