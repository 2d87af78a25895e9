use std::io::{self, Write};

use serde::Serialize;

use crate::output::json::SCHEMA_VERSION;
use crate::package::{BatchResult, FileResult};

#[derive(Serialize)]
struct JsonLinesHeader<'a> {
    record: &'static str,
    version: &'a str,
    files: usize,
}

#[derive(Serialize)]
struct JsonLinesRecord<'a, T: Serialize> {
    record: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

/// Writes a header line, one line per file, then one line for the dependency graph.
///
/// Each line is tagged with a `record` field; file lines keep their own `kind`.
pub struct JsonLinesWriter<W: Write> {
    w: W,
    wrote_header: bool,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            wrote_header: false,
        }
    }

    pub fn begin(&mut self, files: usize) -> io::Result<()> {
        if self.wrote_header {
            return Ok(());
        }
        let header = JsonLinesHeader {
            record: "Header",
            version: SCHEMA_VERSION,
            files,
        };
        self.line(&header)?;
        self.wrote_header = true;
        Ok(())
    }

    pub fn emit_file(&mut self, file: &FileResult) -> io::Result<()> {
        self.line(&JsonLinesRecord {
            record: "File",
            body: file,
        })
    }

    pub fn write_batch(&mut self, batch: &BatchResult) -> io::Result<()> {
        self.begin(batch.files.len())?;
        for file in &batch.files {
            self.emit_file(file)?;
        }
        self.line(&JsonLinesRecord {
            record: "Graph",
            body: &batch.dependency_graph(),
        })?;
        self.finish()
    }

    pub fn finish(&mut self) -> io::Result<()> {
        self.w.flush()
    }

    pub fn into_inner(self) -> W {
        self.w
    }

    fn line<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.w, value).map_err(io::Error::other)?;
        self.w.write_all(b"\n")
    }
}
