use serde::Serialize;

use crate::graph::DependencyGraph;
use crate::package::{BatchResult, FileResult};

pub const SCHEMA_VERSION: &str = "1";

/// Top-level JSON document: every file plus the batch dependency graph.
#[derive(Debug, Serialize)]
pub struct BatchDocument<'a> {
    pub version: &'static str,
    pub files: &'a [FileResult],
    pub dependency_graph: DependencyGraph,
}

impl<'a> BatchDocument<'a> {
    pub fn new(batch: &'a BatchResult) -> Self {
        Self {
            version: SCHEMA_VERSION,
            files: &batch.files,
            dependency_graph: batch.dependency_graph(),
        }
    }
}

pub fn serialize_batch_result(batch: &BatchResult) -> serde_json::Result<String> {
    serde_json::to_string(&BatchDocument::new(batch))
}

pub fn serialize_batch_result_pretty(batch: &BatchResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&BatchDocument::new(batch))
}

pub fn serialize_file_result(file: &FileResult) -> serde_json::Result<String> {
    serde_json::to_string(file)
}
