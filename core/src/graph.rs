//! Batch-wide query dependency graph.
//!
//! Same-file edges come straight from section analysis. A cross-file edge is
//! added when a query loads another file of the batch by name and also names
//! one of that file's queries in a string literal (the usual
//! `Source{[Item="Sales"]}` navigation after `Excel.Workbook(File.Contents(..))`).

use std::collections::BTreeSet;

use serde::Serialize;

use crate::m_deps::file_name_of;
use crate::m_lexer::mask_source;
use crate::m_section::{DependencyEdge, QueryKey};
use crate::package::FileResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyGraph {
    pub nodes: Vec<QueryKey>,
    pub edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Queries `key` reads from.
    pub fn dependencies_of<'g>(&'g self, key: &'g QueryKey) -> impl Iterator<Item = &'g QueryKey> {
        self.edges.iter().filter(move |e| &e.to == key).map(|e| &e.from)
    }

    /// Queries that read from `key`.
    pub fn dependents_of<'g>(&'g self, key: &'g QueryKey) -> impl Iterator<Item = &'g QueryKey> {
        self.edges.iter().filter(move |e| &e.from == key).map(|e| &e.to)
    }

    pub fn cross_file_edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter().filter(|e| e.from.file != e.to.file)
    }
}

pub fn build_dependency_graph(files: &[FileResult]) -> DependencyGraph {
    let mut nodes: BTreeSet<QueryKey> = BTreeSet::new();
    let mut edges: BTreeSet<DependencyEdge> = BTreeSet::new();

    for file in files {
        nodes.extend(file.queries.iter().map(|q| q.key()));
        edges.extend(file.edges.iter().cloned());
    }

    for file in files {
        for reference in &file.cross_file_refs {
            let Some(target) = files
                .iter()
                .find(|other| other.name != file.name && names_same_file(&other.name, &reference.file_name))
            else {
                continue;
            };
            let Some(consumer) = file
                .queries
                .iter()
                .find(|q| q.name == reference.query)
            else {
                continue;
            };
            let literals: BTreeSet<String> = mask_source(&consumer.raw_code)
                .string_literals
                .into_iter()
                .map(|s| s.value)
                .collect();
            for producer in target.queries.iter().filter(|q| literals.contains(&q.name)) {
                edges.insert(DependencyEdge {
                    from: producer.key(),
                    to: consumer.key(),
                });
            }
        }
    }

    DependencyGraph {
        nodes: nodes.into_iter().collect(),
        edges: edges.into_iter().collect(),
    }
}

fn names_same_file(batch_name: &str, referenced: &str) -> bool {
    !referenced.is_empty() && file_name_of(batch_name).eq_ignore_ascii_case(referenced)
}
