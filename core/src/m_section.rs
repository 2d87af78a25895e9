//! Declaration extraction for M section documents.
//!
//! The scanner walks the masked source (see [`crate::m_lexer`]) so that `;`,
//! brackets and keywords inside comments, strings and quoted identifiers never
//! split a declaration. Malformed input never aborts the scan: whatever can be
//! recovered is returned alongside a list of [`ScanAnomaly`] values.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

use log::debug;
use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::error_codes;
use crate::m_deps::{CrossFileRef, find_cross_file_refs, find_dependencies};
use crate::m_lexer::{MaskedSource, ident_end, is_ident_continue, is_ident_start, mask_source};

pub const DEFAULT_SECTION_NAME: &str = "Section1";

/// Identity of a query across a batch: the file it came from plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QueryKey {
    pub file: String,
    pub name: String,
}

impl QueryKey {
    pub fn new(file: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.file, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    pub name: String,
    /// Expression text after `=` up to the terminating `;`, comments included.
    pub raw_code: String,
    pub source_file: String,
    pub section_name: String,
    pub depends_on: BTreeSet<String>,
    #[serde(skip)]
    pub statement: Range<usize>,
    #[serde(skip)]
    pub body: Range<usize>,
}

impl Query {
    pub fn key(&self) -> QueryKey {
        QueryKey::new(&self.source_file, &self.name)
    }
}

/// `from` must be evaluated before `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DependencyEdge {
    pub from: QueryKey,
    pub to: QueryKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanAnomaly {
    MissingSectionHeader,
    UnterminatedLiteral { offset: usize },
    UnbalancedNesting { offset: usize },
    UnexpectedClose { offset: usize },
    InvalidDeclaration { offset: usize },
    DuplicateName { name: String, offset: usize },
}

impl ScanAnomaly {
    pub fn code(&self) -> &'static str {
        error_codes::M_SECTION_SYNTAX
    }
}

impl fmt::Display for ScanAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanAnomaly::MissingSectionHeader => {
                write!(f, "no section header; using '{DEFAULT_SECTION_NAME}'")
            }
            ScanAnomaly::UnterminatedLiteral { offset } => {
                write!(f, "unterminated literal or comment at offset {offset}")
            }
            ScanAnomaly::UnbalancedNesting { offset } => {
                write!(f, "unbalanced brackets or let/in in statement at offset {offset}")
            }
            ScanAnomaly::UnexpectedClose { offset } => {
                write!(f, "unexpected closing bracket at offset {offset}")
            }
            ScanAnomaly::InvalidDeclaration { offset } => {
                write!(f, "malformed shared declaration at offset {offset}")
            }
            ScanAnomaly::DuplicateName { name, offset } => {
                write!(f, "duplicate query '{name}' at offset {offset}; first kept")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionAnalysis {
    pub section_name: String,
    pub queries: Vec<Query>,
    pub edges: Vec<DependencyEdge>,
    pub cross_file_refs: Vec<CrossFileRef>,
    pub anomalies: Vec<ScanAnomaly>,
}

impl SectionAnalysis {
    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }
}

#[derive(Debug)]
struct Declaration {
    name: String,
    statement: Range<usize>,
    body: Range<usize>,
}

/// Extracts every `shared` declaration of `source` with its same-file dependencies.
///
/// Offsets in the returned spans refer to `source` with any leading BOM removed.
pub fn parse_section(source: &str, source_file: &str) -> SectionAnalysis {
    let source = source.strip_prefix('\u{FEFF}').unwrap_or(source);
    let mask = mask_source(source);
    let mut scanner = SectionScanner::new(source, &mask);

    let section_name = scanner.section_header();
    let declarations = scanner.declarations();
    let mut anomalies = scanner.anomalies;
    let section_name = match section_name {
        Some(name) => name,
        None => {
            anomalies.insert(0, ScanAnomaly::MissingSectionHeader);
            DEFAULT_SECTION_NAME.to_string()
        }
    };

    let known: FxHashSet<&str> = declarations.iter().map(|d| d.name.as_str()).collect();
    let queries: Vec<Query> = declarations
        .iter()
        .map(|decl| Query {
            name: decl.name.clone(),
            raw_code: source[decl.body.clone()].trim().to_string(),
            source_file: source_file.to_string(),
            section_name: section_name.clone(),
            depends_on: find_dependencies(&mask, source, decl.body.clone(), &known, &decl.name),
            statement: decl.statement.clone(),
            body: decl.body.clone(),
        })
        .collect();

    let edges = queries
        .iter()
        .flat_map(|query| {
            query.depends_on.iter().map(|dep| DependencyEdge {
                from: QueryKey::new(source_file, dep),
                to: query.key(),
            })
        })
        .collect();

    let cross_file_refs = queries
        .iter()
        .flat_map(|query| find_cross_file_refs(&mask, source, query.body.clone(), &query.name))
        .collect();

    debug!(
        "section '{section_name}' in '{source_file}': {} queries, {} anomalies",
        queries.len(),
        anomalies.len()
    );

    SectionAnalysis {
        section_name,
        queries,
        edges,
        cross_file_refs,
        anomalies,
    }
}

enum StatementEnd {
    Semicolon(usize),
    Eof { balanced: bool },
}

struct SectionScanner<'a> {
    source: &'a str,
    mask: &'a MaskedSource,
    pos: usize,
    anomalies: Vec<ScanAnomaly>,
}

impl<'a> SectionScanner<'a> {
    fn new(source: &'a str, mask: &'a MaskedSource) -> Self {
        Self {
            source,
            mask,
            pos: 0,
            anomalies: Vec::new(),
        }
    }

    fn bytes(&self) -> &'a [u8] {
        &self.mask.masked
    }

    fn peek(&self) -> Option<u8> {
        self.bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self, limit: usize) {
        while self.pos < limit && self.bytes()[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn keyword_at(&self, kw: &str) -> bool {
        let bytes = self.bytes();
        let end = self.pos + kw.len();
        bytes.get(self.pos..end) == Some(kw.as_bytes())
            && bytes.get(end).is_none_or(|b| !is_ident_continue(*b))
            && (self.pos == 0 || !is_ident_continue(bytes[self.pos - 1]))
    }

    /// Skips `[ ... ]` attribute records that may precede a header or member.
    fn skip_attributes(&mut self, limit: usize) {
        loop {
            self.skip_ws(limit);
            if self.peek() != Some(b'[') {
                return;
            }
            let mut depth = 0usize;
            let mut close = None;
            for i in self.pos..limit {
                match self.bytes()[i] {
                    b'[' => depth += 1,
                    b']' => {
                        depth -= 1;
                        if depth == 0 {
                            close = Some(i);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            match close {
                Some(i) => self.pos = i + 1,
                None => return,
            }
        }
    }

    fn identifier(&mut self, limit: usize) -> Option<String> {
        let start = self.pos;
        if start >= limit {
            return None;
        }
        let b = self.bytes()[start];
        if b == b'#' {
            let span = self.mask.quoted_at(start)?;
            self.pos = span.end;
            return Some(span.name.clone());
        }
        if is_ident_start(b) {
            let end = ident_end(self.bytes(), start).min(limit);
            self.pos = end;
            return Some(self.source[start..end].to_string());
        }
        None
    }

    fn section_header(&mut self) -> Option<String> {
        let len = self.bytes().len();
        self.skip_attributes(len);
        self.skip_ws(len);
        let header_start = self.pos;
        if !self.keyword_at("section") {
            self.pos = 0;
            return None;
        }
        self.pos += "section".len();
        self.skip_ws(len);
        let name = self.identifier(len);
        self.skip_ws(len);
        if self.peek() == Some(b';') {
            self.pos += 1;
        } else {
            self.anomalies.push(ScanAnomaly::InvalidDeclaration {
                offset: header_start,
            });
        }
        Some(name.unwrap_or_else(|| DEFAULT_SECTION_NAME.to_string()))
    }

    /// Finds the `;` ending the statement at `from`. Only a `;` outside every
    /// bracket and every `let ... in` counts.
    fn statement_end(&mut self, from: usize) -> StatementEnd {
        let bytes = self.bytes();
        let mut depth = 0usize;
        let mut let_depth = 0usize;
        let mut i = from;

        while i < bytes.len() {
            match bytes[i] {
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => {
                    if depth == 0 {
                        self.anomalies.push(ScanAnomaly::UnexpectedClose { offset: i });
                    } else {
                        depth -= 1;
                    }
                }
                b';' if depth == 0 && let_depth == 0 => return StatementEnd::Semicolon(i),
                b'#' => {
                    if let Some(span) = self.mask.quoted_at(i) {
                        i = span.end;
                        continue;
                    }
                }
                b if is_ident_start(b) => {
                    let end = ident_end(bytes, i);
                    match &bytes[i..end] {
                        b"let" => let_depth += 1,
                        b"in" => let_depth = let_depth.saturating_sub(1),
                        _ => {}
                    }
                    i = end;
                    continue;
                }
                b if b.is_ascii_digit() => {
                    while i < bytes.len() && (is_ident_continue(bytes[i]) || bytes[i] == b'.') {
                        i += 1;
                    }
                    continue;
                }
                _ => {}
            }
            i += 1;
        }

        StatementEnd::Eof {
            balanced: depth == 0 && let_depth == 0,
        }
    }

    fn declarations(&mut self) -> Vec<Declaration> {
        let len = self.bytes().len();
        let mut out: Vec<Declaration> = Vec::new();

        loop {
            self.skip_ws(len);
            if self.pos >= len {
                break;
            }
            let start = self.pos;
            let (stmt_end, next) = match self.statement_end(start) {
                StatementEnd::Semicolon(i) => (i, i + 1),
                StatementEnd::Eof { balanced } => {
                    if let Some(offset) = self.mask.unterminated
                        && offset >= start
                    {
                        self.anomalies.push(ScanAnomaly::UnterminatedLiteral { offset });
                        break;
                    }
                    if !balanced {
                        self.anomalies.push(ScanAnomaly::UnbalancedNesting { offset: start });
                        break;
                    }
                    (len, len)
                }
            };

            if let Some(decl) = self.declaration(start, stmt_end) {
                if out.iter().any(|d| d.name == decl.name) {
                    self.anomalies.push(ScanAnomaly::DuplicateName {
                        name: decl.name,
                        offset: start,
                    });
                } else {
                    out.push(decl);
                }
            }
            self.pos = next;
        }

        if let Some(offset) = self.mask.unterminated
            && !self
                .anomalies
                .iter()
                .any(|a| matches!(a, ScanAnomaly::UnterminatedLiteral { .. }))
        {
            self.anomalies.push(ScanAnomaly::UnterminatedLiteral { offset });
        }

        out
    }

    /// Parses `[attrs] shared <name> = <body>` within `start..end`.
    /// Statements that are not `shared` members are skipped silently.
    fn declaration(&mut self, start: usize, end: usize) -> Option<Declaration> {
        self.pos = start;
        self.skip_attributes(end);
        self.skip_ws(end);
        if !self.keyword_at("shared") {
            return None;
        }
        self.pos += "shared".len();
        self.skip_ws(end);

        let Some(name) = self.identifier(end) else {
            self.anomalies.push(ScanAnomaly::InvalidDeclaration { offset: start });
            return None;
        };
        self.skip_ws(end);

        let bytes = self.bytes();
        let is_assign =
            self.pos < end && bytes[self.pos] == b'=' && bytes.get(self.pos + 1) != Some(&b'>');
        if !is_assign {
            self.anomalies.push(ScanAnomaly::InvalidDeclaration { offset: start });
            return None;
        }

        Some(Declaration {
            name,
            statement: start..end,
            body: self.pos + 1..end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI_QUERY: &str = r#"section Section1;

shared RawOrders = let
    Source = Csv.Document(File.Contents("C:\Data\orders.csv"), [Delimiter=","]),
    Promoted = Table.PromoteHeaders(Source)
in
    Promoted;

shared Customers = let
    Source = #table({"Id", "Name"}, {{1, "Contoso"}})
in
    Source;

shared OrdersWithCustomers = let
    Joined = Table.NestedJoin(RawOrders, {"CustomerId"}, Customers, {"Id"}, "C", JoinKind.LeftOuter)
in
    Joined;

shared SalesSummary = let
    Grouped = Table.Group(OrdersWithCustomers, {"Region"}, {{"Total", each List.Sum([Amount]), type number}})
in
    Grouped;
"#;

    fn names(analysis: &SectionAnalysis) -> Vec<&str> {
        analysis.queries.iter().map(|q| q.name.as_str()).collect()
    }

    #[test]
    fn multi_query_section_yields_queries_and_edges() {
        let analysis = parse_section(MULTI_QUERY, "multi_query.xlsx");
        assert_eq!(analysis.section_name, "Section1");
        assert_eq!(
            names(&analysis),
            vec!["RawOrders", "Customers", "OrdersWithCustomers", "SalesSummary"]
        );
        assert!(analysis.anomalies.is_empty(), "{:?}", analysis.anomalies);

        let edges: Vec<(&str, &str)> = analysis
            .edges
            .iter()
            .map(|e| (e.from.name.as_str(), e.to.name.as_str()))
            .collect();
        assert_eq!(
            edges,
            vec![
                ("Customers", "OrdersWithCustomers"),
                ("RawOrders", "OrdersWithCustomers"),
                ("OrdersWithCustomers", "SalesSummary"),
            ]
        );

        assert_eq!(analysis.cross_file_refs.len(), 1);
        assert_eq!(analysis.cross_file_refs[0].query, "RawOrders");
        assert_eq!(analysis.cross_file_refs[0].file_name, "orders.csv");
    }

    #[test]
    fn raw_code_is_the_body_verbatim() {
        let analysis = parse_section(MULTI_QUERY, "f.xlsx");
        let customers = analysis.query("Customers").expect("query present");
        assert_eq!(
            customers.raw_code,
            "let\n    Source = #table({\"Id\", \"Name\"}, {{1, \"Contoso\"}})\nin\n    Source"
        );
        assert_eq!(customers.source_file, "f.xlsx");
        assert_eq!(customers.key(), QueryKey::new("f.xlsx", "Customers"));
    }

    #[test]
    fn quoted_names_and_delimiters_inside_literals() {
        let src = r#"section Section1;
shared #"FactOnlineSales Agg" = "a;b" & "c}";
shared TestQuery = let Source = #"FactOnlineSales Agg" in Source; // trailing ; comment
"#;
        let analysis = parse_section(src, "t.pbit");
        assert_eq!(names(&analysis), vec!["FactOnlineSales Agg", "TestQuery"]);
        assert_eq!(analysis.queries[0].raw_code, r#""a;b" & "c}""#);
        let deps: Vec<_> = analysis.queries[1].depends_on.iter().cloned().collect();
        assert_eq!(deps, vec!["FactOnlineSales Agg".to_string()]);
        assert!(analysis.anomalies.is_empty());
    }

    #[test]
    fn missing_header_uses_default_section() {
        let analysis = parse_section("shared A = 1;", "f");
        assert_eq!(analysis.section_name, DEFAULT_SECTION_NAME);
        assert_eq!(analysis.anomalies, vec![ScanAnomaly::MissingSectionHeader]);
        assert_eq!(analysis.queries[0].raw_code, "1");
    }

    #[test]
    fn attributes_and_private_members_are_skipped() {
        let src = "[Version = \"1.0\"] section Sec;\n[Description = \"x\"] shared A = 1;\nB = 2;\nshared C = A + B;";
        let analysis = parse_section(src, "f");
        assert_eq!(analysis.section_name, "Sec");
        assert_eq!(names(&analysis), vec!["A", "C"]);
        assert_eq!(analysis.queries[1].raw_code, "A + B");
        assert!(analysis.queries[1].depends_on.contains("A"));
    }

    #[test]
    fn last_statement_without_semicolon_is_kept_when_balanced() {
        let analysis = parse_section("section S;\nshared A = 1;\nshared B = let x = A in x\n", "f");
        assert_eq!(names(&analysis), vec!["A", "B"]);
        assert_eq!(analysis.queries[1].raw_code, "let x = A in x");
    }

    #[test]
    fn unterminated_string_keeps_earlier_queries() {
        let src = "section S;\nshared A = 1;\nshared B = \"open;\nshared C = 3;";
        let analysis = parse_section(src, "f");
        assert_eq!(names(&analysis), vec!["A"]);
        assert!(matches!(
            analysis.anomalies.as_slice(),
            [ScanAnomaly::UnterminatedLiteral { .. }]
        ));
    }

    #[test]
    fn unbalanced_tail_is_reported() {
        let src = "section S;\nshared A = 1;\nshared B = Table.Combine({A, ";
        let analysis = parse_section(src, "f");
        assert_eq!(names(&analysis), vec!["A"]);
        assert!(
            analysis
                .anomalies
                .iter()
                .any(|a| matches!(a, ScanAnomaly::UnbalancedNesting { .. }))
        );
    }

    #[test]
    fn duplicate_names_keep_the_first() {
        let analysis = parse_section("section S; shared A = 1; shared A = 2;", "f");
        assert_eq!(analysis.queries.len(), 1);
        assert_eq!(analysis.queries[0].raw_code, "1");
        assert!(matches!(
            analysis.anomalies.as_slice(),
            [ScanAnomaly::DuplicateName { name, .. }] if name == "A"
        ));
        assert_eq!(analysis.anomalies[0].code(), error_codes::M_SECTION_SYNTAX);
    }

    #[test]
    fn malformed_declaration_is_skipped() {
        let analysis = parse_section("section S; shared = 1; shared B = 2;", "f");
        assert_eq!(names(&analysis), vec!["B"]);
        assert!(matches!(
            analysis.anomalies.as_slice(),
            [ScanAnomaly::InvalidDeclaration { .. }]
        ));
    }

    #[test]
    fn empty_and_header_only_sections_have_no_queries() {
        assert!(parse_section("", "f").queries.is_empty());
        let analysis = parse_section("\u{FEFF}section Section1;\r\n", "f");
        assert!(analysis.queries.is_empty());
        assert!(analysis.anomalies.is_empty());
    }

    #[test]
    fn arbitrary_input_never_panics() {
        let mut seed = 0x2545_f491_u32;
        let alphabet = b"section shared let in ;=()[]{}\"#/*\n ab,";
        for _ in 0..200 {
            let mut text = String::new();
            for _ in 0..64 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                text.push(alphabet[(seed as usize) % alphabet.len()] as char);
            }
            let analysis = parse_section(&text, "fuzz");
            for query in &analysis.queries {
                assert!(query.body.end <= text.len());
            }
        }
    }
}
