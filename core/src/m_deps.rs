//! Dependency and cross-file reference scanning over masked M bodies.

use std::collections::BTreeSet;
use std::ops::Range;

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::m_lexer::{MaskedSource, ident_end, is_ident_continue, is_ident_start};

/// Functions whose first string argument names a file or location.
const LOADER_FUNCTIONS: &[&str] = &[
    "File.Contents",
    "Folder.Files",
    "Folder.Contents",
    "Excel.Workbook",
    "Csv.Document",
    "Json.Document",
    "Xml.Tables",
    "Xml.Document",
    "Parquet.Document",
    "Access.Database",
    "Pdf.Tables",
    "Web.Contents",
    "SharePoint.Files",
];

const DATA_FILE_EXTENSIONS: &[&str] = &[
    ".xlsx", ".xlsm", ".xlsb", ".xls", ".csv", ".tsv", ".txt", ".json", ".xml", ".parquet",
    ".pbix", ".pbit", ".accdb", ".mdb", ".pdf",
];

const KEYWORDS: &[&str] = &[
    "and", "as", "each", "else", "error", "false", "if", "in", "is", "let", "meta", "not", "null",
    "or", "otherwise", "section", "shared", "then", "true", "try", "type",
];

/// A file named inside a query body. Informational only; never traversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossFileRef {
    pub query: String,
    /// Loader call the path was passed to, when one was recognized.
    pub function: Option<String>,
    pub path: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Name(&'a str),
    Keyword(&'a str),
    Str(&'a str),
    Punct(u8),
    Other,
}

fn tokenize<'a>(mask: &'a MaskedSource, source: &'a str, body: Range<usize>) -> Vec<Token<'a>> {
    let masked = &mask.masked;
    let end = body.end.min(masked.len());
    let mut tokens = Vec::new();
    let mut i = body.start;

    while i < end {
        let b = masked[i];
        if b.is_ascii_whitespace() {
            i += 1;
        } else if b == b'#' && masked.get(i + 1) == Some(&b'"') {
            match mask.quoted_at(i) {
                Some(span) => {
                    tokens.push(Token::Name(span.name.as_str()));
                    i = span.end;
                }
                None => i = end,
            }
        } else if b == b'#' {
            i += 1;
            if i < end && is_ident_start(masked[i]) {
                i = ident_end(masked, i).min(end);
            }
            tokens.push(Token::Other);
        } else if b == b'"' {
            match mask.string_at(i) {
                Some(span) => {
                    tokens.push(Token::Str(span.value.as_str()));
                    i = span.end;
                }
                None => i = end,
            }
        } else if is_ident_start(b) {
            let word_end = ident_end(masked, i).min(end);
            let word = &source[i..word_end];
            if KEYWORDS.contains(&word) {
                tokens.push(Token::Keyword(word));
            } else {
                tokens.push(Token::Name(word));
            }
            i = word_end;
        } else if b.is_ascii_digit() {
            while i < end && (is_ident_continue(masked[i]) || masked[i] == b'.') {
                i += 1;
            }
            tokens.push(Token::Other);
        } else {
            tokens.push(Token::Punct(b));
            i += 1;
        }
    }
    tokens
}

/// `name =` directly after `let`, `,` or `[`: a binding or record-field name.
fn is_binding_position(tokens: &[Token<'_>], idx: usize) -> bool {
    let followed_by_assign = tokens.get(idx + 1) == Some(&Token::Punct(b'='))
        && tokens.get(idx + 2) != Some(&Token::Punct(b'>'));
    let prev = idx.checked_sub(1).map(|p| tokens[p]);
    followed_by_assign
        && matches!(
            prev,
            Some(Token::Keyword("let")) | Some(Token::Punct(b',')) | Some(Token::Punct(b'['))
        )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Let,
    Record,
    Group,
}

/// Names bound by a `let` or by a function's parameter list.
fn local_names<'a>(tokens: &[Token<'a>]) -> FxHashSet<&'a str> {
    let mut locals = FxHashSet::default();
    let mut scopes = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        match *token {
            Token::Keyword("let") => scopes.push(Scope::Let),
            Token::Keyword("in") => {
                if scopes.last() == Some(&Scope::Let) {
                    scopes.pop();
                }
            }
            Token::Punct(b'[') => scopes.push(Scope::Record),
            Token::Punct(b'(' | b'{') => scopes.push(Scope::Group),
            Token::Punct(b']' | b')' | b'}') => {
                while scopes.last() == Some(&Scope::Let) {
                    scopes.pop();
                }
                scopes.pop();
            }
            Token::Name(name) if is_binding_position(tokens, idx) => {
                let let_binding = match tokens[idx - 1] {
                    Token::Keyword("let") => true,
                    Token::Punct(b',') => scopes.last() == Some(&Scope::Let),
                    _ => false,
                };
                if let_binding {
                    locals.insert(name);
                }
            }
            _ => {}
        }
    }
    locals.extend(parameter_names(tokens));
    locals
}

/// Parameters of every `(a, optional b as table) [as type] =>` list.
fn parameter_names<'a>(tokens: &[Token<'a>]) -> Vec<&'a str> {
    let mut names = Vec::new();
    for (close, token) in tokens.iter().enumerate() {
        if *token != Token::Punct(b')') {
            continue;
        }
        let mut next = close + 1;
        if tokens.get(next) == Some(&Token::Keyword("as")) {
            next += 2;
        }
        let arrow = tokens.get(next) == Some(&Token::Punct(b'='))
            && tokens.get(next + 1) == Some(&Token::Punct(b'>'));
        if !arrow {
            continue;
        }
        let Some(open) = matching_open(tokens, close) else {
            continue;
        };
        for idx in open + 1..close {
            let Token::Name(name) = tokens[idx] else {
                continue;
            };
            let after_separator = matches!(
                tokens[idx - 1],
                Token::Punct(b'(' | b',') | Token::Name("optional")
            );
            let ends_parameter = matches!(
                tokens[idx + 1],
                Token::Punct(b',' | b')') | Token::Keyword("as")
            );
            if after_separator && ends_parameter {
                names.push(name);
            }
        }
    }
    names
}

fn matching_open(tokens: &[Token<'_>], close: usize) -> Option<usize> {
    let mut depth = 0usize;
    for idx in (0..close).rev() {
        match tokens[idx] {
            Token::Punct(b')') => depth += 1,
            Token::Punct(b'(') if depth == 0 => return Some(idx),
            Token::Punct(b'(') => depth -= 1,
            _ => {}
        }
    }
    None
}

/// `[name]`: a field access, not a reference.
fn is_field_access(tokens: &[Token<'_>], idx: usize) -> bool {
    idx > 0
        && tokens[idx - 1] == Token::Punct(b'[')
        && tokens.get(idx + 1) == Some(&Token::Punct(b']'))
}

/// Names from `known` referenced by the body at `body`, excluding `self_name`.
///
/// Quoted identifiers match only as whole decoded names and binding or field
/// names are skipped. A name bound by `let` or by a function parameter inside the
/// body shadows the query; record fields do not.
pub fn find_dependencies(
    mask: &MaskedSource,
    source: &str,
    body: Range<usize>,
    known: &FxHashSet<&str>,
    self_name: &str,
) -> BTreeSet<String> {
    let tokens = tokenize(mask, source, body);

    let locals = local_names(&tokens);

    tokens
        .iter()
        .enumerate()
        .filter_map(|(idx, token)| match token {
            Token::Name(name)
                if *name != self_name
                    && known.contains(name)
                    && !locals.contains(name)
                    && !is_binding_position(&tokens, idx)
                    && !is_field_access(&tokens, idx) =>
            {
                Some((*name).to_string())
            }
            _ => None,
        })
        .collect()
}

/// Literal file paths passed to loader calls, plus other string literals that
/// look like data-file paths.
pub fn find_cross_file_refs(
    mask: &MaskedSource,
    source: &str,
    body: Range<usize>,
    query: &str,
) -> Vec<CrossFileRef> {
    let tokens = tokenize(mask, source, body);
    let mut refs: Vec<CrossFileRef> = Vec::new();
    let mut seen_paths: FxHashSet<&str> = FxHashSet::default();

    for (idx, token) in tokens.iter().enumerate() {
        let Token::Name(function) = token else {
            continue;
        };
        if !LOADER_FUNCTIONS.contains(function) || tokens.get(idx + 1) != Some(&Token::Punct(b'(')) {
            continue;
        }
        if let Some(Token::Str(path)) = tokens.get(idx + 2)
            && !path.trim().is_empty()
            && seen_paths.insert(path)
        {
            refs.push(CrossFileRef {
                query: query.to_string(),
                function: Some((*function).to_string()),
                path: (*path).to_string(),
                file_name: file_name_of(path).to_string(),
            });
        }
    }

    for token in &tokens {
        if let Token::Str(path) = token
            && looks_like_data_file(path)
            && seen_paths.insert(path)
        {
            refs.push(CrossFileRef {
                query: query.to_string(),
                function: None,
                path: (*path).to_string(),
                file_name: file_name_of(path).to_string(),
            });
        }
    }

    refs
}

/// Last path segment, accepting both separators and URLs.
pub fn file_name_of(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches(['/', '\\']);
    let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    without_query
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(without_query)
}

fn looks_like_data_file(text: &str) -> bool {
    let lower = text.trim().to_ascii_lowercase();
    !lower.contains(char::is_whitespace)
        && DATA_FILE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext) && lower.len() > ext.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::m_lexer::mask_source;

    fn deps(code: &str, known: &[&str], self_name: &str) -> Vec<String> {
        let mask = mask_source(code);
        let known: FxHashSet<&str> = known.iter().copied().collect();
        find_dependencies(&mask, code, 0..code.len(), &known, self_name)
            .into_iter()
            .collect()
    }

    #[test]
    fn quoted_dependency_is_matched_whole() {
        let code = r#"let Source = #"FactOnlineSales Agg" in Source"#;
        let found = deps(code, &["FactOnlineSales Agg", "FactOnlineSales"], "TestQuery");
        assert_eq!(found, vec!["FactOnlineSales Agg".to_string()]);
    }

    #[test]
    fn identifier_boundaries_are_respected() {
        let code = "let a = SalesData, b = Sales2 in Table.Combine({a, b})";
        let found = deps(code, &["Sales", "SalesData"], "Q");
        assert_eq!(found, vec!["SalesData".to_string()]);
    }

    #[test]
    fn names_inside_strings_and_comments_are_ignored() {
        let code = "let a = \"Customers\" // Customers\n in /* Customers */ a";
        assert!(deps(code, &["Customers"], "Q").is_empty());
    }

    #[test]
    fn binding_names_and_field_access_are_not_references() {
        let code = "let Orders = Source, x = Table.SelectRows(Orders, each [Region] = \"EU\") in x";
        let found = deps(code, &["Orders", "Region", "Source"], "Q");
        assert_eq!(found, vec!["Source".to_string()]);
    }

    #[test]
    fn record_fields_do_not_shadow_queries() {
        let found = deps("[Sales = Sales, Total = 1]", &["Sales", "Total"], "Q");
        assert_eq!(found, vec!["Sales".to_string()]);

        let code = "let r = [Customers = 1], Orders = r[Customers] in Customers & Orders";
        let found = deps(code, &["Customers", "Orders"], "Q");
        assert_eq!(found, vec!["Customers".to_string()]);
    }

    #[test]
    fn function_parameters_shadow_queries() {
        let code = "(Orders, optional Limit as number) as table => Table.FirstN(Orders, Limit ?? Top)";
        let found = deps(code, &["Orders", "Limit", "Top"], "Q");
        assert_eq!(found, vec!["Top".to_string()]);
    }

    #[test]
    fn self_reference_is_skipped() {
        assert!(deps("Q & 1", &["Q"], "Q").is_empty());
    }

    #[test]
    fn bare_reference_matches_quoted_declaration() {
        let found = deps(r#"#"Start Date" + StartDate"#, &["Start Date", "StartDate"], "Q");
        assert_eq!(found, vec!["Start Date".to_string(), "StartDate".to_string()]);
    }

    #[test]
    fn loader_paths_are_reported_as_cross_file_refs() {
        let code = r#"let Source = Csv.Document(File.Contents("C:\Data\orders.csv")), B = Excel.Workbook(File.Contents("\\share\Budget.xlsx"), null, true) in Source"#;
        let mask = mask_source(code);
        let refs = find_cross_file_refs(&mask, code, 0..code.len(), "RawOrders");
        let names: Vec<_> = refs.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["orders.csv", "Budget.xlsx"]);
        assert_eq!(refs[0].function.as_deref(), Some("File.Contents"));
        assert_eq!(refs[0].query, "RawOrders");
    }

    #[test]
    fn bare_file_paths_are_reported_without_function() {
        let code = r#"let path = "D:/exports/q1.parquet", label = "not a file" in path"#;
        let mask = mask_source(code);
        let refs = find_cross_file_refs(&mask, code, 0..code.len(), "Q");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].function, None);
        assert_eq!(refs[0].file_name, "q1.parquet");
    }

    #[test]
    fn file_name_handles_urls_and_separators() {
        assert_eq!(file_name_of(r"C:\Data\orders.csv"), "orders.csv");
        assert_eq!(file_name_of("https://host/a/b.json?x=1"), "b.json");
        assert_eq!(file_name_of("plain.xlsx"), "plain.xlsx");
    }
}
