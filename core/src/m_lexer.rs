//! Comment and literal masking for M source.
//!
//! [`mask_source`] returns a byte-for-byte copy of the source in which comments
//! become spaces and the bodies of string literals and quoted identifiers become
//! [`MASK_BYTE`]. Offsets into the masked copy are offsets into the original, so
//! structural scans run on the mask and slices are taken from the source.

/// Placeholder for literal bodies. Not an identifier character and not structural in M.
pub const MASK_BYTE: u8 = b'~';

/// A `#"..."` quoted identifier. `start` is the `#`, `end` is one past the closing quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedSpan {
    pub start: usize,
    pub end: usize,
    pub name: String,
}

/// A `"..."` string literal. `start` is the opening quote, `end` one past the closing quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringSpan {
    pub start: usize,
    pub end: usize,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedSource {
    pub masked: Vec<u8>,
    pub quoted_identifiers: Vec<QuotedSpan>,
    pub string_literals: Vec<StringSpan>,
    /// Offset of a literal or block comment that runs to end of input.
    pub unterminated: Option<usize>,
}

impl MaskedSource {
    pub fn len(&self) -> usize {
        self.masked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masked.is_empty()
    }

    pub fn quoted_at(&self, start: usize) -> Option<&QuotedSpan> {
        self.quoted_identifiers
            .binary_search_by_key(&start, |span| span.start)
            .ok()
            .map(|idx| &self.quoted_identifiers[idx])
    }

    pub fn string_at(&self, start: usize) -> Option<&StringSpan> {
        self.string_literals
            .binary_search_by_key(&start, |span| span.start)
            .ok()
            .map(|idx| &self.string_literals[idx])
    }

    /// String literals whose opening quote falls inside `range`.
    pub fn strings_in(&self, range: std::ops::Range<usize>) -> impl Iterator<Item = &StringSpan> {
        self.string_literals
            .iter()
            .filter(move |span| range.contains(&span.start))
    }
}

pub fn mask_source(source: &str) -> MaskedSource {
    let bytes = source.as_bytes();
    let mut masked = bytes.to_vec();
    let mut quoted_identifiers = Vec::new();
    let mut string_literals = Vec::new();
    let mut unterminated = None;
    let mut i = 0;

    while i < bytes.len() {
        match (bytes[i], bytes.get(i + 1).copied()) {
            (b'/', Some(b'/')) => {
                while i < bytes.len() && bytes[i] != b'\n' && bytes[i] != b'\r' {
                    masked[i] = b' ';
                    i += 1;
                }
            }
            (b'/', Some(b'*')) => {
                let start = i;
                let end = find_subslice(bytes, b"*/", i + 2).map(|pos| pos + 2);
                let stop = end.unwrap_or(bytes.len());
                for (offset, byte) in bytes[start..stop].iter().enumerate() {
                    if *byte != b'\n' && *byte != b'\r' {
                        masked[start + offset] = b' ';
                    }
                }
                if end.is_none() {
                    unterminated = Some(start);
                }
                i = stop;
            }
            (b'#', Some(b'"')) => {
                let literal = scan_quoted(source, i + 1);
                mask_body(&mut masked, i + 2, literal.body_end);
                if literal.terminated {
                    quoted_identifiers.push(QuotedSpan {
                        start: i,
                        end: literal.end,
                        name: literal.text,
                    });
                } else {
                    unterminated = Some(i);
                }
                i = literal.end;
            }
            (b'"', _) => {
                let literal = scan_quoted(source, i);
                mask_body(&mut masked, i + 1, literal.body_end);
                if literal.terminated {
                    string_literals.push(StringSpan {
                        start: i,
                        end: literal.end,
                        value: literal.text,
                    });
                } else {
                    unterminated = Some(i);
                }
                i = literal.end;
            }
            _ => i += 1,
        }
    }

    MaskedSource {
        masked,
        quoted_identifiers,
        string_literals,
        unterminated,
    }
}

struct QuotedLiteral {
    text: String,
    body_end: usize,
    end: usize,
    terminated: bool,
}

/// Scans a `"`-delimited literal whose opening quote is at `open`; `""` escapes a quote.
fn scan_quoted(source: &str, open: usize) -> QuotedLiteral {
    let bytes = source.as_bytes();
    let mut j = open + 1;
    while j < bytes.len() {
        if bytes[j] == b'"' {
            if bytes.get(j + 1) == Some(&b'"') {
                j += 2;
                continue;
            }
            return QuotedLiteral {
                text: source[open + 1..j].replace("\"\"", "\""),
                body_end: j,
                end: j + 1,
                terminated: true,
            };
        }
        j += 1;
    }
    QuotedLiteral {
        text: source[open + 1..].replace("\"\"", "\""),
        body_end: bytes.len(),
        end: bytes.len(),
        terminated: false,
    }
}

fn mask_body(masked: &mut [u8], start: usize, end: usize) {
    if start < end {
        masked[start..end].fill(MASK_BYTE);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Identifier start: ASCII letter, underscore, or any non-ASCII byte.
pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

pub(crate) fn is_ident_continue(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

/// End of the (possibly dotted) identifier starting at `start`, e.g. `Table.SelectRows`.
/// A dot only joins parts when another identifier part follows it.
pub(crate) fn ident_end(masked: &[u8], start: usize) -> usize {
    let mut i = start;
    loop {
        while i < masked.len() && is_ident_continue(masked[i]) {
            i += 1;
        }
        if i + 1 < masked.len() && masked[i] == b'.' && is_ident_start(masked[i + 1]) {
            i += 1;
            continue;
        }
        return i;
    }
}
