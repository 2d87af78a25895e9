//! Read-only walker over the table b-trees of an in-memory SQLite database.
//!
//! Only what the model metadata catalog needs: table leaf and interior pages,
//! overflow chains, record decoding and column names taken from `CREATE TABLE`.

use rustc_hash::FxHashSet;

use crate::data_model::DataModelError;

const HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const FILE_HEADER_LEN: usize = 100;
const PAGE_INTERIOR_TABLE: u8 = 0x05;
const PAGE_LEAF_TABLE: u8 = 0x0D;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(v) => Some(*v as f64),
            SqlValue::Real(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl SqliteTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            table: self,
            values,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Row<'t> {
    table: &'t SqliteTable,
    values: &'t [SqlValue],
}

impl<'t> Row<'t> {
    pub fn get(&self, column: &str) -> Option<&'t SqlValue> {
        self.table
            .column_index(column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn real(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }

    pub fn text(&self, column: &str) -> Option<&'t str> {
        self.get(column).and_then(SqlValue::as_str)
    }
}

#[derive(Debug)]
struct SchemaEntry {
    kind: String,
    name: String,
    root_page: u32,
    sql: String,
}

#[derive(Debug)]
pub struct SqliteDb<'a> {
    data: &'a [u8],
    page_size: usize,
    usable: usize,
}

impl<'a> SqliteDb<'a> {
    pub fn open(data: &'a [u8]) -> Result<Self, DataModelError> {
        if data.len() < FILE_HEADER_LEN || !data.starts_with(HEADER_MAGIC) {
            return Err(DataModelError::layout("metadata is not a SQLite database"));
        }
        let page_size = match u16::from_be_bytes([data[16], data[17]]) {
            1 => 65536,
            n if n >= 512 && n.is_power_of_two() => usize::from(n),
            n => return Err(DataModelError::layout(format!("invalid SQLite page size {n}"))),
        };
        let reserved = usize::from(data[20]);
        let usable = page_size
            .checked_sub(reserved)
            .filter(|u| *u >= 480)
            .ok_or_else(|| DataModelError::layout("invalid SQLite reserved space"))?;
        Ok(Self {
            data,
            page_size,
            usable,
        })
    }

    pub fn page_count(&self) -> usize {
        self.data.len() / self.page_size
    }

    /// Every row of table `name` (case-insensitive), or `None` when the schema has no such table.
    pub fn table(&self, name: &str) -> Result<Option<SqliteTable>, DataModelError> {
        let Some(entry) = self
            .schema()?
            .into_iter()
            .find(|e| e.kind == "table" && e.name.eq_ignore_ascii_case(name))
        else {
            return Ok(None);
        };

        let defs = column_defs(&entry.sql);
        let alias = defs.iter().position(|(_, is_alias)| *is_alias);
        let columns: Vec<String> = defs.into_iter().map(|(name, _)| name).collect();

        let mut rows = Vec::new();
        for (rowid, payload) in self.scan(entry.root_page)? {
            let mut values = decode_record(&payload)?;
            values.resize(columns.len().max(values.len()), SqlValue::Null);
            if let Some(idx) = alias
                && matches!(values[idx], SqlValue::Null)
            {
                values[idx] = SqlValue::Integer(rowid);
            }
            rows.push(values);
        }

        Ok(Some(SqliteTable {
            name: entry.name,
            columns,
            rows,
        }))
    }

    fn schema(&self) -> Result<Vec<SchemaEntry>, DataModelError> {
        let mut out = Vec::new();
        for (_, payload) in self.scan(1)? {
            let values = decode_record(&payload)?;
            let text = |idx: usize| {
                values
                    .get(idx)
                    .and_then(SqlValue::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let root_page = values.get(3).and_then(SqlValue::as_i64).unwrap_or(0);
            out.push(SchemaEntry {
                kind: text(0),
                name: text(1),
                root_page: u32::try_from(root_page).unwrap_or(0),
                sql: text(4),
            });
        }
        Ok(out)
    }

    fn page(&self, number: u32) -> Result<&'a [u8], DataModelError> {
        let start = (number as usize)
            .checked_sub(1)
            .map(|idx| idx * self.page_size)
            .ok_or_else(|| DataModelError::layout("SQLite page 0 referenced"))?;
        self.data
            .get(start..start + self.page_size)
            .ok_or_else(|| DataModelError::layout(format!("SQLite page {number} past end of file")))
    }

    /// `(rowid, payload)` of every cell in the table b-tree rooted at `root`, in key order.
    fn scan(&self, root: u32) -> Result<Vec<(i64, Vec<u8>)>, DataModelError> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        let mut visited = FxHashSet::default();

        while let Some(number) = stack.pop() {
            if !visited.insert(number) {
                return Err(DataModelError::layout(format!("SQLite page {number} visited twice")));
            }
            let page = self.page(number)?;
            let header = if number == 1 { FILE_HEADER_LEN } else { 0 };
            let kind = page[header];
            let cell_count = usize::from(be_u16(page, header + 3)?);

            match kind {
                PAGE_LEAF_TABLE => {
                    for i in 0..cell_count {
                        let offset = usize::from(be_u16(page, header + 8 + i * 2)?);
                        out.push(self.leaf_cell(page, offset)?);
                    }
                }
                PAGE_INTERIOR_TABLE => {
                    stack.push(be_u32(page, header + 8)?);
                    for i in (0..cell_count).rev() {
                        let offset = usize::from(be_u16(page, header + 12 + i * 2)?);
                        stack.push(be_u32(page, offset)?);
                    }
                }
                other => {
                    return Err(DataModelError::layout(format!(
                        "unsupported SQLite page type {other:#04x} on page {number}"
                    )));
                }
            }
        }
        Ok(out)
    }

    fn leaf_cell(&self, page: &[u8], offset: usize) -> Result<(i64, Vec<u8>), DataModelError> {
        let truncated = || DataModelError::layout("SQLite cell truncated");
        let (payload_len, n1) = read_varint(page, offset).ok_or_else(truncated)?;
        let (rowid, n2) = read_varint(page, offset + n1).ok_or_else(truncated)?;
        let start = offset + n1 + n2;

        let total = usize::try_from(payload_len).map_err(|_| truncated())?;
        let local = local_payload_len(total, self.usable);
        let mut payload = page.get(start..start + local).ok_or_else(truncated)?.to_vec();

        if local < total {
            let mut next = be_u32(page, start + local)?;
            let mut hops = 0usize;
            while payload.len() < total {
                if next == 0 || hops > self.page_count() {
                    return Err(DataModelError::layout("SQLite overflow chain broken"));
                }
                let overflow = self.page(next)?;
                let take = (total - payload.len()).min(self.usable - 4);
                payload.extend_from_slice(overflow.get(4..4 + take).ok_or_else(truncated)?);
                next = be_u32(overflow, 0)?;
                hops += 1;
            }
        }
        Ok((rowid as i64, payload))
    }
}

/// Bytes of a table-leaf payload stored on the b-tree page itself.
fn local_payload_len(total: usize, usable: usize) -> usize {
    let max_local = usable - 35;
    if total <= max_local {
        return total;
    }
    let min_local = ((usable - 12) * 32 / 255) - 23;
    let k = min_local + (total - min_local) % (usable - 4);
    if k <= max_local { k } else { min_local }
}

fn be_u16(buf: &[u8], at: usize) -> Result<u16, DataModelError> {
    buf.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| DataModelError::layout("SQLite page header truncated"))
}

fn be_u32(buf: &[u8], at: usize) -> Result<u32, DataModelError> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DataModelError::layout("SQLite page pointer truncated"))
}

fn read_varint(buf: &[u8], at: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..9 {
        let byte = *buf.get(at + i)?;
        if i == 8 {
            return Some(((value << 8) | u64::from(byte), 9));
        }
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn decode_record(payload: &[u8]) -> Result<Vec<SqlValue>, DataModelError> {
    let bad = || DataModelError::layout("malformed SQLite record");
    let (header_len, n) = read_varint(payload, 0).ok_or_else(bad)?;
    let header_len = usize::try_from(header_len).map_err(|_| bad())?;
    if header_len > payload.len() {
        return Err(bad());
    }

    let mut serials = Vec::new();
    let mut pos = n;
    while pos < header_len {
        let (serial, used) = read_varint(payload, pos).ok_or_else(bad)?;
        serials.push(serial);
        pos += used;
    }

    let mut body = header_len;
    let mut values = Vec::with_capacity(serials.len());
    for serial in serials {
        let (value, used) = match serial {
            0 => (SqlValue::Null, 0),
            1..=6 => {
                let width = [1, 2, 3, 4, 6, 8][serial as usize - 1];
                let bytes = payload.get(body..body + width).ok_or_else(bad)?;
                (SqlValue::Integer(be_signed(bytes)), width)
            }
            7 => {
                let bytes = payload.get(body..body + 8).ok_or_else(bad)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                (SqlValue::Real(f64::from_be_bytes(raw)), 8)
            }
            8 => (SqlValue::Integer(0), 0),
            9 => (SqlValue::Integer(1), 0),
            n if n >= 12 => {
                let len = ((n - 12) / 2) as usize;
                let bytes = payload.get(body..body + len).ok_or_else(bad)?;
                if n % 2 == 0 {
                    (SqlValue::Blob(bytes.to_vec()), len)
                } else {
                    (SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()), len)
                }
            }
            _ => return Err(bad()),
        };
        values.push(value);
        body += used;
    }
    Ok(values)
}

fn be_signed(bytes: &[u8]) -> i64 {
    let unsigned = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let shift = 64 - bytes.len() * 8;
    ((unsigned << shift) as i64) >> shift
}

/// Column names of a `CREATE TABLE` statement, flagging the `INTEGER PRIMARY KEY`
/// column that aliases the rowid.
fn column_defs(sql: &str) -> Vec<(String, bool)> {
    let (Some(open), Some(close)) = (sql.find('('), sql.rfind(')')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }

    split_top_level(&sql[open + 1..close])
        .into_iter()
        .filter_map(|def| {
            let def = def.trim();
            let (name, rest) = split_name(def)?;
            let first_word = name.to_ascii_uppercase();
            if !def.starts_with(['[', '"', '`'])
                && matches!(
                    first_word.as_str(),
                    "CONSTRAINT" | "PRIMARY" | "UNIQUE" | "CHECK" | "FOREIGN"
                )
            {
                return None;
            }
            let words: Vec<String> = rest
                .split_whitespace()
                .map(str::to_ascii_uppercase)
                .collect();
            let is_alias = words.first().is_some_and(|w| w == "INTEGER")
                && words.windows(2).any(|w| w[0] == "PRIMARY" && w[1] == "KEY");
            Some((name, is_alias))
        })
        .collect()
}

fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'' | '`') => quote = Some(ch),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

fn split_name(def: &str) -> Option<(String, &str)> {
    let close = match def.chars().next()? {
        '[' => Some(']'),
        '"' => Some('"'),
        '`' => Some('`'),
        _ => None,
    };
    match close {
        Some(close) => {
            let end = def[1..].find(close)? + 1;
            Some((def[1..end].to_string(), &def[end + 1..]))
        }
        None => {
            let end = def.find(char::is_whitespace).unwrap_or(def.len());
            Some((def[..end].to_string(), &def[end..]))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_db::{TableSpec, build, put_varint};
    use super::*;

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    #[test]
    fn varints_decode() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20, (1 << 40) + 7] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(read_varint(&buf, 0), Some((value, buf.len())), "{value}");
        }
        let nine = [0xFF; 9];
        assert_eq!(read_varint(&nine, 0), Some((u64::MAX, 9)));
    }

    #[test]
    fn column_names_come_from_create_table() {
        let defs = column_defs(
            "CREATE TABLE [Column] ([ID] INTEGER PRIMARY KEY, TableID UNSIGNED BIG INT NOT NULL, \"Explicit Name\" TEXT, Amount DECIMAL(10, 2), PRIMARY KEY (ID))",
        );
        assert_eq!(
            defs,
            vec![
                ("ID".to_string(), true),
                ("TableID".to_string(), false),
                ("Explicit Name".to_string(), false),
                ("Amount".to_string(), false),
            ]
        );
    }

    #[test]
    fn rows_are_read_across_interior_pages_with_rowid_alias() {
        let rows: Vec<Vec<SqlValue>> = (1..=7)
            .map(|i| vec![SqlValue::Null, text(&format!("T{i}")), SqlValue::Integer(i * 100)])
            .collect();
        let db = build(
            1024,
            3,
            &[TableSpec {
                name: "Table",
                sql: "CREATE TABLE [Table] (ID INTEGER PRIMARY KEY, Name TEXT, Size INTEGER)",
                rows,
            }],
        );
        let sqlite = SqliteDb::open(&db).expect("opens");
        let table = sqlite.table("table").expect("reads").expect("table exists");
        assert_eq!(table.columns, vec!["ID", "Name", "Size"]);
        let ids: Vec<_> = table.rows().map(|r| r.int("ID")).collect();
        assert_eq!(ids, (1..=7).map(Some).collect::<Vec<_>>());
        let last = table.rows().last().expect("row");
        assert_eq!(last.text("Name"), Some("T7"));
        assert_eq!(last.int("size"), Some(700));
    }

    #[test]
    fn overflow_chains_are_followed() {
        let long = "x".repeat(3000);
        let db = build(
            512,
            10,
            &[TableSpec {
                name: "Partition",
                sql: "CREATE TABLE Partition (ID INTEGER PRIMARY KEY, QueryDefinition TEXT, Score REAL)",
                rows: vec![vec![SqlValue::Null, text(&long), SqlValue::Real(-2.5)]],
            }],
        );
        let sqlite = SqliteDb::open(&db).expect("opens");
        let table = sqlite.table("Partition").expect("reads").expect("exists");
        let row = table.rows().next().expect("row");
        assert_eq!(row.text("QueryDefinition").map(str::len), Some(3000));
        assert_eq!(row.get("Score"), Some(&SqlValue::Real(-2.5)));
    }

    #[test]
    fn missing_table_is_none() {
        let db = build(
            1024,
            4,
            &[TableSpec {
                name: "Table",
                sql: "CREATE TABLE Table (ID INTEGER PRIMARY KEY)",
                rows: Vec::new(),
            }],
        );
        let sqlite = SqliteDb::open(&db).expect("opens");
        assert!(sqlite.table("StorageFile").expect("reads").is_none());
        assert_eq!(sqlite.table("Table").expect("reads").expect("exists").rows.len(), 0);
    }

    #[test]
    fn signed_integers_decode() {
        assert_eq!(be_signed(&[0xFF]), -1);
        assert_eq!(be_signed(&[0x80, 0x00]), -32768);
        assert_eq!(be_signed(&[0x00, 0x01, 0x00]), 256);
    }

    #[test]
    fn non_sqlite_bytes_are_unsupported_layout() {
        let err = SqliteDb::open(b"not sqlite").expect_err("rejects");
        assert!(matches!(err, DataModelError::UnsupportedModelLayout(_)));
    }
}
