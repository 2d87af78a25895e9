//! `.dictionary` storage files: the distinct values a dictionary-encoded column
//! refers to by position.

use log::warn;

use super::ByteCursor;
use super::convert::RawValue;
use crate::data_model::DataModelError;
use crate::huffman::{HuffmanTable, WordBitReader};

const TYPE_LONG: i32 = 0;
const TYPE_REAL: i32 = 1;
const TYPE_STRING: i32 = 2;
const HASH_INFO_LEN: usize = 24;
const PAGE_BEGIN: [u8; 4] = [0xDD, 0xCC, 0xBB, 0xAA];
const PAGE_END: [u8; 4] = [0xCD, 0xAB, 0xCD, 0xAB];
const ENCODE_ARRAY_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum Dictionary {
    Long(Vec<i64>),
    Real(Vec<f64>),
    Text(Vec<String>),
}

impl Dictionary {
    pub fn len(&self) -> usize {
        match self {
            Dictionary::Long(v) => v.len(),
            Dictionary::Real(v) => v.len(),
            Dictionary::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, position: usize) -> Option<RawValue> {
        match self {
            Dictionary::Long(v) => v.get(position).map(|n| RawValue::Int(*n)),
            Dictionary::Real(v) => v.get(position).map(|n| RawValue::Real(*n)),
            Dictionary::Text(v) => v.get(position).map(|s| RawValue::Text(s.clone())),
        }
    }
}

pub fn parse_dictionary(bytes: &[u8]) -> Result<Dictionary, DataModelError> {
    let mut cursor = ByteCursor::new(bytes, "dictionary");
    let kind = cursor.i32()?;
    cursor.bytes(HASH_INFO_LEN)?;
    match kind {
        TYPE_LONG | TYPE_REAL => parse_numeric(&mut cursor, kind),
        TYPE_STRING => parse_strings(&mut cursor).map(Dictionary::Text),
        other => Err(DataModelError::layout(format!("dictionary type {other} not supported"))),
    }
}

fn parse_numeric(cursor: &mut ByteCursor<'_>, kind: i32) -> Result<Dictionary, DataModelError> {
    let count = cursor.u64()?;
    let size = cursor.u32()?;
    if size != 4 && size != 8 {
        return Err(DataModelError::layout(format!("dictionary element size {size}")));
    }
    let count = usize::try_from(count)
        .ok()
        .filter(|n| n.saturating_mul(size as usize) <= cursor.remaining())
        .ok_or_else(|| DataModelError::layout("dictionary values exceed data"))?;

    Ok(match (kind, size) {
        (TYPE_LONG, 4) => Dictionary::Long(
            (0..count)
                .map(|_| cursor.i32().map(i64::from))
                .collect::<Result<_, _>>()?,
        ),
        (TYPE_LONG, _) => Dictionary::Long((0..count).map(|_| cursor.i64()).collect::<Result<_, _>>()?),
        (_, 4) => Dictionary::Real(
            (0..count)
                .map(|_| cursor.f32().map(f64::from))
                .collect::<Result<_, _>>()?,
        ),
        _ => Dictionary::Real((0..count).map(|_| cursor.f64()).collect::<Result<_, _>>()?),
    })
}

enum PageBody<'a> {
    Plain(Vec<String>),
    Compressed {
        total_bits: u64,
        charset: u16,
        table: HuffmanTable,
        buffer: &'a [u8],
    },
}

struct StringPage<'a> {
    string_count: usize,
    body: PageBody<'a>,
}

fn parse_strings(cursor: &mut ByteCursor<'_>) -> Result<Vec<String>, DataModelError> {
    let declared = cursor.u64()?;
    let _store_compressed = cursor.u8()?;
    let _longest = cursor.u64()?;
    let page_count = cursor.count(30)?;

    let mut pages = Vec::with_capacity(page_count);
    for _ in 0..page_count {
        pages.push(parse_page(cursor)?);
    }

    let handle_count = cursor.u64()?;
    let handle_size = cursor.u32()?;
    if handle_size != 8 {
        return Err(DataModelError::layout(format!("record handle size {handle_size}")));
    }
    let handle_count = usize::try_from(handle_count)
        .ok()
        .filter(|n| n.saturating_mul(8) <= cursor.remaining())
        .ok_or_else(|| DataModelError::layout("record handles exceed data"))?;
    let mut offsets_by_page: Vec<Vec<u64>> = vec![Vec::new(); pages.len()];
    for _ in 0..handle_count {
        let offset = cursor.u32()?;
        let page = cursor.u32()? as usize;
        let slot = offsets_by_page
            .get_mut(page)
            .ok_or_else(|| DataModelError::layout(format!("record handle names page {page}")))?;
        slot.push(u64::from(offset));
    }

    let mut out = Vec::new();
    for (page, offsets) in pages.into_iter().zip(offsets_by_page) {
        match page.body {
            PageBody::Plain(strings) => out.extend(strings),
            PageBody::Compressed {
                total_bits,
                charset,
                table,
                buffer,
            } => {
                if offsets.len() != page.string_count {
                    warn!(
                        "compressed page lists {} strings but has {} handles",
                        page.string_count,
                        offsets.len()
                    );
                }
                let mut reader = WordBitReader::new(buffer);
                let mut symbols = Vec::new();
                for (i, &start) in offsets.iter().enumerate() {
                    let end = offsets.get(i + 1).copied().unwrap_or(total_bits);
                    symbols.clear();
                    reader.seek(start);
                    table
                        .decode_until(&mut reader, end, &mut symbols)
                        .map_err(|e| DataModelError::layout(format!("string dictionary: {e}")))?;
                    let units: Vec<u16> = symbols.iter().map(|s| (charset << 8) | *s).collect();
                    out.push(String::from_utf16_lossy(&units));
                }
            }
        }
    }

    if out.len() as u64 != declared {
        warn!("string dictionary declares {declared} strings, decoded {}", out.len());
    }
    Ok(out)
}

fn parse_page<'a>(cursor: &mut ByteCursor<'a>) -> Result<StringPage<'a>, DataModelError> {
    let _mask = cursor.u64()?;
    let _has_nulls = cursor.u8()?;
    let _start_index = cursor.u64()?;
    let string_count = cursor.u64()? as usize;
    let compressed = cursor.u8()? != 0;
    cursor.expect(&PAGE_BEGIN)?;

    let body = if compressed {
        let total_bits = u64::from(cursor.u32()?);
        let _charset_type = cursor.u32()?;
        let _allocation = cursor.u64()?;
        let charset = u16::from(cursor.u8()?);
        let _decode_bits = cursor.u32()?;
        let encode = cursor.bytes(ENCODE_ARRAY_LEN)?;
        let lengths: Vec<u8> = encode.iter().flat_map(|b| [b & 0x0F, b >> 4]).collect();
        let table = HuffmanTable::from_lengths(&lengths)
            .map_err(|e| DataModelError::layout(format!("string dictionary: {e}")))?;
        let size = cursor.count(1)?;
        PageBody::Compressed {
            total_bits,
            charset,
            table,
            buffer: cursor.bytes(size)?,
        }
    } else {
        let _remaining = cursor.u64()?;
        let used_chars = cursor.u64()?;
        let allocation = cursor.count(1)?;
        let buffer = cursor.bytes(allocation)?;
        let used = usize::try_from(used_chars)
            .unwrap_or(usize::MAX)
            .saturating_mul(2)
            .min(buffer.len() & !1);
        let units: Vec<u16> = buffer[..used]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16_lossy(&units);
        PageBody::Plain(
            text.split('\0')
                .take(string_count)
                .map(str::to_string)
                .collect(),
        )
    };

    cursor.expect(&PAGE_END)?;
    Ok(StringPage { string_count, body })
}
