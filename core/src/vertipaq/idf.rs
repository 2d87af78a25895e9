//! `.idf` column data and its `.idfmeta` segment descriptors.

use serde::Serialize;

use super::ByteCursor;
use crate::data_model::DataModelError;

const BIT_PACKED_MARKER: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentMeta {
    pub row_count: u64,
    pub min_data_id: u32,
    pub bit_width: u32,
}

pub fn parse_idfmeta(bytes: &[u8]) -> Result<Vec<SegmentMeta>, DataModelError> {
    let mut cursor = ByteCursor::new(bytes, "idfmeta");
    let count = cursor.u32()? as usize;
    if count.saturating_mul(16) > cursor.remaining() {
        return Err(DataModelError::layout(format!("idfmeta: {count} segments exceed data")));
    }
    (0..count)
        .map(|_| {
            Ok(SegmentMeta {
                row_count: cursor.u64()?,
                min_data_id: cursor.u32()?,
                bit_width: cursor.u32()?,
            })
        })
        .collect()
}

/// Data ids for every row, segment after segment.
///
/// The segments together may declare at most `max_rows` rows.
pub fn decode_idf(
    bytes: &[u8],
    segments: &[SegmentMeta],
    max_rows: u64,
) -> Result<Vec<u32>, DataModelError> {
    let declared = segments
        .iter()
        .fold(0u64, |total, meta| total.saturating_add(meta.row_count));
    if declared > max_rows {
        return Err(DataModelError::layout(format!(
            "idf: {declared} rows exceed the limit of {max_rows}"
        )));
    }
    let mut cursor = ByteCursor::new(bytes, "idf");
    let mut out = Vec::new();
    for (idx, meta) in segments.iter().enumerate() {
        let before = out.len();
        decode_segment(&mut cursor, meta, &mut out)?;
        let produced = (out.len() - before) as u64;
        if produced < meta.row_count {
            log::warn!(
                "idf segment {idx}: {produced} of {} rows encoded",
                meta.row_count
            );
        }
    }
    Ok(out)
}

fn decode_segment(
    cursor: &mut ByteCursor<'_>,
    meta: &SegmentMeta,
    out: &mut Vec<u32>,
) -> Result<(), DataModelError> {
    if meta.bit_width > 32 {
        return Err(DataModelError::layout(format!(
            "idf: bit width {} not supported",
            meta.bit_width
        )));
    }
    let entry_count = cursor.count(8)?;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        entries.push((cursor.u32()?, cursor.u32()?));
    }
    let word_count = cursor.count(8)?;
    let mut words = Vec::with_capacity(word_count);
    for _ in 0..word_count {
        words.push(cursor.u64()?);
    }

    let mut packed = PackedValues::new(&words, meta.bit_width);
    let mut remaining = meta.row_count;
    for (value, repeat) in entries {
        if remaining == 0 {
            break;
        }
        let n = u64::from(repeat).min(remaining);
        if value == BIT_PACKED_MARKER {
            if n > packed.available() {
                return Err(DataModelError::layout(format!(
                    "idf: {n} bit-packed values requested, {} available",
                    packed.available()
                )));
            }
            for _ in 0..n {
                out.push(packed.next()?.wrapping_add(meta.min_data_id));
            }
        } else {
            out.extend(std::iter::repeat_n(value, n as usize));
        }
        remaining -= n;
    }
    Ok(())
}

/// Fixed-width values packed LSB-first, `64 / width` per word.
struct PackedValues<'w> {
    words: &'w [u64],
    width: u32,
    index: usize,
}

impl<'w> PackedValues<'w> {
    fn new(words: &'w [u64], width: u32) -> Self {
        Self {
            words,
            width,
            index: 0,
        }
    }

    /// Values left in the word pool; none when the width is zero.
    fn available(&self) -> u64 {
        if self.width == 0 {
            return 0;
        }
        let total = self.words.len() as u64 * u64::from(64 / self.width);
        total.saturating_sub(self.index as u64)
    }

    fn next(&mut self) -> Result<u32, DataModelError> {
        if self.width == 0 {
            return Err(DataModelError::layout("idf: bit-packed span with zero width"));
        }
        let per_word = (64 / self.width) as usize;
        let word = self
            .words
            .get(self.index / per_word)
            .ok_or_else(|| DataModelError::layout("idf: bit-packed values exhausted"))?;
        let shift = (self.index % per_word) as u32 * self.width;
        let mask = if self.width == 32 {
            u64::from(u32::MAX)
        } else {
            (1u64 << self.width) - 1
        };
        self.index += 1;
        Ok(((word >> shift) & mask) as u32)
    }
}

#[cfg(test)]
pub(crate) fn encode_segment(entries: &[(u32, u32)], words: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (value, repeat) in entries {
        out.extend_from_slice(&value.to_le_bytes());
        out.extend_from_slice(&repeat.to_le_bytes());
    }
    out.extend_from_slice(&(words.len() as u64).to_le_bytes());
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

#[cfg(test)]
pub(crate) fn encode_idfmeta(segments: &[SegmentMeta]) -> Vec<u8> {
    let mut out = (segments.len() as u32).to_le_bytes().to_vec();
    for meta in segments {
        out.extend_from_slice(&meta.row_count.to_le_bytes());
        out.extend_from_slice(&meta.min_data_id.to_le_bytes());
        out.extend_from_slice(&meta.bit_width.to_le_bytes());
    }
    out
}
