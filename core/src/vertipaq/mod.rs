//! Column storage of the compressed data model.
//!
//! - [`idf`]: run-length / bit-packed hybrid segments of per-row data ids
//! - [`dictionary`]: numeric and (optionally Huffman-coded) string dictionaries
//! - [`convert`]: mapping data ids to typed [`CellValue`](crate::workbook::CellValue)s

pub mod convert;
pub mod dictionary;
pub mod idf;

pub use convert::{ColumnEncoding, ColumnType, RawValue, convert_column_value, materialize_column};
pub use dictionary::{Dictionary, parse_dictionary};
pub use idf::{SegmentMeta, decode_idf, parse_idfmeta};

use crate::data_model::DataModelError;

/// Little-endian reader over a storage file; every read is bounds-checked.
#[derive(Debug, Clone)]
pub(crate) struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteCursor<'a> {
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], DataModelError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                DataModelError::layout(format!("{} truncated at byte {}", self.what, self.pos))
            })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DataModelError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DataModelError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DataModelError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DataModelError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DataModelError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, DataModelError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, DataModelError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64, DataModelError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// A `u64` count that must fit in the bytes left when each item takes at least `item_len`.
    pub(crate) fn count(&mut self, item_len: usize) -> Result<usize, DataModelError> {
        let at = self.pos;
        let count = self.u64()?;
        usize::try_from(count)
            .ok()
            .filter(|n| n.saturating_mul(item_len.max(1)) <= self.remaining())
            .ok_or_else(|| {
                DataModelError::layout(format!("{}: count {count} at byte {at} exceeds data", self.what))
            })
    }

    pub(crate) fn expect(&mut self, marker: &[u8]) -> Result<(), DataModelError> {
        let at = self.pos;
        if self.bytes(marker.len())? == marker {
            Ok(())
        } else {
            Err(DataModelError::layout(format!("{}: bad marker at byte {at}", self.what)))
        }
    }
}
