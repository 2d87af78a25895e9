//! Canonical Huffman tables and an MSB-first reader over 16-bit little-endian words.
//!
//! Both the XPress LZ77+Huffman codec and compressed string dictionaries describe
//! their codes as a list of per-symbol bit lengths and pack code bits the same way.

use thiserror::Error;

pub const MAX_CODE_BITS: u8 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HuffmanError {
    #[error("no symbol has a code")]
    Empty,
    #[error("code length {0} exceeds {MAX_CODE_BITS} bits")]
    LengthTooLarge(u8),
    #[error("code lengths oversubscribe the code space")]
    Oversubscribed,
    #[error("invalid code at bit {0}")]
    InvalidCode(u64),
}

/// Canonical code for every symbol with a non-zero length, as `(symbol, code, len)`,
/// ordered by length then symbol.
pub fn canonical_codes(lengths: &[u8]) -> Result<Vec<(u16, u32, u8)>, HuffmanError> {
    let mut symbols: Vec<(u16, u8)> = lengths
        .iter()
        .enumerate()
        .filter(|(_, len)| **len > 0)
        .map(|(symbol, len)| (symbol as u16, *len))
        .collect();
    if symbols.is_empty() {
        return Err(HuffmanError::Empty);
    }
    if let Some(&(_, len)) = symbols.iter().find(|(_, len)| *len > MAX_CODE_BITS) {
        return Err(HuffmanError::LengthTooLarge(len));
    }
    symbols.sort_by_key(|&(symbol, len)| (len, symbol));

    let mut codes = Vec::with_capacity(symbols.len());
    let mut code: u32 = 0;
    let mut prev_len = symbols[0].1;
    for (symbol, len) in symbols {
        code <<= len - prev_len;
        prev_len = len;
        if code >= (1 << len) {
            return Err(HuffmanError::Oversubscribed);
        }
        codes.push((symbol, code, len));
        code += 1;
    }
    Ok(codes)
}

/// Direct lookup table indexed by the next `table_bits` bits of input.
#[derive(Debug, Clone)]
pub struct HuffmanTable {
    /// `(symbol, len)`; `len == 0` marks a prefix that no code covers.
    entries: Vec<(u16, u8)>,
    table_bits: u8,
}

impl HuffmanTable {
    pub fn from_lengths(lengths: &[u8]) -> Result<Self, HuffmanError> {
        let codes = canonical_codes(lengths)?;
        let table_bits = codes.iter().map(|&(_, _, len)| len).max().unwrap_or(1);
        let mut entries = vec![(0u16, 0u8); 1 << table_bits];
        for (symbol, code, len) in codes {
            let shift = table_bits - len;
            let first = (code << shift) as usize;
            let last = first + (1usize << shift);
            entries[first..last].fill((symbol, len));
        }
        Ok(Self {
            entries,
            table_bits,
        })
    }

    pub fn table_bits(&self) -> u8 {
        self.table_bits
    }

    /// Symbol and code length for a `table_bits`-wide prefix.
    pub fn lookup(&self, prefix: u32) -> Option<(u16, u8)> {
        match self.entries.get(prefix as usize) {
            Some(&(symbol, len)) if len > 0 => Some((symbol, len)),
            _ => None,
        }
    }

    /// Decodes symbols from `reader` until its position reaches `end_bit`.
    pub fn decode_until(
        &self,
        reader: &mut WordBitReader<'_>,
        end_bit: u64,
        out: &mut Vec<u16>,
    ) -> Result<(), HuffmanError> {
        while reader.position() < end_bit {
            let at = reader.position();
            let prefix = reader.peek(self.table_bits);
            let (symbol, len) = self.lookup(prefix).ok_or(HuffmanError::InvalidCode(at))?;
            reader.consume(len);
            out.push(symbol);
        }
        Ok(())
    }
}

/// Reads bits most-significant first from consecutive 16-bit little-endian words.
/// Bits past the end of the buffer read as zero.
#[derive(Debug, Clone)]
pub struct WordBitReader<'a> {
    data: &'a [u8],
    bit: u64,
}

impl<'a> WordBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    pub fn position(&self) -> u64 {
        self.bit
    }

    pub fn seek(&mut self, bit: u64) {
        self.bit = bit;
    }

    pub fn total_bits(&self) -> u64 {
        self.data.len() as u64 * 8
    }

    fn bit_at(&self, pos: u64) -> u32 {
        let word = (pos / 16) as usize;
        let within = (pos % 16) as u32;
        let byte_index = word * 2 + if within < 8 { 1 } else { 0 };
        match self.data.get(byte_index) {
            Some(byte) => u32::from(byte >> (7 - within % 8)) & 1,
            None => 0,
        }
    }

    pub fn peek(&self, n: u8) -> u32 {
        (0..u64::from(n)).fold(0, |acc, i| (acc << 1) | self.bit_at(self.bit + i))
    }

    pub fn consume(&mut self, n: u8) {
        self.bit += u64::from(n);
    }

    pub fn read(&mut self, n: u8) -> u32 {
        let value = self.peek(n);
        self.consume(n);
        value
    }
}

/// Packs bits MSB-first into 16-bit little-endian words. Test support for the
/// decoders built on this module.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct WordBitWriter {
    words: Vec<u16>,
    current: u16,
    filled: u8,
}

#[cfg(test)]
impl WordBitWriter {
    pub(crate) fn write(&mut self, value: u32, n: u8) {
        for i in (0..n).rev() {
            let bit = ((value >> i) & 1) as u16;
            self.current |= bit << (15 - self.filled);
            self.filled += 1;
            if self.filled == 16 {
                self.words.push(self.current);
                self.current = 0;
                self.filled = 0;
            }
        }
    }

    pub(crate) fn bits_written(&self) -> u64 {
        self.words.len() as u64 * 16 + u64::from(self.filled)
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.words.push(self.current);
        }
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
