//! Decompression of the `DataModel` part.
//!
//! The part is an optional UTF-16LE banner followed by chunks of
//! `u32 uncompressed_size | u32 compressed_size | bytes`. Each chunk is handed to a
//! [`Decompressor`] whose [`ChunkFormat`] matches the part's framing.
//!
//! [`XcaHuffman`] implements the MS-XCA LZ77+Huffman codec for parts without a
//! banner. No XPress9 codec is bundled: compressed chunks of a bannered part are
//! reported as [`XpressError::UnsupportedFormat`] unless the caller supplies a
//! [`Decompressor`] for [`ChunkFormat::Xpress9`].

use log::debug;
use thiserror::Error;

use crate::huffman::{HuffmanError, HuffmanTable};

/// Text (UTF-16LE with BOM) that opens an XPress-compressed backup.
pub const XPRESS_SIGNATURE: &str = "This backup was created using XPress9 compression.";
const XPRESS_SIGNATURE_BYTES: usize = 102;

/// Text (UTF-16LE with BOM) that opens an uncompressed backup stream.
pub const BACKUP_SIGNATURE: &str = "STREAM_STORAGE_SIGNATURE_)!@#$%^&*(";

const BLOCK_SIZE: usize = 64 * 1024;
const TABLE_BYTES: usize = 256;
const SYMBOLS: usize = 512;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum XpressError {
    #[error("truncated input: {0}")]
    Truncated(&'static str),
    #[error("invalid Huffman table: {0}")]
    Table(#[from] HuffmanError),
    #[error("invalid Huffman code at input offset {0}")]
    InvalidCode(usize),
    #[error("match offset {offset} reaches before start of output ({position})")]
    BadOffset { offset: usize, position: usize },
    #[error("decompressed size {size} exceeds limit {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("chunk produced {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("{part:?} chunks are not supported by the {codec:?} codec")]
    UnsupportedFormat { part: ChunkFormat, codec: ChunkFormat },
}

/// Compression applied to the chunks of a `DataModel` part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFormat {
    /// Parts opening with the XPress9 banner.
    Xpress9,
    /// MS-XCA LZ77+Huffman.
    XcaHuffman,
}

/// A codec able to inflate one chunk to exactly `expected_len` bytes.
pub trait Decompressor {
    fn format(&self) -> ChunkFormat;

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>, XpressError>;
}

/// MS-XCA LZ77 with a canonical Huffman stage over 512 symbols, one table per
/// 64 KiB of output.
#[derive(Debug, Default, Clone, Copy)]
pub struct XcaHuffman;

impl Decompressor for XcaHuffman {
    fn format(&self) -> ChunkFormat {
        ChunkFormat::XcaHuffman
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>, XpressError> {
        let mut out: Vec<u8> = Vec::with_capacity(expected_len);
        let mut block_start = 0usize;

        while out.len() < expected_len {
            let table_bytes = input
                .get(block_start..block_start + TABLE_BYTES)
                .ok_or(XpressError::Truncated("Huffman table"))?;
            let mut lengths = [0u8; SYMBOLS];
            for (i, byte) in table_bytes.iter().enumerate() {
                lengths[2 * i] = byte & 0x0F;
                lengths[2 * i + 1] = byte >> 4;
            }
            let table = HuffmanTable::from_lengths(&lengths)?;

            let mut bits = BitSource::new(input, block_start + TABLE_BYTES);
            let block_end = (out.len() + BLOCK_SIZE).min(expected_len);

            while out.len() < block_end {
                let at = bits.position;
                let prefix = bits.peek(table.table_bits());
                let (symbol, len) = table.lookup(prefix).ok_or(XpressError::InvalidCode(at))?;
                bits.skip(len);

                if symbol < 256 {
                    out.push(symbol as u8);
                    continue;
                }

                let symbol = usize::from(symbol - 256);
                let mut length = symbol & 0x0F;
                let offset_bits = (symbol >> 4) as u8;
                if length == 15 {
                    length = usize::from(bits.read_byte()?);
                    if length == 255 {
                        length = usize::from(bits.read_u16()?);
                        if length < 15 {
                            return Err(XpressError::Truncated("match length"));
                        }
                        length -= 15;
                    }
                    length += 15;
                }
                length += 3;

                let offset = (1usize << offset_bits) + bits.read_bits(offset_bits) as usize;
                let position = out.len();
                if offset > position {
                    return Err(XpressError::BadOffset { offset, position });
                }
                let take = length.min(expected_len - position);
                for i in 0..take {
                    let byte = out[position - offset + i];
                    out.push(byte);
                }
            }

            block_start = bits.position;
        }

        Ok(out)
    }
}

/// The codec's bit source: a 32-bit window refilled 16 bits at a time, with
/// length-extension bytes read inline from the same cursor.
struct BitSource<'a> {
    input: &'a [u8],
    position: usize,
    window: u32,
    extra: i32,
}

impl<'a> BitSource<'a> {
    fn new(input: &'a [u8], start: usize) -> Self {
        let mut source = Self {
            input,
            position: start,
            window: 0,
            extra: 16,
        };
        let hi = source.next_word();
        let lo = source.next_word();
        source.window = (u32::from(hi) << 16) | u32::from(lo);
        source
    }

    fn next_word(&mut self) -> u16 {
        let word = match self.input.get(self.position..self.position + 2) {
            Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]),
            None => 0,
        };
        self.position += 2;
        word
    }

    fn peek(&self, n: u8) -> u32 {
        self.window >> (32 - u32::from(n))
    }

    fn skip(&mut self, n: u8) {
        if n == 0 {
            return;
        }
        self.window = self.window.checked_shl(u32::from(n)).unwrap_or(0);
        self.extra -= i32::from(n);
        if self.extra < 0 {
            let word = u32::from(self.next_word());
            self.window |= word << (-self.extra) as u32;
            self.extra += 16;
        }
    }

    fn read_bits(&mut self, n: u8) -> u32 {
        if n == 0 {
            return 0;
        }
        let value = self.peek(n);
        self.skip(n);
        value
    }

    fn read_byte(&mut self) -> Result<u8, XpressError> {
        let byte = *self
            .input
            .get(self.position)
            .ok_or(XpressError::Truncated("match length byte"))?;
        self.position += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, XpressError> {
        let bytes = self
            .input
            .get(self.position..self.position + 2)
            .ok_or(XpressError::Truncated("match length word"))?;
        self.position += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

pub(crate) fn signature_bytes(text: &str) -> Vec<u8> {
    let mut out = vec![0xFF, 0xFE];
    out.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
    out
}

pub fn has_xpress_signature(part: &[u8]) -> bool {
    part.starts_with(&signature_bytes(XPRESS_SIGNATURE))
}

pub fn has_backup_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(&signature_bytes(BACKUP_SIGNATURE))
}

/// Streams the chunks of a `DataModel` part through a [`Decompressor`].
///
/// A part that already starts with the backup signature is passed through in one
/// step.
pub struct ChunkedDecompression<'a, D: Decompressor> {
    part: &'a [u8],
    cursor: usize,
    codec: D,
    format: ChunkFormat,
    limit: u64,
    output: Vec<u8>,
    passthrough: bool,
}

impl<'a, D: Decompressor> ChunkedDecompression<'a, D> {
    pub fn new(part: &'a [u8], codec: D, limit: u64) -> Self {
        let passthrough = has_backup_signature(part);
        let (cursor, format) = if has_xpress_signature(part) {
            (XPRESS_SIGNATURE_BYTES, ChunkFormat::Xpress9)
        } else {
            (0, ChunkFormat::XcaHuffman)
        };
        Self {
            part,
            cursor,
            codec,
            format,
            limit,
            output: Vec::new(),
            passthrough,
        }
    }

    pub fn is_done(&self) -> bool {
        self.passthrough || self.cursor >= self.part.len()
    }

    /// Fraction of the compressed part consumed so far.
    pub fn progress(&self) -> f32 {
        if self.part.is_empty() || self.passthrough {
            return 1.0;
        }
        self.cursor as f32 / self.part.len() as f32
    }

    /// Decompresses the next chunk. Returns `false` once every chunk is done.
    pub fn step(&mut self) -> Result<bool, XpressError> {
        if self.is_done() {
            return Ok(false);
        }
        let header = self
            .part
            .get(self.cursor..self.cursor + 8)
            .ok_or(XpressError::Truncated("chunk header"))?;
        let uncompressed = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let compressed = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = self.cursor + 8;
        let body = self
            .part
            .get(start..start + compressed)
            .ok_or(XpressError::Truncated("chunk body"))?;

        let size = self.output.len() as u64 + uncompressed as u64;
        if size > self.limit {
            return Err(XpressError::TooLarge {
                size,
                limit: self.limit,
            });
        }

        let chunk = if compressed == uncompressed {
            body.to_vec()
        } else if self.codec.format() != self.format {
            return Err(XpressError::UnsupportedFormat {
                part: self.format,
                codec: self.codec.format(),
            });
        } else {
            self.codec.decompress(body, uncompressed)?
        };
        if chunk.len() != uncompressed {
            return Err(XpressError::SizeMismatch {
                expected: uncompressed,
                actual: chunk.len(),
            });
        }
        debug!("DataModel chunk: {compressed} -> {uncompressed} bytes");
        self.output.extend_from_slice(&chunk);
        self.cursor = start + compressed;
        Ok(true)
    }

    pub fn finish(self) -> Vec<u8> {
        if self.passthrough {
            self.part.to_vec()
        } else {
            self.output
        }
    }
}

/// Runs [`ChunkedDecompression`] to completion.
pub fn decompress_data_model(
    part: &[u8],
    codec: impl Decompressor,
    limit: u64,
) -> Result<Vec<u8>, XpressError> {
    let mut job = ChunkedDecompression::new(part, codec, limit);
    while job.step()? {}
    Ok(job.finish())
}
