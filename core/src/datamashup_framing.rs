use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

use crate::container::MashupPayload;
use crate::error_codes;

const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DataMashupError {
    #[error("malformed DataMashup envelope: {0}")]
    MalformedEnvelope(&'static str),
    #[error("base64 decoding failed")]
    Base64Invalid,
    #[error("XML parse error: {0}")]
    XmlError(String),
    #[error("inner package is not a readable archive: {0}")]
    InnerArchive(String),
    #[error("DataMashup package has no Formulas/Section1.m part")]
    NoFormulaSection,
    #[error("inner package has too many entries: {entries} (limit: {max_entries})")]
    InnerTooManyEntries { entries: usize, max_entries: usize },
    #[error("inner part '{path}' is too large: {size} bytes (limit: {limit} bytes)")]
    InnerPartTooLarge { path: String, size: u64, limit: u64 },
    #[error("inner package exceeds {limit} uncompressed bytes")]
    InnerTotalTooLarge { limit: u64 },
}

impl DataMashupError {
    pub fn code(&self) -> &'static str {
        match self {
            DataMashupError::MalformedEnvelope(_) => error_codes::DM_MALFORMED_ENVELOPE,
            DataMashupError::Base64Invalid => error_codes::DM_BASE64_INVALID,
            DataMashupError::XmlError(_) => error_codes::DM_XML,
            DataMashupError::InnerArchive(_) => error_codes::DM_INNER_ARCHIVE,
            DataMashupError::NoFormulaSection => error_codes::DM_NO_FORMULA_SECTION,
            DataMashupError::InnerTooManyEntries { .. }
            | DataMashupError::InnerPartTooLarge { .. }
            | DataMashupError::InnerTotalTooLarge { .. } => error_codes::DM_INNER_LIMIT,
        }
    }
}

/// A decoded `version | length | package | trailer` envelope.
///
/// # Invariants
///
/// `8 + package_parts.len() + trailer.len()` equals the envelope length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDataMashup {
    pub version: u32,
    pub package_parts: Vec<u8>,
    /// Permissions/metadata bytes after the package, kept verbatim.
    pub trailer: Vec<u8>,
}

pub fn parse_data_mashup(bytes: &[u8]) -> Result<RawDataMashup, DataMashupError> {
    if bytes.len() < HEADER_LEN {
        return Err(DataMashupError::MalformedEnvelope(
            "envelope is shorter than its 8-byte header",
        ));
    }

    let mut offset: usize = 0;
    let version = read_u32_at(bytes, offset)
        .ok_or(DataMashupError::MalformedEnvelope("missing version field"))?;
    offset += 4;

    let package_len = read_length(bytes, offset)?;
    offset += 4;
    let package_parts = take_segment(bytes, &mut offset, package_len)?;

    Ok(RawDataMashup {
        version,
        package_parts,
        trailer: bytes[offset..].to_vec(),
    })
}

/// Cheap structural check used when probing candidate parts.
pub(crate) fn envelope_fits(bytes: &[u8]) -> bool {
    let Some(len) = read_u32_at(bytes, 4) else {
        return false;
    };
    usize::try_from(len)
        .ok()
        .and_then(|len| len.checked_add(HEADER_LEN))
        .is_some_and(|end| end <= bytes.len())
}

pub fn decode_mashup_payload(payload: &MashupPayload) -> Result<RawDataMashup, DataMashupError> {
    match payload {
        MashupPayload::Binary(bytes) => parse_data_mashup(bytes),
        MashupPayload::Base64Text(text) => {
            let decoded = decode_datamashup_base64(text)?;
            parse_data_mashup(&decoded)
        }
    }
}

/// Extracts the text of the single `DataMashup` element (any namespace prefix).
pub fn read_datamashup_text(xml: &[u8]) -> Result<Option<String>, DataMashupError> {
    let utf8_xml = decode_datamashup_xml(xml)?;
    let source = utf8_xml.as_deref().unwrap_or(xml);
    let source = source.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(source);

    let mut reader = Reader::from_reader(source);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_datamashup = false;
    let mut found_content: Option<String> = None;
    let mut content = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if is_datamashup_element(e.name().as_ref()) => {
                if in_datamashup || found_content.is_some() {
                    return Err(DataMashupError::MalformedEnvelope(
                        "more than one DataMashup element",
                    ));
                }
                in_datamashup = true;
                content.clear();
            }
            Ok(Event::Text(t)) if in_datamashup => {
                let text = t
                    .unescape()
                    .map_err(|e| DataMashupError::XmlError(e.to_string()))?;
                content.push_str(&text);
            }
            Ok(Event::CData(t)) if in_datamashup => {
                content.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Ok(Event::End(e)) if is_datamashup_element(e.name().as_ref()) => {
                in_datamashup = false;
                found_content = Some(std::mem::take(&mut content));
            }
            Ok(Event::Eof) if in_datamashup => {
                return Err(DataMashupError::MalformedEnvelope(
                    "unterminated DataMashup element",
                ));
            }
            Ok(Event::Eof) => return Ok(found_content),
            Err(e) => return Err(DataMashupError::XmlError(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
}

pub fn decode_datamashup_base64(text: &str) -> Result<Vec<u8>, DataMashupError> {
    let cleaned: String = text.split_whitespace().collect();
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|_| DataMashupError::Base64Invalid)
}

/// Re-encodes UTF-16 XML (BOM or declared) as UTF-8; `None` means "already UTF-8".
pub(crate) fn decode_datamashup_xml(xml: &[u8]) -> Result<Option<Vec<u8>>, DataMashupError> {
    if xml.starts_with(&[0xFF, 0xFE]) {
        return Ok(Some(decode_utf16(&xml[2..], true)?.into_bytes()));
    }
    if xml.starts_with(&[0xFE, 0xFF]) {
        return Ok(Some(decode_utf16(&xml[2..], false)?.into_bytes()));
    }

    for little_endian in [true, false] {
        if !looks_like_utf16(xml, little_endian) {
            continue;
        }
        let decoded = decode_utf16(xml, little_endian)?;
        let lower = decoded.to_ascii_lowercase();
        if lower.contains("encoding=\"utf-16\"") || lower.contains("encoding='utf-16'") {
            return Ok(Some(decoded.into_bytes()));
        }
    }
    Ok(None)
}

fn looks_like_utf16(xml: &[u8], little_endian: bool) -> bool {
    match xml.get(..4) {
        Some([a, b, c, d]) if little_endian => *a == b'<' && *b == 0 && *c == b'?' && *d == 0,
        Some([a, b, c, d]) => *a == 0 && *b == b'<' && *c == 0 && *d == b'?',
        _ => false,
    }
}

/// Decodes UTF-16 text without a BOM. Shared with the backup-container XML readers.
pub(crate) fn decode_utf16(body: &[u8], little_endian: bool) -> Result<String, DataMashupError> {
    if body.len() % 2 != 0 {
        return Err(DataMashupError::XmlError(
            "invalid UTF-16 byte length".into(),
        ));
    }

    let units = body.chunks_exact(2).map(|chunk| {
        if little_endian {
            u16::from_le_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], chunk[1]])
        }
    });
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| DataMashupError::XmlError("invalid UTF-16 text".into()))
}

fn is_datamashup_element(name: &[u8]) -> bool {
    match name.iter().rposition(|&b| b == b':') {
        Some(idx) => &name[idx + 1..] == b"DataMashup",
        None => name == b"DataMashup",
    }
}

fn read_u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    let array: [u8; 4] = slice.try_into().ok()?;
    Some(u32::from_le_bytes(array))
}

fn read_length(bytes: &[u8], offset: usize) -> Result<usize, DataMashupError> {
    let len = read_u32_at(bytes, offset)
        .ok_or(DataMashupError::MalformedEnvelope("missing package length"))?;
    usize::try_from(len)
        .map_err(|_| DataMashupError::MalformedEnvelope("package length does not fit"))
}

fn take_segment(bytes: &[u8], offset: &mut usize, len: usize) -> Result<Vec<u8>, DataMashupError> {
    let start = *offset;
    let end = start.checked_add(len).ok_or(DataMashupError::MalformedEnvelope(
        "package length overflows",
    ))?;
    let segment = bytes.get(start..end).ok_or(DataMashupError::MalformedEnvelope(
        "package length points past the end of the envelope",
    ))?;
    *offset = end;
    Ok(segment.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_envelope(version: u32, package: &[u8], trailer: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&(package.len() as u32).to_le_bytes());
        bytes.extend_from_slice(package);
        bytes.extend_from_slice(trailer);
        bytes
    }

    #[test]
    fn empty_package_and_trailer_parse() {
        let parsed = parse_data_mashup(&build_envelope(0, b"", b"")).expect("header only");
        assert_eq!(
            parsed,
            RawDataMashup {
                version: 0,
                package_parts: Vec::new(),
                trailer: Vec::new(),
            }
        );
    }

    #[test]
    fn package_and_trailer_are_split_at_declared_length() {
        let bytes = build_envelope(0, b"AAAA", b"TRAILER");
        let parsed = parse_data_mashup(&bytes).expect("valid envelope");
        assert_eq!(parsed.package_parts, b"AAAA");
        assert_eq!(parsed.trailer, b"TRAILER");
        assert_eq!(8 + parsed.package_parts.len() + parsed.trailer.len(), bytes.len());
    }

    #[test]
    fn any_version_is_preserved() {
        let parsed = parse_data_mashup(&build_envelope(7, b"x", b"")).expect("version 7");
        assert_eq!(parsed.version, 7);
    }

    #[test]
    fn length_past_end_is_malformed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"short");
        let err = parse_data_mashup(&bytes).expect_err("length overflows buffer");
        assert!(matches!(err, DataMashupError::MalformedEnvelope(_)));
        assert_eq!(err.code(), error_codes::DM_MALFORMED_ENVELOPE);
    }

    #[test]
    fn max_length_does_not_overflow() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = parse_data_mashup(&bytes).expect_err("u32::MAX length");
        assert!(matches!(err, DataMashupError::MalformedEnvelope(_)));
    }

    #[test]
    fn short_buffers_are_malformed() {
        for len in 0..8 {
            let err = parse_data_mashup(&vec![0u8; len]).expect_err("shorter than header");
            assert!(matches!(err, DataMashupError::MalformedEnvelope(_)));
        }
    }

    #[test]
    fn envelope_fits_matches_parser() {
        assert!(envelope_fits(&build_envelope(0, b"abc", b"")));
        assert!(!envelope_fits(b"\0\0\0\0\xff\0\0\0"));
        assert!(!envelope_fits(b"\0\0"));
    }

    #[test]
    fn base64_payload_decodes_into_envelope() {
        let envelope = build_envelope(0, b"PK", b"");
        let text = format!("  {}\n", STANDARD.encode(&envelope));
        let raw = decode_mashup_payload(&MashupPayload::Base64Text(text)).expect("decode");
        assert_eq!(raw.package_parts, b"PK");
    }

    #[test]
    fn utf16_datamashup_xml_with_bom_decodes() {
        let xml_text = r#"<?xml version="1.0" encoding="utf-16"?><root xmlns:dm="http://schemas.microsoft.com/DataMashup"><dm:DataMashup>QQ==</dm:DataMashup></root>"#;
        let mut xml_bytes = vec![0xFF, 0xFE];
        for unit in xml_text.encode_utf16() {
            xml_bytes.extend_from_slice(&unit.to_le_bytes());
        }

        let text = read_datamashup_text(&xml_bytes)
            .expect("UTF-16 XML should parse")
            .expect("DataMashup element should be found");
        assert_eq!(text.trim(), "QQ==");
    }

    #[test]
    fn utf16_big_endian_without_bom_needs_declaration() {
        let xml_text = r#"<?xml version="1.0" encoding="utf-16"?><DataMashup>QQ==</DataMashup>"#;
        let mut xml_bytes = Vec::new();
        for unit in xml_text.encode_utf16() {
            xml_bytes.extend_from_slice(&unit.to_be_bytes());
        }
        let text = read_datamashup_text(&xml_bytes)
            .expect("declared UTF-16 should parse")
            .expect("element found");
        assert_eq!(text, "QQ==");
    }

    #[test]
    fn utf8_bom_is_tolerated() {
        let xml = b"\xEF\xBB\xBF<?xml version=\"1.0\"?><DataMashup>QQ==</DataMashup>";
        let text = read_datamashup_text(xml).expect("parse").expect("found");
        assert_eq!(text, "QQ==");
    }

    #[test]
    fn elements_with_datamashup_suffix_are_ignored() {
        let xml = br#"<?xml version="1.0"?><root><FooDataMashup>QQ==</FooDataMashup></root>"#;
        assert!(read_datamashup_text(xml).expect("parse").is_none());
    }

    #[test]
    fn duplicate_datamashup_elements_are_malformed() {
        let xml = br#"<root><DataMashup>QQ==</DataMashup><DataMashup>QQ==</DataMashup></root>"#;
        let err = read_datamashup_text(xml).expect_err("duplicates rejected");
        assert!(matches!(err, DataMashupError::MalformedEnvelope(_)));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = decode_datamashup_base64("!!!").expect_err("invalid base64");
        assert!(matches!(err, DataMashupError::Base64Invalid));
    }

    #[test]
    fn pseudo_random_envelopes_never_panic() {
        for seed in 0u64..64 {
            let len = (seed as usize * 7 % 48) + (seed as usize % 5);
            let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let mut bytes = Vec::with_capacity(len);
            for _ in 0..len {
                state = state
                    .wrapping_mul(2862933555777941757)
                    .wrapping_add(3037000493);
                bytes.push((state >> 32) as u8);
            }
            if let Ok(raw) = parse_data_mashup(&bytes) {
                assert_eq!(8 + raw.package_parts.len() + raw.trailer.len(), bytes.len());
            }
        }
    }
}
