use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::container::{ContainerError, ContainerLimits, OpcContainer, normalize_part_name};
use crate::datamashup_framing::DataMashupError;

pub const SECTION_PART: &str = "Formulas/Section1.m";
const PACKAGE_XML_PART: &str = "Config/Package.xml";
const CONTENT_PREFIX: &str = "Content/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataMashupLimits {
    pub max_inner_entries: usize,
    pub max_inner_part_bytes: u64,
    pub max_inner_total_bytes: u64,
}

impl Default for DataMashupLimits {
    fn default() -> Self {
        Self {
            max_inner_entries: 10_000,
            max_inner_part_bytes: 100 * 1024 * 1024,
            max_inner_total_bytes: 500 * 1024 * 1024,
        }
    }
}

impl DataMashupLimits {
    fn as_container_limits(&self) -> ContainerLimits {
        ContainerLimits {
            max_entries: self.max_inner_entries,
            max_part_uncompressed_bytes: self.max_inner_part_bytes,
            max_total_uncompressed_bytes: self.max_inner_total_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDocument {
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedContent {
    /// Normalized path of the embedded package inside the outer one (never starts with '/').
    pub name: String,
    pub section: SectionDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageParts {
    pub package_xml: Option<String>,
    pub main_section: SectionDocument,
    pub embedded_contents: Vec<EmbeddedContent>,
}

pub fn parse_package_parts(bytes: &[u8]) -> Result<PackageParts, DataMashupError> {
    parse_package_parts_with_limits(bytes, DataMashupLimits::default())
}

/// Opens the archive carried by a DataMashup envelope and reads its M section.
///
/// Fails with [`DataMashupError::NoFormulaSection`] when the archive is readable
/// but has no `Formulas/Section1.m`.
pub fn parse_package_parts_with_limits(
    bytes: &[u8],
    limits: DataMashupLimits,
) -> Result<PackageParts, DataMashupError> {
    let mut container = OpcContainer::open_from_bytes_with_limits(bytes, limits.as_container_limits())
        .map_err(inner_error)?;

    let mut package_xml: Option<String> = None;
    let mut main_section: Option<SectionDocument> = None;
    let mut embedded_contents: Vec<EmbeddedContent> = Vec::new();

    for stored in container.list_parts() {
        let name = normalize_part_name(&stored);
        if package_xml.is_none() && name == PACKAGE_XML_PART {
            let bytes = container.read_part(&stored).map_err(inner_error)?;
            package_xml = Some(decode_text(&bytes, &name));
            continue;
        }
        if main_section.is_none() && name == SECTION_PART {
            let bytes = container.read_part(&stored).map_err(inner_error)?;
            main_section = Some(SectionDocument {
                source: decode_text(&bytes, &name),
            });
            continue;
        }
        if !name.starts_with(CONTENT_PREFIX) {
            continue;
        }

        let content_bytes = container.read_part(&stored).map_err(inner_error)?;
        if let Some(root) = name.strip_suffix(&format!("/{SECTION_PART}")) {
            if embedded_contents.iter().all(|e| e.name != root) {
                embedded_contents.push(EmbeddedContent {
                    name: root.to_string(),
                    section: SectionDocument {
                        source: decode_text(&content_bytes, &name),
                    },
                });
            }
            continue;
        }

        if let Some(source) = extract_embedded_section(&content_bytes, limits)? {
            debug!("embedded M section found in '{name}'");
            embedded_contents.push(EmbeddedContent {
                name,
                section: SectionDocument { source },
            });
        }
    }

    let main_section = main_section.ok_or(DataMashupError::NoFormulaSection)?;
    Ok(PackageParts {
        package_xml,
        main_section,
        embedded_contents,
    })
}

fn extract_embedded_section(
    bytes: &[u8],
    limits: DataMashupLimits,
) -> Result<Option<String>, DataMashupError> {
    let mut container =
        match OpcContainer::open_from_bytes_with_limits(bytes, limits.as_container_limits()) {
            Ok(container) => container,
            Err(ContainerError::TooManyEntries {
                entries,
                max_entries,
            }) => {
                return Err(DataMashupError::InnerTooManyEntries {
                    entries,
                    max_entries,
                });
            }
            Err(_) => return Ok(None),
        };

    match container.read_part_optional(SECTION_PART) {
        Ok(Some(bytes)) => Ok(Some(decode_text(&bytes, SECTION_PART))),
        Ok(None) => Ok(None),
        Err(err) => Err(inner_error(err)),
    }
}

fn inner_error(err: ContainerError) -> DataMashupError {
    match err {
        ContainerError::TooManyEntries {
            entries,
            max_entries,
        } => DataMashupError::InnerTooManyEntries {
            entries,
            max_entries,
        },
        ContainerError::PartTooLarge { path, size, limit } => {
            DataMashupError::InnerPartTooLarge { path, size, limit }
        }
        ContainerError::TotalTooLarge { limit } => DataMashupError::InnerTotalTooLarge { limit },
        other => DataMashupError::InnerArchive(other.to_string()),
    }
}

fn decode_text(bytes: &[u8], name: &str) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(err) => {
            warn!("'{name}' is not valid UTF-8 ({err}); decoding lossily");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, bytes) in entries {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(bytes).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    #[test]
    fn reads_section_and_strips_bom() {
        let bytes = build_zip(&[
            ("[Content_Types].xml", b"<Types/>"),
            ("Formulas/Section1.m", "\u{FEFF}section Section1;".as_bytes()),
        ]);
        let parts = parse_package_parts(&bytes).expect("package parses");
        assert_eq!(parts.main_section.source, "section Section1;");
        assert_eq!(parts.package_xml, None);
    }

    #[test]
    fn missing_section_is_no_formula_section() {
        let bytes = build_zip(&[("Config/Package.xml", b"<Package/>")]);
        let err = parse_package_parts(&bytes).expect_err("no section");
        assert!(matches!(err, DataMashupError::NoFormulaSection));
    }

    #[test]
    fn garbage_package_is_inner_archive_error() {
        let err = parse_package_parts(b"PK\x03\x04garbage").expect_err("not a zip");
        assert!(matches!(err, DataMashupError::InnerArchive(_)));
    }

    #[test]
    fn embedded_content_packages_are_collected() {
        let nested = build_zip(&[("Formulas/Section1.m", b"section Inner;")]);
        let bytes = build_zip(&[
            ("Config/Package.xml", b"<Package/>"),
            ("Formulas/Section1.m", b"section Section1;"),
            ("Content/abc.package", &nested),
            ("Content/raw/Formulas/Section1.m", b"section Raw;"),
        ]);
        let parts = parse_package_parts(&bytes).expect("package parses");
        assert_eq!(parts.package_xml.as_deref(), Some("<Package/>"));
        let names: Vec<_> = parts.embedded_contents.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Content/abc.package", "Content/raw"]);
        assert_eq!(parts.embedded_contents[0].section.source, "section Inner;");
    }

    #[test]
    fn inner_part_limit_is_enforced() {
        let bytes = build_zip(&[("Formulas/Section1.m", &[b'a'; 128])]);
        let limits = DataMashupLimits {
            max_inner_part_bytes: 16,
            ..DataMashupLimits::default()
        };
        let err = parse_package_parts_with_limits(&bytes, limits).expect_err("too large");
        assert!(matches!(err, DataMashupError::InnerPartTooLarge { size: 128, .. }));
    }
}
