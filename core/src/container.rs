//! ZIP-based package navigation.
//!
//! Opens `.xlsx`/`.pbix`/`.pbit` packages (and the archive nested inside a
//! DataMashup envelope), lists their parts and reads them under size limits.
//! [`OpcContainer::locate_data_mashup`] implements the DataMashup detection order.

use std::io::{Cursor, Read, Seek};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::datamashup_framing::{envelope_fits, read_datamashup_text};
use crate::error_codes;

const ZIP_LOCAL_HEADER: &[u8; 4] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8; 4] = b"PK\x05\x06";

/// Root part holding a raw DataMashup envelope in `.pbix`/`.pbit` files.
pub const ROOT_DATAMASHUP_PART: &str = "DataMashup";
const PRIMARY_CUSTOM_XML_PART: &str = "customXml/item1.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerLimits {
    pub max_entries: usize,
    pub max_part_uncompressed_bytes: u64,
    pub max_total_uncompressed_bytes: u64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_part_uncompressed_bytes: 100 * 1024 * 1024,
            max_total_uncompressed_bytes: 500 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a ZIP container")]
    NotZipContainer,
    #[error("archive has too many entries: {entries} (limit: {max_entries})")]
    TooManyEntries { entries: usize, max_entries: usize },
    #[error("part '{path}' is too large: {size} bytes (limit: {limit} bytes)")]
    PartTooLarge { path: String, size: u64, limit: u64 },
    #[error("total uncompressed size exceeds limit: would exceed {limit} bytes")]
    TotalTooLarge { limit: u64 },
    #[error("failed to read ZIP entry '{path}': {reason}")]
    ZipRead { path: String, reason: String },
    #[error("part not found in archive: {path}")]
    PartMissing { path: String },
}

impl ContainerError {
    pub fn code(&self) -> &'static str {
        match self {
            ContainerError::Io(_) => error_codes::CONTAINER_IO,
            ContainerError::NotZipContainer => error_codes::CONTAINER_NOT_ZIP,
            ContainerError::TooManyEntries { .. } => error_codes::CONTAINER_TOO_MANY_ENTRIES,
            ContainerError::PartTooLarge { .. } => error_codes::CONTAINER_PART_TOO_LARGE,
            ContainerError::TotalTooLarge { .. } => error_codes::CONTAINER_TOTAL_TOO_LARGE,
            ContainerError::ZipRead { .. } => error_codes::CONTAINER_ZIP,
            ContainerError::PartMissing { .. } => error_codes::CONTAINER_PART_MISSING,
        }
    }
}

/// Result of structural sniffing on raw upload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Zip,
    Unknown,
}

pub fn sniff_container(bytes: &[u8]) -> ContainerKind {
    if bytes.starts_with(ZIP_LOCAL_HEADER) || bytes.starts_with(ZIP_EMPTY_ARCHIVE) {
        ContainerKind::Zip
    } else {
        ContainerKind::Unknown
    }
}

/// DataMashup bytes as found in the package, before envelope decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MashupPayload {
    /// `version | length | package | trailer` stored directly.
    Binary(Vec<u8>),
    /// Base64 text lifted out of a `DataMashup` XML element.
    Base64Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedMashup {
    pub part_name: String,
    pub payload: MashupPayload,
}

pub(crate) trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

pub struct OpcContainer<'a> {
    archive: ZipArchive<Box<dyn ReadSeek + 'a>>,
    limits: ContainerLimits,
    total_read: u64,
}

impl<'a> OpcContainer<'a> {
    pub fn open_from_bytes(bytes: &'a [u8]) -> Result<OpcContainer<'a>, ContainerError> {
        Self::open_from_bytes_with_limits(bytes, ContainerLimits::default())
    }

    pub fn open_from_bytes_with_limits(
        bytes: &'a [u8],
        limits: ContainerLimits,
    ) -> Result<OpcContainer<'a>, ContainerError> {
        if sniff_container(bytes) != ContainerKind::Zip {
            return Err(ContainerError::NotZipContainer);
        }
        Self::open_from_reader_with_limits(Cursor::new(bytes), limits)
    }

    pub fn open_from_reader<R: Read + Seek + 'a>(
        reader: R,
    ) -> Result<OpcContainer<'a>, ContainerError> {
        Self::open_from_reader_with_limits(reader, ContainerLimits::default())
    }

    pub fn open_from_reader_with_limits<R: Read + Seek + 'a>(
        reader: R,
        limits: ContainerLimits,
    ) -> Result<OpcContainer<'a>, ContainerError> {
        let reader: Box<dyn ReadSeek + 'a> = Box::new(reader);
        let archive = ZipArchive::new(reader).map_err(|err| match err {
            ZipError::InvalidArchive(_) | ZipError::UnsupportedArchive(_) => {
                ContainerError::NotZipContainer
            }
            ZipError::Io(e) => ContainerError::Io(e),
            other => ContainerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other.to_string(),
            )),
        })?;

        if archive.len() > limits.max_entries {
            return Err(ContainerError::TooManyEntries {
                entries: archive.len(),
                max_entries: limits.max_entries,
            });
        }

        Ok(OpcContainer {
            archive,
            limits,
            total_read: 0,
        })
    }

    /// Part names in central-directory order, directory entries skipped.
    pub fn list_parts(&self) -> Vec<String> {
        self.archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect()
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.resolve_part_name(name).is_some()
    }

    /// Maps `name` onto the stored entry name, tolerating a leading `/`,
    /// backslashes and ASCII case differences.
    pub fn resolve_part_name(&self, name: &str) -> Option<String> {
        let wanted = normalize_part_name(name);
        let mut fallback = None;
        for stored in self.archive.file_names() {
            let normalized = normalize_part_name(stored);
            if normalized == wanted {
                return Some(stored.to_string());
            }
            if fallback.is_none() && normalized.eq_ignore_ascii_case(&wanted) {
                fallback = Some(stored.to_string());
            }
        }
        fallback
    }

    /// Reads a part, enforcing the per-part and cumulative byte limits.
    pub fn read_part(&mut self, name: &str) -> Result<Vec<u8>, ContainerError> {
        let stored = self
            .resolve_part_name(name)
            .ok_or_else(|| ContainerError::PartMissing {
                path: name.to_string(),
            })?;

        let size = {
            let file = self.archive.by_name(&stored).map_err(|e| zip_read_error(&stored, e))?;
            file.size()
        };

        if size > self.limits.max_part_uncompressed_bytes {
            return Err(ContainerError::PartTooLarge {
                path: stored,
                size,
                limit: self.limits.max_part_uncompressed_bytes,
            });
        }

        let new_total = self.total_read.saturating_add(size);
        if new_total > self.limits.max_total_uncompressed_bytes {
            return Err(ContainerError::TotalTooLarge {
                limit: self.limits.max_total_uncompressed_bytes,
            });
        }

        let mut file = self.archive.by_name(&stored).map_err(|e| zip_read_error(&stored, e))?;
        let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        file.read_to_end(&mut buf).map_err(|e| ContainerError::ZipRead {
            path: stored.clone(),
            reason: e.to_string(),
        })?;

        self.total_read = new_total;
        Ok(buf)
    }

    pub fn read_part_optional(&mut self, name: &str) -> Result<Option<Vec<u8>>, ContainerError> {
        match self.read_part(name) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ContainerError::PartMissing { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Finds the DataMashup envelope, first match wins:
    ///
    /// 1. the root `DataMashup` part;
    /// 2. `customXml/item1.xml` wrapping base64 text in a `DataMashup` element;
    /// 3. any other `customXml/*.xml` with the same wrapper;
    /// 4. any `customXml/*.bin` holding a raw envelope.
    ///
    /// A candidate that cannot be read is skipped. `Ok(None)` means the package
    /// carries no M source container.
    pub fn locate_data_mashup(&mut self) -> Result<Option<LocatedMashup>, ContainerError> {
        if let Some(stored) = self.resolve_part_name(ROOT_DATAMASHUP_PART) {
            let bytes = self.read_part(&stored)?;
            debug!("DataMashup found at root part '{stored}' ({} bytes)", bytes.len());
            return Ok(Some(LocatedMashup {
                part_name: stored,
                payload: MashupPayload::Binary(bytes),
            }));
        }

        let parts = self.list_parts();
        let mut xml_candidates: Vec<&String> = parts
            .iter()
            .filter(|name| is_custom_xml_item(name, ".xml"))
            .collect();
        xml_candidates.sort_by_key(|name| !name.eq_ignore_ascii_case(PRIMARY_CUSTOM_XML_PART));

        for name in xml_candidates {
            let bytes = match self.read_part(name) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!("skipping '{name}': {err}");
                    continue;
                }
            };
            match read_datamashup_text(&bytes) {
                Ok(Some(text)) => {
                    debug!("DataMashup found in '{name}'");
                    return Ok(Some(LocatedMashup {
                        part_name: name.clone(),
                        payload: MashupPayload::Base64Text(text),
                    }));
                }
                Ok(None) => {}
                Err(err) => debug!("skipping '{name}': {err}"),
            }
        }

        for name in parts.iter().filter(|name| is_custom_xml_item(name, ".bin")) {
            let bytes = match self.read_part(name) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!("skipping '{name}': {err}");
                    continue;
                }
            };
            if envelope_fits(&bytes) {
                debug!("raw DataMashup envelope found in '{name}'");
                return Ok(Some(LocatedMashup {
                    part_name: name.clone(),
                    payload: MashupPayload::Binary(bytes),
                }));
            }
        }

        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limits(&self) -> &ContainerLimits {
        &self.limits
    }
}

fn zip_read_error(path: &str, err: ZipError) -> ContainerError {
    match err {
        ZipError::FileNotFound => ContainerError::PartMissing {
            path: path.to_string(),
        },
        other => ContainerError::ZipRead {
            path: path.to_string(),
            reason: other.to_string(),
        },
    }
}

pub(crate) fn normalize_part_name(name: &str) -> String {
    name.trim_start_matches(['/', '\\']).replace('\\', "/")
}

fn is_custom_xml_item(name: &str, extension: &str) -> bool {
    let normalized = normalize_part_name(name).to_ascii_lowercase();
    normalized.starts_with("customxml/")
        && !normalized["customxml/".len()..].contains('/')
        && normalized.ends_with(extension)
}
