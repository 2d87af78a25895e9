//! Backup-format container recovered from a decompressed `DataModel` part.
//!
//! Layout: a UTF-16LE signature, a UTF-16LE `BackupLogHeader` XML document up to
//! offset `0x1000` pointing at a UTF-8 `VirtualDirectory` XML document, which in
//! turn lists every stored file by offset and size. The last stored file is the
//! `BackupLog` mapping logical file paths to their storage paths.

use std::ops::Range;

use log::{debug, warn};
use quick_xml::Reader;
use quick_xml::events::Event;
use rustc_hash::FxHashMap;

use crate::data_model::DataModelError;
use crate::datamashup_framing::decode_utf16;
use crate::xpress::{BACKUP_SIGNATURE, has_backup_signature, signature_bytes};

const HEADER_END: usize = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile {
    pub path: String,
    pub size: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub path: String,
    pub storage_path: String,
}

#[derive(Debug)]
pub struct AbfArchive<'a> {
    data: &'a [u8],
    files: Vec<VirtualFile>,
    log: Vec<LogEntry>,
}

impl<'a> AbfArchive<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DataModelError> {
        if !has_backup_signature(data) {
            return Err(DataModelError::layout("missing backup stream signature"));
        }
        let header_start = signature_bytes(BACKUP_SIGNATURE).len();
        let header_bytes = data
            .get(header_start..HEADER_END.min(data.len()))
            .ok_or_else(|| DataModelError::layout("backup header truncated"))?;
        let header_xml = decode_text(header_bytes)?;
        let header = xml_records(&header_xml, b"BackupLogHeader")
            .into_iter()
            .next()
            .ok_or_else(|| DataModelError::layout("BackupLogHeader not found"))?;

        let offset = number_field(&header, "m_cbOffsetHeader")?;
        let size = number_field(&header, "DataSize")?;
        let directory = slice(data, offset, size)
            .ok_or_else(|| DataModelError::layout("VirtualDirectory outside the stream"))?;
        let directory_xml = decode_text(directory)?;

        let files = xml_records(&directory_xml, b"BackupFile")
            .into_iter()
            .map(|record| {
                Ok(VirtualFile {
                    path: record.get("Path").cloned().unwrap_or_default(),
                    size: number_field(&record, "Size")?,
                    offset: number_field(&record, "m_cbOffsetHeader")?,
                })
            })
            .collect::<Result<Vec<_>, DataModelError>>()?;
        if files.is_empty() {
            return Err(DataModelError::layout("VirtualDirectory lists no files"));
        }

        let log = files
            .last()
            .and_then(|file| slice(data, file.offset, file.size))
            .map(read_backup_log)
            .unwrap_or_default();
        debug!("backup stream: {} files, {} log entries", files.len(), log.len());

        Ok(Self { data, files, log })
    }

    pub fn files(&self) -> &[VirtualFile] {
        &self.files
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Bytes of the stored file whose logical path ends with `name`, resolved
    /// through the backup log, else the first virtual file whose path ends with it.
    pub fn get_data_slice(&self, name: &str) -> Result<&'a [u8], DataModelError> {
        let range = self.get_data_range(name)?;
        Ok(&self.data[range])
    }

    /// Byte range of [`get_data_slice`](Self::get_data_slice) within the stream.
    pub fn get_data_range(&self, name: &str) -> Result<Range<usize>, DataModelError> {
        let storage_path = self
            .log
            .iter()
            .find(|entry| path_matches(&entry.path, name))
            .map(|entry| entry.storage_path.as_str());

        let file = storage_path
            .and_then(|storage| {
                self.files
                    .iter()
                    .find(|f| f.path == storage || path_matches(&f.path, storage))
            })
            .or_else(|| self.files.iter().find(|f| path_matches(&f.path, name)))
            .ok_or_else(|| DataModelError::layout(format!("file '{name}' not in backup")))?;

        range(self.data.len(), file.offset, file.size)
            .ok_or_else(|| DataModelError::layout(format!("file '{name}' outside the stream")))
    }
}

fn read_backup_log(bytes: &[u8]) -> Vec<LogEntry> {
    let text = match decode_text(bytes) {
        Ok(text) => text,
        Err(err) => {
            warn!("backup log unreadable: {err}");
            return Vec::new();
        }
    };
    xml_records(&text, b"BackupFile")
        .into_iter()
        .filter_map(|mut record| {
            Some(LogEntry {
                path: record.remove("Path")?,
                storage_path: record.remove("StoragePath")?,
            })
        })
        .collect()
}

/// `path` equals `name` or ends with it right after a path separator.
fn path_matches(path: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    match path.strip_suffix(name) {
        Some("") => true,
        Some(prefix) => prefix.ends_with(['\\', '/']),
        None => false,
    }
}

fn range(len: usize, offset: u64, size: u64) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    (end <= len).then_some(start..end)
}

fn slice(data: &[u8], offset: u64, size: u64) -> Option<&[u8]> {
    range(data.len(), offset, size).map(|r| &data[r])
}

fn number_field(record: &FxHashMap<String, String>, key: &str) -> Result<u64, DataModelError> {
    record
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| DataModelError::layout(format!("missing or invalid <{key}>")))
}

/// UTF-16LE (with or without BOM) or UTF-8 text, trailing NULs removed.
fn decode_text(bytes: &[u8]) -> Result<String, DataModelError> {
    let text = if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        decode_utf16(even(rest), true)
    } else if bytes.len() >= 2 && bytes[1] == 0 {
        decode_utf16(even(bytes), true)
    } else {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
    .map_err(|e| DataModelError::layout(e.to_string()))?;
    Ok(text.trim_end_matches('\0').to_string())
}

fn even(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len() & !1]
}

/// Child-element text of every `<record>` element, keyed by local name.
/// Stops quietly at the first XML error.
fn xml_records(xml: &str, record: &[u8]) -> Vec<FxHashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut records = Vec::new();
    let mut current: Option<FxHashMap<String, String>> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == record {
                    current = Some(FxHashMap::default());
                } else if current.is_some() {
                    field = Some(String::from_utf8_lossy(name.as_ref()).into_owned());
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(map), Some(key)) = (current.as_mut(), field.as_ref())
                    && let Ok(value) = t.unescape()
                {
                    map.insert(key.clone(), value.into_owned());
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == record {
                    records.extend(current.take());
                }
                field = None;
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    records
}

/// Builds a backup stream holding `files`, each stored under a synthetic
/// storage path and listed in the backup log under `C:\Data\<name>`.
#[cfg(test)]
pub(crate) fn build_abf(files: &[(&str, &[u8])]) -> Vec<u8> {
    fn utf16(text: &str) -> Vec<u8> {
        let mut out = vec![0xFF, 0xFE];
        out.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
        out
    }

    let mut out = signature_bytes(BACKUP_SIGNATURE);
    out.resize(HEADER_END, 0);

    let mut entries = Vec::new();
    let mut log = String::from("<BackupLog><FileGroups><FileGroup><FileList>");
    for (idx, (name, bytes)) in files.iter().enumerate() {
        let storage = format!("{:08X}.{idx}", 0xA0 + idx);
        entries.push((storage.clone(), out.len(), bytes.len()));
        out.extend_from_slice(bytes);
        log.push_str(&format!(
            "<BackupFile><Path>\\\\?\\C:\\Data\\{name}</Path><StoragePath>{storage}</StoragePath><Size>{}</Size></BackupFile>",
            bytes.len()
        ));
    }
    log.push_str("</FileList></FileGroup></FileGroups></BackupLog>");
    let log_bytes = utf16(&log);
    entries.push(("BackupLog".to_string(), out.len(), log_bytes.len()));
    out.extend_from_slice(&log_bytes);

    let mut directory = String::from("<VirtualDirectory>");
    for (path, offset, size) in &entries {
        directory.push_str(&format!(
            "<BackupFile><Path>{path}</Path><Size>{size}</Size><m_cbOffsetHeader>{offset}</m_cbOffsetHeader><Delete>false</Delete></BackupFile>"
        ));
    }
    directory.push_str("</VirtualDirectory>");
    let directory_offset = out.len();
    out.extend_from_slice(directory.as_bytes());

    let header = format!(
        "<BackupLogHeader><BackupRestoreSyncVersion>1</BackupRestoreSyncVersion><m_cbOffsetHeader>{directory_offset}</m_cbOffsetHeader><DataSize>{}</DataSize><ApplyCompression>true</ApplyCompression></BackupLogHeader>",
        directory.len()
    );
    let header_bytes: Vec<u8> = header.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let start = signature_bytes(BACKUP_SIGNATURE).len();
    out[start..start + header_bytes.len()].copy_from_slice(&header_bytes);
    out
}
