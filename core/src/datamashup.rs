use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Serialize;

use crate::datamashup_framing::{DataMashupError, RawDataMashup};
use crate::datamashup_package::{DataMashupLimits, PackageParts, parse_package_parts_with_limits};

/// A fully opened DataMashup: inner package plus whatever the trailer yielded.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMashup {
    pub version: u32,
    pub package_parts: PackageParts,
    pub permissions: Option<Permissions>,
    pub trailer: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub can_evaluate_future_packages: bool,
    pub firewall_enabled: bool,
    pub workbook_group_type: Option<String>,
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            can_evaluate_future_packages: false,
            firewall_enabled: true,
            workbook_group_type: None,
        }
    }
}

pub fn build_data_mashup(
    raw: &RawDataMashup,
    limits: DataMashupLimits,
) -> Result<DataMashup, DataMashupError> {
    let package_parts = parse_package_parts_with_limits(&raw.package_parts, limits)?;
    let permissions = trailer_sections(&raw.trailer)
        .and_then(|sections| sections.first().copied())
        .filter(|bytes| looks_like_xml(bytes))
        .map(parse_permissions);

    Ok(DataMashup {
        version: raw.version,
        package_parts,
        permissions,
        trailer: raw.trailer.clone(),
    })
}

/// Splits the trailer into its length-prefixed sections
/// (permissions, metadata, permission bindings).
///
/// Returns `None` when the trailer does not follow that layout exactly; it is
/// then treated as opaque.
pub fn trailer_sections(trailer: &[u8]) -> Option<Vec<&[u8]>> {
    if trailer.is_empty() {
        return None;
    }
    let mut sections = Vec::new();
    let mut offset = 0usize;
    while offset < trailer.len() {
        let len_bytes: [u8; 4] = trailer.get(offset..offset + 4)?.try_into().ok()?;
        let len = usize::try_from(u32::from_le_bytes(len_bytes)).ok()?;
        let start = offset + 4;
        let end = start.checked_add(len)?;
        sections.push(trailer.get(start..end)?);
        offset = end;
    }
    Some(sections)
}

pub fn parse_permissions(xml_bytes: &[u8]) -> Permissions {
    let bytes = xml_bytes
        .strip_prefix(b"\xEF\xBB\xBF".as_slice())
        .unwrap_or(xml_bytes);
    let Ok(text) = std::str::from_utf8(bytes) else {
        return Permissions::default();
    };

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut current_tag: Option<String> = None;
    let mut permissions = Permissions::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                current_tag = Some(String::from_utf8_lossy(&name).into_owned());
            }
            Ok(Event::Text(t)) => {
                let Some(tag) = current_tag.as_deref() else {
                    continue;
                };
                // An unescape failure makes the whole payload unusable.
                let Ok(value) = t.unescape() else {
                    return Permissions::default();
                };
                apply_permission(&mut permissions, tag, &value);
            }
            Ok(Event::End(_)) => current_tag = None,
            Ok(Event::Eof) => break,
            Err(_) => return Permissions::default(),
            _ => {}
        }
    }

    permissions
}

fn apply_permission(permissions: &mut Permissions, tag: &str, value: &str) {
    match tag {
        "CanEvaluateFuturePackages" => {
            if let Some(v) = parse_bool(value) {
                permissions.can_evaluate_future_packages = v;
            }
        }
        "FirewallEnabled" => {
            if let Some(v) = parse_bool(value) {
                permissions.firewall_enabled = v;
            }
        }
        "WorkbookGroupType" => {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                permissions.workbook_group_type = Some(trimmed.to_string());
            }
        }
        _ => {}
    }
}

fn looks_like_xml(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'<')
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(bytes: &[u8]) -> Vec<u8> {
        let mut out = (bytes.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(bytes);
        out
    }

    #[test]
    fn trailer_sections_split_length_prefixed_blocks() {
        let mut trailer = section(b"<Permissions/>");
        trailer.extend(section(b"meta"));
        trailer.extend(section(b""));
        let sections = trailer_sections(&trailer).expect("well-formed trailer");
        assert_eq!(sections, vec![&b"<Permissions/>"[..], &b"meta"[..], &b""[..]]);
    }

    #[test]
    fn opaque_trailer_is_not_split() {
        assert!(trailer_sections(b"\xff\xff\xff\xff").is_none());
        assert!(trailer_sections(b"").is_none());
    }

    #[test]
    fn permissions_xml_is_read() {
        let xml = br#"<?xml version="1.0" encoding="utf-8"?>
<PermissionList xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <CanEvaluateFuturePackages>true</CanEvaluateFuturePackages>
  <FirewallEnabled>false</FirewallEnabled>
  <WorkbookGroupType>None</WorkbookGroupType>
</PermissionList>"#;
        let permissions = parse_permissions(xml);
        assert!(permissions.can_evaluate_future_packages);
        assert!(!permissions.firewall_enabled);
        assert_eq!(permissions.workbook_group_type.as_deref(), Some("None"));
    }

    #[test]
    fn broken_permissions_fall_back_to_defaults() {
        assert_eq!(parse_permissions(b"<a><b></a>"), Permissions::default());
        assert_eq!(parse_permissions(&[0xff, 0xfe]), Permissions::default());
    }
}
