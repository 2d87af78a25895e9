//! Stable, machine-readable error codes.
//!
//! Codes are part of the JSON output contract; message text is not.

pub const CONTAINER_IO: &str = "PQX-C001";
pub const CONTAINER_ZIP: &str = "PQX-C002";
pub const CONTAINER_NOT_ZIP: &str = "PQX-C003";
pub const CONTAINER_TOO_MANY_ENTRIES: &str = "PQX-C004";
pub const CONTAINER_PART_TOO_LARGE: &str = "PQX-C005";
pub const CONTAINER_TOTAL_TOO_LARGE: &str = "PQX-C006";
pub const CONTAINER_PART_MISSING: &str = "PQX-C007";

pub const DM_MALFORMED_ENVELOPE: &str = "PQX-D001";
pub const DM_BASE64_INVALID: &str = "PQX-D002";
pub const DM_XML: &str = "PQX-D003";
pub const DM_INNER_ARCHIVE: &str = "PQX-D004";
pub const DM_NO_FORMULA_SECTION: &str = "PQX-D005";
pub const DM_INNER_LIMIT: &str = "PQX-D006";

pub const M_SECTION_SYNTAX: &str = "PQX-M001";

pub const GRID_XML: &str = "PQX-G001";
pub const GRID_ADDRESS: &str = "PQX-G002";
pub const GRID_SHARED_STRING: &str = "PQX-G003";
pub const GRID_WORKBOOK_MISSING: &str = "PQX-G004";

pub const MODEL_DECOMPRESSION: &str = "PQX-V001";
pub const MODEL_UNSUPPORTED_LAYOUT: &str = "PQX-V002";
pub const MODEL_SCHEMA: &str = "PQX-V003";

pub const EXPORT_INVALID_SHAPE: &str = "PQX-E001";
pub const EXPORT_ENCODING: &str = "PQX-E002";

pub const CONFIG_INVALID: &str = "PQX-K001";

pub const NO_QUERIES_FOUND: &str = "PQX-N001";
