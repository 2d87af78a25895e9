//! Configuration for the extraction pipeline.
//!
//! `ExtractConfig` collects every size cap and preview knob so the decoders
//! never hardcode their own limits.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::ContainerLimits;
use crate::datamashup_package::DataMashupLimits;
use crate::error_codes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub container: ContainerLimits,
    pub datamashup: DataMashupLimits,
    #[serde(alias = "row_limit")]
    pub preview_row_limit: usize,
    pub top_k: usize,
    pub export_chunk_rows: usize,
    pub max_decompressed_bytes: u64,
    pub include_worksheets: bool,
    pub include_data_model: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            container: ContainerLimits::default(),
            datamashup: DataMashupLimits::default(),
            preview_row_limit: 500,
            top_k: 5,
            export_chunk_rows: 1_000,
            max_decompressed_bytes: 1024 * 1024 * 1024,
            include_worksheets: true,
            include_data_model: true,
        }
    }
}

impl ExtractConfig {
    /// Queries only: no worksheet previews, no data-model decoding.
    pub fn queries_only() -> Self {
        Self {
            include_worksheets: false,
            include_data_model: false,
            ..Default::default()
        }
    }

    pub fn builder() -> ExtractConfigBuilder {
        ExtractConfigBuilder {
            inner: ExtractConfig::default(),
        }
    }

    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ExtractConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_non_zero(self.preview_row_limit as u64, "preview_row_limit")?;
        ensure_non_zero(self.top_k as u64, "top_k")?;
        ensure_non_zero(self.export_chunk_rows as u64, "export_chunk_rows")?;
        ensure_non_zero(self.max_decompressed_bytes, "max_decompressed_bytes")?;
        ensure_non_zero(self.container.max_entries as u64, "container.max_entries")?;
        ensure_non_zero(
            self.container.max_part_uncompressed_bytes,
            "container.max_part_uncompressed_bytes",
        )?;
        ensure_non_zero(
            self.datamashup.max_inner_entries as u64,
            "datamashup.max_inner_entries",
        )?;
        ensure_non_zero(
            self.datamashup.max_inner_part_bytes,
            "datamashup.max_inner_part_bytes",
        )?;

        if self.container.max_total_uncompressed_bytes < self.container.max_part_uncompressed_bytes
        {
            return Err(ConfigError::TotalBelowPart {
                field: "container.max_total_uncompressed_bytes",
                total: self.container.max_total_uncompressed_bytes,
                part: self.container.max_part_uncompressed_bytes,
            });
        }
        if self.datamashup.max_inner_total_bytes < self.datamashup.max_inner_part_bytes {
            return Err(ConfigError::TotalBelowPart {
                field: "datamashup.max_inner_total_bytes",
                total: self.datamashup.max_inner_total_bytes,
                part: self.datamashup.max_inner_part_bytes,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero (got {value})")]
    NonPositiveLimit { field: &'static str, value: u64 },
    #[error("{field} ({total}) is smaller than the per-part limit ({part})")]
    TotalBelowPart {
        field: &'static str,
        total: u64,
        part: u64,
    },
    #[error("invalid configuration JSON: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        error_codes::CONFIG_INVALID
    }
}

fn ensure_non_zero(value: u64, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NonPositiveLimit { field, value });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExtractConfigBuilder {
    inner: ExtractConfig,
}

impl Default for ExtractConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractConfigBuilder {
    pub fn new() -> Self {
        ExtractConfig::builder()
    }

    pub fn container_limits(mut self, value: ContainerLimits) -> Self {
        self.inner.container = value;
        self
    }

    pub fn datamashup_limits(mut self, value: DataMashupLimits) -> Self {
        self.inner.datamashup = value;
        self
    }

    pub fn preview_row_limit(mut self, value: usize) -> Self {
        self.inner.preview_row_limit = value;
        self
    }

    pub fn top_k(mut self, value: usize) -> Self {
        self.inner.top_k = value;
        self
    }

    pub fn export_chunk_rows(mut self, value: usize) -> Self {
        self.inner.export_chunk_rows = value;
        self
    }

    pub fn max_decompressed_bytes(mut self, value: u64) -> Self {
        self.inner.max_decompressed_bytes = value;
        self
    }

    pub fn include_worksheets(mut self, value: bool) -> Self {
        self.inner.include_worksheets = value;
        self
    }

    pub fn include_data_model(mut self, value: bool) -> Self {
        self.inner.include_data_model = value;
        self
    }

    pub fn build(self) -> Result<ExtractConfig, ConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ExtractConfig::default();
        assert_eq!(cfg.preview_row_limit, 500);
        assert_eq!(cfg.top_k, 5);
        assert!(cfg.include_worksheets);
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn serde_roundtrip_preserves_defaults() {
        let cfg = ExtractConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize default config");
        let parsed: ExtractConfig = serde_json::from_str(&json).expect("deserialize config");
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let cfg = ExtractConfig::from_json(r#"{ "row_limit": 20, "top_k": 3 }"#)
            .expect("partial config");
        assert_eq!(cfg.preview_row_limit, 20);
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.export_chunk_rows, 1_000);
        assert_eq!(cfg.container, ContainerLimits::default());
    }

    #[test]
    fn builder_rejects_zero_limits() {
        let err = ExtractConfig::builder()
            .preview_row_limit(0)
            .build()
            .expect_err("zero row limit");
        assert_eq!(
            err,
            ConfigError::NonPositiveLimit {
                field: "preview_row_limit",
                value: 0
            }
        );
        assert_eq!(err.code(), "PQX-K001");
    }

    #[test]
    fn total_limit_must_cover_part_limit() {
        let err = ExtractConfig::builder()
            .container_limits(ContainerLimits {
                max_entries: 10,
                max_part_uncompressed_bytes: 100,
                max_total_uncompressed_bytes: 50,
            })
            .build()
            .expect_err("total below part");
        assert!(matches!(err, ConfigError::TotalBelowPart { total: 50, part: 100, .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            ExtractConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
