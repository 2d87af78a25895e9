use log::debug;
use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::ExtractConfig;
use crate::package::{BatchResult, FileResult, InputFile, process_file};

/// Cache key for an upload: same name, length and content hash means same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub name: String,
    pub len: u64,
    pub xxh3: u64,
}

impl FileIdentity {
    pub fn of(name: &str, bytes: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            len: bytes.len() as u64,
            xxh3: xxh3_64(bytes),
        }
    }
}

/// Holds parsed results across uploads so a re-dropped file is not decoded twice.
///
/// The cache only grows until [`ExtractSession::reset`]; the config is fixed
/// for the session's lifetime so cached results never go stale.
pub struct ExtractSession {
    config: ExtractConfig,
    cache: FxHashMap<FileIdentity, FileResult>,
}

impl Default for ExtractSession {
    fn default() -> Self {
        Self::new(ExtractConfig::default())
    }
}

impl ExtractSession {
    pub fn new(config: ExtractConfig) -> Self {
        Self {
            config,
            cache: FxHashMap::default(),
        }
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn contains(&self, identity: &FileIdentity) -> bool {
        self.cache.contains_key(identity)
    }

    pub fn process_file(&mut self, name: &str, bytes: &[u8]) -> FileResult {
        let identity = FileIdentity::of(name, bytes);
        if let Some(hit) = self.cache.get(&identity) {
            debug!("'{name}': cached result reused");
            return hit.clone();
        }
        let result = process_file(name, bytes, &self.config);
        self.cache.insert(identity, result.clone());
        result
    }

    pub fn process_batch(&mut self, files: &[InputFile]) -> BatchResult {
        BatchResult {
            files: files
                .iter()
                .map(|file| self.process_file(&file.name, &file.bytes))
                .collect(),
        }
    }

    /// Every result cached so far, in no particular order.
    pub fn cached(&self) -> impl Iterator<Item = &FileResult> {
        self.cache.values()
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }
}
