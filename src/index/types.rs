use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Dense identifier of a module file within one index
pub type ModuleId = u32;

/// Name of the index file inside a module cache directory
pub const INDEX_FILE_NAME: &str = "modules.idx";

/// Name of the advisory build marker
pub const LOCK_FILE_NAME: &str = "modules.idx.lock";

/// Size and modification time of a module file when it was indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: u64,
}

impl Fingerprint {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mtime = metadata
            .modified()
            .map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64)
            .unwrap_or(0);
        Self {
            size: metadata.len(),
            mtime,
        }
    }

    pub fn of(path: &Path) -> io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }
}

/// Identity of an indexed module file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFile {
    pub id: ModuleId,
    /// Path relative to the index directory
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// Index configuration, stored as JSON in the app data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Upper bound on occupied / total buckets in the identifier table
    #[serde(default = "default_max_load_factor")]
    pub max_load_factor: f64,

    /// Glob patterns (matched against file names) selecting module files
    #[serde(default = "default_module_patterns")]
    pub module_patterns: Vec<String>,

    /// Age after which another builder's lock is considered abandoned
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Extract names from modules on the rayon pool
    #[serde(default = "default_parallel_scan")]
    pub parallel_scan: bool,

    /// Show progress bars while building from the CLI
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_max_load_factor() -> f64 {
    0.5
}

fn default_module_patterns() -> Vec<String> {
    vec!["*.pcm".to_string()]
}

fn default_lock_timeout_secs() -> u64 {
    600
}

fn default_parallel_scan() -> bool {
    true
}

fn default_show_progress() -> bool {
    true
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_load_factor: default_max_load_factor(),
            module_patterns: default_module_patterns(),
            lock_timeout_secs: default_lock_timeout_secs(),
            parallel_scan: default_parallel_scan(),
            show_progress: default_show_progress(),
        }
    }
}

impl IndexConfig {
    pub const MIN_LOAD_FACTOR: f64 = 0.1;
    pub const MAX_LOAD_FACTOR: f64 = 0.9;

    /// Load factor clamped to a range that keeps probe chains short and the table bounded
    pub fn load_factor(&self) -> f64 {
        if self.max_load_factor.is_nan() {
            return default_max_load_factor();
        }
        self.max_load_factor
            .clamp(Self::MIN_LOAD_FACTOR, Self::MAX_LOAD_FACTOR)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Compile `module_patterns` into a matcher
    pub fn module_matcher(&self) -> Result<GlobSet, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.module_patterns {
            builder.add(Glob::new(pattern)?);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: IndexConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_load_factor, 0.5);
        assert_eq!(config.module_patterns, vec!["*.pcm".to_string()]);
        assert_eq!(config.lock_timeout_secs, 600);
        assert!(config.parallel_scan);
    }

    #[test]
    fn test_load_factor_is_clamped() {
        let mut config = IndexConfig::default();
        config.max_load_factor = 2.0;
        assert_eq!(config.load_factor(), IndexConfig::MAX_LOAD_FACTOR);
        config.max_load_factor = 0.0;
        assert_eq!(config.load_factor(), IndexConfig::MIN_LOAD_FACTOR);
        config.max_load_factor = f64::NAN;
        assert_eq!(config.load_factor(), 0.5);
    }

    #[test]
    fn test_module_matcher() {
        let mut config = IndexConfig::default();
        config.module_patterns.push("*.pch".to_string());
        let matcher = config.module_matcher().unwrap();
        assert!(matcher.is_match("Foundation-3DFBBEGCR1U.pcm"));
        assert!(matcher.is_match("prefix.pch"));
        assert!(!matcher.is_match("modules.idx"));
    }

    #[test]
    fn test_fingerprint_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pcm");
        std::fs::write(&path, b"abc").unwrap();
        let first = Fingerprint::of(&path).unwrap();
        assert_eq!(first.size, 3);
        std::fs::write(&path, b"abcdef").unwrap();
        assert_ne!(Fingerprint::of(&path).unwrap(), first);
    }
}
