use crate::error::IndexError;
use crate::format::{BlockKind, ContainerWriter, Header, IndexState, STATE_OFFSET};
use crate::index::registry::ModuleRegistry;
use crate::index::table::{write_table, IdentifierEntry};
use crate::index::types::INDEX_FILE_NAME;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Prefix of staging files written next to the index
const STAGING_PREFIX: &str = ".modules.idx-";
const STAGING_SUFFIX: &str = ".tmp";

/// Informational block describing how a generation was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub created_at: u64,
    pub tool_version: String,
    pub max_load_factor: f64,
}

/// A fully serialized index generation
#[derive(Debug)]
pub struct SerializedIndex {
    pub bytes: Vec<u8>,
    pub bucket_count: usize,
    pub identifier_count: usize,
}

/// Serializes a registry and identifier entries into the container format
pub struct IndexWriter<'a> {
    registry: &'a ModuleRegistry,
    entries: &'a [IdentifierEntry],
    generation: u64,
    max_load_factor: f64,
}

impl<'a> IndexWriter<'a> {
    pub fn new(
        registry: &'a ModuleRegistry,
        entries: &'a [IdentifierEntry],
        generation: u64,
        max_load_factor: f64,
    ) -> Self {
        Self {
            registry,
            entries,
            generation,
            max_load_factor,
        }
    }

    /// Produce the file image. The header state is `Building`; [`publish`]
    /// marks it complete once every byte is on disk.
    pub fn serialize(&self) -> SerializedIndex {
        let table = write_table(self.entries, self.max_load_factor);

        let header = Header::new(
            self.generation,
            self.registry.module_count() as u32,
            table.entry_count as u32,
        );
        let mut container = ContainerWriter::new(header);
        container.add_block(BlockKind::Modules, self.registry.encode());
        container.add_block(BlockKind::IdentifierTable, table.table);
        container.add_block(BlockKind::IdentifierStrings, table.strings);
        container.add_block(BlockKind::ModuleSets, table.sets);

        let info = BuildInfo {
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            max_load_factor: self.max_load_factor,
        };
        container.add_block(
            BlockKind::BuildInfo,
            serde_json::to_vec(&info).unwrap_or_default(),
        );

        SerializedIndex {
            bytes: container.finish(),
            bucket_count: table.bucket_count,
            identifier_count: table.entry_count,
        }
    }
}

/// Write `bytes` to a staging file in `dir` and atomically rename it over the
/// index. Readers see either the previous file or the complete new one.
pub fn publish(dir: &Path, bytes: &[u8]) -> Result<PathBuf, IndexError> {
    let target = dir.join(INDEX_FILE_NAME);
    let publish_error = |source: std::io::Error| IndexError::Publish {
        path: target.clone(),
        source,
    };

    let mut staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(STAGING_SUFFIX)
        .tempfile_in(dir)
        .map_err(publish_error)?;

    staging.write_all(bytes).map_err(publish_error)?;
    staging.flush().map_err(publish_error)?;

    let file = staging.as_file_mut();
    file.seek(SeekFrom::Start(STATE_OFFSET as u64))
        .map_err(publish_error)?;
    file.write_all(&(IndexState::Complete as u32).to_le_bytes())
        .map_err(publish_error)?;
    file.sync_all().map_err(publish_error)?;

    staging
        .persist(&target)
        .map_err(|err| publish_error(err.error))?;

    debug!(index = %target.display(), bytes = bytes.len(), "published index");
    Ok(target)
}

/// Delete staging files left behind by builders that died mid-write.
/// Only call while holding the build lock.
pub fn remove_staging_files(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(STAGING_PREFIX)
            && name.ends_with(STAGING_SUFFIX)
            && fs::remove_file(entry.path()).is_ok()
        {
            debug!(file = %name, "removed stale staging file");
            removed += 1;
        }
    }
    removed
}
