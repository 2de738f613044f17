use crate::error::{ErrorCode, FormatError, IndexError};
use crate::format::{BlockKind, Container, Header, IndexState};
use crate::index::lock::BuildLock;
use crate::index::registry::ModuleRegistry;
use crate::index::table::{IdentifierTable, TableStats};
use crate::index::types::*;
use crate::index::writer::BuildInfo;
use memmap2::Mmap;
use roaring::RoaringBitmap;
use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Identifier lookups performed by this process
static IDENTIFIER_LOOKUPS: AtomicU64 = AtomicU64::new(0);

/// Lookups that found the identifier in an index
static IDENTIFIER_LOOKUP_HITS: AtomicU64 = AtomicU64::new(0);

/// Process-wide lookup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub lookups: u64,
    pub hits: u64,
}

impl LookupStats {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

/// Snapshot of the process-wide counters
pub fn lookup_stats() -> LookupStats {
    LookupStats {
        lookups: IDENTIFIER_LOOKUPS.load(Ordering::Relaxed),
        hits: IDENTIFIER_LOOKUP_HITS.load(Ordering::Relaxed),
    }
}

/// Result of [`IndexReader::lookup_identifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierLookup<'a> {
    /// The index knows the identifier
    pub found: bool,
    /// Up-to-date module files declaring it, in id order
    pub hits: Vec<&'a ModuleFile>,
}

/// Byte ranges of the table blocks inside the mapping
#[derive(Debug, Clone)]
struct TableRanges {
    table: Range<usize>,
    strings: Range<usize>,
    sets: Range<usize>,
}

/// Memory-mapped view of a published index.
///
/// Opening validates the header and decodes the module table; the identifier
/// table is probed in place on each lookup. Modules whose files changed since
/// the index was built are treated as gaps.
pub struct IndexReader {
    dir: PathBuf,
    index_path: PathBuf,
    mmap: Mmap,
    header: Header,
    registry: ModuleRegistry,
    /// Modules whose file no longer matches its fingerprint
    stale: RoaringBitmap,
    tables: TableRanges,
    build_info: Option<Range<usize>>,
}

impl IndexReader {
    /// Open the index of a module cache directory
    pub fn open(dir: &Path) -> Result<Self, IndexError> {
        Self::open_with_config(dir, &IndexConfig::default())
    }

    pub fn open_with_config(dir: &Path, config: &IndexConfig) -> Result<Self, IndexError> {
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let index_path = dir.join(INDEX_FILE_NAME);

        match Self::open_file(&dir, &index_path) {
            Err(IndexError::NotFound(_)) if BuildLock::is_held(&dir, config.lock_timeout()) => {
                Err(IndexError::Building(dir))
            }
            result => result,
        }
    }

    /// Open a specific index file without consulting the build lock
    pub fn open_file(dir: &Path, index_path: &Path) -> Result<Self, IndexError> {
        let file = match File::open(index_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound(dir.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };

        if file.metadata()?.len() < Header::SIZE as u64 {
            return Err(FormatError::Truncated.into());
        }

        // SAFETY: published index files are never written in place; a new
        // generation replaces the file by rename, leaving this mapping intact.
        let mmap = unsafe { Mmap::map(&file)? };

        let container = Container::parse(&mmap)?;
        let header = container.header;
        if header.state == IndexState::Building {
            return Err(IndexError::Building(dir.to_path_buf()));
        }

        let registry = ModuleRegistry::decode(dir, container.require(BlockKind::Modules)?.data)?;
        if registry.module_count() != header.module_count as usize {
            return Err(FormatError::corrupt(format!(
                "header lists {} modules, module block has {}",
                header.module_count,
                registry.module_count()
            ))
            .into());
        }

        let table = container.require(BlockKind::IdentifierTable)?;
        let strings = container.require(BlockKind::IdentifierStrings)?;
        let sets = container.require(BlockKind::ModuleSets)?;
        IdentifierTable::new(table.data, strings.data, sets.data)?;

        let tables = TableRanges {
            table: table.range(),
            strings: strings.range(),
            sets: sets.range(),
        };
        let build_info = container.block(BlockKind::BuildInfo).map(|b| b.range());
        drop(container);

        let stale: RoaringBitmap = registry
            .iter()
            .map(|record| record.file.id)
            .filter(|&id| registry.is_stale(id))
            .collect();
        if !stale.is_empty() {
            debug!(
                stale = stale.len(),
                "module files changed since the index was built"
            );
        }

        debug!(
            index = %index_path.display(),
            generation = header.generation,
            modules = header.module_count,
            identifiers = header.identifier_count,
            "opened global module index"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            index_path: index_path.to_path_buf(),
            mmap,
            header,
            registry,
            stale,
            tables,
            build_info,
        })
    }

    fn table(&self) -> Option<IdentifierTable<'_>> {
        IdentifierTable::new(
            &self.mmap[self.tables.table.clone()],
            &self.mmap[self.tables.strings.clone()],
            &self.mmap[self.tables.sets.clone()],
        )
        .ok()
    }

    /// Whether `id` names a module with a current entry
    pub fn is_current(&self, id: ModuleId) -> bool {
        self.registry.get(id).is_some() && !self.stale.contains(id)
    }

    /// A current module by id
    pub fn module(&self, id: ModuleId) -> Option<&ModuleFile> {
        if self.stale.contains(id) {
            return None;
        }
        self.registry.get(id).map(|record| &record.file)
    }

    /// Every module with an up-to-date entry
    pub fn known_modules(&self) -> Vec<&ModuleFile> {
        self.registry
            .iter()
            .filter(|record| !self.stale.contains(record.file.id))
            .map(|record| &record.file)
            .collect()
    }

    /// Modules recorded in the index whose files have since changed or vanished
    pub fn stale_modules(&self) -> Vec<&ModuleFile> {
        self.stale
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|record| &record.file)
            .collect()
    }

    pub fn has_stale_modules(&self) -> bool {
        !self.stale.is_empty()
    }

    /// Resolve a module path (relative to the directory, or absolute)
    pub fn module_id(&self, path: &Path) -> Option<ModuleId> {
        self.registry.lookup_by_file(path).or_else(|| {
            let canonical = path.canonicalize().ok()?;
            self.registry.lookup_by_file(&canonical)
        })
    }

    /// Direct dependencies of a module file, in import order. Empty for
    /// unknown or stale modules.
    pub fn dependencies_of(&self, module: &Path) -> Vec<&ModuleFile> {
        let Some(id) = self.module_id(module).filter(|&id| self.is_current(id)) else {
            return Vec::new();
        };
        self.registry
            .dependencies_of(id)
            .iter()
            .filter_map(|&dep| self.module(dep))
            .collect()
    }

    /// Modules with a namespace-scope binding or method named `name`.
    ///
    /// A hit is a strong hint to load those modules; a miss says nothing about
    /// modules that are not indexed.
    pub fn lookup_identifier(&self, name: &str) -> IdentifierLookup<'_> {
        IDENTIFIER_LOOKUPS.fetch_add(1, Ordering::Relaxed);

        let ids = self
            .table()
            .map(|table| table.lookup(name))
            .unwrap_or_default();
        if ids.is_empty() {
            return IdentifierLookup {
                found: false,
                hits: Vec::new(),
            };
        }

        IDENTIFIER_LOOKUP_HITS.fetch_add(1, Ordering::Relaxed);
        IdentifierLookup {
            found: true,
            hits: ids.iter().filter_map(|id| self.module(id)).collect(),
        }
    }

    /// Every identifier in the table with its module ids, stale ones included
    pub fn identifiers(&self) -> impl Iterator<Item = (&str, Vec<ModuleId>)> + '_ {
        self.table().into_iter().flat_map(IdentifierTable::iter)
    }

    /// Process-wide lookup counters
    pub fn stats(&self) -> LookupStats {
        lookup_stats()
    }

    /// Print lookup statistics to standard error
    pub fn print_stats(&self) {
        let stats = self.stats();
        eprintln!("*** Global Module Index Statistics:");
        if stats.lookups > 0 {
            eprintln!(
                "  {} / {} identifier lookups succeeded ({:.2}%)",
                stats.hits,
                stats.lookups,
                stats.hit_rate() * 100.0
            );
        }
        eprintln!();
    }

    /// Occupancy and probe lengths of the identifier table
    pub fn table_stats(&self) -> TableStats {
        self.table().map(|table| table.stats()).unwrap_or_default()
    }

    pub fn build_info(&self) -> Option<BuildInfo> {
        let range = self.build_info.clone()?;
        serde_json::from_slice(&self.mmap[range]).ok()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    pub fn identifier_count(&self) -> u32 {
        self.header.identifier_count
    }

    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}

/// Open the index for `dir`, reporting failures as an [`ErrorCode`].
/// On anything but [`ErrorCode::None`] no reader is returned.
pub fn read_index(dir: &Path) -> (Option<IndexReader>, ErrorCode) {
    match IndexReader::open(dir) {
        Ok(reader) => (Some(reader), ErrorCode::None),
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "global module index unavailable");
            (None, err.code())
        }
    }
}
