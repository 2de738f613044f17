//! Module registry: an arena of slots indexed by [`ModuleId`].
//!
//! Removed modules leave a [`ModuleSlot::Vacant`] hole; slots are never
//! compacted, so ids handed out by an earlier generation stay valid for the
//! modules that survive an incremental rebuild.

use crate::error::FormatError;
use crate::format::{RecordCursor, RecordWriter};
use crate::index::types::{Fingerprint, ModuleFile, ModuleId};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

const SLOT_VACANT: u8 = 0;
const SLOT_OCCUPIED: u8 = 1;

/// A module as recorded in the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub file: ModuleFile,
    /// Direct dependencies, in import order
    pub dependencies: Vec<ModuleId>,
    /// Number of distinct names the module contributed
    pub identifier_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSlot {
    Vacant,
    Occupied(ModuleRecord),
}

impl ModuleSlot {
    pub fn record(&self) -> Option<&ModuleRecord> {
        match self {
            ModuleSlot::Occupied(record) => Some(record),
            ModuleSlot::Vacant => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    /// Directory module paths are relative to
    root: PathBuf,
    slots: Vec<ModuleSlot>,
    by_path: FxHashMap<PathBuf, ModuleId>,
}

impl ModuleRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Vec::new(),
            by_path: FxHashMap::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Assign an id to `path`, or refresh the record of an already known path.
    pub fn register(
        &mut self,
        path: &Path,
        fingerprint: Fingerprint,
        dependencies: Vec<ModuleId>,
    ) -> ModuleId {
        if let Some(&id) = self.by_path.get(path) {
            if let ModuleSlot::Occupied(record) = &mut self.slots[id as usize] {
                record.file.fingerprint = fingerprint;
                record.dependencies = dependencies;
            }
            return id;
        }

        let id = self.slots.len() as ModuleId;
        self.slots.push(ModuleSlot::Occupied(ModuleRecord {
            file: ModuleFile {
                id,
                path: path.to_path_buf(),
                fingerprint,
            },
            dependencies,
            identifier_count: 0,
        }));
        self.by_path.insert(path.to_path_buf(), id);
        id
    }

    /// Id of a module given its path, relative to the root or absolute under it
    pub fn lookup_by_file(&self, path: &Path) -> Option<ModuleId> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        self.by_path.get(relative).copied()
    }

    pub fn get(&self, id: ModuleId) -> Option<&ModuleRecord> {
        self.slots.get(id as usize).and_then(ModuleSlot::record)
    }

    fn get_mut(&mut self, id: ModuleId) -> Option<&mut ModuleRecord> {
        match self.slots.get_mut(id as usize) {
            Some(ModuleSlot::Occupied(record)) => Some(record),
            _ => None,
        }
    }

    /// Direct dependencies of `id`; empty for unknown or vacant ids
    pub fn dependencies_of(&self, id: ModuleId) -> &[ModuleId] {
        self.get(id)
            .map(|record| record.dependencies.as_slice())
            .unwrap_or(&[])
    }

    pub fn set_dependencies(&mut self, id: ModuleId, dependencies: Vec<ModuleId>) {
        if let Some(record) = self.get_mut(id) {
            record.dependencies = dependencies;
        }
    }

    pub fn set_identifier_count(&mut self, id: ModuleId, count: u32) {
        if let Some(record) = self.get_mut(id) {
            record.identifier_count = count;
        }
    }

    /// True if the module file changed or disappeared since it was indexed.
    /// Vacant and unknown ids are stale.
    pub fn is_stale(&self, id: ModuleId) -> bool {
        match self.get(id) {
            Some(record) => match Fingerprint::of(&self.root.join(&record.file.path)) {
                Ok(current) => current != record.file.fingerprint,
                Err(_) => true,
            },
            None => true,
        }
    }

    /// Turn a slot into a gap. The id is not reused.
    pub fn vacate(&mut self, id: ModuleId) -> Option<ModuleRecord> {
        let slot = self.slots.get_mut(id as usize)?;
        match std::mem::replace(slot, ModuleSlot::Vacant) {
            ModuleSlot::Occupied(record) => {
                self.by_path.remove(&record.file.path);
                Some(record)
            }
            ModuleSlot::Vacant => None,
        }
    }

    /// Drop dependency edges that point at vacant slots
    pub fn prune_dangling_dependencies(&mut self) {
        let occupied: Vec<bool> = self
            .slots
            .iter()
            .map(|slot| matches!(slot, ModuleSlot::Occupied(_)))
            .collect();
        for slot in &mut self.slots {
            if let ModuleSlot::Occupied(record) = slot {
                record
                    .dependencies
                    .retain(|&dep| occupied.get(dep as usize).copied().unwrap_or(false));
            }
        }
    }

    /// Occupied records in id order
    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord> + '_ {
        self.slots.iter().filter_map(ModuleSlot::record)
    }

    /// Number of slots including gaps
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn module_count(&self) -> usize {
        self.by_path.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::with_capacity(self.slots.len() * 48);
        w.put_varint(self.slots.len() as u32);
        for slot in &self.slots {
            match slot {
                ModuleSlot::Vacant => w.put_u8(SLOT_VACANT),
                ModuleSlot::Occupied(record) => {
                    w.put_u8(SLOT_OCCUPIED);
                    w.put_str(&record.file.path.to_string_lossy());
                    w.put_u64(record.file.fingerprint.size);
                    w.put_u64(record.file.fingerprint.mtime);
                    w.put_varint(record.identifier_count);
                    w.put_varint(record.dependencies.len() as u32);
                    for &dep in &record.dependencies {
                        w.put_varint(dep);
                    }
                }
            }
        }
        w.into_inner()
    }

    pub fn decode(root: impl Into<PathBuf>, data: &[u8]) -> Result<Self, FormatError> {
        let mut c = RecordCursor::new(data);
        let slot_count = c.get_varint()?;
        // Every slot takes at least one byte.
        if slot_count as usize > c.remaining() {
            return Err(FormatError::Truncated);
        }

        let mut registry = Self::new(root);
        registry.slots.reserve(slot_count as usize);
        for id in 0..slot_count {
            match c.get_u8()? {
                SLOT_VACANT => registry.slots.push(ModuleSlot::Vacant),
                SLOT_OCCUPIED => {
                    let path = PathBuf::from(c.get_str()?);
                    let fingerprint = Fingerprint {
                        size: c.get_u64()?,
                        mtime: c.get_u64()?,
                    };
                    let identifier_count = c.get_varint()?;
                    let dep_count = c.get_varint()? as usize;
                    if dep_count > c.remaining() {
                        return Err(FormatError::Truncated);
                    }
                    let mut dependencies = Vec::with_capacity(dep_count);
                    for _ in 0..dep_count {
                        let dep = c.get_varint()?;
                        if dep >= slot_count {
                            return Err(FormatError::corrupt(format!(
                                "module {id} depends on unknown module {dep}"
                            )));
                        }
                        dependencies.push(dep);
                    }
                    if registry.by_path.insert(path.clone(), id).is_some() {
                        return Err(FormatError::corrupt(format!(
                            "module path {} recorded twice",
                            path.display()
                        )));
                    }
                    registry.slots.push(ModuleSlot::Occupied(ModuleRecord {
                        file: ModuleFile {
                            id,
                            path,
                            fingerprint,
                        },
                        dependencies,
                        identifier_count,
                    }));
                }
                tag => {
                    return Err(FormatError::corrupt(format!(
                        "unknown module slot tag {tag}"
                    )));
                }
            }
        }

        if !c.is_at_end() {
            return Err(FormatError::corrupt("trailing bytes in modules block"));
        }
        Ok(registry)
    }
}
