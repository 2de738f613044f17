use crate::error::{IndexError, ScanError};
use crate::index::lock::BuildLock;
use crate::index::reader::IndexReader;
use crate::index::registry::ModuleRegistry;
use crate::index::table::IdentifierSetBuilder;
use crate::index::types::*;
use crate::index::writer::{publish, remove_staging_files, IndexWriter};
use crate::module_file::{ModuleFileReader, ModuleSummary};
use crate::utils::progress::{self, ProgressBar};
use globset::GlobSet;
use ignore::WalkBuilder;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A module file found in the index directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Path relative to the index directory
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// List the module files directly inside `dir` whose names match `matcher`,
/// sorted by path
pub fn discover_modules(dir: &Path, matcher: &GlobSet) -> Result<Vec<Candidate>, IndexError> {
    let walker = WalkBuilder::new(dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .build();

    let mut candidates = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let name = entry.file_name();
        if name == INDEX_FILE_NAME || name == LOCK_FILE_NAME || !matcher.is_match(name) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(path = %entry.path().display(), error = %err, "cannot stat module file");
                continue;
            }
        };
        candidates.push(Candidate {
            path: relative.to_path_buf(),
            fingerprint: Fingerprint::from_metadata(&metadata),
        });
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(candidates)
}

/// A module that could not be read; its slot is left vacant
#[derive(Debug)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub error: ScanError,
}

/// Outcome of a build
#[derive(Debug)]
pub struct BuildReport {
    pub generation: u64,
    pub modules_scanned: usize,
    pub modules_reused: usize,
    pub modules_removed: usize,
    pub scan_failures: Vec<ScanFailure>,
    pub identifier_count: usize,
    pub bucket_count: usize,
    /// Nothing changed; the previous generation was kept
    pub up_to_date: bool,
    pub index_path: PathBuf,
}

/// Builds a new generation of the index for one directory.
///
/// Modules whose fingerprint matches the previous generation are carried
/// forward from its identifier table without being opened.
pub struct IndexBuilder<'r, R: ModuleFileReader + ?Sized> {
    dir: PathBuf,
    config: IndexConfig,
    modules: &'r R,
    force: bool,
    silent: bool,
}

impl<'r, R: ModuleFileReader + ?Sized> IndexBuilder<'r, R> {
    pub fn new(dir: &Path, config: &IndexConfig, modules: &'r R) -> Self {
        Self {
            dir: dir.to_path_buf(),
            config: config.clone(),
            modules,
            force: false,
            silent: false,
        }
    }

    /// Ignore the previous generation and rescan every module
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Suppress progress bars
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    fn progress_bar(&self, len: usize) -> Option<ProgressBar> {
        if self.silent || !self.config.show_progress || len == 0 {
            return None;
        }
        Some(progress::counter(len, "modules"))
    }

    pub fn build(&self) -> Result<BuildReport, IndexError> {
        let dir = self.dir.canonicalize()?;
        let index_path = dir.join(INDEX_FILE_NAME);
        let _lock = BuildLock::acquire(&dir, self.config.lock_timeout())?;

        let staging = remove_staging_files(&dir);
        if staging > 0 {
            debug!(count = staging, "removed leftover staging files");
        }

        let matcher = self.config.module_matcher()?;
        let candidates = discover_modules(&dir, &matcher)?;

        let previous = match IndexReader::open_file(&dir, &index_path) {
            Ok(reader) => Some(reader),
            Err(IndexError::NotFound(_)) => None,
            Err(err) => {
                warn!(index = %index_path.display(), error = %err, "discarding unreadable index");
                None
            }
        };
        let generation = previous.as_ref().map_or(0, IndexReader::generation) + 1;
        let reusable = previous.as_ref().filter(|_| !self.force);

        // Plan: reuse unchanged modules, rescan changed ones under their old id,
        // append new ones and vacate the ones that disappeared.
        let mut registry = reusable
            .map(|prev| prev.registry().clone())
            .unwrap_or_else(|| ModuleRegistry::new(&dir));
        let mut reused = RoaringBitmap::new();
        let mut to_scan: Vec<(ModuleId, PathBuf)> = Vec::new();
        let present: FxHashSet<&Path> = candidates.iter().map(|c| c.path.as_path()).collect();

        for candidate in &candidates {
            let known = registry.lookup_by_file(&candidate.path);
            let unchanged = known
                .and_then(|id| registry.get(id))
                .is_some_and(|record| record.file.fingerprint == candidate.fingerprint);
            if let (Some(id), true) = (known, unchanged) {
                reused.insert(id);
                continue;
            }
            let id = registry.register(&candidate.path, candidate.fingerprint, Vec::new());
            debug!(
                module = %candidate.path.display(),
                id,
                changed = known.is_some(),
                "module needs scanning"
            );
            to_scan.push((id, candidate.path.clone()));
        }

        let missing: Vec<ModuleId> = registry
            .iter()
            .filter(|record| !present.contains(record.file.path.as_path()))
            .map(|record| record.file.id)
            .collect();
        for &id in &missing {
            if let Some(record) = registry.vacate(id) {
                debug!(module = %record.file.path.display(), id, "module removed");
            }
        }

        if let Some(prev) = reusable.filter(|_| to_scan.is_empty() && missing.is_empty()) {
            info!(
                index = %index_path.display(),
                generation = prev.generation(),
                modules = reused.len(),
                "index is up to date"
            );
            return Ok(BuildReport {
                generation: prev.generation(),
                modules_scanned: 0,
                modules_reused: reused.len() as usize,
                modules_removed: 0,
                scan_failures: Vec::new(),
                identifier_count: prev.identifier_count() as usize,
                bucket_count: prev.table_stats().bucket_count,
                up_to_date: true,
                index_path,
            });
        }

        let mut names = IdentifierSetBuilder::new();
        if let Some(prev) = reusable {
            for (name, ids) in prev.identifiers() {
                names.extend(name, ids.into_iter().filter(|&id| reused.contains(id)));
            }
        }

        let progress = self.progress_bar(to_scan.len());
        let scan = |(id, path): &(ModuleId, PathBuf)| {
            let result = self.modules.read_module(&dir.join(path));
            if let Some(pb) = &progress {
                pb.inc(1);
            }
            (*id, result)
        };
        let results: Vec<(ModuleId, Result<ModuleSummary, ScanError>)> =
            if self.config.parallel_scan {
                to_scan.par_iter().map(scan).collect()
            } else {
                to_scan.iter().map(scan).collect()
            };
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        let mut modules_scanned = 0;
        let mut scan_failures = Vec::new();
        for (id, result) in results {
            match result {
                Ok(summary) => {
                    let distinct: FxHashSet<&str> = summary.names().collect();
                    for &name in &distinct {
                        names.insert(name, id);
                    }
                    registry.set_identifier_count(id, distinct.len() as u32);
                    let dependencies = resolve_dependencies(&registry, &dir, id, &summary);
                    registry.set_dependencies(id, dependencies);
                    modules_scanned += 1;
                }
                Err(error) => {
                    let path = registry
                        .vacate(id)
                        .map(|record| record.file.path)
                        .unwrap_or_default();
                    warn!(module = %path.display(), error = %error, "skipping unreadable module");
                    scan_failures.push(ScanFailure { path, error });
                }
            }
        }
        registry.prune_dangling_dependencies();

        let entries = names.finish();
        let serialized =
            IndexWriter::new(&registry, &entries, generation, self.config.load_factor())
                .serialize();

        // Release the old mapping before replacing the file.
        drop(previous);
        publish(&dir, &serialized.bytes)?;

        info!(
            index = %index_path.display(),
            generation,
            modules = registry.module_count(),
            scanned = modules_scanned,
            reused = reused.len(),
            removed = missing.len(),
            failures = scan_failures.len(),
            identifiers = serialized.identifier_count,
            "published global module index"
        );

        Ok(BuildReport {
            generation,
            modules_scanned,
            modules_reused: reused.len() as usize,
            modules_removed: missing.len(),
            scan_failures,
            identifier_count: serialized.identifier_count,
            bucket_count: serialized.bucket_count,
            up_to_date: false,
            index_path,
        })
    }
}

/// Map the dependency paths of a scanned module to ids, in import order.
/// Self references, duplicates and modules outside the index are dropped.
fn resolve_dependencies(
    registry: &ModuleRegistry,
    dir: &Path,
    id: ModuleId,
    summary: &ModuleSummary,
) -> Vec<ModuleId> {
    let mut resolved = Vec::with_capacity(summary.dependencies.len());
    for dependency in &summary.dependencies {
        let found = registry.lookup_by_file(dependency).or_else(|| {
            let canonical = dir.join(dependency).canonicalize().ok()?;
            registry.lookup_by_file(&canonical)
        });
        match found {
            Some(dep) if dep != id && !resolved.contains(&dep) => resolved.push(dep),
            Some(_) => {}
            None => debug!(
                module = id,
                dependency = %dependency.display(),
                "dependency is not indexed"
            ),
        }
    }
    resolved
}

/// Open the index for `dir`, building it first if it is missing, unreadable or
/// refers to modules that changed.
pub fn load_or_build<R: ModuleFileReader + ?Sized>(
    dir: &Path,
    config: &IndexConfig,
    modules: &R,
) -> Result<IndexReader, IndexError> {
    match IndexReader::open_with_config(dir, config) {
        Ok(reader) if !reader.has_stale_modules() => return Ok(reader),
        Ok(_) => debug!(dir = %dir.display(), "index has stale modules, rebuilding"),
        Err(err) if err.should_rebuild() => {
            debug!(dir = %dir.display(), error = %err, "rebuilding global module index")
        }
        Err(err) => return Err(err),
    }

    IndexBuilder::new(dir, config, modules).silent(true).build()?;
    IndexReader::open_with_config(dir, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_file::{write_module_summary, JsonModuleReader};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quiet_config() -> IndexConfig {
        IndexConfig {
            show_progress: false,
            ..IndexConfig::default()
        }
    }

    fn write_module(dir: &Path, name: &str, identifiers: &[&str], dependencies: &[&str]) {
        let summary = ModuleSummary {
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            selectors: Vec::new(),
            dependencies: dependencies.iter().map(PathBuf::from).collect(),
        };
        write_module_summary(&dir.join(name), &summary).unwrap();
    }

    fn hit_paths(reader: &IndexReader, name: &str) -> Vec<String> {
        reader
            .lookup_identifier(name)
            .hits
            .iter()
            .map(|m| m.path.display().to_string())
            .collect()
    }

    #[test]
    fn test_discover_modules() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("B.pcm"), b"{}").unwrap();
        fs::write(dir.path().join("A.pcm"), b"{}").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join(INDEX_FILE_NAME), b"").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("C.pcm"), b"{}").unwrap();

        let matcher = IndexConfig::default().module_matcher().unwrap();
        let found = discover_modules(dir.path(), &matcher).unwrap();
        let names: Vec<_> = found.iter().map(|c| c.path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("A.pcm"), PathBuf::from("B.pcm")]);
        assert_eq!(found[0].fingerprint.size, 2);
    }

    #[test]
    fn test_build_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "M1.pcm", &["foo", "bar"], &[]);
        write_module(dir.path(), "M2.pcm", &["foo", "baz"], &["M1.pcm"]);

        let report = IndexBuilder::new(dir.path(), &quiet_config(), &JsonModuleReader)
            .build()
            .unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.modules_scanned, 2);
        assert_eq!(report.identifier_count, 3);
        assert!(!report.up_to_date);

        let reader = IndexReader::open(dir.path()).unwrap();
        assert_eq!(hit_paths(&reader, "foo"), vec!["M1.pcm", "M2.pcm"]);
        assert_eq!(hit_paths(&reader, "baz"), vec!["M2.pcm"]);
        assert!(!reader.lookup_identifier("qux").found);

        let deps: Vec<_> = reader
            .dependencies_of(Path::new("M2.pcm"))
            .iter()
            .map(|m| m.path.clone())
            .collect();
        assert_eq!(deps, vec![PathBuf::from("M1.pcm")]);
    }

    #[test]
    fn test_identifier_count_ignores_repeated_names() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "M.pcm", &["dup", "dup", "other", "dup"], &[]);

        IndexBuilder::new(dir.path(), &quiet_config(), &JsonModuleReader)
            .build()
            .unwrap();
        let reader = IndexReader::open(dir.path()).unwrap();
        let registry = reader.registry();
        let id = registry.lookup_by_file(Path::new("M.pcm")).unwrap();
        assert_eq!(registry.get(id).unwrap().identifier_count, 2);
        assert_eq!(hit_paths(&reader, "dup"), vec!["M.pcm"]);
    }

    #[test]
    fn test_incremental_build_skips_unchanged_modules() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &["alpha", "shared"], &[]);

        let scans = AtomicUsize::new(0);
        let counting = |path: &Path| {
            scans.fetch_add(1, Ordering::SeqCst);
            JsonModuleReader.read_module(path)
        };
        let config = quiet_config();

        IndexBuilder::new(dir.path(), &config, &counting).build().unwrap();
        assert_eq!(scans.load(Ordering::SeqCst), 1);

        write_module(dir.path(), "B.pcm", &["beta", "shared"], &["A.pcm"]);
        let report = IndexBuilder::new(dir.path(), &config, &counting).build().unwrap();
        assert_eq!(scans.load(Ordering::SeqCst), 2);
        assert_eq!(report.generation, 2);
        assert_eq!(report.modules_reused, 1);
        assert_eq!(report.modules_scanned, 1);

        let reader = IndexReader::open(dir.path()).unwrap();
        assert_eq!(hit_paths(&reader, "alpha"), vec!["A.pcm"]);
        assert_eq!(hit_paths(&reader, "beta"), vec!["B.pcm"]);
        assert_eq!(hit_paths(&reader, "shared"), vec!["A.pcm", "B.pcm"]);
    }

    #[test]
    fn test_unchanged_directory_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &["alpha"], &[]);
        let config = quiet_config();

        IndexBuilder::new(dir.path(), &config, &JsonModuleReader).build().unwrap();
        let before = fs::read(dir.path().join(INDEX_FILE_NAME)).unwrap();

        let report = IndexBuilder::new(dir.path(), &config, &JsonModuleReader)
            .build()
            .unwrap();
        assert!(report.up_to_date);
        assert_eq!(report.generation, 1);
        assert_eq!(report.identifier_count, 1);
        assert_eq!(fs::read(dir.path().join(INDEX_FILE_NAME)).unwrap(), before);
    }

    #[test]
    fn test_changed_module_keeps_its_id() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &["old_name"], &[]);
        write_module(dir.path(), "B.pcm", &["other"], &[]);
        let config = quiet_config();
        IndexBuilder::new(dir.path(), &config, &JsonModuleReader).build().unwrap();

        write_module(dir.path(), "A.pcm", &["new_name", "another_name"], &[]);
        let report = IndexBuilder::new(dir.path(), &config, &JsonModuleReader)
            .build()
            .unwrap();
        assert_eq!(report.modules_scanned, 1);
        assert_eq!(report.modules_reused, 1);

        let reader = IndexReader::open(dir.path()).unwrap();
        let a = reader.module_id(Path::new("A.pcm")).unwrap();
        assert_eq!(a, 0);
        assert!(!reader.lookup_identifier("old_name").found);
        assert_eq!(hit_paths(&reader, "new_name"), vec!["A.pcm"]);
    }

    #[test]
    fn test_removed_module_leaves_a_gap() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &["alpha"], &[]);
        write_module(dir.path(), "B.pcm", &["beta"], &["A.pcm"]);
        let config = quiet_config();
        IndexBuilder::new(dir.path(), &config, &JsonModuleReader).build().unwrap();

        fs::remove_file(dir.path().join("A.pcm")).unwrap();
        write_module(dir.path(), "C.pcm", &["gamma"], &[]);
        let report = IndexBuilder::new(dir.path(), &config, &JsonModuleReader)
            .build()
            .unwrap();
        assert_eq!(report.modules_removed, 1);

        let reader = IndexReader::open(dir.path()).unwrap();
        assert_eq!(reader.registry().slot_count(), 3);
        assert_eq!(reader.module_id(Path::new("B.pcm")), Some(1));
        assert_eq!(reader.module_id(Path::new("C.pcm")), Some(2));
        assert!(!reader.lookup_identifier("alpha").found);
        assert!(reader.dependencies_of(Path::new("B.pcm")).is_empty());
    }

    #[test]
    fn test_scan_failure_is_reported_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "Good.pcm", &["fine"], &[]);
        fs::write(dir.path().join("Bad.pcm"), b"not json").unwrap();

        let report = IndexBuilder::new(dir.path(), &quiet_config(), &JsonModuleReader)
            .build()
            .unwrap();
        assert_eq!(report.modules_scanned, 1);
        assert_eq!(report.scan_failures.len(), 1);
        assert_eq!(report.scan_failures[0].path, PathBuf::from("Bad.pcm"));

        let reader = IndexReader::open(dir.path()).unwrap();
        assert_eq!(reader.known_modules().len(), 1);
        assert_eq!(hit_paths(&reader, "fine"), vec!["Good.pcm"]);
    }

    #[test]
    fn test_force_rescans_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &["alpha"], &[]);
        write_module(dir.path(), "B.pcm", &["beta"], &[]);
        let config = quiet_config();
        IndexBuilder::new(dir.path(), &config, &JsonModuleReader).build().unwrap();

        let report = IndexBuilder::new(dir.path(), &config, &JsonModuleReader)
            .force(true)
            .build()
            .unwrap();
        assert_eq!(report.modules_scanned, 2);
        assert_eq!(report.modules_reused, 0);
        assert_eq!(report.generation, 2);
    }

    #[test]
    fn test_sequential_scan_matches_parallel() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            let own = format!("own{i}");
            write_module(dir.path(), &format!("M{i:02}.pcm"), &["common", own.as_str()], &[]);
        }
        let parallel = IndexBuilder::new(dir.path(), &quiet_config(), &JsonModuleReader)
            .build()
            .unwrap();
        let parallel_bytes = fs::read(&parallel.index_path).unwrap();

        let sequential_config = IndexConfig {
            parallel_scan: false,
            ..quiet_config()
        };
        IndexBuilder::new(dir.path(), &sequential_config, &JsonModuleReader)
            .force(true)
            .build()
            .unwrap();
        let sequential_bytes = fs::read(&parallel.index_path).unwrap();

        // Only the generation and build timestamp may differ.
        assert_eq!(parallel_bytes.len(), sequential_bytes.len());
        let reader = IndexReader::open(dir.path()).unwrap();
        assert_eq!(reader.lookup_identifier("common").hits.len(), 20);
    }

    #[test]
    fn test_build_fails_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &["alpha"], &[]);
        let config = quiet_config();
        let _lock = BuildLock::acquire(dir.path(), config.lock_timeout()).unwrap();

        let err = IndexBuilder::new(dir.path(), &config, &JsonModuleReader)
            .build()
            .unwrap_err();
        assert!(matches!(err, IndexError::Building(_)));
        assert!(!dir.path().join(INDEX_FILE_NAME).exists());
    }

    #[test]
    fn test_unknown_and_self_dependencies_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &[], &[]);
        write_module(
            dir.path(),
            "B.pcm",
            &[],
            &["Missing.pcm", "B.pcm", "A.pcm", "A.pcm"],
        );
        IndexBuilder::new(dir.path(), &quiet_config(), &JsonModuleReader)
            .build()
            .unwrap();

        let reader = IndexReader::open(dir.path()).unwrap();
        let b = reader.module_id(Path::new("B.pcm")).unwrap();
        let a = reader.module_id(Path::new("A.pcm")).unwrap();
        assert_eq!(reader.registry().dependencies_of(b), &[a]);
    }

    #[test]
    fn test_load_or_build() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "A.pcm", &["alpha"], &[]);
        let config = quiet_config();

        let reader = load_or_build(dir.path(), &config, &JsonModuleReader).unwrap();
        assert_eq!(reader.generation(), 1);
        drop(reader);

        let reader = load_or_build(dir.path(), &config, &JsonModuleReader).unwrap();
        assert_eq!(reader.generation(), 1);
        drop(reader);

        write_module(dir.path(), "A.pcm", &["alpha", "renamed"], &[]);
        let reader = load_or_build(dir.path(), &config, &JsonModuleReader).unwrap();
        assert_eq!(reader.generation(), 2);
        assert!(reader.lookup_identifier("renamed").found);
    }
}
