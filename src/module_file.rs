//! Access to the names a module file declares.
//!
//! The index never interprets module files itself; it asks a
//! [`ModuleFileReader`] for each file's top-level identifiers, selectors and
//! direct dependencies. [`JsonModuleReader`] reads a JSON module summary:
//!
//! ```json
//! { "identifiers": ["printf", "FILE"], "selectors": ["initWithFrame:"],
//!   "dependencies": ["Darwin.pcm"] }
//! ```
//!
//! Dependency paths are relative to the directory holding the module file.

use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Names and imports extracted from one module file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    /// Identifiers with namespace-scope bindings
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Method selectors declared by the module
    #[serde(default)]
    pub selectors: Vec<String>,
    /// Module files this module directly imports
    #[serde(default)]
    pub dependencies: Vec<PathBuf>,
}

impl ModuleSummary {
    /// Identifiers and selectors; both share the index namespace
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.identifiers
            .iter()
            .chain(&self.selectors)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// Extracts a [`ModuleSummary`] from a module file
pub trait ModuleFileReader: Sync {
    fn read_module(&self, path: &Path) -> Result<ModuleSummary, ScanError>;
}

impl<F> ModuleFileReader for F
where
    F: Fn(&Path) -> Result<ModuleSummary, ScanError> + Sync,
{
    fn read_module(&self, path: &Path) -> Result<ModuleSummary, ScanError> {
        self(path)
    }
}

/// Reads module summaries stored as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonModuleReader;

impl ModuleFileReader for JsonModuleReader {
    fn read_module(&self, path: &Path) -> Result<ModuleSummary, ScanError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Write a summary in the format [`JsonModuleReader`] reads
pub fn write_module_summary(path: &Path, summary: &ModuleSummary) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut file, summary).map_err(io::Error::other)?;
    file.flush()
}
