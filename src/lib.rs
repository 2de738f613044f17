//! # gmindex - Global Module Index
//!
//! A persisted lookup table that tells a compiler which precompiled module
//! files declare a given top-level identifier or method selector, so that
//! unresolved names can be answered without loading every module.
//!
//! ## Architecture
//!
//! - [`format`] - Block-structured container file codec
//! - [`index`] - Module registry, identifier hash table, builder and reader
//! - [`module_file`] - Extracting names and imports from module files
//! - [`error`] - Error types and the coarse [`ErrorCode`]
//! - [`utils`] - Varint encoding, configuration, progress bars
//!
//! ## Quick Start
//!
//! ```no_run
//! use gmindex::index::{load_or_build, IndexConfig};
//! use gmindex::module_file::JsonModuleReader;
//! use std::path::Path;
//!
//! let reader = load_or_build(Path::new("/tmp/module-cache"), &IndexConfig::default(), &JsonModuleReader)?;
//! let lookup = reader.lookup_identifier("printf");
//! for module in lookup.hits {
//!     println!("{}", module.path.display());
//! }
//! # Ok::<(), gmindex::error::IndexError>(())
//! ```
//!
//! ## On-disk layout
//!
//! One file, `modules.idx`, per module cache directory. It is written to a
//! staging file and renamed into place, so readers that already mapped the
//! previous generation keep a consistent view. Identifiers live in a static
//! open-addressing table of fixed-size slots probed straight from the
//! memory map.

pub mod error;
pub mod format;
pub mod index;
pub mod module_file;
pub mod utils;

pub use error::{ErrorCode, FormatError, IndexError, ScanError};
pub use index::{load_or_build, read_index, IndexBuilder, IndexReader};
