pub mod build;
pub mod lock;
pub mod reader;
pub mod registry;
pub mod stats;
pub mod table;
pub mod types;
pub mod writer;

pub use build::{load_or_build, BuildReport, IndexBuilder};
pub use reader::{read_index, IdentifierLookup, IndexReader, LookupStats};
pub use registry::{ModuleRecord, ModuleRegistry, ModuleSlot};
pub use types::*;
pub use writer::IndexWriter;
