//! Container format for the persisted index.
//!
//! A file is a fixed 32-byte [`Header`] followed by `block_count` blocks:
//!
//! ```text
//! +-------+---------+-------+--------+------------+---------+---------+
//! | magic | version | state | blocks | generation | modules | idents  |
//! +-------+---------+-------+--------+------------+---------+---------+
//! | kind u32 | len u64 | payload (len bytes) |   ... repeated
//! ```
//!
//! All fixed-width fields are little-endian. Readers locate blocks by kind
//! and skip unknown kinds by length, so new block kinds can be added without
//! a version bump. Payload records are written with [`RecordWriter`] and read
//! back with [`RecordCursor`].

pub mod container;
pub mod records;

pub use container::{
    Block, BlockKind, Container, ContainerWriter, Header, IndexState, INDEX_MAGIC, INDEX_VERSION,
    STATE_OFFSET,
};
pub use records::{RecordCursor, RecordWriter};
