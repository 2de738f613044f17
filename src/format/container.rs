use super::records::{RecordCursor, RecordWriter};
use crate::error::FormatError;
use std::ops::Range;

/// Magic number at the start of every index file ("GMIX" in little-endian)
pub const INDEX_MAGIC: u32 = u32::from_le_bytes(*b"GMIX");

/// Current version of the container format
pub const INDEX_VERSION: u32 = 1;

/// Byte offset of the state field, patched in place when a build completes
pub const STATE_OFFSET: usize = 8;

/// Size of a block header: kind (u32) + payload length (u64)
pub const BLOCK_HEADER_SIZE: usize = 4 + 8;

/// Whether the file is still being written or is a finished generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IndexState {
    Building = 0,
    Complete = 1,
}

impl IndexState {
    fn from_u32(value: u32) -> Result<Self, FormatError> {
        match value {
            0 => Ok(IndexState::Building),
            1 => Ok(IndexState::Complete),
            other => Err(FormatError::corrupt(format!("unknown index state {other}"))),
        }
    }
}

/// Known block kinds. Readers skip any other kind by its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockKind {
    Modules = 1,
    IdentifierTable = 2,
    IdentifierStrings = 3,
    ModuleSets = 4,
    BuildInfo = 5,
}

/// Fixed-size file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub state: IndexState,
    pub block_count: u32,
    pub generation: u64,
    pub module_count: u32,
    pub identifier_count: u32,
}

impl Header {
    /// Size of header in bytes
    pub const SIZE: usize = 4 + 4 + 4 + 4 + 8 + 4 + 4; // 32 bytes

    pub fn new(generation: u64, module_count: u32, identifier_count: u32) -> Self {
        Self {
            version: INDEX_VERSION,
            state: IndexState::Building,
            block_count: 0,
            generation,
            module_count,
            identifier_count,
        }
    }

    fn write(&self, w: &mut RecordWriter) {
        w.put_u32(INDEX_MAGIC);
        w.put_u32(self.version);
        w.put_u32(self.state as u32);
        w.put_u32(self.block_count);
        w.put_u64(self.generation);
        w.put_u32(self.module_count);
        w.put_u32(self.identifier_count);
    }

    /// Validate magic and version, then decode the remaining fields
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < Self::SIZE {
            return Err(FormatError::Truncated);
        }
        let mut c = RecordCursor::new(&data[..Self::SIZE]);
        if c.get_u32()? != INDEX_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = c.get_u32()?;
        if version != INDEX_VERSION {
            return Err(FormatError::VersionMismatch {
                found: version,
                expected: INDEX_VERSION,
            });
        }
        Ok(Self {
            version,
            state: IndexState::from_u32(c.get_u32()?)?,
            block_count: c.get_u32()?,
            generation: c.get_u64()?,
            module_count: c.get_u32()?,
            identifier_count: c.get_u32()?,
        })
    }
}

/// Builds a complete container in memory.
pub struct ContainerWriter {
    header: Header,
    blocks: Vec<(u32, Vec<u8>)>,
}

impl ContainerWriter {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            blocks: Vec::new(),
        }
    }

    pub fn add_block(&mut self, kind: BlockKind, payload: Vec<u8>) {
        self.add_raw_block(kind as u32, payload);
    }

    /// Add a block with an arbitrary kind tag
    pub fn add_raw_block(&mut self, kind: u32, payload: Vec<u8>) {
        self.blocks.push((kind, payload));
    }

    /// Serialize header and blocks. The header state is written as given;
    /// publishing flips it to `Complete` at [`STATE_OFFSET`].
    pub fn finish(mut self) -> Vec<u8> {
        self.header.block_count = self.blocks.len() as u32;
        let payload_len: usize = self
            .blocks
            .iter()
            .map(|(_, p)| BLOCK_HEADER_SIZE + p.len())
            .sum();

        let mut w = RecordWriter::with_capacity(Header::SIZE + payload_len);
        self.header.write(&mut w);
        for (kind, payload) in &self.blocks {
            w.put_u32(*kind);
            w.put_u64(payload.len() as u64);
            w.put_bytes(payload);
        }
        w.into_inner()
    }
}

/// A block located inside a parsed container
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    pub kind: u32,
    /// Offset of the payload from the start of the file
    pub offset: usize,
    pub data: &'a [u8],
}

impl Block<'_> {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.data.len()
    }
}

/// Zero-copy view of a container: validated header plus the block table.
/// Block payloads are not interpreted here.
#[derive(Debug)]
pub struct Container<'a> {
    pub header: Header,
    blocks: Vec<Block<'a>>,
}

impl<'a> Container<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, FormatError> {
        let header = Header::parse(data)?;

        let mut cursor = RecordCursor::new(&data[Header::SIZE..]);
        // The count is untrusted; never reserve more blocks than the bytes can hold.
        let fits = cursor.remaining() / BLOCK_HEADER_SIZE;
        let mut blocks = Vec::with_capacity((header.block_count as usize).min(fits));
        for _ in 0..header.block_count {
            let kind = cursor.get_u32()?;
            let len = cursor.get_u64()?;
            let len = usize::try_from(len).map_err(|_| FormatError::Truncated)?;
            let offset = Header::SIZE + cursor.position();
            let payload = cursor.get_bytes(len)?;
            blocks.push(Block {
                kind,
                offset,
                data: payload,
            });
        }

        if !cursor.is_at_end() {
            return Err(FormatError::corrupt(format!(
                "{} trailing bytes after the last block",
                cursor.remaining()
            )));
        }

        Ok(Self { header, blocks })
    }

    pub fn blocks(&self) -> &[Block<'a>] {
        &self.blocks
    }

    /// First block of the given kind, if present
    pub fn block(&self, kind: BlockKind) -> Option<&Block<'a>> {
        self.blocks.iter().find(|b| b.kind == kind as u32)
    }

    pub fn require(&self, kind: BlockKind) -> Result<&Block<'a>, FormatError> {
        self.block(kind)
            .ok_or_else(|| FormatError::corrupt(format!("missing {kind:?} block")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut w = ContainerWriter::new(Header::new(3, 2, 10));
        w.add_block(BlockKind::Modules, vec![1, 2, 3]);
        w.add_raw_block(99, vec![0xAA; 5]);
        w.add_block(BlockKind::IdentifierStrings, b"foobar".to_vec());
        w.finish()
    }

    #[test]
    fn test_parse_written_container() {
        let bytes = sample();
        let container = Container::parse(&bytes).unwrap();
        assert_eq!(container.header.generation, 3);
        assert_eq!(container.header.module_count, 2);
        assert_eq!(container.header.identifier_count, 10);
        assert_eq!(container.header.state, IndexState::Building);
        assert_eq!(container.blocks().len(), 3);

        let modules = container.require(BlockKind::Modules).unwrap();
        assert_eq!(modules.data, &[1, 2, 3]);
        assert_eq!(&bytes[modules.range()], &[1, 2, 3]);
        // The unknown block is skipped over by length.
        let strings = container.block(BlockKind::IdentifierStrings).unwrap();
        assert_eq!(strings.data, b"foobar");
        assert!(container.block(BlockKind::ModuleSets).is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample();
        bytes[0] ^= 0xFF;
        assert_eq!(Container::parse(&bytes).unwrap_err(), FormatError::BadMagic);
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = sample();
        bytes[4..8].copy_from_slice(&(INDEX_VERSION + 1).to_le_bytes());
        assert_eq!(
            Container::parse(&bytes).unwrap_err(),
            FormatError::VersionMismatch {
                found: INDEX_VERSION + 1,
                expected: INDEX_VERSION
            }
        );
    }

    #[test]
    fn test_truncated_anywhere() {
        let bytes = sample();
        for len in 0..bytes.len() {
            let err = Container::parse(&bytes[..len]).unwrap_err();
            assert_eq!(err, FormatError::Truncated, "prefix of {len} bytes");
        }
    }

    #[test]
    fn test_huge_block_count_is_truncated() {
        let mut bytes = ContainerWriter::new(Header::new(1, 0, 0)).finish();
        bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(Container::parse(&bytes).unwrap_err(), FormatError::Truncated);

        let mut bytes = sample();
        bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(Container::parse(&bytes).unwrap_err(), FormatError::Truncated);
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let mut bytes = sample();
        bytes.push(0);
        assert!(matches!(
            Container::parse(&bytes),
            Err(FormatError::Corrupt(_))
        ));
    }

    #[test]
    fn test_state_patch() {
        let mut bytes = sample();
        bytes[STATE_OFFSET..STATE_OFFSET + 4]
            .copy_from_slice(&(IndexState::Complete as u32).to_le_bytes());
        let container = Container::parse(&bytes).unwrap();
        assert_eq!(container.header.state, IndexState::Complete);
    }
}
