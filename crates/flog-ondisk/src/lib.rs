#![forbid(unsafe_code)]
//! On-media record layouts.
//!
//! Every persistent record is a bit-exact little-endian byte layout,
//! serialized field by field — language-natural padding never reaches
//! the media. Multi-byte integers are little-endian; erased flash reads
//! back as the all-ones sentinel of each field's type, which is why
//! `INVALID` is all-ones everywhere.
//!
//! Sector roles within a block (see `Geometry`): sector 0 is the init
//! sector, `sectors_per_block - 2` the tail sector, and
//! `sectors_per_block - 1` the invalidation/stat sector.

use flog_types::{
    hamming8, read_fixed, read_le_u16, read_le_u32, BlockAge, BlockIdx, FileId, Geometry,
    ParseError, Timestamp, MAX_FILENAME_LEN, SPARE_SIZE,
};

/// Block type tag, stored in the first byte of the first sector's spare.
pub const TYPE_UNALLOCATED: u8 = 0xFF;
pub const TYPE_INODE: u8 = 0x01;
pub const TYPE_FILE: u8 = 0x02;

/// Magic key in the stat record, used at format time to tell a
/// previously formatted block (whose age must be preserved) from
/// factory-fresh or foreign media.
pub const STAT_KEY: [u8; 8] = *b"FLOGSTAT";

/// Classification of a block from its first-sector spare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Unallocated,
    Inode,
    File,
    /// Unrecognized tag; the block is treated as bad for the session.
    Corrupt,
}

/// Decode a block type tag.
///
/// The erased tag is decoded by Hamming distance so a single flipped
/// bit in the unprotected spare does not conjure a phantom allocation;
/// the allocated tags are low-weight values matched exactly.
#[must_use]
pub fn classify_tag(tag: u8) -> BlockType {
    match tag {
        TYPE_INODE => BlockType::Inode,
        TYPE_FILE => BlockType::File,
        _ if hamming8(tag, TYPE_UNALLOCATED) <= 1 => BlockType::Unallocated,
        _ => BlockType::Corrupt,
    }
}

/// Classify a block from its first-sector spare bytes.
#[must_use]
pub fn classify_spare(spare: &[u8; SPARE_SIZE]) -> BlockType {
    classify_tag(spare[0])
}

// ── File block records ──────────────────────────────────────────────────────

/// Header at the start of a file block's init sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInitHeader {
    pub age: BlockAge,
    pub file_id: FileId,
}

impl FileInitHeader {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            age: BlockAge(read_le_u32(data, 0)?),
            file_id: FileId(read_le_u32(data, 4)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.age.0.to_le_bytes());
        out[4..8].copy_from_slice(&self.file_id.0.to_le_bytes());
        out
    }
}

/// Header at the start of a file block's tail sector: the forward link
/// of the chain plus the block's final data byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTailHeader {
    pub next_block: BlockIdx,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
    pub bytes_in_block: u16,
}

impl FileTailHeader {
    pub const SIZE: usize = 12;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            next_block: BlockIdx(read_le_u16(data, 0)?),
            next_age: BlockAge(read_le_u32(data, 2)?),
            timestamp: Timestamp(read_le_u32(data, 6)?),
            bytes_in_block: read_le_u16(data, 10)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.next_block.0.to_le_bytes());
        out[2..6].copy_from_slice(&self.next_age.0.to_le_bytes());
        out[6..10].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[10..12].copy_from_slice(&self.bytes_in_block.to_le_bytes());
        out
    }
}

/// Common prefix of the file and inode tail headers; what the mount
/// pass reads when it scans every block for the newest allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniversalTailHeader {
    pub next_block: BlockIdx,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
}

impl UniversalTailHeader {
    pub const SIZE: usize = 10;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            next_block: BlockIdx(read_le_u16(data, 0)?),
            next_age: BlockAge(read_le_u32(data, 2)?),
            timestamp: Timestamp(read_le_u32(data, 6)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.next_block.0.to_le_bytes());
        out[2..6].copy_from_slice(&self.next_age.0.to_le_bytes());
        out[6..10].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out
    }
}

/// Spare layout of every written file sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSectorSpare {
    pub nbytes: u16,
}

impl FileSectorSpare {
    pub fn parse(spare: &[u8; SPARE_SIZE]) -> Result<Self, ParseError> {
        Ok(Self {
            nbytes: read_le_u16(spare, 2)?,
        })
    }

    /// Whether the sector has never been written.
    #[must_use]
    pub fn is_erased(spare: &[u8; SPARE_SIZE]) -> bool {
        flog_types::is_erased(&spare[..4])
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SPARE_SIZE] {
        let mut out = [0xFF_u8; SPARE_SIZE];
        out[0] = TYPE_FILE;
        out[2..4].copy_from_slice(&self.nbytes.to_le_bytes());
        out
    }
}

/// View of a file block's invalidation sector. Erased while the block
/// is allocated; deletion recovery reads it to decide whether a chain
/// reclamation ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInvalidationSector {
    pub timestamp: Timestamp,
    pub next_age: BlockAge,
}

impl FileInvalidationSector {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            timestamp: Timestamp(read_le_u32(data, 0)?),
            next_age: BlockAge(read_le_u32(data, 4)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[4..8].copy_from_slice(&self.next_age.0.to_le_bytes());
        out
    }
}

// ── Inode block records ─────────────────────────────────────────────────────

/// Header of an inode block's init sector. `previous_block` is the
/// back-link for reverse iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInitHeader {
    pub age: BlockAge,
    pub timestamp: Timestamp,
    pub previous_block: BlockIdx,
}

impl InodeInitHeader {
    pub const SIZE: usize = 10;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            age: BlockAge(read_le_u32(data, 0)?),
            timestamp: Timestamp(read_le_u32(data, 4)?),
            previous_block: BlockIdx(read_le_u16(data, 8)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.age.0.to_le_bytes());
        out[4..8].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[8..10].copy_from_slice(&self.previous_block.0.to_le_bytes());
        out
    }
}

/// Spare layout of an inode block's init sector: the type tag plus the
/// absolute index of the block within the inode chain (inode0 is 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInitSpare {
    pub inode_index: u16,
}

impl InodeInitSpare {
    pub fn parse(spare: &[u8; SPARE_SIZE]) -> Result<Self, ParseError> {
        Ok(Self {
            inode_index: read_le_u16(spare, 2)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SPARE_SIZE] {
        let mut out = [0xFF_u8; SPARE_SIZE];
        out[0] = TYPE_INODE;
        out[2..4].copy_from_slice(&self.inode_index.to_le_bytes());
        out
    }
}

/// Allocation half of an inode entry: one sector recording a file's
/// identity and the head of its block chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAllocEntry {
    pub file_id: FileId,
    pub first_block: BlockIdx,
    pub first_block_age: BlockAge,
    pub timestamp: Timestamp,
    pub filename: [u8; MAX_FILENAME_LEN],
}

impl InodeAllocEntry {
    pub const SIZE: usize = 14 + MAX_FILENAME_LEN;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            file_id: FileId(read_le_u32(data, 0)?),
            first_block: BlockIdx(read_le_u16(data, 4)?),
            first_block_age: BlockAge(read_le_u32(data, 6)?),
            timestamp: Timestamp(read_le_u32(data, 10)?),
            filename: read_fixed::<MAX_FILENAME_LEN>(data, 14)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.file_id.0.to_le_bytes());
        out[4..6].copy_from_slice(&self.first_block.0.to_le_bytes());
        out[6..10].copy_from_slice(&self.first_block_age.0.to_le_bytes());
        out[10..14].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[14..].copy_from_slice(&self.filename);
        out
    }

    #[must_use]
    pub fn name(&self) -> String {
        flog_types::filename_from_bytes(&self.filename)
    }

    /// Byte-wise name comparison over at most `MAX_FILENAME_LEN` bytes.
    #[must_use]
    pub fn name_matches(&self, name: &str) -> bool {
        let raw = name.as_bytes();
        raw.len() < MAX_FILENAME_LEN
            && self.filename[..raw.len()] == *raw
            && self.filename[raw.len()] == 0
    }
}

/// Invalidation half of an inode entry. An erased timestamp means the
/// file is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInvalidationEntry {
    pub timestamp: Timestamp,
    pub last_block: BlockIdx,
}

impl InodeInvalidationEntry {
    pub const SIZE: usize = 6;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            timestamp: Timestamp(read_le_u32(data, 0)?),
            last_block: BlockIdx(read_le_u16(data, 4)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[4..6].copy_from_slice(&self.last_block.0.to_le_bytes());
        out
    }
}

// ── Stat record ─────────────────────────────────────────────────────────────

/// Block stat record, written into the invalidation/stat sector at
/// format time and after every reclaim erase. Persists the erase
/// counter across erases and, after a reclaim, the forward link of the
/// dead chain so an interrupted deletion can hop over freed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatRecord {
    pub age: BlockAge,
    pub next_block: BlockIdx,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
    pub key: [u8; STAT_KEY.len()],
}

impl BlockStatRecord {
    pub const SIZE: usize = 14 + STAT_KEY.len();

    #[must_use]
    pub fn new(age: BlockAge, next_block: BlockIdx, next_age: BlockAge, timestamp: Timestamp) -> Self {
        Self {
            age,
            next_block,
            next_age,
            timestamp,
            key: STAT_KEY,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            age: BlockAge(read_le_u32(data, 0)?),
            next_block: BlockIdx(read_le_u16(data, 4)?),
            next_age: BlockAge(read_le_u32(data, 6)?),
            timestamp: Timestamp(read_le_u32(data, 10)?),
            key: read_fixed::<{ STAT_KEY.len() }>(data, 14)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.age.0.to_le_bytes());
        out[4..6].copy_from_slice(&self.next_block.0.to_le_bytes());
        out[6..10].copy_from_slice(&self.next_age.0.to_le_bytes());
        out[10..14].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[14..].copy_from_slice(&self.key);
        out
    }

    /// Whether the record was written by a formatted filesystem.
    #[must_use]
    pub fn has_valid_key(&self) -> bool {
        self.key == STAT_KEY
    }
}

// ── Capacity helpers ────────────────────────────────────────────────────────

/// Offset at which data starts within a file sector.
#[must_use]
pub fn file_sector_data_offset(geo: Geometry, sector: u16) -> usize {
    if sector == 0 {
        FileInitHeader::SIZE
    } else if sector == geo.tail_sector() {
        FileTailHeader::SIZE
    } else {
        0
    }
}

/// Data bytes a file sector can hold.
#[must_use]
pub fn file_sector_data_capacity(geo: Geometry, sector: u16) -> usize {
    geo.sector_size() - file_sector_data_offset(geo, sector)
}

/// Data bytes a whole file block can hold: every sector except the
/// invalidation sector, less the init and tail headers.
#[must_use]
pub fn block_data_capacity(geo: Geometry) -> usize {
    (usize::from(geo.sectors_per_block()) - 1) * geo.sector_size()
        - FileInitHeader::SIZE
        - FileTailHeader::SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(512, 4, 2, 8).expect("geometry")
    }

    #[test]
    fn file_init_header_layout() {
        let hdr = FileInitHeader {
            age: BlockAge(0x0102_0304),
            file_id: FileId(7),
        };
        let bytes = hdr.encode();
        assert_eq!(bytes, [0x04, 0x03, 0x02, 0x01, 0x07, 0x00, 0x00, 0x00]);
        assert_eq!(FileInitHeader::parse(&bytes).expect("parse"), hdr);
    }

    #[test]
    fn file_tail_header_layout() {
        let hdr = FileTailHeader {
            next_block: BlockIdx(0x1234),
            next_age: BlockAge(5),
            timestamp: Timestamp(0xAABB_CCDD),
            bytes_in_block: 2000,
        };
        let bytes = hdr.encode();
        assert_eq!(bytes[0..2], [0x34, 0x12]);
        assert_eq!(bytes[6..10], [0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(FileTailHeader::parse(&bytes).expect("parse"), hdr);

        // The universal prefix reads the same link.
        let uni = UniversalTailHeader::parse(&bytes).expect("prefix");
        assert_eq!(uni.next_block, BlockIdx(0x1234));
        assert_eq!(uni.timestamp, Timestamp(0xAABB_CCDD));
    }

    #[test]
    fn erased_tail_is_invalid() {
        let erased = [0xFF_u8; FileTailHeader::SIZE];
        let hdr = FileTailHeader::parse(&erased).expect("parse");
        assert_eq!(hdr.next_block, BlockIdx::INVALID);
        assert_eq!(hdr.timestamp, Timestamp::INVALID);
    }

    #[test]
    fn file_sector_spare_round_trip() {
        let spare = FileSectorSpare { nbytes: 504 }.encode();
        assert_eq!(spare[0], TYPE_FILE);
        assert_eq!(spare[1], 0xFF);
        assert!(!FileSectorSpare::is_erased(&spare));
        assert_eq!(
            FileSectorSpare::parse(&spare).expect("parse").nbytes,
            504
        );
        assert!(FileSectorSpare::is_erased(&[0xFF; SPARE_SIZE]));
    }

    #[test]
    fn inode_records_round_trip() {
        let init = InodeInitHeader {
            age: BlockAge(3),
            timestamp: Timestamp(9),
            previous_block: BlockIdx::INVALID,
        };
        assert_eq!(
            InodeInitHeader::parse(&init.encode()).expect("parse"),
            init
        );

        let spare = InodeInitSpare { inode_index: 2 }.encode();
        assert_eq!(spare[0], TYPE_INODE);
        assert_eq!(InodeInitSpare::parse(&spare).expect("parse").inode_index, 2);

        let alloc = InodeAllocEntry {
            file_id: FileId(11),
            first_block: BlockIdx(4),
            first_block_age: BlockAge(1),
            timestamp: Timestamp(17),
            filename: flog_types::filename_to_bytes("telemetry.log").expect("name"),
        };
        let parsed = InodeAllocEntry::parse(&alloc.encode()).expect("parse");
        assert_eq!(parsed, alloc);
        assert_eq!(parsed.name(), "telemetry.log");
        assert!(parsed.name_matches("telemetry.log"));
        assert!(!parsed.name_matches("telemetry.lo"));
        assert!(!parsed.name_matches("telemetry.log2"));

        let inval = InodeInvalidationEntry {
            timestamp: Timestamp(21),
            last_block: BlockIdx(6),
        };
        assert_eq!(
            InodeInvalidationEntry::parse(&inval.encode()).expect("parse"),
            inval
        );
    }

    #[test]
    fn stat_record_key_detection() {
        let stat = BlockStatRecord::new(
            BlockAge(40),
            BlockIdx::INVALID,
            BlockAge::INVALID,
            Timestamp::ZERO,
        );
        let parsed = BlockStatRecord::parse(&stat.encode()).expect("parse");
        assert!(parsed.has_valid_key());
        assert_eq!(parsed.age, BlockAge(40));

        let erased = [0xFF_u8; BlockStatRecord::SIZE];
        assert!(!BlockStatRecord::parse(&erased).expect("parse").has_valid_key());
    }

    #[test]
    fn classification_tolerates_one_flip_of_erased() {
        assert_eq!(classify_tag(0xFF), BlockType::Unallocated);
        assert_eq!(classify_tag(0xFD), BlockType::Unallocated);
        assert_eq!(classify_tag(TYPE_INODE), BlockType::Inode);
        assert_eq!(classify_tag(TYPE_FILE), BlockType::File);
        assert_eq!(classify_tag(0x3C), BlockType::Corrupt);
    }

    #[test]
    fn capacities_for_test_geometry() {
        let geo = geo();
        assert_eq!(file_sector_data_offset(geo, 0), 8);
        assert_eq!(file_sector_data_offset(geo, 1), 0);
        assert_eq!(file_sector_data_offset(geo, 6), 12);
        assert_eq!(file_sector_data_capacity(geo, 0), 504);
        assert_eq!(file_sector_data_capacity(geo, 5), 512);
        assert_eq!(file_sector_data_capacity(geo, 6), 500);
        // 7 usable sectors * 512 - 8 - 12
        assert_eq!(block_data_capacity(geo), 3564);
    }
}
