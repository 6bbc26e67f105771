#![forbid(unsafe_code)]
//! Shared vocabulary for the FLogFS workspace.
//!
//! Unit-carrying newtypes for the on-media coordinate system (blocks,
//! ages, timestamps, file ids), the validated NAND [`Geometry`], the
//! erased-state sentinels, and the little-endian byte helpers used by
//! every record parser.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum filename length in bytes, including the terminating NUL.
pub const MAX_FILENAME_LEN: usize = 32;

/// Out-of-band spare bytes per sector. Drivers may have more; the
/// filesystem uses exactly this many.
pub const SPARE_SIZE: usize = 16;

/// Erase-block index on the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIdx(pub u16);

impl BlockIdx {
    /// All-ones sentinel: reads back from erased flash.
    pub const INVALID: Self = Self(u16::MAX);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Monotonically assigned file identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    pub const INVALID: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Allocation sequence number, strictly increasing across every block
/// allocation and invalidation in the filesystem's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub const INVALID: Self = Self(u32::MAX);
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Erase counter of a block, used for wear-leveling bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAge(pub u32);

impl BlockAge {
    pub const INVALID: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Age the block carries once allocated on top of this recorded age.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for BlockIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid geometry: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated NAND geometry: a linear array of erase blocks, each holding
/// `pages_per_block` pages of `sectors_per_page` sectors of
/// `sector_size` bytes, plus [`SPARE_SIZE`] out-of-band bytes per sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    sector_size: u32,
    sectors_per_page: u16,
    pages_per_block: u16,
    n_blocks: u16,
}

impl Geometry {
    /// Validate a geometry.
    ///
    /// `sector_size` must be a power of two in 64..=65536; blocks must
    /// have room for the init sector, at least one inode entry pair,
    /// the tail sector and the invalidation sector; block indices must
    /// stay clear of the all-ones sentinel.
    pub fn new(
        sector_size: u32,
        sectors_per_page: u16,
        pages_per_block: u16,
        n_blocks: u16,
    ) -> Result<Self, GeometryError> {
        if !sector_size.is_power_of_two() || !(64..=65536).contains(&sector_size) {
            return Err(GeometryError::InvalidField {
                field: "sector_size",
                reason: "must be a power of two in 64..=65536",
            });
        }
        if sectors_per_page < 2 {
            return Err(GeometryError::InvalidField {
                field: "sectors_per_page",
                reason: "must be at least 2",
            });
        }
        if pages_per_block < 2 {
            return Err(GeometryError::InvalidField {
                field: "pages_per_block",
                reason: "must be at least 2",
            });
        }
        if n_blocks < 4 {
            return Err(GeometryError::InvalidField {
                field: "n_blocks",
                reason: "must be at least 4",
            });
        }
        if n_blocks == u16::MAX {
            return Err(GeometryError::InvalidField {
                field: "n_blocks",
                reason: "collides with the invalid-block sentinel",
            });
        }
        if u32::from(sectors_per_page) * u32::from(pages_per_block) > u32::from(u16::MAX) {
            return Err(GeometryError::InvalidField {
                field: "pages_per_block",
                reason: "sectors per block must fit a 16-bit index",
            });
        }
        let geo = Self {
            sector_size,
            sectors_per_page,
            pages_per_block,
            n_blocks,
        };
        // Inode entries occupy [first_inode_entry_sector, tail) in
        // pairs; at least one pair must fit.
        if geo.first_inode_entry_sector() > geo.last_inode_entry_sector() {
            return Err(GeometryError::InvalidField {
                field: "pages_per_block",
                reason: "no room for an inode entry pair between init and tail sectors",
            });
        }
        Ok(geo)
    }

    #[must_use]
    pub fn sector_size(self) -> usize {
        self.sector_size as usize
    }

    #[must_use]
    pub fn sectors_per_page(self) -> u16 {
        self.sectors_per_page
    }

    #[must_use]
    pub fn pages_per_block(self) -> u16 {
        self.pages_per_block
    }

    #[must_use]
    pub fn n_blocks(self) -> u16 {
        self.n_blocks
    }

    #[must_use]
    pub fn sectors_per_block(self) -> u16 {
        self.sectors_per_page * self.pages_per_block
    }

    /// Second-to-last sector: carries the forward link of the chain.
    #[must_use]
    pub fn tail_sector(self) -> u16 {
        self.sectors_per_block() - 2
    }

    /// Last sector: invalidation timestamp for allocated blocks, stat
    /// record for free ones.
    #[must_use]
    pub fn invalidation_sector(self) -> u16 {
        self.sectors_per_block() - 1
    }

    /// First sector of an inode block that holds entries (the first
    /// sector past the page owning the init sector).
    #[must_use]
    pub fn first_inode_entry_sector(self) -> u16 {
        self.sectors_per_page
    }

    /// Highest sector at which an inode entry pair may start.
    #[must_use]
    pub fn last_inode_entry_sector(self) -> u16 {
        self.tail_sector() - 2
    }

    /// Inode entry pairs per inode block.
    #[must_use]
    pub fn inode_entries_per_block(self) -> u16 {
        (self.tail_sector() - self.first_inode_entry_sector()) / 2
    }

    /// Page holding a given sector of a block.
    #[must_use]
    pub fn page_of_sector(self, sector: u16) -> u16 {
        sector / self.sectors_per_page
    }

    /// Sector index within its page.
    #[must_use]
    pub fn sector_in_page(self, sector: u16) -> u16 {
        sector % self.sectors_per_page
    }

    /// Bytes of payload across the whole media (data areas only).
    #[must_use]
    pub fn media_bytes(self) -> u64 {
        u64::from(self.sector_size)
            * u64::from(self.sectors_per_block())
            * u64::from(self.n_blocks)
    }
}

// ── Byte helpers ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Bit distance between two bytes.
///
/// Status bytes in the unprotected spare area are decoded by nearest
/// valid value rather than equality, so a single flipped bit does not
/// reclassify a block.
#[must_use]
pub fn hamming8(a: u8, b: u8) -> u32 {
    (a ^ b).count_ones()
}

/// Whether every byte of `data` reads as erased flash.
#[must_use]
pub fn is_erased(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0xFF)
}

/// Decode a NUL-padded fixed-width filename field.
#[must_use]
pub fn filename_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encode a filename into a NUL-padded fixed-width field.
///
/// Returns `None` if the name (plus NUL) does not fit.
#[must_use]
pub fn filename_to_bytes(name: &str) -> Option<[u8; MAX_FILENAME_LEN]> {
    let raw = name.as_bytes();
    if raw.len() >= MAX_FILENAME_LEN || raw.contains(&0) {
        return None;
    }
    let mut out = [0_u8; MAX_FILENAME_LEN];
    out[..raw.len()].copy_from_slice(raw);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_geometry() -> Geometry {
        Geometry::new(512, 4, 2, 8).expect("test geometry")
    }

    #[test]
    fn geometry_derived_sectors() {
        let geo = test_geometry();
        assert_eq!(geo.sectors_per_block(), 8);
        assert_eq!(geo.tail_sector(), 6);
        assert_eq!(geo.invalidation_sector(), 7);
        assert_eq!(geo.first_inode_entry_sector(), 4);
        assert_eq!(geo.last_inode_entry_sector(), 4);
        assert_eq!(geo.inode_entries_per_block(), 1);
        assert_eq!(geo.page_of_sector(5), 1);
        assert_eq!(geo.sector_in_page(5), 1);
    }

    #[test]
    fn geometry_rejects_bad_shapes() {
        assert!(Geometry::new(500, 4, 2, 8).is_err()); // not a power of two
        assert!(Geometry::new(32, 4, 2, 8).is_err()); // too small
        assert!(Geometry::new(512, 1, 2, 8).is_err());
        assert!(Geometry::new(512, 4, 1, 8).is_err());
        assert!(Geometry::new(512, 4, 2, 2).is_err());
        assert!(Geometry::new(512, 4, 2, u16::MAX).is_err());
        // 2x2 sectors: init page is half the block, no entry pair fits.
        assert!(Geometry::new(512, 2, 2, 8).is_err());
    }

    #[test]
    fn sentinels_match_erased_flash() {
        assert_eq!(BlockIdx::INVALID.0.to_le_bytes(), [0xFF, 0xFF]);
        assert_eq!(Timestamp::INVALID.0.to_le_bytes(), [0xFF; 4]);
        assert!(!FileId::INVALID.is_valid());
        assert!(FileId(0).is_valid());
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 2).expect("u32"), 0xCDEF_5678);
        assert!(read_le_u32(&bytes, 4).is_err());
    }

    #[test]
    fn hamming_distance() {
        assert_eq!(hamming8(0xFF, 0xFF), 0);
        assert_eq!(hamming8(0xFF, 0xFE), 1);
        assert_eq!(hamming8(0xFF, 0x0F), 4);
        assert_eq!(hamming8(0x00, 0xFF), 8);
    }

    #[test]
    fn filename_round_trip() {
        let packed = filename_to_bytes("boot.log").expect("fits");
        assert_eq!(filename_from_bytes(&packed), "boot.log");

        let longest = "a".repeat(MAX_FILENAME_LEN - 1);
        assert!(filename_to_bytes(&longest).is_some());
        let too_long = "a".repeat(MAX_FILENAME_LEN);
        assert!(filename_to_bytes(&too_long).is_none());
        assert!(filename_to_bytes("nul\0name").is_none());
    }

    #[test]
    fn erased_detection() {
        assert!(is_erased(&[0xFF; 16]));
        assert!(!is_erased(&[0xFF, 0x7F]));
    }
}
