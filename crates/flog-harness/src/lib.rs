#![forbid(unsafe_code)]
//! End-to-end fixtures for FLogFS.
//!
//! [`TestFs`] bundles a simulated NAND device with a mounted
//! filesystem and panicking convenience wrappers, so scenario tests
//! read as straight-line workloads. The free functions peek at the
//! media through the raw driver, bypassing the filesystem, for
//! assertions about on-media state (block tags, stat ages, durable
//! event counts).

use flog_core::{BlockAge, BlockIdx, Flogfs, Geometry, Timestamp};
use flog_flash::{FlashDriver, MemNand};
use flog_ondisk::{classify_spare, BlockStatRecord, BlockType};
use std::sync::Arc;

/// Deterministic pseudo-random payload bytes.
#[must_use]
pub fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 56) as u8
        })
        .collect()
}

/// A simulated device plus a mounted filesystem over it.
pub struct TestFs {
    geo: Geometry,
    pub nand: MemNand,
    pub fs: Flogfs,
}

impl TestFs {
    /// Fresh media, formatted and mounted.
    #[must_use]
    pub fn formatted(geo: Geometry) -> Self {
        let nand = MemNand::new(geo);
        let fs = Flogfs::new(Arc::new(nand.clone())).expect("bind filesystem");
        fs.format().expect("format");
        fs.mount().expect("mount");
        Self { geo, nand, fs }
    }

    /// Mount a filesystem over existing media.
    #[must_use]
    pub fn mounted_over(geo: Geometry, nand: MemNand) -> Self {
        let fs = Flogfs::new(Arc::new(nand.clone())).expect("bind filesystem");
        fs.mount().expect("mount");
        Self { geo, nand, fs }
    }

    /// Cold reboot: drop the filesystem, mount a fresh one over the
    /// same media.
    #[must_use]
    pub fn remount(self) -> Self {
        let Self { geo, nand, fs } = self;
        drop(fs);
        Self::mounted_over(geo, nand)
    }

    #[must_use]
    pub fn geo(&self) -> Geometry {
        self.geo
    }

    pub fn write_file(&self, name: &str, data: &[u8]) {
        let h = self.fs.open_write(name).expect("open_write");
        assert_eq!(self.fs.write(&h, data).expect("write"), data.len());
        self.fs.close_write(h).expect("close_write");
    }

    #[must_use]
    pub fn read_all(&self, name: &str) -> Vec<u8> {
        let h = self.fs.open_read(name).expect("open_read");
        let mut out = Vec::new();
        let mut buf = [0_u8; 251];
        loop {
            let n = self.fs.read(&h, &mut buf).expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        self.fs.close_read(h).expect("close_read");
        out
    }
}

/// Commits + erases so far: the events that matter for power-loss
/// injection budgets.
#[must_use]
pub fn durable_events(nand: &MemNand) -> u64 {
    let stats = nand.stats();
    stats.commits + stats.erases
}

/// Whether a block's first-sector spare reads as unallocated.
#[must_use]
pub fn block_is_unallocated(nand: &MemNand, block: u16) -> bool {
    if nand.open_page(block, 0).is_err() {
        return false;
    }
    let mut spare = [0_u8; flog_types::SPARE_SIZE];
    if nand.read_spare(&mut spare, 0).is_err() {
        return false;
    }
    classify_spare(&spare) == BlockType::Unallocated
}

/// Stat-record age of a block, if a valid record is present.
#[must_use]
pub fn stat_age(nand: &MemNand, geo: Geometry, block: u16) -> Option<u32> {
    let inval = geo.invalidation_sector();
    nand.open_page(block, geo.page_of_sector(inval)).ok()?;
    let mut buf = [0_u8; BlockStatRecord::SIZE];
    nand.read_sector(&mut buf, geo.sector_in_page(inval), 0)
        .ok()?;
    let stat = BlockStatRecord::parse(&buf).ok()?;
    stat.has_valid_key().then_some(stat.age.0)
}

/// Restamp a free block's stat record with a synthetic age — test
/// setup for wear-leveling scenarios. The block is erased first, so
/// this must only be used on unallocated blocks.
pub fn set_free_block_age(nand: &MemNand, geo: Geometry, block: u16, age: u32) {
    assert!(
        block_is_unallocated(nand, block),
        "block {block} is allocated"
    );
    nand.erase_block(block).expect("erase");
    let stat = BlockStatRecord::new(
        BlockAge(age),
        BlockIdx::INVALID,
        BlockAge::INVALID,
        Timestamp::ZERO,
    );
    let inval = geo.invalidation_sector();
    nand.open_page(block, geo.page_of_sector(inval))
        .expect("open");
    nand.write_sector(&stat.encode(), geo.sector_in_page(inval), 0)
        .expect("write stat");
    nand.commit().expect("commit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_is_deterministic() {
        assert_eq!(pattern(7, 32), pattern(7, 32));
        assert_ne!(pattern(7, 32), pattern(8, 32));
    }

    #[test]
    fn fixture_round_trips() {
        let geo = Geometry::new(512, 4, 2, 8).expect("geometry");
        let t = TestFs::formatted(geo);
        let data = pattern(1, 700);
        t.write_file("fixture", &data);
        assert_eq!(t.read_all("fixture"), data);

        let t = t.remount();
        assert_eq!(t.read_all("fixture"), data);
    }

    #[test]
    fn media_peek_helpers_agree_with_fs() {
        let geo = Geometry::new(512, 4, 2, 8).expect("geometry");
        let t = TestFs::formatted(geo);
        // inode0 is allocated, the rest are free with stat records.
        assert!(!block_is_unallocated(&t.nand, 0));
        for b in 1..geo.n_blocks() {
            assert!(block_is_unallocated(&t.nand, b));
            assert_eq!(stat_age(&t.nand, geo, b), Some(0));
        }

        set_free_block_age(&t.nand, geo, 3, 77);
        assert_eq!(stat_age(&t.nand, geo, 3), Some(77));
    }
}
