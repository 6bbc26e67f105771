#![forbid(unsafe_code)]
//! Free-block accounting and wear-leveled allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap** — raw bit manipulation over the free-block bitmap.
//! 2. **PreallocHeap** — a small age-ordered stash of candidates that
//!    were examined but rejected by the age threshold.
//! 3. **Allocator** — a moving head over the block array, admitting
//!    candidates whose age sits far enough below the mean free age and
//!    relaxing the threshold on every rejection so allocation always
//!    terminates.
//!
//! Allocation returns a block *unerased*; the caller parks it in the
//! one-slot dirty-block protocol and erases lazily at the first real
//! write. [`Allocator::dirty_block`] and friends carry that slot.

use flog_error::Result;
use flog_flash::FlashCache;
use flog_ondisk::BlockStatRecord;
use flog_types::{BlockAge, BlockIdx, Geometry};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u16) -> bool {
    let byte_idx = usize::from(idx / 8);
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u16) {
    let byte_idx = usize::from(idx / 8);
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u16) {
    let byte_idx = usize::from(idx / 8);
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
#[expect(clippy::cast_possible_truncation)] // at most `count` bits are set
pub fn bitmap_count_set(bitmap: &[u8], count: u16) -> u16 {
    (0..count).filter(|idx| bitmap_get(bitmap, *idx)).count() as u16
}

// ── Allocation result ───────────────────────────────────────────────────────

/// A claimed block, still unerased. `age` is the stat-record age; the
/// consumer stamps `age.next()` into the init sector it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    pub block: BlockIdx,
    pub age: BlockAge,
}

/// The one outstanding allocated-but-unwritten block. `holder` is the
/// open write file that will materialize it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyBlock {
    pub block: BlockIdx,
    pub holder: u32,
}

// ── Preallocation heap ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PreallocEntry {
    block: BlockIdx,
    age: BlockAge,
}

/// Fixed-capacity stash of rejected candidates, ascending by age.
/// When full, the oldest entry is evicted.
#[derive(Debug)]
struct PreallocHeap {
    entries: Vec<PreallocEntry>,
    capacity: usize,
}

impl PreallocHeap {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, block: BlockIdx) -> bool {
        self.entries.iter().any(|e| e.block == block)
    }

    fn push(&mut self, block: BlockIdx, age: BlockAge) {
        if self.contains(block) {
            return;
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e.age > age)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, PreallocEntry { block, age });
        if self.entries.len() > self.capacity {
            self.entries.pop();
        }
    }

    /// Youngest entry, if it meets the threshold against the mean age.
    fn pop(&mut self, mean_free_age: BlockAge, threshold: i32) -> Option<PreallocEntry> {
        let youngest = *self.entries.first()?;
        if sufficient(mean_free_age, youngest.age, threshold) {
            self.entries.remove(0);
            Some(youngest)
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Age admission test: a candidate is sufficient when its age sits at
/// least `threshold` below the mean free age. Signed on purpose — a
/// negative threshold admits blocks older than the mean.
#[must_use]
pub fn sufficient(mean_free_age: BlockAge, age: BlockAge, threshold: i32) -> bool {
    i64::from(mean_free_age.0) - i64::from(age.0) >= i64::from(threshold)
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// In-RAM free-pool state: bitmap, counters, the moving allocation
/// head, the preallocation heap, and the dirty-block slot.
#[derive(Debug)]
pub struct Allocator {
    geo: Geometry,
    free_bitmap: Vec<u8>,
    num_free: u16,
    free_age_sum: u64,
    head: u16,
    prealloc: PreallocHeap,
    dirty: Option<DirtyBlock>,
}

impl Allocator {
    #[must_use]
    pub fn new(geo: Geometry, prealloc_capacity: usize) -> Self {
        Self {
            geo,
            free_bitmap: vec![0; usize::from(geo.n_blocks()).div_ceil(8)],
            num_free: 0,
            free_age_sum: 0,
            head: 0,
            prealloc: PreallocHeap::new(prealloc_capacity),
            dirty: None,
        }
    }

    /// Forget everything; mount rebuilds from the media.
    pub fn reset(&mut self) {
        self.free_bitmap.fill(0);
        self.num_free = 0;
        self.free_age_sum = 0;
        self.head = 0;
        self.prealloc.clear();
        self.dirty = None;
    }

    /// Record a block as free with the given stat age.
    pub fn mark_free(&mut self, block: BlockIdx, age: BlockAge) {
        if !bitmap_get(&self.free_bitmap, block.0) {
            bitmap_set(&mut self.free_bitmap, block.0);
            self.num_free += 1;
            self.free_age_sum += u64::from(age.0);
        }
    }

    /// Reverse a [`Allocator::mark_free`], used when mount recovery
    /// discovers the block actually belongs to a completed allocation.
    pub fn unmark_free(&mut self, block: BlockIdx, age: BlockAge) {
        if bitmap_get(&self.free_bitmap, block.0) {
            bitmap_clear(&mut self.free_bitmap, block.0);
            self.num_free -= 1;
            self.free_age_sum -= u64::from(age.0);
        }
    }

    #[must_use]
    pub fn is_free(&self, block: BlockIdx) -> bool {
        bitmap_get(&self.free_bitmap, block.0)
    }

    #[must_use]
    pub fn num_free_blocks(&self) -> u16 {
        self.num_free
    }

    #[must_use]
    pub fn free_age_sum(&self) -> u64 {
        self.free_age_sum
    }

    /// `free_age_sum / num_free_blocks`, zero when the pool is empty.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // ages are u32, so is the mean
    pub fn mean_free_age(&self) -> BlockAge {
        if self.num_free == 0 {
            BlockAge(0)
        } else {
            BlockAge((self.free_age_sum / u64::from(self.num_free)) as u32)
        }
    }

    #[must_use]
    pub fn prealloc_len(&self) -> usize {
        self.prealloc.len()
    }

    // ── Dirty-block slot ────────────────────────────────────────────────

    #[must_use]
    pub fn dirty_block(&self) -> Option<DirtyBlock> {
        self.dirty
    }

    /// Park a freshly allocated block in the slot. The slot must be
    /// empty: callers drain it (via their flush path) before
    /// allocating.
    pub fn set_dirty_block(&mut self, block: BlockIdx, holder: u32) {
        debug_assert!(self.dirty.is_none(), "dirty slot is a one-slot protocol");
        self.dirty = Some(DirtyBlock { block, holder });
    }

    /// Clear the slot once the block's first sector is committed.
    pub fn clear_dirty_block(&mut self) {
        self.dirty = None;
    }

    // ── Allocation ──────────────────────────────────────────────────────

    fn claim(&mut self, block: BlockIdx, age: BlockAge) {
        bitmap_clear(&mut self.free_bitmap, block.0);
        self.num_free -= 1;
        self.free_age_sum -= u64::from(age.0);
    }

    /// Allocate one block, preferring young blocks.
    ///
    /// Examines the preallocation heap first, then walks the moving
    /// head. Every rejection relaxes the threshold by one, so some
    /// candidate is admitted within `n_blocks` iterations whenever the
    /// pool is non-empty. Returns `Ok(None)` when no free block exists.
    pub fn allocate(
        &mut self,
        cache: &mut FlashCache,
        mut threshold: i32,
    ) -> Result<Option<BlockAlloc>> {
        if self.num_free == 0 {
            return Ok(None);
        }

        for _ in 0..self.geo.n_blocks() {
            if let Some(entry) = self.prealloc.pop(self.mean_free_age(), threshold) {
                self.claim(entry.block, entry.age);
                tracing::debug!(block = %entry.block, age = %entry.age, threshold, "allocated from prealloc");
                return Ok(Some(BlockAlloc {
                    block: entry.block,
                    age: entry.age,
                }));
            }

            let candidate = BlockIdx(self.head);
            self.head = (self.head + 1) % self.geo.n_blocks();

            if bitmap_get(&self.free_bitmap, candidate.0) && !self.prealloc.contains(candidate) {
                let age = self.read_stat_age(cache, candidate)?;
                if sufficient(self.mean_free_age(), age, threshold) {
                    self.claim(candidate, age);
                    tracing::debug!(block = %candidate, age = %age, threshold, "allocated");
                    return Ok(Some(BlockAlloc {
                        block: candidate,
                        age,
                    }));
                }
                self.prealloc.push(candidate, age);
            }

            threshold -= 1;
        }

        Ok(None)
    }

    /// Stat-record age of a free block. The record sits at a fixed
    /// offset in the last sector, so this is a single cached-page read.
    fn read_stat_age(&self, cache: &mut FlashCache, block: BlockIdx) -> Result<BlockAge> {
        let mut buf = [0_u8; BlockStatRecord::SIZE];
        cache.read(block.0, self.geo.invalidation_sector(), 0, &mut buf)?;
        let stat = BlockStatRecord::parse(&buf)?;
        if stat.has_valid_key() {
            Ok(stat.age)
        } else {
            tracing::warn!(block = %block, "free block without stat record, assuming age 0");
            Ok(BlockAge(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flog_flash::{FlashDriver, MemNand};
    use flog_types::Timestamp;
    use std::sync::Arc;

    fn geo() -> Geometry {
        Geometry::new(512, 4, 2, 8).expect("geometry")
    }

    /// Stamp stat records so the allocator can read ages off the media.
    fn nand_with_ages(geo: Geometry, ages: &[(u16, u32)]) -> (MemNand, FlashCache) {
        let nand = MemNand::new(geo);
        let mut cache = FlashCache::new(Arc::new(nand.clone()));
        for &(block, age) in ages {
            let stat = BlockStatRecord::new(
                BlockAge(age),
                BlockIdx::INVALID,
                BlockAge::INVALID,
                Timestamp::ZERO,
            );
            cache
                .write(block, geo.invalidation_sector(), 0, &stat.encode())
                .expect("stat write");
            cache.commit().expect("commit");
        }
        (nand, cache)
    }

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0_u8; 2];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert_eq!(bm[0], 0x80);
        bitmap_set(&mut bm, 8);
        assert_eq!(bm[1], 0x01);
        assert_eq!(bitmap_count_set(&bm, 16), 2);
    }

    #[test]
    fn sufficiency_is_signed() {
        assert!(sufficient(BlockAge(100), BlockAge(50), 0));
        assert!(sufficient(BlockAge(100), BlockAge(50), 50));
        assert!(!sufficient(BlockAge(100), BlockAge(50), 51));
        // Negative thresholds admit blocks older than the mean.
        assert!(sufficient(BlockAge(10), BlockAge(40), -30));
        assert!(!sufficient(BlockAge(10), BlockAge(40), -29));
    }

    #[test]
    fn allocates_young_block_first() {
        let geo = geo();
        let (_nand, mut cache) = nand_with_ages(geo, &[(0, 1000), (1, 10), (2, 1000), (3, 10)]);
        let mut alloc = Allocator::new(geo, 4);
        alloc.mark_free(BlockIdx(0), BlockAge(1000));
        alloc.mark_free(BlockIdx(1), BlockAge(10));
        alloc.mark_free(BlockIdx(2), BlockAge(1000));
        alloc.mark_free(BlockIdx(3), BlockAge(10));

        // mean = 505; block 0 (age 1000) is rejected, block 1 admitted.
        let got = alloc
            .allocate(&mut cache, 0)
            .expect("allocate")
            .expect("some");
        assert_eq!(got.block, BlockIdx(1));
        assert_eq!(got.age, BlockAge(10));
        assert_eq!(alloc.num_free_blocks(), 3);
        assert_eq!(alloc.free_age_sum(), 1000 + 1000 + 10);
        assert_eq!(alloc.prealloc_len(), 1);
    }

    #[test]
    fn threshold_relaxes_until_old_blocks_qualify() {
        let geo = geo();
        let (_nand, mut cache) = nand_with_ages(geo, &[(0, 1000), (1, 1000)]);
        let mut alloc = Allocator::new(geo, 4);
        alloc.mark_free(BlockIdx(0), BlockAge(1000));
        alloc.mark_free(BlockIdx(1), BlockAge(1000));

        // mean == every age, threshold 5: rejections decrement it to 0
        // and the prealloc pop admits the youngest.
        let got = alloc
            .allocate(&mut cache, 5)
            .expect("allocate")
            .expect("some");
        assert_eq!(got.age, BlockAge(1000));
    }

    #[test]
    fn exhausts_pool_then_returns_none() {
        let geo = geo();
        let ages: Vec<(u16, u32)> = (0..4).map(|b| (b, 7)).collect();
        let (_nand, mut cache) = nand_with_ages(geo, &ages);
        let mut alloc = Allocator::new(geo, 4);
        for b in 0..4 {
            alloc.mark_free(BlockIdx(b), BlockAge(7));
        }

        let mut seen = Vec::new();
        while let Some(a) = alloc.allocate(&mut cache, 0).expect("allocate") {
            seen.push(a.block.0);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(alloc.num_free_blocks(), 0);
        assert_eq!(alloc.free_age_sum(), 0);
        assert!(alloc.allocate(&mut cache, 0).expect("allocate").is_none());
    }

    #[test]
    fn prealloc_keeps_youngest_and_evicts_oldest() {
        let mut heap = PreallocHeap::new(2);
        heap.push(BlockIdx(0), BlockAge(50));
        heap.push(BlockIdx(1), BlockAge(10));
        heap.push(BlockIdx(2), BlockAge(90)); // evicted immediately
        assert_eq!(heap.len(), 2);
        assert!(!heap.contains(BlockIdx(2)));

        // Duplicate pushes are ignored.
        heap.push(BlockIdx(1), BlockAge(10));
        assert_eq!(heap.len(), 2);

        let e = heap.pop(BlockAge(100), 0).expect("youngest qualifies");
        assert_eq!(e.block, BlockIdx(1));
        assert!(heap.pop(BlockAge(0), 10).is_none());
    }

    #[test]
    fn dirty_slot_round_trip() {
        let mut alloc = Allocator::new(geo(), 4);
        assert!(alloc.dirty_block().is_none());
        alloc.set_dirty_block(BlockIdx(5), 3);
        assert_eq!(
            alloc.dirty_block(),
            Some(DirtyBlock {
                block: BlockIdx(5),
                holder: 3
            })
        );
        alloc.clear_dirty_block();
        assert!(alloc.dirty_block().is_none());
    }

    #[test]
    fn missing_stat_record_reads_as_age_zero() {
        let geo = geo();
        let nand = MemNand::new(geo);
        let mut cache = FlashCache::new(Arc::new(nand));
        let mut alloc = Allocator::new(geo, 4);
        alloc.mark_free(BlockIdx(2), BlockAge(0));

        let got = alloc
            .allocate(&mut cache, 0)
            .expect("allocate")
            .expect("some");
        assert_eq!(got.block, BlockIdx(2));
        assert_eq!(got.age, BlockAge(0));
    }

    #[test]
    fn mount_style_refill_keeps_sum_consistent() {
        let geo = geo();
        let mut alloc = Allocator::new(geo, 4);
        alloc.mark_free(BlockIdx(0), BlockAge(3));
        alloc.mark_free(BlockIdx(1), BlockAge(5));
        alloc.mark_free(BlockIdx(1), BlockAge(5)); // idempotent
        assert_eq!(alloc.num_free_blocks(), 2);
        assert_eq!(alloc.free_age_sum(), 8);
        assert_eq!(alloc.mean_free_age(), BlockAge(4));

        alloc.reset();
        assert_eq!(alloc.num_free_blocks(), 0);
        assert_eq!(alloc.mean_free_age(), BlockAge(0));
    }
}
