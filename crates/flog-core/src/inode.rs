//! Inode chain iteration.
//!
//! Inode entries live in a singly linked chain of inode blocks starting
//! at `inode0`. Each entry is a pair of consecutive sectors: the
//! allocation sector names the file and the head of its block chain,
//! the companion invalidation sector is erased while the file is live.
//! End of table is the first entry whose allocation sector reads
//! `file_id == INVALID` — erased flash.

use flog_error::{FlogError, Result};
use flog_flash::FlashCache;
use flog_ondisk::{
    BlockType, InodeAllocEntry, InodeInitHeader, InodeInitSpare, InodeInvalidationEntry,
    UniversalTailHeader,
};
use flog_types::{BlockIdx, Geometry, Timestamp};

use crate::FsState;

/// Cursor over inode entries.
///
/// `sector` addresses the current entry's allocation sector. When it
/// runs past [`Geometry::last_inode_entry_sector`] and no successor
/// block exists, the iterator is at the one-past-end position: the slot
/// a chain extension would make writable.
#[derive(Debug, Clone)]
pub(crate) struct InodeIter {
    pub block: BlockIdx,
    pub next_block: BlockIdx,
    pub previous_block: BlockIdx,
    /// Running entry index across the whole chain.
    pub inode_idx: u32,
    /// Absolute index of the current block within the chain.
    pub inode_block_idx: u16,
    pub sector: u16,
}

/// What a filename lookup found.
pub(crate) enum FindOutcome {
    /// A live entry, with the inode block/sector it occupies.
    Found {
        entry: InodeAllocEntry,
        block: BlockIdx,
        sector: u16,
    },
    /// End of table; the iterator is parked at the first free slot,
    /// ready for `prepare_new`.
    Free(InodeIter),
}

/// Per-block chain links read from an inode block's metadata sectors.
struct InodeBlockLinks {
    next_block: BlockIdx,
    previous_block: BlockIdx,
    inode_block_idx: u16,
}

/// Read an inode block's chain links. `None` means the block is not
/// (yet) typed as an inode block — a half-written chain extension that
/// mount's allocation-recovery will finish.
fn read_links(
    cache: &mut FlashCache,
    geo: Geometry,
    block: BlockIdx,
) -> Result<Option<InodeBlockLinks>> {
    let spare = cache.read_spare(block.0, 0)?;
    if flog_ondisk::classify_spare(&spare) != BlockType::Inode {
        return Ok(None);
    }
    let init_spare = InodeInitSpare::parse(&spare)?;

    let mut init_buf = [0_u8; InodeInitHeader::SIZE];
    cache.read(block.0, 0, 0, &mut init_buf)?;
    let init = InodeInitHeader::parse(&init_buf)?;

    let mut tail_buf = [0_u8; UniversalTailHeader::SIZE];
    cache.read(block.0, geo.tail_sector(), 0, &mut tail_buf)?;
    let tail = UniversalTailHeader::parse(&tail_buf)?;

    Ok(Some(InodeBlockLinks {
        next_block: if tail.timestamp.is_valid() {
            tail.next_block
        } else {
            BlockIdx::INVALID
        },
        previous_block: init.previous_block,
        inode_block_idx: init_spare.inode_index,
    }))
}

impl InodeIter {
    /// Position on the first entry of the chain rooted at `inode0`.
    pub fn init(cache: &mut FlashCache, geo: Geometry, inode0: BlockIdx) -> Result<Self> {
        let Some(links) = read_links(cache, geo, inode0)? else {
            return Err(FlogError::Corruption {
                block: inode0.0,
                detail: "inode0 is not typed as an inode block".to_owned(),
            });
        };
        if links.inode_block_idx != 0 {
            tracing::warn!(block = %inode0, index = links.inode_block_idx, "inode0 carries a nonzero chain index");
        }
        Ok(Self {
            block: inode0,
            next_block: links.next_block,
            previous_block: links.previous_block,
            inode_idx: 0,
            inode_block_idx: links.inode_block_idx,
            sector: geo.first_inode_entry_sector(),
        })
    }

    /// Whether the cursor is parked one past the last allocated slot
    /// position of the chain's final block.
    #[must_use]
    pub fn at_end(&self, geo: Geometry) -> bool {
        self.sector > geo.last_inode_entry_sector()
    }

    /// Advance one entry, stepping into the successor block when this
    /// one is exhausted. At the chain's end the cursor stops at the
    /// one-past-end slot rather than walking into unallocated space.
    pub fn next(&mut self, cache: &mut FlashCache, geo: Geometry) -> Result<()> {
        self.sector += 2;
        self.inode_idx += 1;
        if self.sector > geo.last_inode_entry_sector() && self.next_block.is_valid() {
            let block = self.next_block;
            match read_links(cache, geo, block)? {
                Some(links) => {
                    self.previous_block = self.block;
                    self.block = block;
                    self.next_block = links.next_block;
                    self.inode_block_idx = links.inode_block_idx;
                    self.sector = geo.first_inode_entry_sector();
                }
                // Half-written extension: stop here; the mount repair
                // pass stamps the successor before anyone iterates
                // again.
                None => self.next_block = BlockIdx::INVALID,
            }
        }
        Ok(())
    }

    /// Step back one entry, following the init sector's back-link
    /// across block boundaries. Returns `false` at the chain start.
    pub fn prev(&mut self, cache: &mut FlashCache, geo: Geometry) -> Result<bool> {
        if self.sector <= geo.first_inode_entry_sector() {
            if !self.previous_block.is_valid() {
                return Ok(false);
            }
            let block = self.previous_block;
            let Some(links) = read_links(cache, geo, block)? else {
                return Err(FlogError::Corruption {
                    block: block.0,
                    detail: "inode back-link leads to a non-inode block".to_owned(),
                });
            };
            self.next_block = self.block;
            self.block = block;
            self.previous_block = links.previous_block;
            self.inode_block_idx = links.inode_block_idx;
            self.sector = geo.last_inode_entry_sector();
        } else {
            self.sector -= 2;
        }
        self.inode_idx = self.inode_idx.saturating_sub(1);
        Ok(true)
    }

    pub fn read_alloc_entry(&self, cache: &mut FlashCache) -> Result<InodeAllocEntry> {
        let mut buf = [0_u8; InodeAllocEntry::SIZE];
        cache.read(self.block.0, self.sector, 0, &mut buf)?;
        Ok(InodeAllocEntry::parse(&buf)?)
    }

    pub fn read_invalidation(&self, cache: &mut FlashCache) -> Result<InodeInvalidationEntry> {
        let mut buf = [0_u8; InodeInvalidationEntry::SIZE];
        cache.read(self.block.0, self.sector + 1, 0, &mut buf)?;
        Ok(InodeInvalidationEntry::parse(&buf)?)
    }
}

impl FsState {
    pub(crate) fn inode_iter(&mut self) -> Result<InodeIter> {
        InodeIter::init(&mut self.cache, self.geo, self.inode0)
    }

    /// Look up `name` among live entries.
    ///
    /// On a miss the returned iterator is parked at the first free
    /// entry so callers can hand it straight to `prepare_new`.
    pub(crate) fn find_file(&mut self, name: &str) -> Result<FindOutcome> {
        let geo = self.geo;
        let mut iter = self.inode_iter()?;
        loop {
            if iter.at_end(geo) {
                return Ok(FindOutcome::Free(iter));
            }
            let entry = iter.read_alloc_entry(&mut self.cache)?;
            if !entry.file_id.is_valid() {
                return Ok(FindOutcome::Free(iter));
            }
            if entry.name_matches(name) {
                let inval = iter.read_invalidation(&mut self.cache)?;
                if !inval.timestamp.is_valid() {
                    return Ok(FindOutcome::Found {
                        entry,
                        block: iter.block,
                        sector: iter.sector,
                    });
                }
            }
            iter.next(&mut self.cache, geo)?;
        }
    }

    /// Make the iterator's current slot writable, extending the inode
    /// chain with a fresh block when the current one is full.
    ///
    /// Extension order matters for recovery: the old block's tail (the
    /// allocation record) commits first, then the new block is erased
    /// and its init sector stamped. A crash in between is repaired by
    /// mount's allocation-recovery pass.
    pub(crate) fn prepare_new(&mut self, iter: &mut InodeIter) -> Result<()> {
        let geo = self.geo;
        if !iter.at_end(geo) {
            return Ok(());
        }

        self.flush_dirty_block()?;
        let Some(alloc) = self.allocate_block(crate::INODE_BASE_THRESHOLD)? else {
            return Err(FlogError::NoSpace);
        };
        let ts = self.next_timestamp();

        let tail = UniversalTailHeader {
            next_block: alloc.block,
            next_age: alloc.age.next(),
            timestamp: ts,
        };
        self.cache
            .write(iter.block.0, geo.tail_sector(), 0, &tail.encode())?;
        self.cache.commit()?;

        self.cache.erase(alloc.block.0)?;
        let init = InodeInitHeader {
            age: alloc.age.next(),
            timestamp: ts,
            previous_block: iter.block,
        };
        self.cache.write(alloc.block.0, 0, 0, &init.encode())?;
        let spare = InodeInitSpare {
            inode_index: iter.inode_block_idx + 1,
        };
        self.cache.write_spare(alloc.block.0, 0, &spare.encode())?;
        self.cache.commit()?;

        tracing::debug!(
            from = %iter.block,
            to = %alloc.block,
            index = iter.inode_block_idx + 1,
            "extended inode chain"
        );

        iter.previous_block = iter.block;
        iter.block = alloc.block;
        iter.next_block = BlockIdx::INVALID;
        iter.inode_block_idx += 1;
        iter.sector = geo.first_inode_entry_sector();
        Ok(())
    }

    /// Write the invalidation half of the entry at `(block, sector)`.
    pub(crate) fn invalidate_entry(
        &mut self,
        block: BlockIdx,
        sector: u16,
        timestamp: Timestamp,
        last_block: BlockIdx,
    ) -> Result<()> {
        let entry = InodeInvalidationEntry {
            timestamp,
            last_block,
        };
        self.cache.write(block.0, sector + 1, 0, &entry.encode())?;
        self.cache.commit()
    }
}
