//! Mount: a single pass over every block reconstructs the in-RAM
//! state, then two targeted repairs complete whatever non-atomic
//! operation a power loss interrupted.
//!
//! The scan collects the free pool, the candidate `inode0`, the newest
//! allocation record (an inode entry or a committed tail sector) and
//! the newest deletion. Allocation-recovery stamps a successor block
//! whose init sector never landed; deletion-recovery reruns the chain
//! reclamation. Neither repair is surfaced to the caller.
//!
//! Uncorrectable reads never feed a structural decision: the cache
//! shim fails them, and every pass here catches that failure and
//! quarantines the block for the session instead of trusting it.

use flog_error::{FlogError, Result};
use flog_ondisk::{
    classify_spare, BlockStatRecord, BlockType, FileInitHeader, FileInvalidationSector,
    FileSectorSpare, InodeInitHeader, InodeInitSpare, UniversalTailHeader,
};
use flog_types::{BlockAge, BlockIdx, FileId, Timestamp};

use crate::FsState;

/// The newest allocation record on the media.
#[derive(Debug, Clone, Copy)]
struct PendingAlloc {
    timestamp: Timestamp,
    /// Block the record references; its init sector may not have landed.
    target: BlockIdx,
    /// Age the target's init sector must carry.
    age: BlockAge,
    kind: AllocKind,
}

#[derive(Debug, Clone, Copy)]
enum AllocKind {
    /// A file's first block (from an inode entry) or a chain extension
    /// (from a file block's tail).
    File { file_id: FileId },
    /// An inode-chain extension (from an inode block's tail).
    Inode {
        predecessor: BlockIdx,
        predecessor_index: u16,
    },
}

/// The newest invalidated inode entry.
#[derive(Debug, Clone, Copy)]
struct PendingDeletion {
    timestamp: Timestamp,
    file_id: FileId,
    first_block: BlockIdx,
    last_block: BlockIdx,
}

/// Everything the scan reads off one block.
enum BlockScan {
    Free {
        age: BlockAge,
        stat_timestamp: Timestamp,
    },
    Inode {
        init: InodeInitHeader,
        inode_index: u16,
        tail: UniversalTailHeader,
    },
    File {
        init: FileInitHeader,
        tail: UniversalTailHeader,
    },
    Corrupt,
}

/// Swallow an uncorrectable-read failure so a scan can quarantine the
/// block and move on; every other error still aborts.
fn tolerate_uncorrectable<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(FlogError::Uncorrectable { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

impl FsState {
    pub(crate) fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        let geo = self.geo;
        self.alloc.reset();
        self.t_ceiling = Timestamp::ZERO;

        let mut inode0: Option<(BlockIdx, Timestamp)> = None;
        let mut last_alloc: Option<PendingAlloc> = None;
        let mut max_t = 0_u32;
        let mut max_fid = 0_u32;
        let mut max_age = 0_u32;

        for b in 0..geo.n_blocks() {
            let block = BlockIdx(b);
            if self.cache.block_is_bad(b).unwrap_or(true) {
                self.session_bad[usize::from(b)] = true;
                tracing::debug!(block = b, "bad block");
                continue;
            }
            self.session_bad[usize::from(b)] = false;

            // Any uncorrectable read below — tag, stat, init or tail —
            // quarantines the whole block rather than feeding garbage
            // into the pool or the recovery candidates.
            let Some(scan) = tolerate_uncorrectable(self.scan_block(b))? else {
                tracing::warn!(block = b, "uncorrectable read, quarantining");
                self.session_bad[usize::from(b)] = true;
                continue;
            };

            match scan {
                BlockScan::Free {
                    age,
                    stat_timestamp,
                } => {
                    if stat_timestamp.is_valid() {
                        max_t = max_t.max(stat_timestamp.0);
                    }
                    max_age = max_age.max(age.0);
                    self.alloc.mark_free(block, age);
                }
                BlockScan::Inode {
                    init,
                    inode_index,
                    tail,
                } => {
                    if init.timestamp.is_valid() {
                        max_t = max_t.max(init.timestamp.0);
                    }
                    max_age = max_age.max(init.age.0);

                    if inode_index == 0 {
                        match inode0 {
                            None => inode0 = Some((block, init.timestamp)),
                            Some((_, other_ts)) => {
                                // Two candidates: the one with the
                                // lower init timestamp is live, the
                                // other is an in-flight replacement
                                // left for later GC.
                                tracing::warn!(block = b, "second inode0 candidate found");
                                if init.timestamp.0 < other_ts.0 {
                                    inode0 = Some((block, init.timestamp));
                                }
                            }
                        }
                    }

                    if tail.timestamp.is_valid() {
                        max_t = max_t.max(tail.timestamp.0);
                        if last_alloc.is_none_or(|a| tail.timestamp.0 > a.timestamp.0) {
                            last_alloc = Some(PendingAlloc {
                                timestamp: tail.timestamp,
                                target: tail.next_block,
                                age: tail.next_age,
                                kind: AllocKind::Inode {
                                    predecessor: block,
                                    predecessor_index: inode_index,
                                },
                            });
                        }
                    }
                }
                BlockScan::File { init, tail } => {
                    if init.file_id.is_valid() {
                        max_fid = max_fid.max(init.file_id.0);
                    }
                    max_age = max_age.max(init.age.0);

                    if tail.timestamp.is_valid() {
                        max_t = max_t.max(tail.timestamp.0);
                        if last_alloc.is_none_or(|a| tail.timestamp.0 > a.timestamp.0) {
                            last_alloc = Some(PendingAlloc {
                                timestamp: tail.timestamp,
                                target: tail.next_block,
                                age: tail.next_age,
                                kind: AllocKind::File {
                                    file_id: init.file_id,
                                },
                            });
                        }
                    }
                }
                BlockScan::Corrupt => {
                    tracing::warn!(block = b, "unrecognized block type, quarantining");
                    self.session_bad[usize::from(b)] = true;
                }
            }
        }

        let Some((inode0_block, _)) = inode0 else {
            return Err(FlogError::Format(
                "no inode0 block; media is not formatted".to_owned(),
            ));
        };
        self.inode0 = inode0_block;

        // ── Inode-chain pass ────────────────────────────────────────────
        let mut last_deletion: Option<PendingDeletion> = None;
        let mut live_files = 0_u32;
        let max_entries =
            u32::from(geo.n_blocks()) * u32::from(geo.inode_entries_per_block());
        let mut iter = self.inode_iter()?;
        loop {
            if iter.at_end(geo) {
                break;
            }
            if iter.inode_idx > max_entries {
                return Err(FlogError::Corruption {
                    block: iter.block.0,
                    detail: "inode chain does not terminate".to_owned(),
                });
            }

            let Some(entry) = tolerate_uncorrectable(iter.read_alloc_entry(&mut self.cache))?
            else {
                tracing::warn!(block = %iter.block, "uncorrectable entry read, stopping the chain pass");
                self.session_bad[usize::from(iter.block.0)] = true;
                break;
            };
            if !entry.file_id.is_valid() {
                break;
            }
            max_fid = max_fid.max(entry.file_id.0);
            if entry.timestamp.is_valid() {
                max_t = max_t.max(entry.timestamp.0);
            }

            let Some(inval) = tolerate_uncorrectable(iter.read_invalidation(&mut self.cache))?
            else {
                tracing::warn!(block = %iter.block, "uncorrectable entry read, stopping the chain pass");
                self.session_bad[usize::from(iter.block.0)] = true;
                break;
            };
            if inval.timestamp.is_valid() {
                max_t = max_t.max(inval.timestamp.0);
                if last_deletion.is_none_or(|d| inval.timestamp.0 > d.timestamp.0) {
                    last_deletion = Some(PendingDeletion {
                        timestamp: inval.timestamp,
                        file_id: entry.file_id,
                        first_block: entry.first_block,
                        last_block: inval.last_block,
                    });
                }
            } else {
                live_files += 1;
                if last_alloc.is_none_or(|a| entry.timestamp.0 > a.timestamp.0) {
                    last_alloc = Some(PendingAlloc {
                        timestamp: entry.timestamp,
                        target: entry.first_block,
                        age: entry.first_block_age,
                        kind: AllocKind::File {
                            file_id: entry.file_id,
                        },
                    });
                }
            }

            if tolerate_uncorrectable(iter.next(&mut self.cache, geo))?.is_none() {
                let successor = iter.next_block;
                tracing::warn!(block = %successor, "uncorrectable chain link, stopping the chain pass");
                if successor.is_valid() {
                    self.session_bad[usize::from(successor.0)] = true;
                }
                break;
            }
        }

        self.t = Timestamp(max_t);
        self.max_file_id = FileId(max_fid);
        self.max_block_age = BlockAge(max_age);

        // ── Recovery ────────────────────────────────────────────────────
        if let Some(alloc) = last_alloc {
            if alloc.timestamp.0 > 0 && alloc.target.is_valid() {
                match self.recover_allocation(alloc) {
                    Ok(()) => {}
                    Err(FlogError::Uncorrectable { block }) => {
                        tracing::warn!(block, "uncorrectable read during allocation recovery, quarantining");
                        self.session_bad[usize::from(block)] = true;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        if let Some(deletion) = last_deletion {
            match self.recover_deletion(deletion) {
                Ok(()) => {}
                Err(FlogError::Uncorrectable { block }) => {
                    tracing::warn!(block, "uncorrectable read during deletion recovery, quarantining");
                    self.session_bad[usize::from(block)] = true;
                }
                Err(err) => return Err(err),
            }
        }

        self.mounted = true;
        tracing::info!(
            free_blocks = self.alloc.num_free_blocks(),
            live_files,
            max_file_id = %self.max_file_id,
            timestamp = %self.t,
            "mounted"
        );
        Ok(())
    }

    /// Classify one block and read the records the scan depends on.
    fn scan_block(&mut self, b: u16) -> Result<BlockScan> {
        let geo = self.geo;
        let spare = self.cache.read_spare(b, 0)?;
        match classify_spare(&spare) {
            BlockType::Unallocated => {
                let mut buf = [0_u8; BlockStatRecord::SIZE];
                self.cache.read(b, geo.invalidation_sector(), 0, &mut buf)?;
                let stat = BlockStatRecord::parse(&buf)?;
                let (age, stat_timestamp) = if stat.has_valid_key() {
                    (stat.age, stat.timestamp)
                } else {
                    (BlockAge(0), Timestamp::INVALID)
                };
                Ok(BlockScan::Free {
                    age,
                    stat_timestamp,
                })
            }
            BlockType::Inode => {
                let mut ibuf = [0_u8; InodeInitHeader::SIZE];
                self.cache.read(b, 0, 0, &mut ibuf)?;
                let init = InodeInitHeader::parse(&ibuf)?;
                let init_spare = InodeInitSpare::parse(&spare)?;

                let mut tbuf = [0_u8; UniversalTailHeader::SIZE];
                self.cache.read(b, geo.tail_sector(), 0, &mut tbuf)?;
                let tail = UniversalTailHeader::parse(&tbuf)?;
                Ok(BlockScan::Inode {
                    init,
                    inode_index: init_spare.inode_index,
                    tail,
                })
            }
            BlockType::File => {
                let mut ibuf = [0_u8; FileInitHeader::SIZE];
                self.cache.read(b, 0, 0, &mut ibuf)?;
                let init = FileInitHeader::parse(&ibuf)?;

                let mut tbuf = [0_u8; UniversalTailHeader::SIZE];
                self.cache.read(b, geo.tail_sector(), 0, &mut tbuf)?;
                let tail = UniversalTailHeader::parse(&tbuf)?;
                Ok(BlockScan::File { init, tail })
            }
            BlockType::Corrupt => Ok(BlockScan::Corrupt),
        }
    }

    /// Complete an allocation whose referenced block never got its init
    /// sector: the crash hit between the allocation record's commit and
    /// the first write into the new block.
    fn recover_allocation(&mut self, alloc: PendingAlloc) -> Result<()> {
        let target = alloc.target;
        if self.session_bad[usize::from(target.0)] {
            return Ok(());
        }
        let spare = self.cache.read_spare(target.0, 0)?;

        match alloc.kind {
            AllocKind::File { file_id } => {
                if classify_spare(&spare) == BlockType::File {
                    let mut buf = [0_u8; FileInitHeader::SIZE];
                    self.cache.read(target.0, 0, 0, &mut buf)?;
                    if FileInitHeader::parse(&buf)?.file_id == file_id {
                        return Ok(());
                    }
                }
                tracing::info!(block = %target, %file_id, "completing interrupted file-block allocation");
                self.reclaim_target_from_free_pool(target)?;
                self.cache.erase(target.0)?;
                let init = FileInitHeader {
                    age: alloc.age,
                    file_id,
                };
                self.cache.write(target.0, 0, 0, &init.encode())?;
                self.cache
                    .write_spare(target.0, 0, &FileSectorSpare { nbytes: 0 }.encode())?;
                self.cache.commit()?;
            }
            AllocKind::Inode {
                predecessor,
                predecessor_index,
            } => {
                if classify_spare(&spare) == BlockType::Inode {
                    return Ok(());
                }
                tracing::info!(block = %target, "completing interrupted inode-chain extension");
                self.reclaim_target_from_free_pool(target)?;
                self.cache.erase(target.0)?;
                let init = InodeInitHeader {
                    age: alloc.age,
                    timestamp: alloc.timestamp,
                    previous_block: predecessor,
                };
                self.cache.write(target.0, 0, 0, &init.encode())?;
                let init_spare = InodeInitSpare {
                    inode_index: predecessor_index + 1,
                };
                self.cache.write_spare(target.0, 0, &init_spare.encode())?;
                self.cache.commit()?;
            }
        }

        self.note_age(alloc.age);
        if self.t.0 <= alloc.timestamp.0 {
            self.t = Timestamp(alloc.timestamp.0 + 1);
        }
        Ok(())
    }

    /// The scan counted the half-allocated target as free; take it back
    /// out of the pool with the age it was counted at.
    fn reclaim_target_from_free_pool(&mut self, target: BlockIdx) -> Result<()> {
        let mut buf = [0_u8; BlockStatRecord::SIZE];
        self.cache
            .read(target.0, self.geo.invalidation_sector(), 0, &mut buf)?;
        let stat = BlockStatRecord::parse(&buf)?;
        let counted_age = if stat.has_valid_key() {
            stat.age
        } else {
            BlockAge(0)
        };
        self.alloc.unmark_free(target, counted_age);
        Ok(())
    }

    /// Rerun an interrupted chain reclamation. Triggered when the
    /// newest invalidated entry's last block still carries the dead
    /// file id and its invalidation sector was never stamped.
    fn recover_deletion(&mut self, deletion: PendingDeletion) -> Result<()> {
        let last = deletion.last_block;
        if !last.is_valid() || self.session_bad[usize::from(last.0)] {
            return Ok(());
        }
        let spare = self.cache.read_spare(last.0, 0)?;
        if classify_spare(&spare) != BlockType::File {
            return Ok(());
        }
        let mut buf = [0_u8; FileInitHeader::SIZE];
        self.cache.read(last.0, 0, 0, &mut buf)?;
        if FileInitHeader::parse(&buf)?.file_id != deletion.file_id {
            return Ok(());
        }
        let mut ibuf = [0_u8; FileInvalidationSector::SIZE];
        self.cache
            .read(last.0, self.geo.invalidation_sector(), 0, &mut ibuf)?;
        if FileInvalidationSector::parse(&ibuf)?.timestamp.is_valid() {
            return Ok(());
        }

        tracing::info!(
            file_id = %deletion.file_id,
            first_block = %deletion.first_block,
            "deletion was interrupted, rerunning chain invalidation"
        );
        self.invalidate_chain(deletion.first_block, deletion.file_id)
    }
}
