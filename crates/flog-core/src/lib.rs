#![forbid(unsafe_code)]
//! FLogFS core engine.
//!
//! An append-only log-structured filesystem for raw SLC NAND: a flat
//! namespace of byte-streams written sequentially and read sequentially
//! or from the start. No in-place update, no seek-write, no rename.
//!
//! ## Design
//!
//! State is isolated in a [`Flogfs`] handle whose lifetime brackets
//! `mount..drop`; every public operation runs under the handle's
//! filesystem lock. The media side is layered:
//!
//! - block identity and chain records live in `flog-ondisk`,
//! - the free pool and wear-leveled allocation in `flog-alloc`,
//! - the single-open-page shim and driver contract in `flog-flash`,
//! - the inode chain cursor in [`mod@self::inode`], mount and
//!   crash recovery in [`mod@self::mount`].
//!
//! All persistent ordering decisions are made here: an allocation
//! record (inode entry or tail sector) always commits before the block
//! it references is erased and stamped, so a crash between the two is
//! repaired by the next mount.

mod inode;
mod mount;

pub use flog_error::{FlogError, Result};
pub use flog_types::{BlockAge, BlockIdx, FileId, Geometry, Timestamp};

use flog_alloc::Allocator;
use flog_flash::{FlashCache, FlashDriver};
use flog_ondisk::{
    classify_spare, file_sector_data_offset, BlockStatRecord, BlockType, FileInitHeader,
    FileSectorSpare, FileTailHeader, InodeAllocEntry, InodeInitHeader, InodeInitSpare,
};
use inode::FindOutcome;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Capacity of the allocator's preallocation heap.
const PREALLOCATE_SIZE: usize = 10;

/// Age threshold for inode-chain blocks.
pub(crate) const INODE_BASE_THRESHOLD: i32 = 0;

/// Default age threshold for write files.
const DEFAULT_BASE_THRESHOLD: i32 = 0;

// ── Public reporting types ──────────────────────────────────────────────────

/// Point-in-time filesystem counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub n_blocks: u16,
    pub num_free_blocks: u16,
    pub free_age_sum: u64,
    pub mean_free_age: u32,
    pub max_block_age: u32,
    pub max_file_id: u32,
    pub timestamp: u32,
    pub open_reads: usize,
    pub open_writes: usize,
}

/// One live file, as enumerated by [`Flogfs::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub file_id: u32,
}

/// Token for a file opened for reading. Obtained from
/// [`Flogfs::open_read`], surrendered to [`Flogfs::close_read`].
#[derive(Debug)]
pub struct ReadHandle {
    id: u32,
}

/// Token for a file opened for appending. Obtained from
/// [`Flogfs::open_write`], surrendered to [`Flogfs::close_write`]
/// (which flushes the sector buffer).
#[derive(Debug)]
pub struct WriteHandle {
    id: u32,
}

// ── Internal state ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct ReadState {
    id: u32,
    file_id: FileId,
    block: BlockIdx,
    sector: u16,
    /// Byte position within the current sector (absolute, headers
    /// included).
    offset: usize,
    /// Unconsumed bytes of the current sector's committed payload.
    remaining: usize,
    read_head: u64,
}

#[derive(Debug)]
struct WriteState {
    id: u32,
    file_id: FileId,
    block: BlockIdx,
    /// Age the current block's init sector carries (or will carry).
    block_age: BlockAge,
    sector: u16,
    /// Fill position within the current sector; data below it (past the
    /// header region) is buffered, not yet committed.
    offset: usize,
    /// Committed data bytes in the current block.
    bytes_in_block: u32,
    write_head: u64,
    base_threshold: i32,
    buf: Vec<u8>,
}

pub(crate) struct FsState {
    pub(crate) geo: Geometry,
    pub(crate) cache: FlashCache,
    pub(crate) alloc: Allocator,
    pub(crate) mounted: bool,
    /// Last issued allocation timestamp.
    pub(crate) t: Timestamp,
    /// Timestamps at or below this are reserved by an in-flight
    /// deletion; allocation stamps must land above it.
    pub(crate) t_ceiling: Timestamp,
    pub(crate) max_file_id: FileId,
    pub(crate) max_block_age: BlockAge,
    pub(crate) inode0: BlockIdx,
    /// Factory-bad and session-quarantined blocks.
    pub(crate) session_bad: Vec<bool>,
    read_files: Vec<Option<ReadState>>,
    write_files: Vec<Option<WriteState>>,
    next_handle: u32,
}

/// The filesystem handle. All public operations serialize on the
/// internal filesystem lock; the flash driver's own mutex nests inside.
pub struct Flogfs {
    inner: Mutex<FsState>,
}

impl Flogfs {
    /// Bind a filesystem to a flash driver. The media is untouched;
    /// call [`Flogfs::format`] or [`Flogfs::mount`] next.
    pub fn new(driver: Arc<dyn FlashDriver>) -> Result<Self> {
        let cache = FlashCache::new(driver);
        let geo = cache.geometry();
        if flog_ondisk::block_data_capacity(geo) > usize::from(u16::MAX) {
            return Err(FlogError::Format(
                "block data capacity exceeds the tail header's 16-bit byte count".to_owned(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(FsState {
                geo,
                cache,
                alloc: Allocator::new(geo, PREALLOCATE_SIZE),
                mounted: false,
                t: Timestamp::ZERO,
                t_ceiling: Timestamp::ZERO,
                max_file_id: FileId(0),
                max_block_age: BlockAge(0),
                inode0: BlockIdx::INVALID,
                session_bad: vec![false; usize::from(geo.n_blocks())],
                read_files: Vec::new(),
                write_files: Vec::new(),
                next_handle: 0,
            }),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.inner.lock().geo
    }

    /// Prepare every good block and claim the first one as `inode0`.
    ///
    /// Ages of previously formatted blocks are preserved via their stat
    /// records; anything else starts at age zero. Any prior mount state
    /// and open handles are discarded.
    pub fn format(&self) -> Result<()> {
        let mut st = self.inner.lock();
        st.mounted = false;
        st.read_files.clear();
        st.write_files.clear();
        st.alloc.reset();

        let geo = st.geo;
        let mut first_good: Option<(BlockIdx, BlockAge)> = None;
        let mut good = 0_u16;

        for b in 0..geo.n_blocks() {
            let bad = st.cache.block_is_bad(b).unwrap_or(true);
            if bad {
                st.session_bad[usize::from(b)] = true;
                tracing::warn!(block = b, "skipping bad block at format");
                continue;
            }
            st.session_bad[usize::from(b)] = false;

            let mut buf = [0_u8; BlockStatRecord::SIZE];
            st.cache.read(b, geo.invalidation_sector(), 0, &mut buf)?;
            let stat = BlockStatRecord::parse(&buf)?;
            let age = if stat.has_valid_key() {
                stat.age
            } else {
                BlockAge(0)
            };

            if st.cache.erase(b).is_err() {
                st.session_bad[usize::from(b)] = true;
                tracing::warn!(block = b, "erase refused at format, quarantining");
                continue;
            }
            let fresh = BlockStatRecord::new(age, BlockIdx::INVALID, BlockAge::INVALID, Timestamp::ZERO);
            st.cache
                .write(b, geo.invalidation_sector(), 0, &fresh.encode())?;
            st.cache.commit()?;

            good += 1;
            if first_good.is_none() {
                first_good = Some((BlockIdx(b), age));
            }
        }

        let Some((inode0, age)) = first_good else {
            return Err(FlogError::Format("no good blocks on media".to_owned()));
        };

        let init = InodeInitHeader {
            age: age.next(),
            timestamp: Timestamp::ZERO,
            previous_block: BlockIdx::INVALID,
        };
        st.cache.write(inode0.0, 0, 0, &init.encode())?;
        st.cache
            .write_spare(inode0.0, 0, &InodeInitSpare { inode_index: 0 }.encode())?;
        st.cache.commit()?;

        tracing::info!(good_blocks = good, inode0 = %inode0, "formatted");
        Ok(())
    }

    /// Mount: one pass over every block, rebuild the in-RAM state, and
    /// finish any non-atomic operation a power loss interrupted.
    /// Mounting an already-mounted filesystem is a no-op.
    pub fn mount(&self) -> Result<()> {
        self.inner.lock().mount()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.lock().mounted
    }

    pub fn stats(&self) -> Result<FsStats> {
        let st = self.inner.lock();
        if !st.mounted {
            return Err(FlogError::NotMounted);
        }
        Ok(FsStats {
            n_blocks: st.geo.n_blocks(),
            num_free_blocks: st.alloc.num_free_blocks(),
            free_age_sum: st.alloc.free_age_sum(),
            mean_free_age: st.alloc.mean_free_age().0,
            max_block_age: st.max_block_age.0,
            max_file_id: st.max_file_id.0,
            timestamp: st.t.0,
            open_reads: st.read_files.iter().flatten().count(),
            open_writes: st.write_files.iter().flatten().count(),
        })
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Open a file for reading from the start.
    pub fn open_read(&self, name: &str) -> Result<ReadHandle> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        match st.find_file(name)? {
            FindOutcome::Free(_) => Err(FlogError::NotFound(name.to_owned())),
            FindOutcome::Found { entry, .. } => {
                if st.file_is_open_for_write(entry.file_id) {
                    return Err(FlogError::AlreadyOpen(name.to_owned()));
                }
                let id = st.alloc_handle();
                st.put_read(ReadState {
                    id,
                    file_id: entry.file_id,
                    block: entry.first_block,
                    sector: 0,
                    offset: FileInitHeader::SIZE,
                    remaining: 0,
                    read_head: 0,
                });
                Ok(ReadHandle { id })
            }
        }
    }

    /// Read up to `out.len()` bytes. A short (possibly zero) count
    /// means the committed data is exhausted; more may appear if a
    /// writer appends and the caller retries.
    pub fn read(&self, handle: &ReadHandle, out: &mut [u8]) -> Result<usize> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        let mut r = st.take_read(handle.id)?;
        let result = st.read_inner(&mut r, out);
        st.put_read(r);
        result
    }

    pub fn close_read(&self, handle: ReadHandle) -> Result<()> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        st.take_read(handle.id).map(drop)
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Open a file for appending, creating it if missing.
    pub fn open_write(&self, name: &str) -> Result<WriteHandle> {
        self.open_write_with_threshold(name, DEFAULT_BASE_THRESHOLD)
    }

    /// [`Flogfs::open_write`] with an explicit wear-leveling threshold
    /// for this file's block allocations.
    pub fn open_write_with_threshold(&self, name: &str, base_threshold: i32) -> Result<WriteHandle> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        let Some(filename) = flog_types::filename_to_bytes(name) else {
            return Err(FlogError::NameTooLong);
        };

        match st.find_file(name)? {
            FindOutcome::Found { entry, .. } => {
                if st.file_is_open_for_write(entry.file_id) {
                    return Err(FlogError::AlreadyOpen(name.to_owned()));
                }
                let pos = st.seek_to_end(&entry)?;
                let id = st.alloc_handle();
                let buf = vec![0_u8; st.geo.sector_size()];
                st.put_write(WriteState {
                    id,
                    file_id: entry.file_id,
                    block: pos.block,
                    block_age: pos.block_age,
                    sector: pos.sector,
                    offset: pos.offset,
                    bytes_in_block: pos.bytes_in_block,
                    write_head: pos.write_head,
                    base_threshold,
                    buf,
                });
                Ok(WriteHandle { id })
            }
            FindOutcome::Free(mut iter) => {
                st.prepare_new(&mut iter)?;
                st.flush_dirty_block()?;
                let Some(alloc) = st.allocate_block(base_threshold)? else {
                    return Err(FlogError::NoSpace);
                };
                let id = st.alloc_handle();
                st.alloc.set_dirty_block(alloc.block, id);

                let file_id = FileId(st.max_file_id.0 + 1);
                st.max_file_id = file_id;
                let ts = st.next_timestamp();
                let entry = InodeAllocEntry {
                    file_id,
                    first_block: alloc.block,
                    first_block_age: alloc.age.next(),
                    timestamp: ts,
                    filename,
                };
                st.cache
                    .write(iter.block.0, iter.sector, 0, &entry.encode())?;
                st.cache.commit()?;
                st.note_age(alloc.age.next());
                tracing::debug!(name, %file_id, first_block = %alloc.block, "created file");

                let buf = vec![0_u8; st.geo.sector_size()];
                st.put_write(WriteState {
                    id,
                    file_id,
                    block: alloc.block,
                    block_age: alloc.age.next(),
                    sector: 0,
                    offset: FileInitHeader::SIZE,
                    bytes_in_block: 0,
                    write_head: 0,
                    base_threshold,
                    buf,
                });
                Ok(WriteHandle { id })
            }
        }
    }

    /// Append bytes. Returns the number accepted; a short count (down
    /// to zero) means the media filled up — the file stays readable up
    /// to its last committed sector.
    pub fn write(&self, handle: &WriteHandle, data: &[u8]) -> Result<usize> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        let mut w = st.take_write(handle.id)?;
        let mut written = 0_usize;
        let result = st.write_inner(&mut w, data, &mut written);
        st.put_write(w);
        result.map(|()| written)
    }

    /// Flush the sector buffer and close the file. On error the handle
    /// is invalidated but committed data stays readable.
    pub fn close_write(&self, handle: WriteHandle) -> Result<()> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        let mut w = st.take_write(handle.id)?;
        st.flush_write(&mut w)
    }

    // ── Namespace ───────────────────────────────────────────────────────

    pub fn exists(&self, name: &str) -> Result<bool> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        Ok(matches!(st.find_file(name)?, FindOutcome::Found { .. }))
    }

    /// Delete a file: invalidate its inode entry, then reclaim the
    /// whole block chain.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        match st.find_file(name)? {
            FindOutcome::Free(_) => Err(FlogError::NotFound(name.to_owned())),
            FindOutcome::Found {
                entry,
                block,
                sector,
            } => {
                if st.file_is_open(entry.file_id) {
                    return Err(FlogError::AlreadyOpen(name.to_owned()));
                }
                let last = st.find_last_block(entry.first_block)?;
                let ts = st.next_timestamp();
                st.invalidate_entry(block, sector, ts, last)?;
                st.invalidate_chain(entry.first_block, entry.file_id)?;
                tracing::debug!(name, file_id = %entry.file_id, "removed");
                Ok(())
            }
        }
    }

    /// Collect every live file, in inode order.
    pub fn list(&self) -> Result<Vec<FileInfo>> {
        let mut st = self.inner.lock();
        st.ensure_mounted()?;
        let geo = st.geo;
        let mut iter = st.inode_iter()?;
        let mut out = Vec::new();
        loop {
            if iter.at_end(geo) {
                break;
            }
            let entry = iter.read_alloc_entry(&mut st.cache)?;
            if !entry.file_id.is_valid() {
                break;
            }
            let inval = iter.read_invalidation(&mut st.cache)?;
            if !inval.timestamp.is_valid() {
                out.push(FileInfo {
                    name: entry.name(),
                    file_id: entry.file_id.0,
                });
            }
            iter.next(&mut st.cache, geo)?;
        }
        Ok(out)
    }

    /// Stepwise enumeration; each [`LsIter::next_name`] takes the
    /// filesystem lock once.
    #[must_use]
    pub fn ls(&self) -> LsIter<'_> {
        LsIter {
            fs: self,
            pos: None,
            started: false,
        }
    }
}

/// Cursor over live filenames. See [`Flogfs::ls`].
pub struct LsIter<'a> {
    fs: &'a Flogfs,
    pos: Option<inode::InodeIter>,
    started: bool,
}

impl LsIter<'_> {
    /// Next live filename, or `None` at the end of the table.
    pub fn next_name(&mut self) -> Result<Option<String>> {
        let mut st = self.fs.inner.lock();
        st.ensure_mounted()?;
        let geo = st.geo;
        if !self.started {
            self.started = true;
            self.pos = Some(st.inode_iter()?);
        }
        loop {
            let Some(iter) = self.pos.as_mut() else {
                return Ok(None);
            };
            if iter.at_end(geo) {
                self.pos = None;
                return Ok(None);
            }
            let entry = iter.read_alloc_entry(&mut st.cache)?;
            if !entry.file_id.is_valid() {
                self.pos = None;
                return Ok(None);
            }
            let inval = iter.read_invalidation(&mut st.cache)?;
            iter.next(&mut st.cache, geo)?;
            if !inval.timestamp.is_valid() {
                return Ok(Some(entry.name()));
            }
        }
    }
}

// ── State internals ─────────────────────────────────────────────────────────

struct SeekPos {
    block: BlockIdx,
    block_age: BlockAge,
    sector: u16,
    offset: usize,
    bytes_in_block: u32,
    write_head: u64,
}

impl FsState {
    pub(crate) fn ensure_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(FlogError::NotMounted)
        }
    }

    /// Issue the next allocation timestamp, respecting the deletion
    /// ceiling.
    pub(crate) fn next_timestamp(&mut self) -> Timestamp {
        self.t = Timestamp(self.t.0.max(self.t_ceiling.0) + 1);
        self.t
    }

    pub(crate) fn note_age(&mut self, age: BlockAge) {
        if age.0 > self.max_block_age.0 {
            self.max_block_age = age;
        }
    }

    /// Claim one free block (unerased) through the wear-leveling
    /// allocator.
    pub(crate) fn allocate_block(&mut self, threshold: i32) -> Result<Option<flog_alloc::BlockAlloc>> {
        self.alloc.allocate(&mut self.cache, threshold)
    }

    fn alloc_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    // ── Handle slots ────────────────────────────────────────────────────

    fn take_read(&mut self, id: u32) -> Result<ReadState> {
        self.read_files
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|r| r.id == id))
            .and_then(|idx| self.read_files[idx].take())
            .ok_or(FlogError::ClosedHandle)
    }

    fn put_read(&mut self, r: ReadState) {
        if let Some(slot) = self.read_files.iter_mut().find(|s| s.is_none()) {
            *slot = Some(r);
        } else {
            self.read_files.push(Some(r));
        }
    }

    fn take_write(&mut self, id: u32) -> Result<WriteState> {
        self.write_files
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|w| w.id == id))
            .and_then(|idx| self.write_files[idx].take())
            .ok_or(FlogError::ClosedHandle)
    }

    fn put_write(&mut self, w: WriteState) {
        if let Some(slot) = self.write_files.iter_mut().find(|s| s.is_none()) {
            *slot = Some(w);
        } else {
            self.write_files.push(Some(w));
        }
    }

    fn file_is_open_for_write(&self, file_id: FileId) -> bool {
        self.write_files
            .iter()
            .flatten()
            .any(|w| w.file_id == file_id)
    }

    fn file_is_open(&self, file_id: FileId) -> bool {
        self.file_is_open_for_write(file_id)
            || self
                .read_files
                .iter()
                .flatten()
                .any(|r| r.file_id == file_id)
    }

    // ── Read internals ──────────────────────────────────────────────────

    fn read_inner(&mut self, r: &mut ReadState, out: &mut [u8]) -> Result<usize> {
        let mut done = 0_usize;
        while done < out.len() {
            if r.remaining == 0 && !self.advance_read(r)? {
                break;
            }
            let take = r.remaining.min(out.len() - done);
            self.cache
                .read(r.block.0, r.sector, r.offset, &mut out[done..done + take])?;
            r.offset += take;
            r.remaining -= take;
            r.read_head += take as u64;
            done += take;
        }
        Ok(done)
    }

    /// Move the cursor to the next committed byte. Returns `false` at
    /// (the current) end of data — which can move forward again if a
    /// writer appends.
    fn advance_read(&mut self, r: &mut ReadState) -> Result<bool> {
        let geo = self.geo;
        let mut steps = 0_u32;
        loop {
            steps += 1;
            if steps > u32::from(geo.n_blocks()) * u32::from(geo.sectors_per_block()) {
                return Err(FlogError::Corruption {
                    block: r.block.0,
                    detail: "file chain does not terminate".to_owned(),
                });
            }

            let spare = self.cache.read_spare(r.block.0, r.sector)?;
            if FileSectorSpare::is_erased(&spare) {
                return Ok(false);
            }
            if r.sector == 0 {
                let mut buf = [0_u8; FileInitHeader::SIZE];
                self.cache.read(r.block.0, 0, 0, &mut buf)?;
                let init = FileInitHeader::parse(&buf)?;
                if init.file_id != r.file_id {
                    // The chain's next block was never claimed for this
                    // file: end of data.
                    return Ok(false);
                }
            }
            let nbytes = usize::from(FileSectorSpare::parse(&spare)?.nbytes);
            let consumed = r.offset - file_sector_data_offset(geo, r.sector);
            if consumed < nbytes {
                r.remaining = nbytes - consumed;
                return Ok(true);
            }

            if r.sector == geo.tail_sector() {
                let mut buf = [0_u8; FileTailHeader::SIZE];
                self.cache.read(r.block.0, r.sector, 0, &mut buf)?;
                let tail = FileTailHeader::parse(&buf)?;
                if !tail.timestamp.is_valid() || !tail.next_block.is_valid() {
                    return Ok(false);
                }
                r.block = tail.next_block;
                r.sector = 0;
            } else {
                r.sector += 1;
            }
            r.offset = file_sector_data_offset(geo, r.sector);
        }
    }

    // ── Write internals ─────────────────────────────────────────────────

    fn write_inner(&mut self, w: &mut WriteState, data: &[u8], written: &mut usize) -> Result<()> {
        let sector_size = self.geo.sector_size();
        while *written < data.len() {
            if w.offset == sector_size {
                match self.commit_file_sector(w) {
                    // Media full: report the short count, keep the file
                    // readable up to its last committed sector.
                    Err(FlogError::NoSpace) => return Ok(()),
                    other => other?,
                }
            }
            let take = (sector_size - w.offset).min(data.len() - *written);
            w.buf[w.offset..w.offset + take].copy_from_slice(&data[*written..*written + take]);
            w.offset += take;
            w.write_head += take as u64;
            *written += take;
        }
        Ok(())
    }

    /// Commit the buffered sector.
    ///
    /// For a non-tail sector this stamps the init header when needed,
    /// writes payload + spare, and advances within the block. For the
    /// tail sector it allocates the successor, commits the tail header
    /// (the allocation record), and hands the file over to the new
    /// block, which becomes the dirty slot.
    fn commit_file_sector(&mut self, w: &mut WriteState) -> Result<()> {
        let geo = self.geo;
        if w.sector == geo.tail_sector() {
            self.flush_dirty_block()?;
            let Some(alloc) = self.allocate_block(w.base_threshold)? else {
                return Err(FlogError::NoSpace);
            };
            let nbytes = sector_payload_len(w.offset, FileTailHeader::SIZE, w.block)?;
            let ts = self.next_timestamp();
            let total = w.bytes_in_block + u32::from(nbytes);
            let header = FileTailHeader {
                next_block: alloc.block,
                next_age: alloc.age.next(),
                timestamp: ts,
                bytes_in_block: u16::try_from(total).map_err(|_| FlogError::Corruption {
                    block: w.block.0,
                    detail: "block byte count overflows the tail header".to_owned(),
                })?,
            };
            w.buf[..FileTailHeader::SIZE].copy_from_slice(&header.encode());
            self.cache.write(w.block.0, w.sector, 0, &w.buf[..w.offset])?;
            self.cache
                .write_spare(w.block.0, w.sector, &FileSectorSpare { nbytes }.encode())?;
            self.cache.commit()?;

            self.alloc.set_dirty_block(alloc.block, w.id);
            self.note_age(alloc.age.next());
            tracing::trace!(file_id = %w.file_id, from = %w.block, to = %alloc.block, "tail handoff");

            w.block = alloc.block;
            w.block_age = alloc.age.next();
            w.sector = 0;
            w.offset = FileInitHeader::SIZE;
            w.bytes_in_block = 0;
        } else {
            // First program into a freshly allocated block: the lazy
            // erase happens now.
            let holds_dirty = self
                .alloc
                .dirty_block()
                .is_some_and(|d| d.holder == w.id);
            if holds_dirty {
                self.cache.erase(w.block.0)?;
            }

            let data_off = file_sector_data_offset(geo, w.sector);
            let nbytes = sector_payload_len(w.offset, data_off, w.block)?;
            if w.sector == 0 {
                let header = FileInitHeader {
                    age: w.block_age,
                    file_id: w.file_id,
                };
                w.buf[..FileInitHeader::SIZE].copy_from_slice(&header.encode());
            }
            self.cache.write(w.block.0, w.sector, 0, &w.buf[..w.offset])?;
            self.cache
                .write_spare(w.block.0, w.sector, &FileSectorSpare { nbytes }.encode())?;
            self.cache.commit()?;
            if holds_dirty {
                self.alloc.clear_dirty_block();
            }

            w.bytes_in_block += u32::from(nbytes);
            w.sector += 1;
            w.offset = file_sector_data_offset(geo, w.sector);
        }
        Ok(())
    }

    /// Drain the dirty-block slot by forcing its holder to commit the
    /// slot's first sector, materializing the block on media.
    pub(crate) fn flush_dirty_block(&mut self) -> Result<()> {
        let Some(dirty) = self.alloc.dirty_block() else {
            return Ok(());
        };
        let mut holder = self.take_write(dirty.holder)?;
        debug_assert_eq!(holder.block, dirty.block);
        let result = self.commit_file_sector(&mut holder);
        self.put_write(holder);
        result
    }

    fn flush_write(&mut self, w: &mut WriteState) -> Result<()> {
        loop {
            let data_off = file_sector_data_offset(self.geo, w.sector);
            let holds_dirty = self
                .alloc
                .dirty_block()
                .is_some_and(|d| d.holder == w.id);
            if w.offset > data_off || holds_dirty {
                self.commit_file_sector(w)?;
            } else {
                return Ok(());
            }
        }
    }

    /// Position a write file at its logical end: follow completed
    /// tails, then scan the incomplete block for its first erased
    /// sector.
    fn seek_to_end(&mut self, entry: &InodeAllocEntry) -> Result<SeekPos> {
        let geo = self.geo;
        let mut block = entry.first_block;
        let mut block_age = entry.first_block_age;
        let mut write_head = 0_u64;
        let mut hops = 0_u32;
        loop {
            hops += 1;
            if hops > u32::from(geo.n_blocks()) {
                return Err(FlogError::Corruption {
                    block: block.0,
                    detail: "file chain does not terminate".to_owned(),
                });
            }
            let mut buf = [0_u8; FileTailHeader::SIZE];
            self.cache.read(block.0, geo.tail_sector(), 0, &mut buf)?;
            let tail = FileTailHeader::parse(&buf)?;
            if tail.timestamp.is_valid() && tail.next_block.is_valid() {
                write_head += u64::from(tail.bytes_in_block);
                block = tail.next_block;
                block_age = tail.next_age;
            } else {
                break;
            }
        }

        let mut bytes_in_block = 0_u32;
        let mut writable = None;
        for sector in 0..=geo.tail_sector() {
            let spare = self.cache.read_spare(block.0, sector)?;
            if FileSectorSpare::is_erased(&spare) {
                writable = Some(sector);
                break;
            }
            bytes_in_block += u32::from(FileSectorSpare::parse(&spare)?.nbytes);
        }
        let Some(sector) = writable else {
            return Err(FlogError::Corruption {
                block: block.0,
                detail: "every sector written but the tail link is incomplete".to_owned(),
            });
        };

        Ok(SeekPos {
            block,
            block_age,
            sector,
            offset: file_sector_data_offset(geo, sector),
            bytes_in_block,
            write_head: write_head + u64::from(bytes_in_block),
        })
    }

    /// Last block of a chain: the one whose tail is not yet committed.
    fn find_last_block(&mut self, first: BlockIdx) -> Result<BlockIdx> {
        let geo = self.geo;
        let mut block = first;
        let mut hops = 0_u32;
        loop {
            hops += 1;
            if hops > u32::from(geo.n_blocks()) {
                return Err(FlogError::Corruption {
                    block: block.0,
                    detail: "file chain does not terminate".to_owned(),
                });
            }
            let mut buf = [0_u8; FileTailHeader::SIZE];
            self.cache.read(block.0, geo.tail_sector(), 0, &mut buf)?;
            let tail = FileTailHeader::parse(&buf)?;
            if tail.timestamp.is_valid() && tail.next_block.is_valid() {
                block = tail.next_block;
            } else {
                return Ok(block);
            }
        }
    }

    /// Reclaim a dead chain: erase each block still carrying the dead
    /// `file_id` and restamp its stat record (age + forward link), so
    /// an interrupted run can hop over already-freed blocks when the
    /// mount recovery reruns it.
    ///
    /// Timestamps issued while the walk runs sit under the allocation
    /// ceiling; the ceiling is lifted on every exit path. A block that
    /// reads back uncorrectable is quarantined for the session and the
    /// operation reports failure.
    pub(crate) fn invalidate_chain(&mut self, first: BlockIdx, file_id: FileId) -> Result<()> {
        self.t_ceiling = self.t;
        let result = self.reclaim_chain(first, file_id);
        self.t_ceiling = Timestamp::ZERO;
        if let Err(FlogError::Uncorrectable { block }) = &result {
            tracing::warn!(block = *block, "uncorrectable read during reclaim, quarantining");
            self.session_bad[usize::from(*block)] = true;
        }
        result
    }

    fn reclaim_chain(&mut self, first: BlockIdx, file_id: FileId) -> Result<()> {
        let geo = self.geo;
        let mut block = first;
        let mut freed = 0_u16;
        let mut hops = 0_u32;

        while block.is_valid() {
            hops += 1;
            if hops > u32::from(geo.n_blocks()) * 2 {
                tracing::warn!(block = %block, "chain reclamation cycle detected, stopping");
                break;
            }
            if self.session_bad[usize::from(block.0)] {
                break;
            }

            let spare = self.cache.read_spare(block.0, 0)?;
            match classify_spare(&spare) {
                BlockType::Unallocated => {
                    // Already reclaimed by an interrupted run; its stat
                    // record carries the hop forward.
                    let mut buf = [0_u8; BlockStatRecord::SIZE];
                    self.cache
                        .read(block.0, geo.invalidation_sector(), 0, &mut buf)?;
                    let stat = BlockStatRecord::parse(&buf)?;
                    if stat.has_valid_key() && stat.next_block.is_valid() {
                        block = stat.next_block;
                    } else {
                        break;
                    }
                }
                BlockType::File => {
                    let mut ibuf = [0_u8; FileInitHeader::SIZE];
                    self.cache.read(block.0, 0, 0, &mut ibuf)?;
                    let init = FileInitHeader::parse(&ibuf)?;
                    if init.file_id != file_id {
                        // Another allocation already consumed this
                        // block; the chain is truncated here.
                        break;
                    }
                    let mut tbuf = [0_u8; FileTailHeader::SIZE];
                    self.cache.read(block.0, geo.tail_sector(), 0, &mut tbuf)?;
                    let tail = FileTailHeader::parse(&tbuf)?;
                    let next = if tail.timestamp.is_valid() {
                        tail.next_block
                    } else {
                        BlockIdx::INVALID
                    };

                    self.cache.invalidate();
                    if self.cache.erase(block.0).is_err() {
                        tracing::warn!(block = %block, "erase refused during reclaim, quarantining");
                        self.session_bad[usize::from(block.0)] = true;
                        block = next;
                        continue;
                    }
                    let ts = self.next_timestamp();
                    let stat = BlockStatRecord::new(init.age, next, tail.next_age, ts);
                    self.cache
                        .write(block.0, geo.invalidation_sector(), 0, &stat.encode())?;
                    self.cache.commit()?;
                    self.alloc.mark_free(block, init.age);
                    freed += 1;
                    block = next;
                }
                BlockType::Inode | BlockType::Corrupt => break,
            }
        }

        tracing::debug!(%file_id, freed, "chain reclaimed");
        Ok(())
    }
}

/// Payload length of a buffered sector, checked against the spare's
/// 16-bit byte count.
fn sector_payload_len(offset: usize, data_off: usize, block: BlockIdx) -> Result<u16> {
    u16::try_from(offset - data_off).map_err(|_| FlogError::Corruption {
        block: block.0,
        detail: "sector payload overflows the spare byte count".to_owned(),
    })
}
