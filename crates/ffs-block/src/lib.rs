#![forbid(unsafe_code)]
//! Block I/O layer: byte devices and a write-back buffer cache.
//!
//! Buffers are keyed by their physical fragment address. A buffer handed
//! out by [`BufferCache::bread`] or [`BufferCache::getblk`] is *checked out*
//! (busy): no other caller can obtain it until it comes back through
//! [`BufferCache::brelse`], [`BufferCache::bdwrite`], [`BufferCache::bwrite`]
//! or [`BufferCache::invalidate`].
//!
//! Writes pass through the installed [`BufferHooks`]: `io_start` may rewrite
//! the outgoing bytes and `io_complete` runs before the buffer is released,
//! with the buffer still busy. Hooks are always called without the cache
//! lock held, so they may call back into the cache for other blocks.

use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, InodeNumber, LogicalBlock};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: u64, len: usize, dev_len: u64, what: &str) -> Result<Range<usize>> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| FfsError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| FfsError::Format(format!("{what} range overflows u64")))?;
    if end > dev_len {
        return Err(FfsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    let start =
        usize::try_from(offset).map_err(|_| FfsError::Format("offset overflow".to_owned()))?;
    Ok(start..start + len)
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) an image file of `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Everything written is immediately "durable": a crash is simulated by
/// throwing away the cache in front of the device and keeping the bytes.
/// Write failures can be injected per byte range.
#[derive(Debug, Default)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    failing: Mutex<Vec<Range<u64>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            failing: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the current device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Make every write overlapping `range` fail with `EIO`.
    pub fn fail_writes(&self, range: Range<u64>) {
        self.failing.lock().push(range);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let range = checked_range(offset, buf.len(), bytes.len() as u64, "read")?;
        buf.copy_from_slice(&bytes[range]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if self
            .failing
            .lock()
            .iter()
            .any(|r| r.start < end && offset < r.end)
        {
            return Err(FfsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        let mut bytes = self.bytes.lock();
        let range = checked_range(offset, buf.len(), bytes.len() as u64, "write")?;
        bytes[range].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Object a buffer belongs to: the raw device (cylinder groups, inode
/// blocks) or a file (data, directory and indirect blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vnode {
    Device,
    File(InodeNumber),
}

/// A checked-out cache buffer.
#[derive(Debug)]
pub struct Buf {
    blkno: BlockNumber,
    pub vnode: Vnode,
    /// Logical block within `vnode`; equals the fragment address for
    /// device buffers.
    pub lbn: LogicalBlock,
    pub data: Vec<u8>,
    /// Delayed-write pending (`B_DELWRI`).
    pub dirty: bool,
    /// errno of the last failed write, if any.
    pub error: Option<i32>,
}

impl Buf {
    #[must_use]
    pub fn blkno(&self) -> BlockNumber {
        self.blkno
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Mark the buffer dirty without releasing it (`bdirty`).
    pub fn bdirty(&mut self) {
        self.dirty = true;
    }
}

/// Dependency callbacks installed by the soft-updates engine.
pub trait BufferHooks: Send + Sync {
    /// A write is about to start; `buf.data` may be rewritten to the bytes
    /// that are safe to put on disk.
    fn io_start(&self, buf: &mut Buf) -> Result<()>;

    /// A write finished; the buffer is still busy.
    fn io_complete(&self, buf: &mut Buf) -> Result<()>;

    /// The buffer is being discarded.
    fn io_deallocate(&self, buf: &Buf) -> Result<()>;

    /// The contents of `from` now live at `to`.
    fn move_dependencies(&self, from: BlockNumber, to: BlockNumber) -> Result<()>;

    /// Number of rollbacks a write of `blkno` would need (stop at one unless
    /// `want_count`).
    fn count_dependencies(&self, blkno: BlockNumber, want_count: bool) -> usize;
}

/// Outcome of [`BufferCache::try_acquire`].
#[derive(Debug)]
pub enum DirtyBuf {
    /// Acquired and dirty; the caller must write or release it.
    Acquired(Buf),
    /// Clean, absent, or busy and the caller did not want to wait.
    Skip,
    /// Was busy; the caller slept until it was released and should
    /// re-evaluate before retrying.
    Slept,
}

#[derive(Debug)]
struct Entry {
    vnode: Vnode,
    lbn: LogicalBlock,
    dirty: bool,
    /// `None` while checked out.
    buf: Option<Buf>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<BlockNumber, Entry>,
    write_log: Vec<BlockNumber>,
    reads: u64,
    writes: u64,
    write_errors: u64,
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cached: usize,
    pub dirty: usize,
    pub busy: usize,
    pub reads: u64,
    pub writes: u64,
    pub write_errors: u64,
}

/// Write-back buffer cache in front of a [`ByteDevice`].
pub struct BufferCache {
    device: Arc<dyn ByteDevice>,
    fsize: u32,
    state: Mutex<CacheState>,
    released: Condvar,
    hooks: RwLock<Option<Weak<dyn BufferHooks>>>,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("fsize", &self.fsize)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BufferCache {
    /// `fsize` is the addressing unit: buffer `blkno` starts at byte
    /// `blkno * fsize`.
    pub fn new(device: Arc<dyn ByteDevice>, fsize: u32) -> Result<Self> {
        if fsize == 0 || !fsize.is_power_of_two() {
            return Err(FfsError::Format(format!(
                "invalid fragment size {fsize} (must be power of two)"
            )));
        }
        Ok(Self {
            device,
            fsize,
            state: Mutex::new(CacheState::default()),
            released: Condvar::new(),
            hooks: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.device
    }

    pub fn set_hooks(&self, hooks: Weak<dyn BufferHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    pub fn clear_hooks(&self) {
        *self.hooks.write() = None;
    }

    fn hooks(&self) -> Option<Arc<dyn BufferHooks>> {
        self.hooks.read().as_ref().and_then(Weak::upgrade)
    }

    fn offset(&self, blkno: BlockNumber) -> u64 {
        blkno.0 * u64::from(self.fsize)
    }

    /// Check out `blkno`, waiting while another holder has it. `None` means
    /// the block is not cached; a busy placeholder is inserted for it.
    fn checkout(&self, blkno: BlockNumber, vnode: Vnode, lbn: LogicalBlock) -> Option<Buf> {
        let mut state = self.state.lock();
        loop {
            match state.entries.get_mut(&blkno) {
                Some(entry) => {
                    if let Some(mut buf) = entry.buf.take() {
                        entry.vnode = vnode;
                        entry.lbn = lbn;
                        buf.vnode = vnode;
                        buf.lbn = lbn;
                        return Some(buf);
                    }
                }
                None => {
                    state.entries.insert(
                        blkno,
                        Entry {
                            vnode,
                            lbn,
                            dirty: false,
                            buf: None,
                        },
                    );
                    return None;
                }
            }
            self.released.wait(&mut state);
        }
    }

    fn resize(buf: &mut Buf, size: usize) {
        if buf.data.len() != size {
            buf.data.resize(size, 0);
        }
    }

    /// Read `size` bytes at `blkno` through the cache (`bread`).
    pub fn bread(&self, vnode: Vnode, lbn: LogicalBlock, blkno: BlockNumber, size: usize) -> Result<Buf> {
        if let Some(mut buf) = self.checkout(blkno, vnode, lbn) {
            Self::resize(&mut buf, size);
            return Ok(buf);
        }
        let mut data = vec![0_u8; size];
        if let Err(err) = self.device.read_exact_at(self.offset(blkno), &mut data) {
            let mut state = self.state.lock();
            state.entries.remove(&blkno);
            drop(state);
            self.released.notify_all();
            return Err(err);
        }
        self.state.lock().reads += 1;
        trace!(target: "ffs::block", event = "bread", blkno = blkno.0, size);
        Ok(Buf {
            blkno,
            vnode,
            lbn,
            data,
            dirty: false,
            error: None,
        })
    }

    /// Check out a buffer for `blkno` without reading the device; an
    /// uncached block comes back zero-filled (`getblk`).
    pub fn getblk(&self, vnode: Vnode, lbn: LogicalBlock, blkno: BlockNumber, size: usize) -> Buf {
        match self.checkout(blkno, vnode, lbn) {
            Some(mut buf) => {
                Self::resize(&mut buf, size);
                buf
            }
            None => Buf {
                blkno,
                vnode,
                lbn,
                data: vec![0_u8; size],
                dirty: false,
                error: None,
            },
        }
    }

    fn release(&self, buf: Buf) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&buf.blkno) {
            entry.vnode = buf.vnode;
            entry.lbn = buf.lbn;
            entry.dirty = buf.dirty;
            entry.buf = Some(buf);
        }
        drop(state);
        self.released.notify_all();
    }

    /// Release without changing the dirty state (`brelse`).
    pub fn brelse(&self, buf: Buf) {
        self.release(buf);
    }

    /// Mark dirty and release (`bdwrite`).
    pub fn bdwrite(&self, mut buf: Buf) {
        buf.dirty = true;
        self.release(buf);
    }

    /// Write the buffer now and release it (`bwrite`).
    ///
    /// On a device error the buffer stays dirty with `error` set and the
    /// error is returned; dependencies on it stay unresolved.
    pub fn bwrite(&self, mut buf: Buf) -> Result<()> {
        let hooks = self.hooks();
        if let Some(hooks) = &hooks {
            if let Err(err) = hooks.io_start(&mut buf) {
                self.release(buf);
                return Err(err);
            }
        }
        let offset = self.offset(buf.blkno);
        if let Err(err) = self.device.write_all_at(offset, &buf.data) {
            error!(target: "ffs::block", event = "write_error", blkno = buf.blkno.0, error = %err);
            buf.error = Some(err.to_errno());
            buf.dirty = true;
            self.state.lock().write_errors += 1;
            // The hook put rollback bytes in place; let it restore them.
            let complete = hooks.as_ref().map_or(Ok(()), |h| h.io_complete(&mut buf));
            buf.dirty = true;
            self.release(buf);
            complete?;
            return Err(err);
        }
        buf.dirty = false;
        buf.error = None;
        {
            let mut state = self.state.lock();
            state.writes += 1;
            state.write_log.push(buf.blkno);
        }
        trace!(target: "ffs::block", event = "bwrite", blkno = buf.blkno.0, size = buf.data.len());
        let complete = hooks.as_ref().map_or(Ok(()), |h| h.io_complete(&mut buf));
        self.release(buf);
        complete
    }

    /// Asynchronous write; completion is delivered before returning.
    pub fn bawrite(&self, buf: Buf) -> Result<()> {
        self.bwrite(buf)
    }

    /// Discard the buffer and its cache entry.
    pub fn invalidate(&self, buf: Buf) -> Result<()> {
        let result = self.hooks().map_or(Ok(()), |h| h.io_deallocate(&buf));
        let mut state = self.state.lock();
        state.entries.remove(&buf.blkno);
        drop(state);
        self.released.notify_all();
        trace!(target: "ffs::block", event = "invalidate", blkno = buf.blkno.0);
        result
    }

    /// Check out a dirty buffer for writing. Clean or absent buffers are
    /// skipped; a busy one is waited for when `wait` is set.
    pub fn try_acquire(&self, blkno: BlockNumber, wait: bool) -> DirtyBuf {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&blkno) else {
            return DirtyBuf::Skip;
        };
        match entry.buf.take() {
            Some(buf) if buf.dirty => DirtyBuf::Acquired(buf),
            Some(buf) => {
                entry.buf = Some(buf);
                DirtyBuf::Skip
            }
            None if !wait => DirtyBuf::Skip,
            None => {
                while state
                    .entries
                    .get(&blkno)
                    .is_some_and(|e| e.buf.is_none())
                {
                    self.released.wait(&mut state);
                }
                DirtyBuf::Slept
            }
        }
    }

    /// Check out `blkno` if it is cached, clean or dirty, waiting while it
    /// is busy. Nothing is read from the device.
    pub fn acquire_cached(&self, blkno: BlockNumber) -> Option<Buf> {
        let mut state = self.state.lock();
        loop {
            let entry = state.entries.get_mut(&blkno)?;
            if let Some(buf) = entry.buf.take() {
                return Some(buf);
            }
            self.released.wait(&mut state);
        }
    }

    /// Block until `blkno` is not checked out.
    pub fn wait_unbusy(&self, blkno: BlockNumber) {
        let mut state = self.state.lock();
        while state
            .entries
            .get(&blkno)
            .is_some_and(|e| e.buf.is_none())
        {
            self.released.wait(&mut state);
        }
    }

    /// Wait until no buffer of `vnode` is checked out (`drain_output`).
    pub fn drain(&self, vnode: Vnode) {
        let mut state = self.state.lock();
        while state
            .entries
            .values()
            .any(|e| e.vnode == vnode && e.buf.is_none())
        {
            self.released.wait(&mut state);
        }
    }

    /// Dirty buffers of `vnode`, busy ones included, in address order.
    #[must_use]
    pub fn dirty_blocks(&self, vnode: Vnode) -> Vec<BlockNumber> {
        let state = self.state.lock();
        let mut blocks: Vec<BlockNumber> = state
            .entries
            .iter()
            .filter(|(_, e)| e.vnode == vnode && e.dirty)
            .map(|(b, _)| *b)
            .collect();
        drop(state);
        blocks.sort_unstable();
        blocks
    }

    /// All buffers of `vnode` in address order.
    #[must_use]
    pub fn vnode_blocks(&self, vnode: Vnode) -> Vec<BlockNumber> {
        let state = self.state.lock();
        let mut blocks: Vec<BlockNumber> = state
            .entries
            .iter()
            .filter(|(_, e)| e.vnode == vnode)
            .map(|(b, _)| *b)
            .collect();
        drop(state);
        blocks.sort_unstable();
        blocks
    }

    #[must_use]
    pub fn incore(&self, blkno: BlockNumber) -> bool {
        self.state.lock().entries.contains_key(&blkno)
    }

    #[must_use]
    pub fn is_dirty(&self, blkno: BlockNumber) -> bool {
        self.state
            .lock()
            .entries
            .get(&blkno)
            .is_some_and(|e| e.dirty)
    }

    /// Move the cached contents of `from` to address `to` and let the hooks
    /// move the dependencies along.
    pub fn relocate(&self, from: BlockNumber, to: BlockNumber) -> Result<()> {
        {
            let mut state = self.state.lock();
            loop {
                match state.entries.get(&from) {
                    None => return Ok(()),
                    Some(e) if e.buf.is_some() => break,
                    Some(_) => self.released.wait(&mut state),
                }
            }
            if state.entries.contains_key(&to) {
                return Err(FfsError::Format(format!(
                    "relocate target {to} is already cached"
                )));
            }
            if let Some(mut entry) = state.entries.remove(&from) {
                if let Some(buf) = entry.buf.as_mut() {
                    buf.blkno = to;
                }
                state.entries.insert(to, entry);
            }
        }
        debug!(target: "ffs::block", event = "relocate", from = from.0, to = to.0);
        self.hooks().map_or(Ok(()), |h| h.move_dependencies(from, to))
    }

    /// Ask the hooks how many rollbacks a write of `blkno` would need.
    #[must_use]
    pub fn count_dependencies(&self, blkno: BlockNumber, want_count: bool) -> usize {
        self.hooks()
            .map_or(0, |h| h.count_dependencies(blkno, want_count))
    }

    /// Write every dirty buffer until none is left, for at most `max_passes`
    /// passes (completions may redirty buffers). Returns the number of
    /// writes issued.
    pub fn flush_all(&self, max_passes: usize) -> Result<usize> {
        let mut written = 0;
        for _ in 0..max_passes {
            let dirty: Vec<BlockNumber> = {
                let state = self.state.lock();
                let mut v: Vec<BlockNumber> = state
                    .entries
                    .iter()
                    .filter(|(_, e)| e.dirty)
                    .map(|(b, _)| *b)
                    .collect();
                v.sort_unstable();
                v
            };
            if dirty.is_empty() {
                break;
            }
            for blkno in dirty {
                if let DirtyBuf::Acquired(buf) = self.try_acquire(blkno, true) {
                    self.bwrite(buf)?;
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    /// Drop every cached buffer without writing, as a power failure would.
    /// Buffers still checked out are forgotten when they come back.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        let lost = state.entries.values().filter(|e| e.dirty).count();
        state.entries.clear();
        state.write_log.clear();
        drop(state);
        self.released.notify_all();
        debug!(target: "ffs::block", event = "crash", lost_dirty = lost);
    }

    /// Blocks written since the last call, in write order.
    pub fn take_write_log(&self) -> Vec<BlockNumber> {
        std::mem::take(&mut self.state.lock().write_log)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            cached: state.entries.len(),
            dirty: state.entries.values().filter(|e| e.dirty).count(),
            busy: state.entries.values().filter(|e| e.buf.is_none()).count(),
            reads: state.reads,
            writes: state.writes,
            write_errors: state.write_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(len: usize) -> (Arc<MemoryByteDevice>, BufferCache) {
        let dev = Arc::new(MemoryByteDevice::new(len));
        let cache = BufferCache::new(dev.clone(), 1024).expect("cache");
        (dev, cache)
    }

    #[test]
    fn memory_device_round_trips_and_rejects_oob() {
        let dev = MemoryByteDevice::new(4096);
        dev.write_all_at(1024, &[7_u8; 16]).expect("write");
        let mut out = [0_u8; 16];
        dev.read_exact_at(1024, &mut out).expect("read");
        assert_eq!(out, [7_u8; 16]);
        assert!(dev.write_all_at(4090, &[0_u8; 16]).is_err());
    }

    #[test]
    fn delayed_write_reaches_device_only_on_flush() {
        let (dev, cache) = cache(16 * 1024);
        let mut buf = cache.getblk(Vnode::Device, LogicalBlock(4), BlockNumber(4), 2048);
        buf.data.fill(0xAB);
        cache.bdwrite(buf);
        assert!(cache.is_dirty(BlockNumber(4)));
        assert_eq!(dev.snapshot()[4096], 0);

        assert_eq!(cache.flush_all(4).expect("flush"), 1);
        assert_eq!(dev.snapshot()[4096], 0xAB);
        assert_eq!(dev.snapshot()[4096 + 2047], 0xAB);
        assert!(!cache.is_dirty(BlockNumber(4)));
        assert_eq!(cache.take_write_log(), vec![BlockNumber(4)]);
    }

    #[test]
    fn crash_discards_unwritten_data() {
        let (dev, cache) = cache(8 * 1024);
        let mut buf = cache.getblk(Vnode::File(InodeNumber(3)), LogicalBlock(0), BlockNumber(2), 1024);
        buf.data.fill(1);
        cache.bdwrite(buf);
        cache.crash();
        assert!(!cache.incore(BlockNumber(2)));
        let buf = cache
            .bread(Vnode::Device, LogicalBlock(2), BlockNumber(2), 1024)
            .expect("bread");
        assert!(buf.data.iter().all(|b| *b == 0));
        cache.brelse(buf);
        assert!(dev.snapshot().iter().all(|b| *b == 0));
    }

    #[test]
    fn try_acquire_skips_clean_and_busy() {
        let (_dev, cache) = cache(8 * 1024);
        let buf = cache.getblk(Vnode::Device, LogicalBlock(1), BlockNumber(1), 1024);
        cache.brelse(buf);
        assert!(matches!(cache.try_acquire(BlockNumber(1), true), DirtyBuf::Skip));
        assert!(matches!(cache.try_acquire(BlockNumber(5), true), DirtyBuf::Skip));

        let held = cache.getblk(Vnode::Device, LogicalBlock(1), BlockNumber(1), 1024);
        assert!(matches!(cache.try_acquire(BlockNumber(1), false), DirtyBuf::Skip));
        assert_eq!(cache.stats().busy, 1);
        cache.bdwrite(held);
        match cache.try_acquire(BlockNumber(1), false) {
            DirtyBuf::Acquired(buf) => cache.bawrite(buf).expect("write"),
            other => panic!("expected acquired, got {other:?}"),
        }
    }

    #[test]
    fn acquire_cached_never_reads() {
        let (_dev, cache) = cache(8 * 1024);
        assert!(cache.acquire_cached(BlockNumber(2)).is_none());
        assert_eq!(cache.stats().cached, 0);
        let buf = cache.getblk(Vnode::File(InodeNumber(4)), LogicalBlock(0), BlockNumber(2), 1024);
        cache.brelse(buf);
        let buf = cache.acquire_cached(BlockNumber(2)).expect("clean buffer");
        assert_eq!(buf.vnode, Vnode::File(InodeNumber(4)));
        cache.invalidate(buf).expect("invalidate");
        assert!(!cache.incore(BlockNumber(2)));
    }

    #[test]
    fn write_error_keeps_buffer_dirty() {
        let (dev, cache) = cache(8 * 1024);
        dev.fail_writes(3072..4096);
        let mut buf = cache.getblk(Vnode::Device, LogicalBlock(3), BlockNumber(3), 1024);
        buf.data.fill(9);
        let err = cache.bwrite(buf).expect_err("injected failure");
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(cache.is_dirty(BlockNumber(3)));
        assert_eq!(cache.stats().write_errors, 1);
        dev.clear_failures();
        assert_eq!(cache.flush_all(2).expect("retry"), 1);
    }

    struct CountingHooks {
        starts: AtomicUsize,
        completes: AtomicUsize,
        moves: Mutex<Vec<(BlockNumber, BlockNumber)>>,
    }

    impl BufferHooks for CountingHooks {
        fn io_start(&self, buf: &mut Buf) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            buf.data[0] = 0xEE;
            Ok(())
        }

        fn io_complete(&self, buf: &mut Buf) -> Result<()> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            buf.data[0] = 0x11;
            Ok(())
        }

        fn io_deallocate(&self, _buf: &Buf) -> Result<()> {
            Ok(())
        }

        fn move_dependencies(&self, from: BlockNumber, to: BlockNumber) -> Result<()> {
            self.moves.lock().push((from, to));
            Ok(())
        }

        fn count_dependencies(&self, _blkno: BlockNumber, _want_count: bool) -> usize {
            3
        }
    }

    #[test]
    fn hooks_see_outgoing_bytes_and_relocations() {
        let (dev, cache) = cache(8 * 1024);
        let hooks = Arc::new(CountingHooks {
            starts: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            moves: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn BufferHooks> = Arc::downgrade(&hooks) as Weak<dyn BufferHooks>;
        cache.set_hooks(weak);

        let buf = cache.getblk(Vnode::Device, LogicalBlock(1), BlockNumber(1), 1024);
        cache.bwrite(buf).expect("write");
        assert_eq!(dev.snapshot()[1024], 0xEE, "io_start bytes hit the disk");
        let buf = cache
            .bread(Vnode::Device, LogicalBlock(1), BlockNumber(1), 1024)
            .expect("cached");
        assert_eq!(buf.data[0], 0x11, "io_complete restored the in-core copy");
        cache.brelse(buf);

        cache.relocate(BlockNumber(1), BlockNumber(6)).expect("relocate");
        assert!(cache.incore(BlockNumber(6)));
        assert!(!cache.incore(BlockNumber(1)));
        assert_eq!(hooks.moves.lock().as_slice(), &[(BlockNumber(1), BlockNumber(6))]);
        assert_eq!(cache.count_dependencies(BlockNumber(6), true), 3);
        assert_eq!(hooks.starts.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.completes.load(Ordering::SeqCst), 1);

        cache.clear_hooks();
        assert_eq!(cache.count_dependencies(BlockNumber(6), true), 0);
    }

    #[test]
    fn checkout_blocks_until_release() {
        let (_dev, cache) = cache(8 * 1024);
        let cache = Arc::new(cache);
        let held = cache.getblk(Vnode::Device, LogicalBlock(2), BlockNumber(2), 1024);
        let worker = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let buf = cache
                    .bread(Vnode::Device, LogicalBlock(2), BlockNumber(2), 1024)
                    .expect("bread");
                let seen = buf.data[0];
                cache.brelse(buf);
                seen
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut held = held;
        held.data[0] = 42;
        cache.bdwrite(held);
        assert_eq!(worker.join().expect("join"), 42);
        cache.drain(Vnode::Device);
        assert_eq!(cache.stats().busy, 0);
    }
}
