#![forbid(unsafe_code)]
//! Soft-updates dependency engine for FFS/UFS.
//!
//! The engine orders metadata writes so that the on-disk image is always
//! usable without a full check: a pointer never reaches the disk before the
//! thing it points to is initialised, and a resource is never released
//! while a durable pointer to it remains. The filesystem reports each
//! metadata change through the `setup_*` calls. The buffer cache reports
//! every write through [`BufferHooks`], which lets the engine put safe
//! bytes in place just before a write and restore the live bytes after it.
//! Work that can only run once something is durable (freeing blocks and
//! inodes, decrementing link counts) is queued on a worklist drained by
//! [`Softdep::process_worklist`].
//!
//! ## Locking
//!
//! One mutex guards the whole [`DepGraph`]. It is never held across a call
//! that can wait for a busy buffer or re-enter the filesystem; such paths
//! drop the lock and revalidate what they saw afterwards. Cache calls that
//! cannot block (release, residency and dirtiness queries, `try_acquire`
//! without waiting) may be made with it held.
//!
//! ## Failure model
//!
//! A broken graph invariant is fatal: the engine logs it once, latches a
//! wedged state and fails every later call with [`FfsError::Invariant`].
//! A failed device write leaves the dependencies of that buffer unresolved
//! and the buffer dirty.

pub mod arena;
pub mod config;
pub mod deps;
pub mod graph;
pub mod hash;
pub mod stats;

mod alloc;
mod debug;
mod dir;
mod free;
mod io;
mod lookup;
mod sync;
mod worklist;

pub use config::SoftdepConfig;
pub use deps::{DepKind, DepState, ListId, WorkRef};
pub use dir::RenameKind;
pub use graph::DepGraph;
pub use stats::SoftdepStats;
pub use worklist::{PassMode, WorkerHandle};

use ffs_block::{Buf, BufferCache, BufferHooks, Vnode};
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, CgHeader, CsSummary, FsGeometry, GroupNumber, InodeNumber, LogicalBlock};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::{Arc, Weak};
use std::thread::Thread;
use tracing::{debug, error, info};

pub(crate) type Guard<'a> = MutexGuard<'a, DepGraph>;

/// Link counts of an in-core inode after an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCounts {
    /// Count that will be written to disk.
    pub nlink: i16,
    /// Count the namespace currently sees.
    pub effnlink: i32,
}

/// Filesystem services the engine calls back into.
///
/// Unless noted otherwise a method is called without the engine lock and
/// may block, perform I/O and call back into the engine.
pub trait FsOps: Send + Sync {
    /// Return a run of `size` bytes at `blkno` to the free map.
    fn free_blocks(&self, ino: InodeNumber, blkno: BlockNumber, size: u32) -> Result<()>;

    /// Return an inode to the free map.
    fn free_inode(&self, ino: InodeNumber, mode: u16) -> Result<()>;

    /// Make inode `ino` resident and pin it until [`FsOps::release`].
    fn vget(&self, ino: InodeNumber) -> Result<()>;

    /// Drop a reference taken by [`FsOps::vget`]; an unlinked inode with no
    /// remaining users is truncated and freed here.
    fn release(&self, ino: InodeNumber) -> Result<()>;

    /// Whether `ino` is locked by a filesystem operation in progress.
    ///
    /// Called with the engine lock held: must not block.
    fn is_inode_locked(&self, ino: InodeNumber) -> bool;

    /// Add `delta` to the on-disk link count of a resident inode.
    ///
    /// Called with the engine lock held: must not block or call the engine.
    fn adjust_link_count(&self, ino: InodeNumber, delta: i16) -> Result<LinkCounts>;

    /// Truncate a resident inode to zero length.
    fn truncate(&self, ino: InodeNumber) -> Result<()>;

    /// Copy the in-core inode to its inode block, writing it when `wait`.
    fn update(&self, ino: InodeNumber, wait: bool) -> Result<()>;

    /// Flush the data and metadata of `ino`.
    fn fsync(&self, ino: InodeNumber, wait: bool) -> Result<()>;

    /// Physical address and size of logical block `lbn` of `ino`.
    fn bmap(&self, ino: InodeNumber, lbn: LogicalBlock) -> Result<Option<(BlockNumber, usize)>>;

    /// Write back every resident inode and file buffer.
    fn flush_files(&self) -> Result<()>;
}

/// Per-mount dependency engine.
pub struct Softdep {
    graph: Mutex<DepGraph>,
    /// Waiters for a creation semaphore.
    sema_cv: Condvar,
    /// Threads throttled by admission control.
    cleanup_cv: Condvar,
    /// Flushes waiting for background passes to finish.
    worklist_cv: Condvar,
    cache: Arc<BufferCache>,
    fs: RwLock<Option<Weak<dyn FsOps>>>,
    geometry: FsGeometry,
    config: SoftdepConfig,
    worker: Mutex<Option<Thread>>,
}

impl std::fmt::Debug for Softdep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Softdep")
            .field("geometry", &self.geometry)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Softdep {
    /// Create the engine and install it as the cache's dependency hooks.
    pub fn new(geometry: FsGeometry, config: SoftdepConfig, cache: Arc<BufferCache>) -> Arc<Self> {
        let engine = Arc::new(Self {
            graph: Mutex::new(DepGraph::new(geometry, config.clone())),
            sema_cv: Condvar::new(),
            cleanup_cv: Condvar::new(),
            worklist_cv: Condvar::new(),
            cache: Arc::clone(&cache),
            fs: RwLock::new(None),
            geometry,
            config,
            worker: Mutex::new(None),
        });
        let hooks: Weak<Self> = Arc::downgrade(&engine);
        cache.set_hooks(hooks);
        debug!(
            target: "ffs::softdep",
            event = "engine_created",
            max_softdeps = engine.config.max_softdeps,
            bsize = geometry.bsize,
            fsize = geometry.fsize
        );
        engine
    }

    /// Attach the filesystem the worklist calls back into.
    pub fn set_fs_ops(&self, fs: Weak<dyn FsOps>) {
        *self.fs.write() = Some(fs);
    }

    pub(crate) fn fs(&self) -> Result<Arc<dyn FsOps>> {
        self.fs
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| FfsError::Format("no filesystem attached to the dependency engine".to_owned()))
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn config(&self) -> &SoftdepConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn stats(&self) -> SoftdepStats {
        self.graph.lock().stats()
    }

    #[must_use]
    pub fn is_wedged(&self) -> bool {
        self.graph.lock().is_wedged()
    }

    /// Inspect the graph under the engine lock.
    pub fn with_graph<R>(&self, f: impl FnOnce(&DepGraph) -> R) -> R {
        f(&self.graph.lock())
    }

    /// Take the engine lock, refusing if the engine is wedged.
    pub(crate) fn lock(&self) -> Result<Guard<'_>> {
        let g = self.graph.lock();
        g.ensure_live()?;
        Ok(g)
    }

    /// Run `f` under the engine lock and latch any invariant it breaks.
    pub(crate) fn run<T>(&self, f: impl FnOnce(&mut Guard<'_>) -> Result<T>) -> Result<T> {
        let mut g = self.lock()?;
        let result = f(&mut g);
        g.wedge_on(result)
    }

    /// Report an I/O error met while processing dependencies.
    pub fn softdep_error(&self, func: &str, err: &FfsError) {
        error!(
            target: "ffs::softdep",
            event = "io_error",
            func,
            errno = err.to_errno(),
            error = %err,
            "error while accessing filesystem"
        );
    }

    /// Prepare a mount. After an unclean shutdown the summary counters can
    /// disagree with the bitmaps, so the per-group counters are re-summed
    /// and returned for the superblock.
    pub fn mount(&self, clean: bool) -> Result<Option<CsSummary>> {
        if clean {
            return Ok(None);
        }
        self.recompute_summary().map(Some)
    }

    /// Re-sum the free counts of every cylinder group.
    pub fn recompute_summary(&self) -> Result<CsSummary> {
        let bsize = self.geometry.bsize as usize;
        let mut total = CsSummary::default();
        for cg in 0..self.geometry.ncg {
            let cgblk = self.geometry.cgtod(GroupNumber(cg));
            let buf = self
                .cache
                .bread(Vnode::Device, LogicalBlock(cgblk.0.cast_signed()), cgblk, bsize)?;
            let header = CgHeader::parse(&buf.data);
            self.cache.brelse(buf);
            let header = header.map_err(|err| FfsError::Corruption {
                block: cgblk.0,
                detail: err.to_string(),
            })?;
            total = total.plus(header.cs);
        }
        info!(
            target: "ffs::softdep",
            event = "summary_recomputed",
            ndir = total.ndir,
            nbfree = total.nbfree,
            nifree = total.nifree,
            nffree = total.nffree
        );
        Ok(total)
    }

    /// Flush everything before unmounting.
    pub fn unmount(&self) -> Result<()> {
        self.flushfiles()?;
        self.cache.clear_hooks();
        Ok(())
    }
}

impl BufferHooks for Softdep {
    fn io_start(&self, buf: &mut Buf) -> Result<()> {
        self.disk_io_initiation(buf)
    }

    fn io_complete(&self, buf: &mut Buf) -> Result<()> {
        self.disk_write_complete(buf)
    }

    fn io_deallocate(&self, buf: &Buf) -> Result<()> {
        self.deallocate_buf(buf)
    }

    fn move_dependencies(&self, from: BlockNumber, to: BlockNumber) -> Result<()> {
        self.run(|g| g.move_dependencies(from, to))
    }

    fn count_dependencies(&self, blkno: BlockNumber, want_count: bool) -> usize {
        let mut g = self.graph.lock();
        let result = g.count_dependencies(blkno, want_count);
        g.wedge_on(result).unwrap_or(0)
    }
}

pub(crate) fn parse_err(err: ffs_types::ParseError) -> FfsError {
    FfsError::Parse(err.to_string())
}
