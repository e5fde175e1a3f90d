#![forbid(unsafe_code)]
//! Synchronous flushing.
//!
//! `fsync` of a file must leave nothing on disk that still depends on an
//! unwritten buffer. Before writing a file's blocks the engine pushes out
//! whatever those blocks wait on (bitmaps, inode blocks, the inodes named
//! by new directory entries) and afterwards writes the directory pages
//! that name the file.

use crate::arena::Idx;
use crate::deps::{BmSafeMap, DepState, PageDep, WorkRef};
use crate::graph::{DepGraph, fatal};
use crate::{FsOps, Guard, Softdep};
use ffs_block::{DirtyBuf, Vnode};
use ffs_error::Result;
use ffs_types::{BlockNumber, InodeNumber, LogicalBlock};
use parking_lot::MutexGuard;
use tracing::{debug, trace};

/// Result of trying to push one buffer to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Written,
    /// Clean, absent or busy.
    Skipped,
    /// Slept waiting for the buffer; what was seen may be stale.
    Retry,
}

impl DepGraph {
    fn bitmap_buf(&self, map: Option<Idx<BmSafeMap>>) -> Result<Option<BlockNumber>> {
        map.map(|sm| self.get(sm).map(|m| m.buf)).transpose()
    }

    fn first_diradd(&self, pd: Idx<PageDep>, bucket: usize) -> Result<Option<Idx<crate::deps::DirAdd>>> {
        Ok(self.get(pd)?.diraddhd[bucket].first().copied())
    }
}

impl Softdep {
    /// Write `blkno` if it is dirty. With `wait` a busy buffer is waited
    /// for and a write error is returned; otherwise the error is logged.
    fn push_block(&self, g: &mut Guard<'_>, blkno: BlockNumber, wait: bool) -> Result<Push> {
        match self.getdirtybuf(g, blkno, wait) {
            DirtyBuf::Skip => Ok(Push::Skipped),
            DirtyBuf::Slept => Ok(Push::Retry),
            DirtyBuf::Acquired(bp) => {
                let written = MutexGuard::unlocked(g, || self.cache.bwrite(bp));
                match written {
                    Ok(()) => {}
                    Err(err) if wait => return Err(err),
                    Err(err) => {
                        self.softdep_error("push_block", &err);
                        return Ok(Push::Skipped);
                    }
                }
                Ok(Push::Written)
            }
        }
    }

    /// Make sure every directory entry naming `ino` reaches the disk after
    /// the inode itself. Called once the inode has been written.
    pub fn fsync(&self, ino: InodeNumber) -> Result<()> {
        let fs = self.fs()?;
        let mut g = self.lock()?;
        loop {
            let Some(id) = g.find_inodedep(ino) else {
                return Ok(());
            };
            let dep = g.get(id)?;
            if !dep.inowait.is_empty()
                || !dep.bufwait.is_empty()
                || !dep.inoupdt.is_empty()
                || !dep.newinoupdt.is_empty()
            {
                return g.wedge_on(Err(fatal(format_args!("softdep_fsync: pending ops on {ino}"))));
            }
            let Some(&wk) = dep.pendinghd.first() else {
                return Ok(());
            };
            let WorkRef::DirAdd(dap) = wk else {
                return g.wedge_on(Err(fatal(format_args!("softdep_fsync: unexpected type {}", wk.kind()))));
            };
            let (state, page, previous) = {
                let add = g.get(dap)?;
                (add.hdr.state, add.pagedep, add.previous)
            };
            let pagedep = if state.contains(DepState::DIRCHG) {
                let rem = previous.ok_or_else(|| fatal("softdep_fsync: changed entry without removal"));
                let rem = g.wedge_on(rem)?;
                let pd = g.get(rem)?.pagedep.ok_or_else(|| fatal("softdep_fsync: removal without page"));
                g.wedge_on(pd)?
            } else {
                page
            };
            if state & (DepState::MKDIR_BODY | DepState::COMPLETE) != DepState::COMPLETE {
                return g.wedge_on(Err(fatal(format_args!("softdep_fsync: dirty entry for {ino}"))));
            }
            let (parentino, lbn, newblock) = {
                let page = g.get(pagedep)?;
                (page.ino, page.lbn, page.hdr.state.contains(DepState::NEWBLOCK))
            };
            let flushparent = state.contains(DepState::MKDIR_PARENT) || newblock;
            trace!(target: "ffs::softdep", event = "fsync_parent", ino = ino.0, parent = parentino.0, lbn = lbn.0, flushparent);

            let flushed = MutexGuard::unlocked(&mut g, || -> Result<bool> {
                fs.vget(parentino)?;
                let result = (|| -> Result<bool> {
                    if flushparent {
                        fs.update(parentino, true)?;
                        if newblock {
                            fs.fsync(parentino, true)?;
                        }
                    }
                    let Some((blkno, size)) = fs.bmap(parentino, lbn)? else {
                        return Ok(false);
                    };
                    let bp = self.cache.bread(Vnode::File(parentino), lbn, blkno, size)?;
                    self.cache.bwrite(bp)?;
                    Ok(true)
                })();
                let released = fs.release(parentino);
                let flushed = result?;
                released?;
                Ok(flushed)
            })?;
            g.ensure_live()?;
            if !flushed {
                return Ok(());
            }
        }
    }

    /// Write the bitmaps that carry dependencies ahead of the rest of the
    /// device, so fewer rollbacks are needed for everything else.
    pub fn fsync_mountdev(&self, wait: bool) -> Result<()> {
        for blkno in self.cache.dirty_blocks(Vnode::Device) {
            let g = self.lock()?;
            if !matches!(g.buf_deps(blkno).first(), Some(WorkRef::BmSafeMap(_))) {
                continue;
            }
            let DirtyBuf::Acquired(bp) = self.cache.try_acquire(blkno, false) else {
                continue;
            };
            drop(g);
            if let Err(err) = self.cache.bawrite(bp) {
                self.softdep_error("fsync_mountdev", &err);
            }
        }
        if wait {
            self.cache.drain(Vnode::Device);
        }
        Ok(())
    }

    /// Flush the whole device: bitmaps first, then every dirty buffer, then
    /// whatever the remaining dependencies still hold back.
    pub(crate) fn flush_device(&self) -> Result<()> {
        self.fsync_mountdev(true)?;
        for blkno in self.cache.dirty_blocks(Vnode::Device) {
            if let DirtyBuf::Acquired(bp) = self.cache.try_acquire(blkno, true) {
                self.cache.bwrite(bp)?;
            }
        }
        self.sync_metadata(Vnode::Device)
    }

    /// Resolve every metadata dependency of the dirty buffers of `vnode`
    /// and write them. The first pass starts writes without waiting for
    /// busy buffers; the second waits and reports write errors.
    pub fn sync_metadata(&self, vnode: Vnode) -> Result<()> {
        if let Vnode::File(ino) = vnode {
            let mut g = self.lock()?;
            let flushed = self.flush_inodedep_deps(&mut g, ino);
            g.wedge_on(flushed)?;
        }
        for wait in [false, true] {
            self.cache.drain(vnode);
            for blkno in self.cache.dirty_blocks(vnode) {
                let mut g = self.lock()?;
                let bp = loop {
                    match self.getdirtybuf(&mut g, blkno, true) {
                        DirtyBuf::Slept => {}
                        DirtyBuf::Skip => break None,
                        DirtyBuf::Acquired(bp) => break Some(bp),
                    }
                };
                let Some(bp) = bp else {
                    continue;
                };
                let pushed = self.flush_buffer_deps(&mut g, blkno, wait);
                let pushed = g.wedge_on(pushed);
                drop(g);
                let written = self.cache.bawrite(bp);
                pushed?;
                if let Err(err) = written {
                    self.softdep_error("sync_metadata", &err);
                }
            }
        }
        self.cache.drain(vnode);
        debug!(target: "ffs::softdep", event = "sync_metadata", ?vnode, remaining = self.cache.dirty_blocks(vnode).len());
        Ok(())
    }

    /// Push out what the dependencies of the (checked-out) buffer at
    /// `blkno` wait on.
    fn flush_buffer_deps(&self, g: &mut Guard<'_>, blkno: BlockNumber, wait: bool) -> Result<()> {
        'scan: loop {
            for item in g.buf_deps(blkno).to_vec() {
                let target = match item {
                    WorkRef::AllocDirect(adp) => {
                        let a = g.get(adp)?;
                        if a.hdr.state.contains(DepState::DEPCOMPLETE) {
                            None
                        } else {
                            g.bitmap_buf(a.bmsafemap)?
                        }
                    }
                    WorkRef::AllocIndir(aip) => {
                        let a = g.get(aip)?;
                        if a.hdr.state.contains(DepState::DEPCOMPLETE) {
                            None
                        } else {
                            g.bitmap_buf(a.bmsafemap)?
                        }
                    }
                    WorkRef::IndirDep(ir) => {
                        self.flush_indirdep_bitmaps(g, ir)?;
                        None
                    }
                    WorkRef::InodeDep(id) => {
                        let ino = g.get(id)?.ino;
                        self.flush_inodedep_deps(g, ino)?;
                        None
                    }
                    WorkRef::PageDep(pd) => {
                        for bucket in 0..crate::deps::DAHASHSZ {
                            if g.get(pd).is_ok_and(|p| !p.diraddhd[bucket].is_empty()) {
                                self.flush_pagedep_deps(g, pd, bucket)?;
                            }
                        }
                        None
                    }
                    WorkRef::Mkdir(md) => Some(g.get(md)?.buf).filter(|b| *b != blkno),
                    WorkRef::BmSafeMap(sm) => Some(g.get(sm)?.buf).filter(|b| *b != blkno),
                    WorkRef::NewBlk(_)
                    | WorkRef::FreeFrag(_)
                    | WorkRef::FreeBlks(_)
                    | WorkRef::FreeFile(_)
                    | WorkRef::DirAdd(_)
                    | WorkRef::DirRem(_)
                    | WorkRef::NewDirBlk(_) => {
                        return Err(fatal(format_args!("sync_metadata: unknown type {}", item.kind())));
                    }
                };
                if let Some(nbp) = target {
                    if self.push_block(g, nbp, wait)? == Push::Retry {
                        continue 'scan;
                    }
                }
            }
            return Ok(());
        }
    }

    /// Write the bitmaps of every pointer in an indirect block whose
    /// allocation is not yet durable.
    fn flush_indirdep_bitmaps(&self, g: &mut Guard<'_>, ir: Idx<crate::deps::IndirDep>) -> Result<()> {
        loop {
            let Ok(dep) = g.get(ir) else {
                return Ok(());
            };
            let mut pending = None;
            for &aip in &dep.deplisthd {
                let a = g.get(aip)?;
                if !a.hdr.state.contains(DepState::DEPCOMPLETE) {
                    pending = g.bitmap_buf(a.bmsafemap)?;
                    if pending.is_some() {
                        break;
                    }
                }
            }
            let Some(nbp) = pending else {
                return Ok(());
            };
            if self.push_block(g, nbp, true)? == Push::Skipped {
                return Ok(());
            }
        }
    }

    /// Write the bitmaps the block pointers of `ino` still wait on, in two
    /// passes like [`Softdep::sync_metadata`], then drop the inodedep if
    /// nothing remains on it.
    pub(crate) fn flush_inodedep_deps(&self, g: &mut Guard<'_>, ino: InodeNumber) -> Result<()> {
        for wait in [false, true] {
            'retry: loop {
                MutexGuard::bump(g);
                let Some(id) = g.find_inodedep(ino) else {
                    return Ok(());
                };
                let dep = g.get(id)?;
                let mut candidates = Vec::new();
                for &adp in dep.inoupdt.iter().chain(&dep.newinoupdt) {
                    let a = g.get(adp)?;
                    if !a.hdr.state.contains(DepState::DEPCOMPLETE) {
                        if let Some(nbp) = g.bitmap_buf(a.bmsafemap)? {
                            candidates.push(nbp);
                        }
                    }
                }
                for nbp in candidates {
                    match self.push_block(g, nbp, wait)? {
                        Push::Skipped => {}
                        Push::Retry | Push::Written => continue 'retry,
                    }
                }
                break;
            }
        }
        if let Some(id) = g.find_inodedep(ino) {
            g.free_inodedep(id)?;
        }
        Ok(())
    }

    /// Commit the additions of one bucket of a directory page: push each
    /// added inode (and for a new directory, its parent link and first
    /// block) so that the entries can go to disk.
    fn flush_pagedep_deps(&self, g: &mut Guard<'_>, pd: Idx<PageDep>, bucket: usize) -> Result<()> {
        let fs = self.fs()?;
        let pdino = g.get(pd)?.ino;
        let bsize = self.geometry.bsize as usize;
        'next: loop {
            let Some(dap) = g.first_diradd(pd, bucket)? else {
                return Ok(());
            };
            if g.state(dap)?.contains(DepState::MKDIR_PARENT) {
                MutexGuard::unlocked(g, || fs.update(pdino, true))?;
                if g.first_diradd(pd, bucket)? != Some(dap) {
                    continue 'next;
                }
                if g.state(dap)?.contains(DepState::MKDIR_PARENT) {
                    return Err(fatal("flush_pagedep_deps: MKDIR_PARENT"));
                }
            }

            let inum = g.get(dap)?.newinum;
            if g.state(dap)?.contains(DepState::MKDIR_BODY) {
                MutexGuard::unlocked(g, || -> Result<()> {
                    fs.vget(inum)?;
                    let result = fs
                        .fsync(inum, false)
                        .and_then(|()| fs.fsync(inum, false))
                        .and_then(|()| {
                            self.drain_output(inum);
                            self.write_mkdir_block(fs.as_ref(), inum)
                        });
                    let released = fs.release(inum);
                    result?;
                    released
                })?;
                if g.first_diradd(pd, bucket)? != Some(dap) {
                    continue 'next;
                }
                if g.state(dap)?.contains(DepState::MKDIR_BODY) {
                    return Err(fatal("flush_pagedep_deps: MKDIR_BODY"));
                }
            }

            // The inode was copied into its buffer when its link count
            // changed; the buffer only has to reach the disk without a
            // bitmap rollback.
            let Some(id) = g.find_inodedep(inum) else {
                return Err(fatal(format_args!("flush_pagedep_deps: lost inode {inum}")));
            };
            loop {
                if g.state(id)?.contains(DepState::DEPCOMPLETE) {
                    break;
                }
                let Some(cgblk) = g.bitmap_buf(g.get(id)?.bmsafemap)? else {
                    break;
                };
                match self.push_block(g, cgblk, true)? {
                    Push::Retry => {}
                    Push::Written | Push::Skipped => break,
                }
            }
            if g.first_diradd(pd, bucket)? != Some(dap) {
                continue 'next;
            }
            let inoblk = self.geometry.ino_to_fsba(inum);
            MutexGuard::unlocked(g, || -> Result<()> {
                let bp = self
                    .cache
                    .bread(Vnode::Device, LogicalBlock(inoblk.0.cast_signed()), inoblk, bsize)?;
                self.cache.bwrite(bp)
            })?;
            if g.first_diradd(pd, bucket)? == Some(dap) {
                return Err(fatal(format_args!("flush_pagedep_deps: flush failed for {inum}")));
            }
        }
    }

    /// Write the first block of a new directory if its `.`/`..` ordering
    /// still waits on it. Called without the engine lock.
    fn write_mkdir_block(&self, fs: &dyn FsOps, ino: InodeNumber) -> Result<()> {
        loop {
            let Some((blkno, _)) = fs.bmap(ino, LogicalBlock(0))? else {
                return Ok(());
            };
            let mut g = self.lock()?;
            if !g.buf_deps(blkno).iter().any(|wk| matches!(wk, WorkRef::Mkdir(_))) {
                return Ok(());
            }
            match self.getdirtybuf(&mut g, blkno, true) {
                DirtyBuf::Slept => {}
                DirtyBuf::Skip => return Ok(()),
                DirtyBuf::Acquired(bp) => {
                    drop(g);
                    return self.cache.bwrite(bp);
                }
            }
        }
    }

    /// Wait until no buffer of `ino` is being written.
    pub fn drain_output(&self, ino: InodeNumber) {
        self.cache.drain(Vnode::File(ino));
    }
}
