#![forbid(unsafe_code)]
//! Directory entry dependencies.
//!
//! A new entry may not reach the disk before its inode is initialised on
//! disk; until then a page write puts zero (or, for a changed entry, the
//! previous inode number) in its place. A removed entry must be durable
//! before the target's link count is decremented. A new directory also
//! holds its parent's entry back until both its own first block and the
//! parent's bumped link count are written.

use crate::arena::Idx;
use crate::deps::{DepState, DirAdd, DirRem, InodeDep, ListId, Mkdir, NewDirBlk, PageDep, WorkHeader, WorkRef, dahash};
use crate::graph::{DepGraph, fatal};
use crate::lookup::LookupFlags;
use crate::worklist::Resource;
use crate::{Guard, Softdep};
use ffs_block::Buf;
use ffs_dir::EntryMove;
use ffs_error::Result;
use ffs_types::{InodeNumber, LogicalBlock};
use parking_lot::MutexGuard;
use tracing::{debug, trace};

/// What the old target of a renamed-over entry was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameKind {
    /// Not a directory.
    File,
    /// A directory under the same parent.
    Dir,
    /// A directory whose `..` now names a different parent; its own link
    /// count drop is all that remains once the entry is durable.
    DirNewParent,
}

impl Softdep {
    /// Called after the entry at byte `diroffset` of directory `dp` was set
    /// to `newinum` in the block buffer `bp`, before `bp` is released.
    ///
    /// `newdirbp` is the first block of a directory being created, and
    /// `isnewblk` says the entry went into a block just allocated to `dp`.
    /// Returns true when the caller must write `bp` synchronously: an
    /// entry at the start of a new block reached through an indirect block
    /// cannot otherwise be ordered against the pointer.
    pub fn setup_directory_add(
        &self,
        bp: &Buf,
        dp: InodeNumber,
        diroffset: u64,
        newinum: InodeNumber,
        newdirbp: Option<Buf>,
        isnewblk: bool,
    ) -> Result<bool> {
        let geometry = self.geometry;
        let lbn = geometry.lblkno(diroffset);
        let offset = geometry.blkoff(diroffset) as usize;
        let fragoff = diroffset % u64::from(geometry.fsize);
        self.run(|g| {
            let pagedep = self.pagedep_attach(g, dp, lbn, bp.blkno())?;
            let mut state = DepState::ATTACHED;
            state |= if newdirbp.is_some() {
                DepState::MKDIR_BODY | DepState::MKDIR_PARENT
            } else {
                DepState::DEPCOMPLETE
            };
            let dap = g.alloc(DirAdd {
                hdr: WorkHeader::new(state),
                offset,
                newinum,
                pagedep,
                previous: None,
            });
            if let Some(newdirbp) = newdirbp {
                let body = g.alloc(Mkdir {
                    hdr: WorkHeader::new(DepState::MKDIR_BODY),
                    diradd: dap,
                    buf: newdirbp.blkno(),
                });
                g.mkdirlist.push(body);
                g.worklist_insert(ListId::Buf(newdirbp.blkno()), WorkRef::Mkdir(body))?;
                self.cache.bdwrite(newdirbp);
                // The parent's link count went up for the new `..`; its
                // inode must be written before the entry.
                let parent = g.find_inodedep(dp);
                match parent {
                    Some(id) if !g.state(id)?.all_complete() => {
                        let half = g.alloc(Mkdir {
                            hdr: WorkHeader::new(DepState::MKDIR_PARENT),
                            diradd: dap,
                            buf: bp.blkno(),
                        });
                        g.mkdirlist.push(half);
                        g.worklist_insert(ListId::BufWait(id), WorkRef::Mkdir(half))?;
                    }
                    _ => g.state_mut(dap)?.remove(DepState::MKDIR_PARENT),
                }
            }
            g.get_mut(pagedep)?.diraddhd[dahash(offset)].push(dap);

            let inodedep = self.inodedep_lookup(g, newinum, LookupFlags::DEPALLOC)?.allocated()?;
            if g.state(inodedep)?.all_complete() {
                g.diradd_inode_written(dap, inodedep)?;
            } else {
                g.worklist_insert(ListId::BufWait(inodedep), WorkRef::DirAdd(dap))?;
            }
            debug!(
                target: "ffs::softdep",
                event = "directory_add",
                dir = dp.0,
                lbn = lbn.0,
                offset,
                newinum = newinum.0,
                mkdir = state.contains(DepState::MKDIR_BODY)
            );

            if !isnewblk {
                return Ok(false);
            }
            if !lbn.is_direct() {
                return Ok(offset == 0);
            }
            if fragoff != 0 || g.state(pagedep)?.contains(DepState::NEWBLOCK) {
                return Ok(false);
            }
            let dirdep = g
                .find_inodedep(dp)
                .ok_or_else(|| fatal(format_args!("setup_directory_add: lost inodedep {dp}")))?;
            let adp = g
                .get(dirdep)?
                .newinoupdt
                .last()
                .copied()
                .ok_or_else(|| fatal("setup_directory_add: lost entry"))?;
            if g.get(adp)?.lbn != lbn {
                return Err(fatal(format_args!("setup_directory_add: lost entry for lbn {lbn}")));
            }
            *g.state_mut(pagedep)? |= DepState::NEWBLOCK;
            let db = g.alloc(NewDirBlk {
                hdr: WorkHeader::new(DepState::empty()),
                pagedep,
            });
            g.worklist_insert(ListId::NewDirBlk(adp), WorkRef::NewDirBlk(db))?;
            Ok(false)
        })
    }

    /// Move a directory entry within block `lbn` of directory `dp` while it
    /// is compacted, keeping pending additions at the entry's offset.
    ///
    /// Suitable as the mover of [`ffs_dir::compact_chunk`].
    pub fn change_directoryentry_offset(
        &self,
        dp: InodeNumber,
        lbn: LogicalBlock,
        block: &mut [u8],
        mv: EntryMove,
    ) -> Result<()> {
        self.run(|g| {
            if let Some(pd) = g.find_pagedep(dp, lbn) {
                g.renumber_diradd(pd, mv.old_offset, mv.new_offset)?;
            }
            ffs_dir::move_entry_bytes(block, mv)
        })
    }

    /// Called after the entry at `diroffset` of directory `dp` naming `ino`
    /// was cleared in `bp`, before `bp` is released.
    pub fn setup_remove(
        &self,
        bp: &Buf,
        dp: InodeNumber,
        diroffset: u64,
        ino: InodeNumber,
        isrmdir: bool,
    ) -> Result<()> {
        self.run(|g| {
            let (dirrem, prev, pagedep) = self.newdirrem(g, bp, dp, diroffset, ino, isrmdir)?;
            if !g.state(dirrem)?.contains(DepState::COMPLETE) {
                g.get_mut(pagedep)?.dirremhd.push(dirrem);
                return Ok(());
            }
            // The entry never reached the disk: the removal can run now.
            if let Some(prev) = prev {
                g.get_mut(pagedep)?.dirremhd.push(prev);
            }
            let rem = g.get_mut(dirrem)?;
            rem.dirinum = dp;
            rem.pagedep = None;
            self.handle_workitem_remove(g, dirrem)
        })
    }

    /// Build the removal record for the entry at `diroffset` and cancel an
    /// addition at the same place that never reached the disk. Returns the
    /// record, the removal the cancelled addition was replacing (if any)
    /// and the page.
    fn newdirrem(
        &self,
        g: &mut Guard<'_>,
        bp: &Buf,
        dp: InodeNumber,
        diroffset: u64,
        ino: InodeNumber,
        isrmdir: bool,
    ) -> Result<(Idx<DirRem>, Option<Idx<DirRem>>, Idx<PageDep>)> {
        if g.num_dirrem > self.config.max_softdeps / 2 {
            self.request_cleanup(g, Resource::Removals)?;
        }
        g.num_dirrem += 1;
        let lbn = self.geometry.lblkno(diroffset);
        let offset = self.geometry.blkoff(diroffset) as usize;
        let pagedep = self.pagedep_attach(g, dp, lbn, bp.blkno())?;
        let dirrem = g.alloc(DirRem {
            hdr: WorkHeader::new(if isrmdir { DepState::RMDIR } else { DepState::empty() }),
            oldinum: ino,
            dirinum: dp,
            pagedep: Some(pagedep),
        });

        let Some(dap) = g.diradd_at(pagedep, offset)? else {
            return Ok((dirrem, None, pagedep));
        };
        let add = g.get_mut(dap)?;
        if !add.hdr.state.contains(DepState::ATTACHED) {
            return Err(fatal(format_args!("newdirrem: not ATTACHED ({:?})", add.hdr.state)));
        }
        if add.newinum != ino {
            return Err(fatal(format_args!("newdirrem: inum {} should be {ino}", add.newinum)));
        }
        let mut prev = None;
        if add.hdr.state.contains(DepState::DIRCHG) {
            prev = add.previous.take();
            add.hdr.state.remove(DepState::DIRCHG);
        }
        *g.state_mut(dirrem)? |= DepState::COMPLETE;
        g.free_diradd(dap)?;
        trace!(target: "ffs::softdep", event = "diradd_cancelled", dir = dp.0, offset, ino = ino.0);
        Ok((dirrem, prev, pagedep))
    }

    /// Called after the entry at `diroffset` of directory `dp` was changed
    /// from `oldinum` to `newinum` in `bp` (rename over an existing name),
    /// before `bp` is released.
    pub fn setup_directory_change(
        &self,
        bp: &Buf,
        dp: InodeNumber,
        diroffset: u64,
        oldinum: InodeNumber,
        newinum: InodeNumber,
        kind: RenameKind,
    ) -> Result<()> {
        let offset = self.geometry.blkoff(diroffset) as usize;
        self.run(|g| {
            let isrmdir = kind != RenameKind::File;
            let (dirrem, prev, pagedep) = self.newdirrem(g, bp, dp, diroffset, oldinum, isrmdir)?;
            if kind == RenameKind::DirNewParent {
                *g.state_mut(dirrem)? |= DepState::DIRCHG;
            }
            let mut state = DepState::DIRCHG | DepState::ATTACHED | DepState::DEPCOMPLETE;
            let previous = if g.state(dirrem)?.contains(DepState::COMPLETE) {
                // The old entry never reached the disk: its inode goes now.
                let rem = g.get_mut(dirrem)?;
                rem.dirinum = dp;
                rem.pagedep = None;
                g.add_to_worklist(WorkRef::DirRem(dirrem))?;
                if prev.is_none() {
                    state.remove(DepState::DIRCHG);
                }
                prev
            } else {
                Some(dirrem)
            };
            let dap = g.alloc(DirAdd {
                hdr: WorkHeader::new(state),
                offset,
                newinum,
                pagedep,
                previous,
            });
            let inodedep = self.inodedep_lookup(g, newinum, LookupFlags::DEPALLOC)?.allocated()?;
            if g.state(inodedep)?.all_complete() {
                *g.state_mut(dap)? |= DepState::COMPLETE;
                g.get_mut(pagedep)?.pendinghd.push(dap);
                g.worklist_insert(ListId::PendingHd(inodedep), WorkRef::DirAdd(dap))?;
            } else {
                g.get_mut(pagedep)?.diraddhd[dahash(offset)].push(dap);
                g.worklist_insert(ListId::BufWait(inodedep), WorkRef::DirAdd(dap))?;
            }
            debug!(
                target: "ffs::softdep",
                event = "directory_change",
                dir = dp.0,
                offset,
                oldinum = oldinum.0,
                newinum = newinum.0,
                ?kind
            );
            Ok(())
        })
    }

    /// Called when the effective link count of `ino` dropped below its
    /// on-disk count. `nlink` is the count that will be written and
    /// `effnlink` the count the namespace sees.
    pub fn change_linkcnt(&self, ino: InodeNumber, nlink: i16, effnlink: i32) -> Result<()> {
        self.run(|g| {
            let inodedep = self.inodedep_lookup(g, ino, LookupFlags::DEPALLOC)?.allocated()?;
            let delta = i32::from(nlink) - effnlink;
            if delta < 0 {
                return Err(fatal(format_args!("change_linkcnt: bad delta {delta} for {ino}")));
            }
            g.get_mut(inodedep)?.nlinkdelta = delta;
            trace!(target: "ffs::softdep", event = "linkcnt", ino = ino.0, nlinkdelta = delta);
            Ok(())
        })
    }

    /// Apply a removal whose directory block is durable: drop the link
    /// count of the old target and, for a directory, truncate it and queue
    /// the parent's `..` drop behind the zeroed inode.
    pub(crate) fn handle_workitem_remove(&self, g: &mut Guard<'_>, dirrem: Idx<DirRem>) -> Result<()> {
        let fs = self.fs()?;
        loop {
            let (oldinum, state) = {
                let rem = g.get(dirrem)?;
                (rem.oldinum, rem.hdr.state)
            };
            if let Err(err) = MutexGuard::unlocked(g, || fs.vget(oldinum)) {
                // Without the inode the count stays high; a checker reclaims
                // it later.
                self.softdep_error("handle_workitem_remove: vget", &err);
                g.num_dirrem = g.num_dirrem.saturating_sub(1);
                return g.workitem_free(WorkRef::DirRem(dirrem));
            }
            let inodedep = g
                .find_inodedep(oldinum)
                .ok_or_else(|| fatal(format_args!("handle_workitem_remove: lost inodedep {oldinum}")))?;
            let rmdir = state.contains(DepState::RMDIR);
            let counts = fs
                .adjust_link_count(oldinum, if rmdir { -2 } else { -1 })
                .map_err(|err| fatal(format_args!("handle_workitem_remove: link count of {oldinum}: {err}")))?;
            let delta = i32::from(counts.nlink) - counts.effnlink;
            if delta < 0 {
                return Err(fatal(format_args!(
                    "handle_workitem_remove: bad {} delta {delta} for {oldinum}",
                    if rmdir { "dir" } else { "file" }
                )));
            }
            g.get_mut(inodedep)?.nlinkdelta = delta;
            trace!(target: "ffs::softdep", event = "remove", ino = oldinum.0, nlink = counts.nlink, rmdir);

            if !rmdir {
                g.num_dirrem = g.num_dirrem.saturating_sub(1);
                g.workitem_free(WorkRef::DirRem(dirrem))?;
                return self.release_unlocked(g, &*fs, oldinum);
            }

            // The directory's blocks go first; a directory that moved to a
            // new parent needs nothing else.
            if let Err(err) = MutexGuard::unlocked(g, || fs.truncate(oldinum)) {
                if err.is_fatal() {
                    return Err(err);
                }
                self.softdep_error("handle_workitem_remove: truncate", &err);
            }
            if state.contains(DepState::DIRCHG) {
                g.num_dirrem = g.num_dirrem.saturating_sub(1);
                g.workitem_free(WorkRef::DirRem(dirrem))?;
                return self.release_unlocked(g, &*fs, oldinum);
            }

            // Reuse the record for the parent's `..` link, released once
            // the directory's zeroed inode is durable.
            let parent = {
                let rem = g.get_mut(dirrem)?;
                rem.hdr.state = DepState::empty();
                rem.oldinum = rem.dirinum;
                rem.dirinum
            };
            let waiting = match g.find_inodedep(oldinum) {
                Some(id) if !g.check_inode_unwritten(id)? => Some(id),
                _ => None,
            };
            match waiting {
                None => {
                    self.release_unlocked(g, &*fs, oldinum)?;
                    trace!(target: "ffs::softdep", event = "remove_parent_now", dir = oldinum.0, parent = parent.0);
                }
                Some(id) => {
                    g.worklist_insert(ListId::InoWait(id), WorkRef::DirRem(dirrem))?;
                    MutexGuard::unlocked(g, || {
                        if let Err(err) = fs.update(oldinum, false) {
                            self.softdep_error("handle_workitem_remove: update", &err);
                        }
                    });
                    return self.release_unlocked(g, &*fs, oldinum);
                }
            }
        }
    }

    fn release_unlocked(&self, g: &mut Guard<'_>, fs: &dyn crate::FsOps, ino: InodeNumber) -> Result<()> {
        match MutexGuard::unlocked(g, || fs.release(ino)) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.softdep_error("release", &err);
                Ok(())
            }
        }
    }
}

impl DepGraph {
    /// The pending addition at byte `offset` of a page, looked up in its
    /// hash bucket first and then on the pending list.
    pub(crate) fn diradd_at(&self, pd: Idx<PageDep>, offset: usize) -> Result<Option<Idx<DirAdd>>> {
        let page = self.get(pd)?;
        for dap in page.diraddhd[dahash(offset)].iter().chain(page.pendinghd.iter()) {
            if self.get(*dap)?.offset == offset {
                return Ok(Some(*dap));
            }
        }
        Ok(None)
    }

    fn renumber_diradd(&mut self, pd: Idx<PageDep>, old: usize, new: usize) -> Result<()> {
        let Some(dap) = self.diradd_at(pd, old)? else {
            return Ok(());
        };
        self.get_mut(dap)?.offset = new;
        let page = self.get_mut(pd)?;
        if Self::unlink(&mut page.diraddhd[dahash(old)], dap) {
            page.diraddhd[dahash(new)].push(dap);
        }
        trace!(target: "ffs::softdep", event = "diradd_moved", old, new);
        Ok(())
    }

    /// Unlink an addition from whichever list of its page holds it.
    fn unlink_from_page(&mut self, dap: Idx<DirAdd>) -> Result<Idx<PageDep>> {
        let (pd, offset) = {
            let add = self.get(dap)?;
            (add.pagedep, add.offset)
        };
        let page = self.get_mut(pd)?;
        if !Self::unlink(&mut page.diraddhd[dahash(offset)], dap) && !Self::unlink(&mut page.pendinghd, dap) {
            return Err(fatal(format_args!("diradd at offset {offset} missing from its page")));
        }
        Ok(pd)
    }

    /// Release an addition, together with its mkdir halves and anything
    /// that was only waiting on it.
    pub(crate) fn free_diradd(&mut self, dap: Idx<DirAdd>) -> Result<()> {
        if self.state(dap)?.contains(DepState::ONWORKLIST) {
            self.worklist_remove(WorkRef::DirAdd(dap))?;
        }
        let pd = self.unlink_from_page(dap)?;
        let (state, newinum, previous) = {
            let add = self.get(dap)?;
            (add.hdr.state, add.newinum, add.previous)
        };
        if state.contains(DepState::DIRCHG) {
            let dirrem = previous.ok_or_else(|| fatal("free_diradd: changed entry without removal"))?;
            let ino = self.get(pd)?.ino;
            let rem = self.get_mut(dirrem)?;
            rem.dirinum = ino;
            rem.pagedep = None;
            self.add_to_worklist(WorkRef::DirRem(dirrem))?;
        }
        if let Some(id) = self.find_inodedep(newinum) {
            self.free_inodedep(id)?;
        }
        let halves = DepState::MKDIR_PARENT | DepState::MKDIR_BODY;
        if state.intersects(halves) {
            let mut remaining = state & halves;
            let mine: Vec<Idx<Mkdir>> = self
                .mkdirlist
                .iter()
                .copied()
                .filter(|m| self.get(*m).is_ok_and(|md| md.diradd == dap))
                .collect();
            for mkdir in mine {
                remaining.remove(self.state(mkdir)? & halves);
                if self.state(mkdir)?.contains(DepState::ONWORKLIST) {
                    self.worklist_remove(WorkRef::Mkdir(mkdir))?;
                }
                Self::unlink(&mut self.mkdirlist, mkdir);
                self.workitem_free(WorkRef::Mkdir(mkdir))?;
            }
            if !remaining.is_empty() {
                return Err(fatal("free_diradd: unfound ref"));
            }
        }
        self.workitem_free(WorkRef::DirAdd(dap))
    }

    /// The inode named by an addition is durable.
    pub(crate) fn diradd_inode_written(&mut self, dap: Idx<DirAdd>, inodedep: Idx<InodeDep>) -> Result<()> {
        *self.state_mut(dap)? |= DepState::COMPLETE;
        if self.state(dap)?.all_complete() {
            let pd = self.unlink_from_page(dap)?;
            self.get_mut(pd)?.pendinghd.push(dap);
        }
        self.worklist_insert(ListId::PendingHd(inodedep), WorkRef::DirAdd(dap))
    }

    /// One half of a new directory's ordering is durable. The record must
    /// already be off its work list.
    pub(crate) fn handle_written_mkdir(&mut self, mkdir: Idx<Mkdir>, half: DepState) -> Result<()> {
        let (state, dap) = {
            let md = self.get(mkdir)?;
            (md.hdr.state, md.diradd)
        };
        if state & (DepState::MKDIR_PARENT | DepState::MKDIR_BODY) != half {
            return Err(fatal(format_args!("handle_written_mkdir: bad type {state:?}")));
        }
        let add_state = {
            let s = self.state_mut(dap)?;
            s.remove(half);
            if !s.intersects(DepState::MKDIR_PARENT | DepState::MKDIR_BODY) {
                *s |= DepState::DEPCOMPLETE;
            }
            *s
        };
        if add_state.all_complete() {
            let pd = self.unlink_from_page(dap)?;
            self.get_mut(pd)?.pendinghd.push(dap);
        }
        Self::unlink(&mut self.mkdirlist, mkdir);
        self.workitem_free(WorkRef::Mkdir(mkdir))
    }
}
