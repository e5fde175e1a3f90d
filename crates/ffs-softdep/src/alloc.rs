#![forbid(unsafe_code)]
//! Allocation dependencies.
//!
//! A new block pointer may reach the disk only after the block it names has
//! been initialised (the buffer of the new block is written) and after the
//! bitmap marking it used is durable (the cylinder-group buffer is
//! written). The first event sets `COMPLETE`, the second `DEPCOMPLETE`.
//! Until both have happened the inode or indirect-block write rolls the
//! pointer back to its previous value.

use crate::arena::Idx;
use crate::deps::{
    AllocDirect, AllocIndir, DepState, FreeFrag, IndirDep, InodeDep, ListId, WorkHeader, WorkRef,
};
use crate::graph::{DepGraph, fatal};
use crate::lookup::LookupFlags;
use crate::{Guard, Softdep, parse_err};
use ffs_block::Buf;
use ffs_error::Result;
use ffs_inode::Inode;
use ffs_types::{BlockNumber, FsFormat, InodeNumber, LogicalBlock, NDADDR};
use parking_lot::MutexGuard;
use tracing::{debug, trace};

/// Which of an inode's two pending block-update lists an entry is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdtList {
    /// Already copied to the inode buffer.
    Ino,
    /// Made since the last inode update.
    NewIno,
}

impl Softdep {
    /// Called just after an inode was marked used in the bitmap of `cgbuf`.
    pub fn setup_inomapdep(&self, cgbuf: &Buf, ino: InodeNumber) -> Result<()> {
        self.run(|g| {
            let lookup = self.inodedep_lookup(g, ino, LookupFlags::DEPALLOC | LookupFlags::NODELAY)?;
            let crate::lookup::Lookup::New(idx) = lookup else {
                return Err(fatal(format_args!("setup_inomapdep: found inode {ino}")));
            };
            let sm = g.bmsafemap_lookup(cgbuf.blkno())?;
            let dep = g.get_mut(idx)?;
            dep.hdr.state.remove(DepState::DEPCOMPLETE);
            dep.bmsafemap = Some(sm);
            g.get_mut(sm)?.inodedephd.push(idx);
            debug!(target: "ffs::softdep", event = "inomapdep", ino = ino.0, cg_blkno = cgbuf.blkno().0);
            Ok(())
        })
    }

    /// Called just after a block or fragment run starting at `newblkno` was
    /// marked used in the bitmap of `cgbuf`.
    pub fn setup_blkmapdep(&self, cgbuf: &Buf, newblkno: BlockNumber) -> Result<()> {
        self.run(|g| {
            let lookup = self.newblk_lookup(g, newblkno, LookupFlags::DEPALLOC)?;
            let crate::lookup::Lookup::New(nb) = lookup else {
                return Err(fatal(format_args!("setup_blkmapdep: found block {newblkno}")));
            };
            let sm = g.bmsafemap_lookup(cgbuf.blkno())?;
            g.get_mut(nb)?.bmsafemap = Some(sm);
            g.get_mut(sm)?.newblkhd.push(nb);
            trace!(target: "ffs::softdep", event = "blkmapdep", blkno = newblkno.0);
            Ok(())
        })
    }

    /// Called just before inode pointer `lbn` of `ip` is set to `newblkno`.
    ///
    /// Direct blocks use lbn `0..NDADDR`; the inode's indirect pointer of
    /// level `i` uses `NDADDR + i`. `bp` is the buffer of the new block.
    #[expect(clippy::too_many_arguments)]
    pub fn setup_allocdirect(
        &self,
        ip: &Inode,
        lbn: LogicalBlock,
        newblkno: BlockNumber,
        oldblkno: BlockNumber,
        newsize: u32,
        oldsize: u32,
        bp: &Buf,
    ) -> Result<()> {
        self.run(|g| {
            let freefrag = if newblkno == oldblkno {
                None
            } else {
                g.newfreefrag(ip.number, oldblkno, oldsize)?
            };
            let nb = g
                .find_newblk(newblkno)
                .ok_or_else(|| fatal(format_args!("setup_allocdirect: lost block {newblkno}")))?;
            let inodedep = self
                .inodedep_lookup(g, ip.number, LookupFlags::DEPALLOC | LookupFlags::NODELAY)?
                .allocated()?;
            let bmsafemap = g.claim_newblk(nb)?;
            let mut state = DepState::ATTACHED;
            if bmsafemap.is_none() {
                state |= DepState::DEPCOMPLETE;
            }
            let adp = g.alloc(AllocDirect {
                hdr: WorkHeader::new(state),
                lbn,
                newblkno,
                oldblkno,
                newsize,
                oldsize,
                freefrag,
                inodedep,
                bmsafemap,
                buf: bp.blkno(),
                newdirblk: Vec::new(),
            });
            if let Some(sm) = bmsafemap {
                g.get_mut(sm)?.allocdirecthd.push(adp);
            }
            g.worklist_insert(ListId::Buf(bp.blkno()), WorkRef::AllocDirect(adp))?;
            if lbn.is_direct() {
                if ip.is_dir() {
                    self.pagedep_attach(g, ip.number, lbn, bp.blkno())?;
                }
            } else if oldblkno.0 != 0 {
                return Err(fatal("setup_allocdirect: non-zero indirect"));
            }
            g.insert_newinoupdt(inodedep, adp)?;
            debug!(
                target: "ffs::softdep",
                event = "allocdirect",
                ino = ip.number.0,
                lbn = lbn.0,
                newblkno = newblkno.0,
                oldblkno = oldblkno.0,
                depcomplete = bmsafemap.is_none()
            );
            Ok(())
        })
    }

    /// Called just before pointer `ptrno` of the indirect block in `bp` is
    /// set to the new file page `newblkno`, whose buffer is `nbp`.
    #[expect(clippy::too_many_arguments)]
    pub fn setup_allocindir_page(
        &self,
        ip: &Inode,
        lbn: LogicalBlock,
        bp: &Buf,
        ptrno: usize,
        newblkno: BlockNumber,
        oldblkno: BlockNumber,
        nbp: &Buf,
    ) -> Result<()> {
        let aip = self.run(|g| {
            let aip = g.newallocindir(ip.number, ptrno, newblkno, oldblkno, nbp.blkno())?;
            if ip.is_dir() {
                self.pagedep_attach(g, ip.number, lbn, nbp.blkno())?;
            }
            g.worklist_insert(ListId::Buf(nbp.blkno()), WorkRef::AllocIndir(aip))?;
            Ok(aip)
        })?;
        self.setup_allocindir_phase2(bp, ip, aip)
    }

    /// Called just before pointer `ptrno` of the indirect block in `bp` is
    /// set to a new indirect block `newblkno`, whose buffer is `nbp`.
    pub fn setup_allocindir_meta(
        &self,
        nbp: &Buf,
        ip: &Inode,
        bp: &Buf,
        ptrno: usize,
        newblkno: BlockNumber,
    ) -> Result<()> {
        let aip = self.run(|g| {
            let aip = g.newallocindir(ip.number, ptrno, newblkno, BlockNumber(0), nbp.blkno())?;
            g.worklist_insert(ListId::Buf(nbp.blkno()), WorkRef::AllocIndir(aip))?;
            Ok(aip)
        })?;
        self.setup_allocindir_phase2(bp, ip, aip)
    }

    /// Hang `aip` on the indirdep of the indirect block in `bp`, creating
    /// the indirdep (with a safe copy of the block) when there is none.
    fn setup_allocindir_phase2(&self, bp: &Buf, ip: &Inode, aip: Idx<AllocIndir>) -> Result<()> {
        if bp.lbn.0 >= 0 {
            return self.run(|_| Err(fatal("setup_allocindir_phase2: not an indirect block")));
        }
        let mut prebuilt: Option<IndirDep> = None;
        loop {
            let mut g = self.lock()?;
            let existing = g.buf_deps(bp.blkno()).iter().find_map(|w| match w {
                WorkRef::IndirDep(i) => Some(*i),
                _ => None,
            });
            let indirdep = match (existing, prebuilt.take()) {
                (Some(idx), _) => Some(idx),
                (None, Some(record)) => {
                    let idx = g.alloc(record);
                    let inserted = g.worklist_insert(ListId::Buf(bp.blkno()), WorkRef::IndirDep(idx));
                    g.wedge_on(inserted)?;
                    Some(idx)
                }
                (None, None) => None,
            };
            if let Some(indirdep) = indirdep {
                let attached = self.allocindir_attach(&mut g, aip, indirdep);
                let freefrag = g.wedge_on(attached)?;
                if let Some(ff) = freefrag {
                    let freed = self.handle_workitem_freefrag(&mut g, ff);
                    g.wedge_on(freed)?;
                }
                trace!(target: "ffs::softdep", event = "allocindir", ino = ip.number.0, indir_blkno = bp.blkno().0);
                return Ok(());
            }
            drop(g);
            let mut state = DepState::ATTACHED;
            if self.geometry.format == FsFormat::Ufs1 {
                state |= DepState::UFS1FMT;
            }
            prebuilt = Some(IndirDep {
                hdr: WorkHeader::new(state),
                blkno: bp.blkno(),
                safecopy: bp.data.clone(),
                saveddata: None,
                deplisthd: Vec::new(),
                donehd: Vec::new(),
            });
        }
    }

    /// Second half of phase 2: claim the newblk and merge with an earlier
    /// allocation of the same pointer. Returns a fragment record that can
    /// be released at once.
    fn allocindir_attach(
        &self,
        g: &mut Guard<'_>,
        aip: Idx<AllocIndir>,
        indirdep: Idx<IndirDep>,
    ) -> Result<Option<Idx<FreeFrag>>> {
        let newblkno = g.get(aip)?.newblkno;
        let nb = g
            .find_newblk(newblkno)
            .ok_or_else(|| fatal(format_args!("setup_allocindir: lost block {newblkno}")))?;
        let bmsafemap = g.claim_newblk(nb)?;
        {
            let a = g.get_mut(aip)?;
            a.bmsafemap = bmsafemap;
            a.indirdep = Some(indirdep);
            if bmsafemap.is_none() {
                a.hdr.state |= DepState::DEPCOMPLETE;
            }
        }
        if let Some(sm) = bmsafemap {
            g.get_mut(sm)?.allocindirhd.push(aip);
        }

        let (offset, oldblkno) = {
            let a = g.get(aip)?;
            (a.offset, a.oldblkno)
        };
        let mut oldaip = None;
        if oldblkno.0 != 0 {
            for &other in &g.get(indirdep)?.deplisthd {
                if g.get(other)?.offset == offset {
                    oldaip = Some(other);
                    break;
                }
            }
        }
        let mut freefrag = None;
        if let Some(old) = oldaip {
            let (old_new, old_old, old_ff) = {
                let o = g.get_mut(old)?;
                (o.newblkno, o.oldblkno, o.freefrag.take())
            };
            if old_new != oldblkno {
                return Err(fatal(format_args!(
                    "setup_allocindir_phase2: blkno {old_new} != {oldblkno}"
                )));
            }
            let a = g.get_mut(aip)?;
            a.oldblkno = old_old;
            freefrag = std::mem::replace(&mut a.freefrag, old_ff);
            g.free_allocindir(old, None)?;
        }
        g.get_mut(indirdep)?.deplisthd.push(aip);
        let saved = g.get(aip)?.oldblkno;
        let format = g.geometry.format;
        format
            .write_block_ptr(&mut g.get_mut(indirdep)?.safecopy, offset, saved.0.cast_signed())
            .map_err(parse_err)?;
        Ok(freefrag)
    }

    /// Release a fragment run replaced by a larger allocation.
    pub(crate) fn handle_workitem_freefrag(&self, g: &mut Guard<'_>, ff: Idx<FreeFrag>) -> Result<()> {
        let (ino, blkno, size) = {
            let f = g.get(ff)?;
            (f.ino, f.blkno, f.size)
        };
        g.workitem_free(WorkRef::FreeFrag(ff))?;
        let fs = self.fs()?;
        trace!(target: "ffs::softdep", event = "freefrag", ino = ino.0, blkno = blkno.0, size);
        if let Err(err) = MutexGuard::unlocked(g, || fs.free_blocks(ino, blkno, size)) {
            self.softdep_error("handle_workitem_freefrag", &err);
        }
        Ok(())
    }
}

impl DepGraph {
    /// Fragment record for the run being replaced, if there was one.
    pub(crate) fn newfreefrag(
        &mut self,
        ino: InodeNumber,
        blkno: BlockNumber,
        size: u32,
    ) -> Result<Option<Idx<FreeFrag>>> {
        if blkno.0 == 0 {
            return Ok(None);
        }
        let frag = u64::from(self.geometry.frag());
        if blkno.0 % frag + self.geometry.numfrags(u64::from(size)) > frag {
            return Err(fatal(format_args!("newfreefrag: {size} bytes at {blkno} cross a block")));
        }
        Ok(Some(self.alloc(FreeFrag {
            hdr: WorkHeader::new(DepState::empty()),
            ino,
            blkno,
            size,
        })))
    }

    pub(crate) fn newallocindir(
        &mut self,
        ino: InodeNumber,
        ptrno: usize,
        newblkno: BlockNumber,
        oldblkno: BlockNumber,
        buf: BlockNumber,
    ) -> Result<Idx<AllocIndir>> {
        let freefrag = self.newfreefrag(ino, oldblkno, self.geometry.bsize)?;
        Ok(self.alloc(AllocIndir {
            hdr: WorkHeader::new(DepState::ATTACHED),
            offset: ptrno,
            newblkno,
            oldblkno,
            freefrag,
            indirdep: None,
            bmsafemap: None,
            buf,
        }))
    }

    /// Consume the newblk of a block now claimed by a pointer record.
    /// Returns the bitmap record still pending, `None` when the bitmap is
    /// already durable.
    pub(crate) fn claim_newblk(&mut self, nb: Idx<crate::deps::NewBlk>) -> Result<Option<Idx<crate::deps::BmSafeMap>>> {
        let (state, sm, blkno) = {
            let n = self.get(nb)?;
            (n.hdr.state, n.bmsafemap, n.newblkno)
        };
        let pending = if state.contains(DepState::DEPCOMPLETE) {
            None
        } else {
            let sm = sm.ok_or_else(|| fatal(format_args!("newblk {blkno} has no bitmap")))?;
            DepGraph::unlink(&mut self.get_mut(sm)?.newblkhd, nb);
            Some(sm)
        };
        self.newblk_hash.remove(&blkno);
        self.workitem_free(WorkRef::NewBlk(nb))?;
        Ok(pending)
    }

    fn updt_list(&mut self, inodedep: Idx<InodeDep>, which: UpdtList) -> Result<&mut Vec<Idx<AllocDirect>>> {
        let dep = self.get_mut(inodedep)?;
        Ok(match which {
            UpdtList::Ino => &mut dep.inoupdt,
            UpdtList::NewIno => &mut dep.newinoupdt,
        })
    }

    fn lbns(&self, list: &[Idx<AllocDirect>]) -> Result<Vec<LogicalBlock>> {
        list.iter().map(|a| self.get(*a).map(|d| d.lbn)).collect()
    }

    /// Insert `adp` into the inode's new-update list, keeping it sorted by
    /// lbn and merging with an entry for the same lbn.
    pub(crate) fn insert_newinoupdt(&mut self, inodedep: Idx<InodeDep>, adp: Idx<AllocDirect>) -> Result<()> {
        let lbn = self.get(adp)?.lbn;
        let list = self.get(inodedep)?.newinoupdt.clone();
        let lbns = self.lbns(&list)?;
        let (pos, merge_with) = match lbns.last() {
            None => (0, None),
            Some(last) if *last <= lbn => (list.len(), (*last == lbn).then(|| list[list.len() - 1])),
            Some(_) => {
                let pos = lbns
                    .iter()
                    .position(|l| *l >= lbn)
                    .ok_or_else(|| fatal("setup_allocdirect: lost entry"))?;
                (pos, (lbns[pos] == lbn).then(|| list[pos]))
            }
        };
        self.get_mut(inodedep)?.newinoupdt.insert(pos, adp);
        if let Some(old) = merge_with {
            self.allocdirect_merge(UpdtList::NewIno, adp, old)?;
        }
        Ok(())
    }

    /// Replace `oldadp` by `newadp` for the same pointer, keeping a single
    /// chain from the block on disk to the newest block.
    pub(crate) fn allocdirect_merge(
        &mut self,
        which: UpdtList,
        newadp: Idx<AllocDirect>,
        oldadp: Idx<AllocDirect>,
    ) -> Result<()> {
        let (o_new, o_newsize, o_old, o_oldsize, o_ff) = {
            let o = self.get(oldadp)?;
            (o.newblkno, o.newsize, o.oldblkno, o.oldsize, o.freefrag)
        };
        let n = self.get_mut(newadp)?;
        if n.oldblkno != o_new || n.oldsize != o_newsize || n.lbn.0 >= NDADDR as i64 {
            return Err(fatal(format_args!(
                "allocdirect_merge: old {} != new {o_new} || lbn {} >= {NDADDR}",
                n.oldblkno, n.lbn.0
            )));
        }
        n.oldblkno = o_old;
        n.oldsize = o_oldsize;
        // Swap fragment records unless the new block extends the old one
        // in place.
        if o_ff.is_some() || o_old.0 == 0 {
            let new_ff = std::mem::replace(&mut n.freefrag, o_ff);
            self.get_mut(oldadp)?.freefrag = new_ff;
        }
        let moved = {
            let o = self.get(oldadp)?;
            if o.newdirblk.len() > 1 {
                return Err(fatal("allocdirect_merge: extra newdirblk"));
            }
            o.newdirblk.first().copied()
        };
        if let Some(wk) = moved {
            self.worklist_remove(wk)?;
            self.worklist_insert(ListId::NewDirBlk(newadp), wk)?;
        }
        let inodedep = self.get(oldadp)?.inodedep;
        self.free_allocdirect(which, inodedep, oldadp, false)
    }

    /// Unlink and release an allocdirect. Its fragment and new-directory
    /// records go to the inode's `bufwait` when `delay`, else are finished
    /// now.
    pub(crate) fn free_allocdirect(
        &mut self,
        which: UpdtList,
        inodedep: Idx<InodeDep>,
        adp: Idx<AllocDirect>,
        delay: bool,
    ) -> Result<()> {
        let (state, sm, freefrag, newdirblk) = {
            let a = self.get(adp)?;
            if a.newdirblk.len() > 1 {
                return Err(fatal("free_allocdirect: extra newdirblk"));
            }
            (a.hdr.state, a.bmsafemap, a.freefrag, a.newdirblk.first().copied())
        };
        if !state.contains(DepState::DEPCOMPLETE) {
            if let Some(sm) = sm {
                DepGraph::unlink(&mut self.get_mut(sm)?.allocdirecthd, adp);
            }
        }
        if !DepGraph::unlink(self.updt_list(inodedep, which)?, adp) {
            return Err(fatal("free_allocdirect: not on its update list"));
        }
        if !state.contains(DepState::COMPLETE) {
            self.worklist_remove(WorkRef::AllocDirect(adp))?;
        }
        if let Some(ff) = freefrag {
            if delay {
                self.worklist_insert(ListId::BufWait(inodedep), WorkRef::FreeFrag(ff))?;
            } else {
                self.add_to_worklist(WorkRef::FreeFrag(ff))?;
            }
        }
        if let Some(wk) = newdirblk {
            self.worklist_remove(wk)?;
            if delay {
                self.worklist_insert(ListId::BufWait(inodedep), wk)?;
            } else if let WorkRef::NewDirBlk(db) = wk {
                self.free_newdirblk(db)?;
            } else {
                return Err(fatal(format_args!("free_allocdirect: {} on newdirblk list", wk.kind())));
            }
        }
        self.workitem_free(WorkRef::AllocDirect(adp))
    }

    /// An allocdirect reached `ALLCOMPLETE`: release it and every later
    /// complete entry, unless an earlier entry still holds a fragment whose
    /// size the on-disk inode depends on.
    pub(crate) fn allocdirect_partdone(&mut self, adp: Idx<AllocDirect>) -> Result<()> {
        let (state, sm, inodedep) = {
            let a = self.get(adp)?;
            (a.hdr.state, a.bmsafemap, a.inodedep)
        };
        if !state.all_complete() {
            return Ok(());
        }
        if sm.is_some() {
            return Err(fatal("handle_allocdirect_partdone: dangling dep"));
        }
        let bsize = self.geometry.bsize;
        let inoupdt = self.get(inodedep)?.inoupdt.clone();
        let mut start = None;
        for (i, &listadp) in inoupdt.iter().enumerate() {
            if listadp == adp {
                start = Some(i);
                break;
            }
            let oldsize = self.get(listadp)?.oldsize;
            if oldsize == 0 || oldsize == bsize {
                continue;
            }
            return Ok(());
        }
        let Some(start) = start else {
            if !self.get(inodedep)?.newinoupdt.contains(&adp) {
                return Err(fatal("handle_allocdirect_partdone: lost dep"));
            }
            return Ok(());
        };
        let delay = self.state(inodedep)?.contains(DepState::DEPCOMPLETE);
        for &next in &inoupdt[start..] {
            if !self.state(next)?.all_complete() {
                return Ok(());
            }
            self.free_allocdirect(UpdtList::Ino, inodedep, next, delay)?;
        }
        Ok(())
    }

    /// An allocindir reached `ALLCOMPLETE`: fold its pointer into the safe
    /// copy, or park it on `donehd` while the safe copy is being written.
    pub(crate) fn allocindir_partdone(&mut self, aip: Idx<AllocIndir>) -> Result<()> {
        let (state, sm, indirdep, offset, newblkno, freefrag) = {
            let a = self.get(aip)?;
            (a.hdr.state, a.bmsafemap, a.indirdep, a.offset, a.newblkno, a.freefrag)
        };
        if !state.all_complete() {
            return Ok(());
        }
        if sm.is_some() {
            return Err(fatal("handle_allocindir_partdone: dangling dependency"));
        }
        let indirdep = indirdep.ok_or_else(|| fatal("handle_allocindir_partdone: no indirdep"))?;
        let format = self.geometry.format;
        let dep = self.get_mut(indirdep)?;
        if dep.hdr.state.contains(DepState::UNDONE) {
            if DepGraph::unlink(&mut dep.deplisthd, aip) {
                dep.donehd.push(aip);
            }
            return Ok(());
        }
        format
            .write_block_ptr(&mut dep.safecopy, offset, newblkno.0.cast_signed())
            .map_err(parse_err)?;
        let linked = DepGraph::unlink(&mut dep.deplisthd, aip) | DepGraph::unlink(&mut dep.donehd, aip);
        if !linked {
            return Err(fatal("handle_allocindir_partdone: not on its indirdep"));
        }
        if let Some(ff) = freefrag {
            self.add_to_worklist(WorkRef::FreeFrag(ff))?;
        }
        self.workitem_free(WorkRef::AllocIndir(aip))
    }

    /// Unlink and release an allocindir; its fragment record goes to the
    /// inode's `bufwait` when there is an inodedep, else to the worklist.
    pub(crate) fn free_allocindir(&mut self, aip: Idx<AllocIndir>, inodedep: Option<Idx<InodeDep>>) -> Result<()> {
        let (state, sm, indirdep, freefrag) = {
            let a = self.get(aip)?;
            (a.hdr.state, a.bmsafemap, a.indirdep, a.freefrag)
        };
        if !state.contains(DepState::DEPCOMPLETE) {
            if let Some(sm) = sm {
                DepGraph::unlink(&mut self.get_mut(sm)?.allocindirhd, aip);
            }
        }
        if state.contains(DepState::ONWORKLIST) {
            self.worklist_remove(WorkRef::AllocIndir(aip))?;
        }
        if let Some(ir) = indirdep {
            let dep = self.get_mut(ir)?;
            if !DepGraph::unlink(&mut dep.deplisthd, aip) {
                DepGraph::unlink(&mut dep.donehd, aip);
            }
        }
        if let Some(ff) = freefrag {
            match inodedep {
                None => self.add_to_worklist(WorkRef::FreeFrag(ff))?,
                Some(id) => self.worklist_insert(ListId::BufWait(id), WorkRef::FreeFrag(ff))?,
            }
        }
        self.workitem_free(WorkRef::AllocIndir(aip))
    }

    /// Merge the updates made since the last inode update into the list of
    /// updates already in the inode buffer, keeping it sorted by lbn.
    pub(crate) fn merge_inode_lists(&mut self, inodedep: Idx<InodeDep>) -> Result<()> {
        let mut i = 0;
        loop {
            let (newadp, listadp) = {
                let d = self.get(inodedep)?;
                match (d.newinoupdt.first(), d.inoupdt.get(i)) {
                    (Some(n), Some(l)) => (*n, *l),
                    _ => break,
                }
            };
            let list_lbn = self.get(listadp)?.lbn;
            let new_lbn = self.get(newadp)?.lbn;
            if list_lbn < new_lbn {
                i += 1;
                continue;
            }
            let d = self.get_mut(inodedep)?;
            d.newinoupdt.remove(0);
            d.inoupdt.insert(i, newadp);
            if list_lbn == new_lbn {
                self.allocdirect_merge(UpdtList::Ino, newadp, listadp)?;
            } else {
                i += 1;
            }
        }
        let d = self.get_mut(inodedep)?;
        let rest = std::mem::take(&mut d.newinoupdt);
        d.inoupdt.extend(rest);
        Ok(())
    }
}
