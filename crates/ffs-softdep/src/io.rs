#![forbid(unsafe_code)]
//! Write interception.
//!
//! Just before a buffer goes to disk every dependency on it puts safe bytes
//! in place: directory entries whose inode is not durable become zero (or
//! their previous inode number), unsafe inode block pointers and the size go
//! back to their old values, a never-written inode becomes zeroes, and an
//! indirect block is swapped for its safe copy. When the write completes the
//! live bytes come back, states advance, and the buffer is redirtied if a
//! rollback means the disk still lags memory.

use crate::arena::Idx;
use crate::deps::{DepState, InodeDep, ListId, PageDep, WorkRef, DAHASHSZ};
use crate::graph::{DepGraph, fatal};
use crate::{Guard, Softdep, parse_err};
use ffs_block::{Buf, DirtyBuf};
use ffs_error::Result;
use ffs_inode::{Dinode, Inode, dinode_slice_mut};
use ffs_types::{InodeNumber, NDADDR, read_le_u32, write_le_u32};
use parking_lot::MutexGuard;
use tracing::{trace, warn};

fn entry_inum(ino: InodeNumber) -> Result<u32> {
    u32::try_from(ino.0).map_err(|_| fatal(format_args!("inode {ino} does not fit a directory entry")))
}

impl Softdep {
    /// `BufferCache::try_acquire` with the engine lock dropped while waiting for a busy
    /// buffer.
    pub(crate) fn getdirtybuf(&self, g: &mut Guard<'_>, blkno: ffs_types::BlockNumber, wait: bool) -> DirtyBuf {
        match self.cache.try_acquire(blkno, false) {
            DirtyBuf::Skip if wait && self.cache.incore(blkno) => {
                MutexGuard::unlocked(g, || self.cache.try_acquire(blkno, true))
            }
            other => other,
        }
    }

    pub(crate) fn disk_io_initiation(&self, bp: &mut Buf) -> Result<()> {
        self.run(|g| g.initiate_write(bp))
    }

    pub(crate) fn disk_write_complete(&self, bp: &mut Buf) -> Result<()> {
        self.run(|g| {
            if bp.error.is_some() {
                return g.write_failed(bp);
            }
            g.deferring = true;
            let result = g.write_complete(bp);
            g.deferring = false;
            g.freequeue_process();
            result
        })
    }

    /// A buffer is being discarded. Its dependencies must already be gone
    /// unless its last write failed.
    pub(crate) fn deallocate_buf(&self, bp: &Buf) -> Result<()> {
        self.run(|g| {
            let pending = g.buf_deps(bp.blkno()).len();
            if pending == 0 {
                return Ok(());
            }
            let Some(errno) = bp.error else {
                return Err(fatal(format_args!(
                    "deallocate_dependencies: {pending} dangling deps on {}",
                    bp.blkno()
                )));
            };
            // The dependencies stay keyed by address and come back with
            // the next read of the block.
            self.softdep_error(
                "deallocate_dependencies",
                &ffs_error::FfsError::Io(std::io::Error::from_raw_os_error(errno)),
            );
            Ok(())
        })
    }

    /// Called when an inode is read into core: recover the effective link
    /// count from a pending link-count delta.
    pub fn load_inodeblock(&self, ip: &mut Inode) -> Result<()> {
        ip.effnlink = i32::from(ip.din.nlink);
        self.run(|g| {
            if let Some(id) = g.find_inodedep(ip.number) {
                ip.effnlink -= g.get(id)?.nlinkdelta;
            }
            Ok(())
        })
    }

    /// Called after the in-core inode `ip` was copied into its inode buffer
    /// `bp`, before `bp` is released.
    ///
    /// Everything waiting on "the next inode update" now waits on this
    /// buffer. With `waitfor` a bitmap write the inode still depends on is
    /// forced so that the update can reach the disk.
    pub fn update_inodeblock(&self, ip: &Inode, bp: &Buf, waitfor: bool) -> Result<()> {
        let ino = ip.number;
        let mut g = self.lock()?;
        let staged = (|| {
            let Some(id) = g.find_inodedep(ino) else {
                if ip.effnlink != i32::from(ip.din.nlink) {
                    return Err(fatal(format_args!("update_inodeblock: bad link count for {ino}")));
                }
                return Ok(None);
            };
            let delta = i32::from(ip.din.nlink) - ip.effnlink;
            if g.get(id)?.nlinkdelta != delta {
                return Err(fatal(format_args!("update_inodeblock: bad delta for {ino}")));
            }
            g.state_mut(id)?.remove(DepState::COMPLETE);
            if !g.state(id)?.contains(DepState::ONWORKLIST) {
                g.worklist_insert(ListId::Buf(bp.blkno()), WorkRef::InodeDep(id))?;
            }
            g.merge_inode_lists(id)?;
            if let Some(&first) = g.get(id)?.inoupdt.first() {
                g.allocdirect_partdone(first)?;
            }
            for wk in g.get(id)?.inowait.clone() {
                g.worklist_remove(wk)?;
                g.worklist_insert(ListId::BufWait(id), wk)?;
            }
            trace!(target: "ffs::softdep", event = "update_inodeblock", ino = ino.0, waitfor);
            Ok(Some(id))
        })();
        let Some(id) = g.wedge_on(staged)? else {
            return Ok(());
        };
        if !waitfor {
            return Ok(());
        }
        loop {
            if g.get(id).is_err() || g.state(id)?.contains(DepState::DEPCOMPLETE) {
                return Ok(());
            }
            let cgblk = match g.get(id)?.bmsafemap {
                Some(sm) => g.get(sm)?.buf,
                None => return g.wedge_on(Err(fatal("update_inodeblock: no bitmap to wait on"))),
            };
            match self.getdirtybuf(&mut g, cgblk, true) {
                DirtyBuf::Slept => continue,
                DirtyBuf::Skip => break,
                DirtyBuf::Acquired(cgbuf) => {
                    let written = MutexGuard::unlocked(&mut g, || self.cache.bwrite(cgbuf));
                    if let Err(err) = written {
                        self.softdep_error("update_inodeblock: bwrite", &err);
                    }
                    break;
                }
            }
        }
        if g.find_inodedep(ino) == Some(id) && !g.state(id)?.contains(DepState::DEPCOMPLETE) {
            return g.wedge_on(Err(fatal(format_args!("update_inodeblock: update failed for {ino}"))));
        }
        Ok(())
    }
}

impl DepGraph {
    /// Number of rollbacks a write of `blkno` would need right now; stops
    /// at the first unless `want_count`.
    pub fn count_dependencies(&self, blkno: ffs_types::BlockNumber, want_count: bool) -> Result<usize> {
        let mut count = 0;
        for &item in self.buf_deps(blkno) {
            let found = match item {
                WorkRef::InodeDep(id) => {
                    let dep = self.get(id)?;
                    usize::from(!dep.hdr.state.contains(DepState::DEPCOMPLETE))
                        + usize::from(!dep.inoupdt.is_empty())
                }
                WorkRef::IndirDep(ir) => self.get(ir)?.deplisthd.len(),
                WorkRef::PageDep(pd) => self.get(pd)?.diraddhd.iter().map(Vec::len).sum(),
                WorkRef::BmSafeMap(_) | WorkRef::AllocDirect(_) | WorkRef::AllocIndir(_) | WorkRef::Mkdir(_) => 0,
                WorkRef::NewBlk(_)
                | WorkRef::FreeFrag(_)
                | WorkRef::FreeBlks(_)
                | WorkRef::FreeFile(_)
                | WorkRef::DirAdd(_)
                | WorkRef::DirRem(_)
                | WorkRef::NewDirBlk(_) => {
                    return Err(fatal(format_args!("count_dependencies: unexpected {}", item.kind())));
                }
            };
            count += found;
            if count > 0 && !want_count {
                return Ok(1);
            }
        }
        Ok(count)
    }

    /// Reattach the dependency list of `from` to `to`.
    pub fn move_dependencies(&mut self, from: ffs_types::BlockNumber, to: ffs_types::BlockNumber) -> Result<()> {
        if !self.buf_deps(to).is_empty() {
            return Err(fatal(format_args!("move_dependencies: {to} already has dependencies")));
        }
        for item in self.take_buf_deps(from)? {
            self.worklist_insert(ListId::Buf(to), item)?;
        }
        Ok(())
    }

    // ── Before the write ────────────────────────────────────────────────────

    pub(crate) fn initiate_write(&mut self, bp: &mut Buf) -> Result<()> {
        let blkno = bp.blkno();
        for item in self.buf_deps(blkno).to_vec() {
            match item {
                WorkRef::PageDep(pd) => self.initiate_write_filepage(pd, bp)?,
                WorkRef::InodeDep(id) => self.initiate_write_inodeblock(id, bp)?,
                WorkRef::IndirDep(ir) => {
                    let dep = self.get_mut(ir)?;
                    if dep.hdr.state.contains(DepState::GOINGAWAY) {
                        return Err(fatal(format_args!("disk_io_initiation: indirdep {blkno} gone")));
                    }
                    if dep.deplisthd.is_empty() {
                        // The live block is now entirely safe.
                        self.worklist_remove(item)?;
                        self.workitem_free(item)?;
                        continue;
                    }
                    dep.saveddata = Some(std::mem::replace(&mut bp.data, dep.safecopy.clone()));
                    dep.hdr.state.remove(DepState::ATTACHED);
                    dep.hdr.state |= DepState::UNDONE;
                }
                WorkRef::Mkdir(_) | WorkRef::BmSafeMap(_) | WorkRef::AllocDirect(_) | WorkRef::AllocIndir(_) => {}
                WorkRef::NewBlk(_)
                | WorkRef::FreeFrag(_)
                | WorkRef::FreeBlks(_)
                | WorkRef::FreeFile(_)
                | WorkRef::DirAdd(_)
                | WorkRef::DirRem(_)
                | WorkRef::NewDirBlk(_) => {
                    return Err(fatal(format_args!("disk_io_initiation: unexpected {}", item.kind())));
                }
            }
        }
        Ok(())
    }

    fn initiate_write_filepage(&mut self, pd: Idx<PageDep>, bp: &mut Buf) -> Result<()> {
        if self.state(pd)?.contains(DepState::IOSTARTED) {
            warn!(target: "ffs::softdep", event = "filepage_already_started", blkno = bp.blkno().0);
            return Ok(());
        }
        *self.state_mut(pd)? |= DepState::IOSTARTED;
        for bucket in 0..DAHASHSZ {
            for dap in self.get(pd)?.diraddhd[bucket].clone() {
                let (offset, newinum, state, previous) = {
                    let add = self.get(dap)?;
                    (add.offset, add.newinum, add.hdr.state, add.previous)
                };
                let on_disk = read_le_u32(&bp.data, offset).map_err(parse_err)?;
                if on_disk != entry_inum(newinum)? {
                    return Err(fatal(format_args!(
                        "initiate_write_filepage: dir inum {on_disk} != new {newinum}"
                    )));
                }
                let rollback = if state.contains(DepState::DIRCHG) {
                    let rem = previous.ok_or_else(|| fatal("initiate_write_filepage: changed entry without removal"))?;
                    entry_inum(self.get(rem)?.oldinum)?
                } else {
                    0
                };
                write_le_u32(&mut bp.data, offset, rollback).map_err(parse_err)?;
                let s = self.state_mut(dap)?;
                s.remove(DepState::ATTACHED);
                *s |= DepState::UNDONE;
            }
        }
        Ok(())
    }

    fn initiate_write_inodeblock(&mut self, id: Idx<InodeDep>, bp: &mut Buf) -> Result<()> {
        let geometry = self.geometry;
        let (ino, state) = {
            let dep = self.get(id)?;
            (dep.ino, dep.hdr.state)
        };
        if state.contains(DepState::IOSTARTED) {
            return Err(fatal(format_args!("initiate_write_inodeblock: {ino} already started")));
        }
        *self.state_mut(id)? |= DepState::IOSTARTED;
        let slot = dinode_slice_mut(&geometry, &mut bp.data, ino).map_err(parse_err)?;

        // An inode whose bitmap is not durable goes out as zeroes.
        if !state.contains(DepState::DEPCOMPLETE) {
            let dep = self.get_mut(id)?;
            if dep.saved_image.is_some() {
                return Err(fatal(format_args!("initiate_write_inodeblock: {ino} I/O underway")));
            }
            dep.saved_image = Some(slot.to_vec());
            slot.fill(0);
            return Ok(());
        }

        let mut din = Dinode::decode(geometry.format, slot).map_err(parse_err)?;
        let inoupdt = {
            let dep = self.get_mut(id)?;
            dep.savedsize = Some(din.size);
            dep.inoupdt.clone()
        };
        if inoupdt.is_empty() {
            return Ok(());
        }

        let mut deplist = 0_u32;
        let mut prevlbn = None;
        for &adp in &inoupdt {
            let a = self.get_mut(adp)?;
            if prevlbn.is_some_and(|p| p >= a.lbn) {
                return Err(fatal("initiate_write_inodeblock: lbn order"));
            }
            prevlbn = Some(a.lbn);
            let slot_no = a.slot();
            let current = if a.is_direct() {
                din.db[slot_no]
            } else {
                din.ib[slot_no - NDADDR]
            };
            if current != a.newblkno.0.cast_signed() {
                return Err(fatal(format_args!(
                    "initiate_write_inodeblock: pointer #{slot_no} mismatch {current} != {}",
                    a.newblkno
                )));
            }
            if !a.hdr.state.contains(DepState::ATTACHED) {
                return Err(fatal(format_args!("initiate_write_inodeblock: unknown state {:?}", a.hdr.state)));
            }
            deplist |= 1 << slot_no;
            a.hdr.state.remove(DepState::ATTACHED);
            a.hdr.state |= DepState::UNDONE;
        }

        // The on-disk inode may not claim more than the last fragment
        // actually written.
        let bsize = u64::from(geometry.bsize);
        let mut lastadp = None;
        let mut rest = inoupdt.len();
        for (i, &adp) in inoupdt.iter().enumerate() {
            let a = self.get(adp)?;
            if !a.is_direct() {
                rest = i;
                break;
            }
            let lbn = a.slot();
            din.db[lbn] = a.oldblkno.0.cast_signed();
            if a.oldsize == 0 || a.oldsize == geometry.bsize {
                lastadp = Some(lbn);
                continue;
            }
            din.size = bsize * lbn as u64 + u64::from(a.oldsize);
            for j in lbn + 1..NDADDR {
                if din.db[j] != 0 && deplist & (1 << j) == 0 {
                    return Err(fatal("initiate_write_inodeblock: lost dep2"));
                }
                din.db[j] = 0;
            }
            for (j, ptr) in din.ib.iter_mut().enumerate() {
                if *ptr != 0 && deplist & (1 << (NDADDR + j)) == 0 {
                    return Err(fatal("initiate_write_inodeblock: lost dep3"));
                }
                *ptr = 0;
            }
            return din.encode_into(geometry.format, slot).map_err(parse_err);
        }
        if let Some(last) = lastadp {
            if din.size <= (last as u64 + 1) * bsize {
                let used = (0..=last).rev().find(|&j| din.db[j] != 0).map_or(0, |j| j + 1);
                din.size = used as u64 * bsize;
            }
        }
        // Pointers to new indirect blocks simply stay zero until safe.
        for &adp in &inoupdt[rest..] {
            let slot_no = self.get(adp)?.slot();
            din.ib[slot_no - NDADDR] = 0;
        }
        din.encode_into(geometry.format, slot).map_err(parse_err)
    }

    // ── After the write ─────────────────────────────────────────────────────

    fn write_complete(&mut self, bp: &mut Buf) -> Result<()> {
        let blkno = bp.blkno();
        let mut reattach = Vec::new();
        for item in self.take_buf_deps(blkno)? {
            match item {
                WorkRef::PageDep(pd) => {
                    if self.handle_written_filepage(pd, bp)? {
                        reattach.push(item);
                    }
                }
                WorkRef::InodeDep(id) => {
                    if self.handle_written_inodeblock(id, bp)? {
                        reattach.push(item);
                    }
                }
                WorkRef::BmSafeMap(sm) => self.handle_written_bmsafemap(sm)?,
                WorkRef::Mkdir(md) => self.handle_written_mkdir(md, DepState::MKDIR_BODY)?,
                WorkRef::AllocDirect(adp) => {
                    *self.state_mut(adp)? |= DepState::COMPLETE;
                    self.allocdirect_partdone(adp)?;
                }
                WorkRef::AllocIndir(aip) => {
                    *self.state_mut(aip)? |= DepState::COMPLETE;
                    self.allocindir_partdone(aip)?;
                }
                WorkRef::IndirDep(ir) => {
                    self.restore_indirdep(ir, bp)?;
                    reattach.push(item);
                    if !bp.dirty {
                        self.stats.indir_blk_ptrs += 1;
                    }
                    bp.dirty = true;
                }
                WorkRef::NewBlk(_)
                | WorkRef::FreeFrag(_)
                | WorkRef::FreeBlks(_)
                | WorkRef::FreeFile(_)
                | WorkRef::DirAdd(_)
                | WorkRef::DirRem(_)
                | WorkRef::NewDirBlk(_) => {
                    return Err(fatal(format_args!("disk_write_complete: unexpected {}", item.kind())));
                }
            }
        }
        for item in reattach {
            self.worklist_insert(ListId::Buf(blkno), item)?;
        }
        Ok(())
    }

    /// Put the live indirect block back and finish the pointers that
    /// completed while the safe copy was being written.
    fn restore_indirdep(&mut self, ir: Idx<crate::deps::IndirDep>, bp: &mut Buf) -> Result<()> {
        let dep = self.get_mut(ir)?;
        if dep.hdr.state.contains(DepState::GOINGAWAY) {
            return Err(fatal("disk_write_complete: indirdep gone"));
        }
        bp.data = dep
            .saveddata
            .take()
            .ok_or_else(|| fatal("disk_write_complete: indirdep without saved data"))?;
        dep.hdr.state.remove(DepState::UNDONE);
        dep.hdr.state |= DepState::ATTACHED;
        while let Some(&aip) = self.get(ir)?.donehd.first() {
            self.allocindir_partdone(aip)?;
            if self.get(ir)?.donehd.first() == Some(&aip) {
                return Err(fatal("disk_write_complete: not gone"));
            }
        }
        Ok(())
    }

    fn handle_written_bmsafemap(&mut self, sm: Idx<crate::deps::BmSafeMap>) -> Result<()> {
        let (newblks, adps, aips, inodedeps) = {
            let map = self.get_mut(sm)?;
            (
                std::mem::take(&mut map.newblkhd),
                std::mem::take(&mut map.allocdirecthd),
                std::mem::take(&mut map.allocindirhd),
                std::mem::take(&mut map.inodedephd),
            )
        };
        for nb in newblks {
            let n = self.get_mut(nb)?;
            n.hdr.state |= DepState::DEPCOMPLETE;
            n.bmsafemap = None;
        }
        for adp in adps {
            let a = self.get_mut(adp)?;
            a.hdr.state |= DepState::DEPCOMPLETE;
            a.bmsafemap = None;
            self.allocdirect_partdone(adp)?;
        }
        for aip in aips {
            let a = self.get_mut(aip)?;
            a.hdr.state |= DepState::DEPCOMPLETE;
            a.bmsafemap = None;
            self.allocindir_partdone(aip)?;
        }
        for id in inodedeps {
            let dep = self.get_mut(id)?;
            dep.hdr.state |= DepState::DEPCOMPLETE;
            dep.bmsafemap = None;
        }
        self.workitem_free(WorkRef::BmSafeMap(sm))
    }

    /// Returns whether the pagedep must stay on the buffer.
    fn handle_written_filepage(&mut self, pd: Idx<PageDep>, bp: &mut Buf) -> Result<bool> {
        let state = self.state(pd)?;
        if !state.contains(DepState::IOSTARTED) {
            return Err(fatal("handle_written_filepage: not started"));
        }
        self.state_mut(pd)?.remove(DepState::IOSTARTED);

        let (ino, dirrems) = {
            let page = self.get_mut(pd)?;
            (page.ino, std::mem::take(&mut page.dirremhd))
        };
        for dirrem in dirrems {
            let rem = self.get_mut(dirrem)?;
            rem.dirinum = ino;
            rem.pagedep = None;
            self.add_to_worklist(WorkRef::DirRem(dirrem))?;
        }
        // Committed additions go, unless the block itself is not yet
        // claimed by the directory inode.
        let newblock = state.contains(DepState::NEWBLOCK);
        if !newblock {
            while let Some(&dap) = self.get(pd)?.pendinghd.first() {
                self.free_diradd(dap)?;
            }
        }

        let mut chgs = false;
        for bucket in 0..DAHASHSZ {
            for dap in self.get(pd)?.diraddhd[bucket].clone() {
                let (offset, newinum, dstate) = {
                    let add = self.get(dap)?;
                    (add.offset, add.newinum, add.hdr.state)
                };
                if dstate.contains(DepState::ATTACHED) {
                    return Err(fatal("handle_written_filepage: attached"));
                }
                write_le_u32(&mut bp.data, offset, entry_inum(newinum)?).map_err(parse_err)?;
                let s = self.state_mut(dap)?;
                s.remove(DepState::UNDONE);
                *s |= DepState::ATTACHED;
                chgs = true;
                if s.all_complete() {
                    let page = self.get_mut(pd)?;
                    Self::unlink(&mut page.diraddhd[bucket], dap);
                    page.pendinghd.push(dap);
                }
            }
        }
        if chgs {
            if !bp.dirty {
                self.stats.dir_entry += 1;
            }
            bp.dirty = true;
            return Ok(true);
        }
        if !newblock {
            let lbn = self.get(pd)?.lbn;
            self.pagedep_hash.remove(&(ino, lbn));
            self.workitem_free(WorkRef::PageDep(pd))?;
        }
        Ok(false)
    }

    /// Returns whether the inodedep must stay on the buffer.
    fn handle_written_inodeblock(&mut self, id: Idx<InodeDep>, bp: &mut Buf) -> Result<bool> {
        let geometry = self.geometry;
        let (ino, state) = {
            let dep = self.get(id)?;
            (dep.ino, dep.hdr.state)
        };
        if !state.contains(DepState::IOSTARTED) {
            return Err(fatal(format_args!("handle_written_inodeblock: {ino} not started")));
        }
        self.state_mut(id)?.remove(DepState::IOSTARTED);
        let slot = dinode_slice_mut(&geometry, &mut bp.data, ino).map_err(parse_err)?;

        if let Some(image) = self.get_mut(id)?.saved_image.take() {
            slot.copy_from_slice(&image);
            if !bp.dirty {
                self.stats.inode_bitmap += 1;
            }
            bp.dirty = true;
            return Ok(true);
        }
        *self.state_mut(id)? |= DepState::COMPLETE;

        // Roll forward what was rolled back.
        let mut din = Dinode::decode(geometry.format, slot).map_err(parse_err)?;
        let mut hadchanges = false;
        for adp in self.get(id)?.inoupdt.clone() {
            let a = self.get_mut(adp)?;
            if a.hdr.state.contains(DepState::ATTACHED) {
                return Err(fatal("handle_written_inodeblock: new entry"));
            }
            let slot_no = a.slot();
            if a.is_direct() {
                if din.db[slot_no] != a.oldblkno.0.cast_signed() {
                    return Err(fatal(format_args!(
                        "handle_written_inodeblock: direct pointer #{slot_no} mismatch {} != {}",
                        din.db[slot_no], a.oldblkno
                    )));
                }
                din.db[slot_no] = a.newblkno.0.cast_signed();
            } else {
                let ib = &mut din.ib[slot_no - NDADDR];
                if *ib != 0 {
                    return Err(fatal(format_args!(
                        "handle_written_inodeblock: indirect pointer #{} allocated as {ib}",
                        slot_no - NDADDR
                    )));
                }
                *ib = a.newblkno.0.cast_signed();
            }
            a.hdr.state.remove(DepState::UNDONE);
            a.hdr.state |= DepState::ATTACHED;
            hadchanges = true;
        }
        if hadchanges && !bp.dirty {
            self.stats.direct_blk_ptrs += 1;
        }
        let savedsize = self
            .get_mut(id)?
            .savedsize
            .take()
            .ok_or_else(|| fatal("handle_written_inodeblock: bad size"))?;
        if din.size != savedsize {
            din.size = savedsize;
            hadchanges = true;
        }
        if hadchanges {
            din.encode_into(geometry.format, slot).map_err(parse_err)?;
            bp.dirty = true;
        }

        if let Some(&first) = self.get(id)?.inoupdt.first() {
            self.allocdirect_partdone(first)?;
        }

        // Release what waited for this inode to be durable. The inode
        // itself is freed last, after every block it held.
        let mut filefree = None;
        while let Some(&wk) = self.get(id)?.bufwait.first() {
            self.worklist_remove(wk)?;
            match wk {
                WorkRef::FreeFile(_) => {
                    if filefree.replace(wk).is_some() {
                        return Err(fatal("handle_written_inodeblock: filefree"));
                    }
                }
                WorkRef::Mkdir(md) => self.handle_written_mkdir(md, DepState::MKDIR_PARENT)?,
                WorkRef::DirAdd(dap) => self.diradd_inode_written(dap, id)?,
                WorkRef::FreeBlks(fb) => {
                    let s = self.state_mut(fb)?;
                    *s |= DepState::COMPLETE;
                    if s.all_complete() {
                        self.add_to_worklist(wk)?;
                    }
                }
                WorkRef::FreeFrag(_) | WorkRef::DirRem(_) => self.add_to_worklist(wk)?,
                WorkRef::NewDirBlk(db) => self.free_newdirblk(db)?,
                WorkRef::PageDep(_)
                | WorkRef::InodeDep(_)
                | WorkRef::NewBlk(_)
                | WorkRef::BmSafeMap(_)
                | WorkRef::AllocDirect(_)
                | WorkRef::IndirDep(_)
                | WorkRef::AllocIndir(_) => {
                    return Err(fatal(format_args!("handle_written_inodeblock: unexpected {}", wk.kind())));
                }
            }
        }
        if let Some(wk) = filefree {
            if !self.free_inodedep(id)? {
                return Err(fatal(format_args!("handle_written_inodeblock: live inodedep {ino}")));
            }
            self.add_to_worklist(wk)?;
            return Ok(false);
        }
        if self.free_inodedep(id)? || self.get(id)?.inoupdt.is_empty() {
            return Ok(false);
        }
        Ok(hadchanges)
    }

    /// Undo the rollbacks of a failed write. Nothing is marked durable and
    /// the buffer stays dirty for a later retry.
    fn write_failed(&mut self, bp: &mut Buf) -> Result<()> {
        let geometry = self.geometry;
        let blkno = bp.blkno();
        for item in self.buf_deps(blkno).to_vec() {
            match item {
                WorkRef::PageDep(pd) => {
                    if !self.state(pd)?.contains(DepState::IOSTARTED) {
                        continue;
                    }
                    self.state_mut(pd)?.remove(DepState::IOSTARTED);
                    for bucket in 0..DAHASHSZ {
                        for dap in self.get(pd)?.diraddhd[bucket].clone() {
                            let (offset, newinum, state) = {
                                let add = self.get(dap)?;
                                (add.offset, add.newinum, add.hdr.state)
                            };
                            if !state.contains(DepState::UNDONE) {
                                continue;
                            }
                            write_le_u32(&mut bp.data, offset, entry_inum(newinum)?).map_err(parse_err)?;
                            let s = self.state_mut(dap)?;
                            s.remove(DepState::UNDONE);
                            *s |= DepState::ATTACHED;
                        }
                    }
                }
                WorkRef::InodeDep(id) => {
                    let (ino, state) = {
                        let dep = self.get(id)?;
                        (dep.ino, dep.hdr.state)
                    };
                    if !state.contains(DepState::IOSTARTED) {
                        continue;
                    }
                    self.state_mut(id)?.remove(DepState::IOSTARTED);
                    let slot = dinode_slice_mut(&geometry, &mut bp.data, ino).map_err(parse_err)?;
                    if let Some(image) = self.get_mut(id)?.saved_image.take() {
                        slot.copy_from_slice(&image);
                        continue;
                    }
                    let mut din = Dinode::decode(geometry.format, slot).map_err(parse_err)?;
                    for adp in self.get(id)?.inoupdt.clone() {
                        let a = self.get_mut(adp)?;
                        if !a.hdr.state.contains(DepState::UNDONE) {
                            continue;
                        }
                        let slot_no = a.slot();
                        if a.is_direct() {
                            din.db[slot_no] = a.newblkno.0.cast_signed();
                        } else {
                            din.ib[slot_no - NDADDR] = a.newblkno.0.cast_signed();
                        }
                        a.hdr.state.remove(DepState::UNDONE);
                        a.hdr.state |= DepState::ATTACHED;
                    }
                    if let Some(size) = self.get_mut(id)?.savedsize.take() {
                        din.size = size;
                    }
                    din.encode_into(geometry.format, slot).map_err(parse_err)?;
                }
                WorkRef::IndirDep(ir) => {
                    if self.state(ir)?.contains(DepState::UNDONE) {
                        self.restore_indirdep(ir, bp)?;
                    }
                }
                WorkRef::Mkdir(_)
                | WorkRef::BmSafeMap(_)
                | WorkRef::AllocDirect(_)
                | WorkRef::AllocIndir(_)
                | WorkRef::NewBlk(_)
                | WorkRef::FreeFrag(_)
                | WorkRef::FreeBlks(_)
                | WorkRef::FreeFile(_)
                | WorkRef::DirAdd(_)
                | WorkRef::DirRem(_)
                | WorkRef::NewDirBlk(_) => {}
            }
        }
        bp.dirty = true;
        warn!(target: "ffs::softdep", event = "write_failed", blkno = blkno.0, errno = bp.error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{AllocDirect, DirAdd, WorkHeader, dahash};
    use crate::graph::tests::graph;
    use ffs_inode::dinode_slice;
    use ffs_block::{BufferCache, MemoryByteDevice, Vnode};
    use ffs_types::{BlockNumber, LogicalBlock};
    use std::sync::Arc;

    fn checked_out(blkno: u64, data: Vec<u8>) -> Buf {
        let dev = Arc::new(MemoryByteDevice::new(1 << 20));
        let cache = BufferCache::new(dev, 1024).expect("cache");
        let mut bp = cache.getblk(Vnode::Device, LogicalBlock(blkno.cast_signed()), BlockNumber(blkno), data.len());
        bp.data = data;
        bp
    }

    fn dir_page(g: &mut DepGraph) -> (Idx<PageDep>, Idx<DirAdd>) {
        let pd = g.alloc(PageDep::new(InodeNumber(2), LogicalBlock(0)));
        g.pagedep_hash.insert((InodeNumber(2), LogicalBlock(0)), pd);
        g.worklist_insert(ListId::Buf(BlockNumber(500)), WorkRef::PageDep(pd)).expect("attach");
        let dap = g.alloc(DirAdd {
            hdr: WorkHeader::new(DepState::ATTACHED | DepState::DEPCOMPLETE),
            offset: 24,
            newinum: InodeNumber(77),
            pagedep: pd,
            previous: None,
        });
        g.get_mut(pd).expect("page").diraddhd[dahash(24)].push(dap);
        (pd, dap)
    }

    #[test]
    fn unsafe_entry_goes_out_as_zero_and_comes_back() {
        let mut g = graph();
        let (pd, dap) = dir_page(&mut g);
        let mut block = vec![0_u8; 1024];
        write_le_u32(&mut block, 24, 77).expect("entry");
        let mut bp = checked_out(500, block);

        g.initiate_write(&mut bp).expect("initiate");
        assert_eq!(read_le_u32(&bp.data, 24).expect("read"), 0);
        assert!(g.state(dap).expect("state").contains(DepState::UNDONE));

        g.write_complete(&mut bp).expect("complete");
        assert_eq!(read_le_u32(&bp.data, 24).expect("read"), 77);
        assert!(bp.dirty, "rolled-back page is redirtied");
        assert_eq!(g.stats.dir_entry, 1);
        assert_eq!(g.buf_deps(BlockNumber(500)), &[WorkRef::PageDep(pd)]);
    }

    #[test]
    fn failed_write_restores_entry_without_progress() {
        let mut g = graph();
        let (pd, dap) = dir_page(&mut g);
        let mut block = vec![0_u8; 1024];
        write_le_u32(&mut block, 24, 77).expect("entry");
        let mut bp = checked_out(500, block);
        g.initiate_write(&mut bp).expect("initiate");
        bp.error = Some(5);
        g.write_failed(&mut bp).expect("failed");
        assert_eq!(read_le_u32(&bp.data, 24).expect("read"), 77);
        assert!(!g.state(pd).expect("page").contains(DepState::IOSTARTED));
        assert!(g.state(dap).expect("dap").contains(DepState::ATTACHED));
        assert_eq!(g.stats.dir_entry, 0);
    }

    #[test]
    fn unallocated_inode_is_written_as_zeroes() {
        let mut g = graph();
        let geometry = g.geometry;
        let ino = InodeNumber(5);
        let mut dep = InodeDep::new(ino);
        dep.hdr.state.remove(DepState::DEPCOMPLETE);
        let id = g.alloc(dep);
        g.inodedep_hash.insert(ino, id);
        g.worklist_insert(ListId::Buf(BlockNumber(64)), WorkRef::InodeDep(id)).expect("attach");

        let mut block = vec![0_u8; geometry.bsize as usize];
        let mut ip = Inode::new(ino, Dinode { mode: 0o100_644, nlink: 1, ..Dinode::default() });
        ip.din.size = 10;
        ip.store(&geometry, &mut block).expect("store");
        let live = block.clone();
        let mut bp = checked_out(64, block);

        g.initiate_write(&mut bp).expect("initiate");
        let on_disk = dinode_slice(&geometry, &bp.data, ino).expect("slot");
        assert!(on_disk.iter().all(|b| *b == 0));
        g.write_complete(&mut bp).expect("complete");
        assert_eq!(bp.data, live);
        assert!(bp.dirty);
        assert_eq!(g.stats.inode_bitmap, 1);
    }

    #[test]
    fn fragment_rollback_trims_size_and_later_pointers() {
        let mut g = graph();
        let geometry = g.geometry;
        let ino = InodeNumber(6);
        let id = g.alloc(InodeDep::new(ino));
        g.inodedep_hash.insert(ino, id);
        g.worklist_insert(ListId::Buf(BlockNumber(64)), WorkRef::InodeDep(id)).expect("attach");
        // lbn 0 grew from a 2-fragment run at 200 to a full block at 320.
        let adp = g.alloc(AllocDirect {
            hdr: WorkHeader::new(DepState::ATTACHED | DepState::DEPCOMPLETE),
            lbn: LogicalBlock(0),
            newblkno: BlockNumber(320),
            oldblkno: BlockNumber(200),
            newsize: 8192,
            oldsize: 2048,
            freefrag: None,
            inodedep: id,
            bmsafemap: None,
            buf: BlockNumber(320),
            newdirblk: Vec::new(),
        });
        g.get_mut(id).expect("dep").inoupdt.push(adp);

        let mut din = Dinode { mode: 0o100_644, nlink: 1, size: 8192 + 100, ..Dinode::default() };
        din.db[0] = 320;
        din.db[1] = 328;
        let mut block = vec![0_u8; geometry.bsize as usize];
        Inode::new(ino, din).store(&geometry, &mut block).expect("store");
        let mut bp = checked_out(64, block);
        // lbn 1 has no dependency of its own: losing it would be a bug.
        assert!(g.initiate_write(&mut bp).is_err());

        let mut g = graph();
        let id = g.alloc(InodeDep::new(ino));
        g.inodedep_hash.insert(ino, id);
        g.worklist_insert(ListId::Buf(BlockNumber(64)), WorkRef::InodeDep(id)).expect("attach");
        let adp = g.alloc(AllocDirect {
            hdr: WorkHeader::new(DepState::ATTACHED | DepState::DEPCOMPLETE),
            lbn: LogicalBlock(0),
            newblkno: BlockNumber(320),
            oldblkno: BlockNumber(200),
            newsize: 8192,
            oldsize: 2048,
            freefrag: None,
            inodedep: id,
            bmsafemap: None,
            buf: BlockNumber(320),
            newdirblk: Vec::new(),
        });
        g.get_mut(id).expect("dep").inoupdt.push(adp);
        let mut din = Dinode { mode: 0o100_644, nlink: 1, size: 8192, ..Dinode::default() };
        din.db[0] = 320;
        let mut block = vec![0_u8; geometry.bsize as usize];
        Inode::new(ino, din).store(&geometry, &mut block).expect("store");
        let mut bp = checked_out(64, block);
        g.initiate_write(&mut bp).expect("initiate");
        let rolled = Dinode::decode(geometry.format, dinode_slice(&geometry, &bp.data, ino).expect("slot"))
            .expect("decode");
        assert_eq!(rolled.db[0], 200);
        assert_eq!(rolled.size, 2048);

        g.write_complete(&mut bp).expect("complete");
        let live = Dinode::decode(geometry.format, dinode_slice(&geometry, &bp.data, ino).expect("slot"))
            .expect("decode");
        assert_eq!(live.db[0], 320);
        assert_eq!(live.size, 8192);
        assert_eq!(g.stats.direct_blk_ptrs, 1);
        assert!(g.state(adp).expect("adp").contains(DepState::ATTACHED));
    }

    #[test]
    fn count_stops_at_first_unless_asked() {
        let mut g = graph();
        let (pd, _) = dir_page(&mut g);
        let second = g.alloc(DirAdd {
            hdr: WorkHeader::new(DepState::ATTACHED),
            offset: 40,
            newinum: InodeNumber(78),
            pagedep: pd,
            previous: None,
        });
        g.get_mut(pd).expect("page").diraddhd[dahash(40)].push(second);
        assert_eq!(g.count_dependencies(BlockNumber(500), false).expect("count"), 1);
        assert_eq!(g.count_dependencies(BlockNumber(500), true).expect("count"), 2);
        assert_eq!(g.count_dependencies(BlockNumber(501), true).expect("count"), 0);
    }

    #[test]
    fn move_dependencies_refuses_to_merge() {
        let mut g = graph();
        let (pd, _) = dir_page(&mut g);
        g.move_dependencies(BlockNumber(500), BlockNumber(600)).expect("move");
        assert_eq!(g.buf_deps(BlockNumber(600)), &[WorkRef::PageDep(pd)]);
        assert!(g.buf_deps(BlockNumber(500)).is_empty());
        let other = g.alloc(PageDep::new(InodeNumber(3), LogicalBlock(0)));
        g.worklist_insert(ListId::Buf(BlockNumber(700)), WorkRef::PageDep(other)).expect("attach");
        assert!(g.move_dependencies(BlockNumber(700), BlockNumber(600)).is_err());
    }
}
