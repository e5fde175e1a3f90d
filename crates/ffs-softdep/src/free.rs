#![forbid(unsafe_code)]
//! Deletion dependencies.
//!
//! Blocks and inodes are returned to the free maps only after every durable
//! pointer to them is gone: a truncated file's blocks once the zeroed inode
//! is on disk, a removed inode once its zeroed image is on disk.

use crate::alloc::UpdtList;
use crate::arena::Idx;
use crate::deps::{DepState, FreeBlks, FreeFile, InodeDep, ListId, NewDirBlk, PageDep, WorkHeader, WorkRef};
use crate::graph::{DepGraph, fatal};
use crate::lookup::LookupFlags;
use crate::{Guard, Softdep, parse_err};
use ffs_block::{Buf, Vnode};
use ffs_error::{FfsError, Result};
use ffs_inode::Inode;
use ffs_types::{BlockNumber, InodeNumber, LogicalBlock, NDADDR, NIADDR};
use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

impl Softdep {
    /// Truncate `ip` to zero length.
    ///
    /// The in-core inode and its copy in the inode buffer are zeroed, the
    /// file's cached buffers are discarded with their dependencies, and
    /// the old blocks are released once the zeroed inode is durable (at
    /// once if the inode never reached the disk).
    pub fn setup_freeblocks(&self, ip: &mut Inode) -> Result<()> {
        let ino = ip.number;
        let record = FreeBlks {
            hdr: WorkHeader::new(DepState::ATTACHED),
            ino,
            oldsize: ip.din.size,
            chkcnt: ip.din.blocks,
            dblks: ip.din.db,
            iblks: ip.din.ib,
        };
        ip.din.db = [0; NDADDR];
        ip.din.ib = [0; NIADDR];
        ip.din.blocks = 0;
        ip.din.size = 0;

        let geometry = self.geometry;
        let blkno = geometry.ino_to_fsba(ino);
        let mut bp = self.cache.bread(
            Vnode::Device,
            LogicalBlock(blkno.0.cast_signed()),
            blkno,
            geometry.bsize as usize,
        )?;
        if let Err(err) = ip.store(&geometry, &mut bp.data) {
            self.cache.brelse(bp);
            return Err(parse_err(err));
        }

        let staged = self.run(|g| {
            let fb = g.alloc(record);
            let inodedep = self
                .inodedep_lookup(g, ino, LookupFlags::DEPALLOC | LookupFlags::NODELAY)?
                .allocated()?;
            let state = g.state(inodedep)?;
            if state.contains(DepState::IOSTARTED) {
                return Err(fatal(format_args!("setup_freeblocks: inode {ino} busy")));
            }
            let delay = state.contains(DepState::DEPCOMPLETE);
            if delay {
                g.worklist_insert(ListId::BufWait(inodedep), WorkRef::FreeBlks(fb))?;
            }
            g.merge_inode_lists(inodedep)?;
            for adp in g.get(inodedep)?.inoupdt.clone() {
                g.free_allocdirect(UpdtList::Ino, inodedep, adp, delay)?;
            }
            Ok((fb, delay))
        });
        let (fb, delay) = match staged {
            Ok(v) => v,
            Err(err) => {
                self.cache.brelse(bp);
                return Err(err);
            }
        };
        self.cache.bdwrite(bp);

        let vnode = Vnode::File(ino);
        self.cache.drain(vnode);
        let mut discarded = 0_usize;
        for blkno in self.cache.vnode_blocks(vnode) {
            let Some(buf) = self.cache.acquire_cached(blkno) else {
                continue;
            };
            if buf.vnode != vnode {
                self.cache.brelse(buf);
                continue;
            }
            let dropped = self.run(|g| {
                let inodedep = g.find_inodedep(ino);
                g.deallocate_dependencies(&buf, inodedep)
            });
            if let Err(err) = dropped {
                self.cache.brelse(buf);
                return Err(err);
            }
            self.cache.invalidate(buf)?;
            discarded += 1;
        }

        self.run(|g| {
            if let Some(inodedep) = g.find_inodedep(ino) {
                g.free_inodedep(inodedep)?;
            }
            if delay {
                let state = g.state_mut(fb)?;
                *state |= DepState::DEPCOMPLETE;
                if state.all_complete() {
                    g.add_to_worklist(WorkRef::FreeBlks(fb))?;
                }
                Ok(())
            } else {
                self.handle_workitem_freeblocks(g, fb)
            }
        })?;
        debug!(
            target: "ffs::softdep",
            event = "freeblocks_setup",
            ino = ino.0,
            delayed = delay,
            discarded
        );
        Ok(())
    }

    /// Prepare inode `ino` to be freed. The release waits until the zeroed
    /// inode is durable, unless the inode never reached the disk.
    pub fn freefile(&self, ino: InodeNumber, mode: u16) -> Result<()> {
        self.run(|g| {
            let ff = g.alloc(FreeFile {
                hdr: WorkHeader::new(DepState::empty()),
                ino,
                mode,
            });
            let immediate = match g.find_inodedep(ino) {
                None => true,
                Some(inodedep) => g.check_inode_unwritten(inodedep)?,
            };
            if immediate {
                return self.handle_workitem_freefile(g, ff);
            }
            let inodedep = g
                .find_inodedep(ino)
                .ok_or_else(|| fatal("freefile: inodedep vanished"))?;
            g.worklist_insert(ListId::InoWait(inodedep), WorkRef::FreeFile(ff))?;
            trace!(target: "ffs::softdep", event = "freefile_deferred", ino = ino.0);
            Ok(())
        })
    }

    /// Return an inode to the free map.
    pub(crate) fn handle_workitem_freefile(&self, g: &mut Guard<'_>, ff: Idx<FreeFile>) -> Result<()> {
        let (ino, mode) = {
            let f = g.get(ff)?;
            (f.ino, f.mode)
        };
        if g.find_inodedep(ino).is_some() {
            warn!(target: "ffs::softdep", event = "inodedep_survived", ino = ino.0, "freeing inode with dependencies");
        }
        g.workitem_free(WorkRef::FreeFile(ff))?;
        let fs = self.fs()?;
        debug!(target: "ffs::softdep", event = "freefile", ino = ino.0);
        if let Err(err) = MutexGuard::unlocked(g, || fs.free_inode(ino, mode)) {
            self.softdep_error("handle_workitem_freefile", &err);
        }
        Ok(())
    }

    /// Release the blocks of a truncated file: indirect trees first, then
    /// the direct blocks. Runs with the lock held and drops it for the I/O.
    pub(crate) fn handle_workitem_freeblocks(&self, g: &mut Guard<'_>, fb: Idx<FreeBlks>) -> Result<()> {
        let (ino, oldsize, chkcnt, dblks, iblks) = {
            let f = g.get(fb)?;
            (f.ino, f.oldsize, f.chkcnt, f.dblks, f.iblks)
        };
        let fs = self.fs()?;
        let geometry = self.geometry;
        let bsize = geometry.bsize;
        let nblocks = u64::from(geometry.frag());

        let (released, first_error) = MutexGuard::unlocked(g, || {
            let mut released = 0_u64;
            let mut first_error: Option<FfsError> = None;
            for level in (0..NIADDR).rev() {
                let bn = iblks[level];
                if bn == 0 {
                    continue;
                }
                let bn = BlockNumber(bn.cast_unsigned());
                match self.indir_trunc(ino, bn, level) {
                    Ok(n) => released += n,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
                if let Err(err) = fs.free_blocks(ino, bn, bsize) {
                    self.softdep_error("handle_workitem_freeblocks", &err);
                }
                released += nblocks;
            }
            for i in (0..NDADDR).rev() {
                let bn = dblks[i];
                if bn == 0 {
                    continue;
                }
                let size = geometry.blksize(oldsize, LogicalBlock(i as i64));
                if let Err(err) = fs.free_blocks(ino, BlockNumber(bn.cast_unsigned()), size) {
                    self.softdep_error("handle_workitem_freeblocks", &err);
                }
                released += geometry.numfrags(u64::from(size));
            }
            Ok((released, first_error))
        })?;

        match &first_error {
            Some(err) => self.softdep_error("handle_workitem_freeblocks", err),
            None if released != chkcnt => warn!(
                target: "ffs::softdep",
                event = "freeblocks_count",
                ino = ino.0,
                released,
                chkcnt,
                "block count mismatch"
            ),
            None => {}
        }
        debug!(target: "ffs::softdep", event = "freeblocks", ino = ino.0, released);
        g.workitem_free(WorkRef::FreeBlks(fb))
    }

    /// Release every block named by the indirect block at `dbn` (and below
    /// it when `level > 0`). Called without the lock. Returns the number
    /// of fragments released.
    fn indir_trunc(&self, ino: InodeNumber, dbn: BlockNumber, level: usize) -> Result<u64> {
        let parked = self.run(|g| {
            let Some(ir) = g.goingaway.get(&dbn).and_then(|l| {
                l.iter().find_map(|w| match w {
                    WorkRef::IndirDep(i) => Some(*i),
                    _ => None,
                })
            }) else {
                return Ok(None);
            };
            let dep = g.get_mut(ir)?;
            if !dep.hdr.state.contains(DepState::GOINGAWAY) {
                return Err(fatal(format_args!("indir_trunc: lost indirdep at {dbn}")));
            }
            let data = std::mem::take(&mut dep.safecopy);
            g.worklist_remove(WorkRef::IndirDep(ir))?;
            g.workitem_free(WorkRef::IndirDep(ir))?;
            if g.goingaway.contains_key(&dbn) {
                return Err(fatal(format_args!("indir_trunc: dangling dep at {dbn}")));
            }
            Ok(Some(data))
        })?;
        let data = match parked {
            Some(data) => data,
            None => {
                let bp = self.cache.bread(
                    Vnode::Device,
                    LogicalBlock(dbn.0.cast_signed()),
                    dbn,
                    self.geometry.bsize as usize,
                )?;
                let data = bp.data.clone();
                self.cache.invalidate(bp)?;
                data
            }
        };

        let fs = self.fs()?;
        let format = self.geometry.format;
        let bsize = self.geometry.bsize;
        let nblocks = u64::from(self.geometry.frag());
        let mut released = 0;
        let mut first_error = None;
        for i in (0..self.geometry.nindir() as usize).rev() {
            let nb = format.read_block_ptr(&data, i).map_err(parse_err)?;
            if nb == 0 {
                continue;
            }
            let nb = BlockNumber(nb.cast_unsigned());
            if level > 0 {
                match self.indir_trunc(ino, nb, level - 1) {
                    Ok(n) => released += n,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }
            if let Err(err) = fs.free_blocks(ino, nb, bsize) {
                self.softdep_error("indir_trunc", &err);
            }
            released += nblocks;
        }
        trace!(target: "ffs::softdep", event = "indir_trunc", ino = ino.0, blkno = dbn.0, level, released);
        match first_error {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }
}

impl DepGraph {
    /// Drop the dependencies of a buffer of a file being truncated. None of
    /// the pending changes on it will ever become visible.
    pub(crate) fn deallocate_dependencies(&mut self, bp: &Buf, inodedep: Option<Idx<InodeDep>>) -> Result<()> {
        let blkno = bp.blkno();
        while let Some(&item) = self.buf_deps(blkno).first() {
            match item {
                WorkRef::IndirDep(ir) => {
                    if self.state(ir)?.contains(DepState::GOINGAWAY) {
                        return Err(fatal(format_args!("deallocate_dependencies: {blkno} already gone")));
                    }
                    *self.state_mut(ir)? |= DepState::GOINGAWAY;
                    loop {
                        let dep = self.get(ir)?;
                        let Some(&aip) = dep.deplisthd.first().or_else(|| dep.donehd.first()) else {
                            break;
                        };
                        self.free_allocindir(aip, inodedep)?;
                    }
                    if bp.lbn.0 >= 0 {
                        return Err(fatal(format_args!("deallocate_dependencies: {blkno} not indirect")));
                    }
                    // Keep the live pointers: the release walks them later.
                    self.get_mut(ir)?.safecopy.clone_from(&bp.data);
                    self.worklist_remove(item)?;
                    self.worklist_insert(ListId::GoingAway(blkno), item)?;
                }
                WorkRef::PageDep(pd) => {
                    loop {
                        let dep = self.get(pd)?;
                        let next = dep
                            .diraddhd
                            .iter()
                            .find_map(|l| l.first())
                            .or_else(|| dep.pendinghd.first())
                            .copied();
                        let Some(dap) = next else {
                            break;
                        };
                        self.free_diradd(dap)?;
                    }
                    let (ino, dirrems, newblock) = {
                        let dep = self.get_mut(pd)?;
                        (dep.ino, std::mem::take(&mut dep.dirremhd), dep.hdr.state.contains(DepState::NEWBLOCK))
                    };
                    let settled = match inodedep {
                        None => true,
                        Some(id) => self.state(id)?.all_complete(),
                    };
                    for dirrem in dirrems {
                        let rem = self.get_mut(dirrem)?;
                        rem.dirinum = ino;
                        rem.pagedep = None;
                        match inodedep {
                            Some(id) if !settled => {
                                self.worklist_insert(ListId::BufWait(id), WorkRef::DirRem(dirrem))?;
                            }
                            _ => self.add_to_worklist(WorkRef::DirRem(dirrem))?,
                        }
                    }
                    if newblock {
                        let found = match inodedep {
                            None => None,
                            Some(id) => self.find_newdirblk(&self.get(id)?.bufwait, pd)?,
                        };
                        let Some(db) = found else {
                            return Err(fatal("deallocate_dependencies: lost pagedep"));
                        };
                        self.worklist_remove(WorkRef::NewDirBlk(db))?;
                        self.free_newdirblk(db)?;
                    }
                    self.worklist_remove(item)?;
                    let lbn = self.get(pd)?.lbn;
                    self.pagedep_hash.remove(&(ino, lbn));
                    self.workitem_free(item)?;
                }
                WorkRef::AllocIndir(aip) => self.free_allocindir(aip, inodedep)?,
                WorkRef::AllocDirect(_)
                | WorkRef::InodeDep(_)
                | WorkRef::NewBlk(_)
                | WorkRef::BmSafeMap(_)
                | WorkRef::FreeFrag(_)
                | WorkRef::FreeBlks(_)
                | WorkRef::FreeFile(_)
                | WorkRef::DirAdd(_)
                | WorkRef::Mkdir(_)
                | WorkRef::DirRem(_)
                | WorkRef::NewDirBlk(_) => {
                    return Err(fatal(format_args!(
                        "deallocate_dependencies: unexpected {} on {blkno}",
                        item.kind()
                    )));
                }
            }
        }
        Ok(())
    }

    fn find_newdirblk(&self, list: &[WorkRef], pagedep: Idx<PageDep>) -> Result<Option<Idx<NewDirBlk>>> {
        for w in list {
            if let WorkRef::NewDirBlk(db) = w {
                if self.get(*db)?.pagedep == pagedep {
                    return Ok(Some(*db));
                }
            }
        }
        Ok(None)
    }

    /// A new directory block's pointer is durable: clear `NEWBLOCK` on its
    /// page and release what was only waiting for that.
    pub(crate) fn free_newdirblk(&mut self, db: Idx<NewDirBlk>) -> Result<()> {
        let pd = self.get(db)?.pagedep;
        let state = {
            let s = self.state_mut(pd)?;
            s.remove(DepState::NEWBLOCK);
            *s
        };
        // Entries on the pending list are committed once the page is no
        // longer attached to its buffer.
        if !state.contains(DepState::ONWORKLIST) {
            while let Some(&dap) = self.get(pd)?.pendinghd.first() {
                self.free_diradd(dap)?;
            }
        }
        let dep = self.get(pd)?;
        if !dep.has_additions() && !state.contains(DepState::ONWORKLIST) {
            let key = (dep.ino, dep.lbn);
            self.pagedep_hash.remove(&key);
            self.workitem_free(WorkRef::PageDep(pd))?;
        }
        self.workitem_free(WorkRef::NewDirBlk(db))
    }

    /// If the inode never reached the disk, drop its inodedep and report
    /// true: the on-disk image is already zero.
    pub(crate) fn check_inode_unwritten(&mut self, inodedep: Idx<InodeDep>) -> Result<bool> {
        let dep = self.get(inodedep)?;
        if dep.hdr.state.contains(DepState::DEPCOMPLETE) || !dep.lists_empty() || dep.nlinkdelta != 0 {
            return Ok(false);
        }
        let (ino, sm, on_list) = (dep.ino, dep.bmsafemap, dep.hdr.state.contains(DepState::ONWORKLIST));
        if let Some(sm) = sm {
            DepGraph::unlink(&mut self.get_mut(sm)?.inodedephd, inodedep);
        }
        if on_list {
            self.worklist_remove(WorkRef::InodeDep(inodedep))?;
        }
        let dep = self.get_mut(inodedep)?;
        dep.hdr.state |= DepState::ALLCOMPLETE;
        dep.bmsafemap = None;
        dep.saved_image = None;
        dep.savedsize = None;
        if !self.free_inodedep(inodedep)? {
            return Err(fatal(format_args!("check_inode_unwritten: busy inode {ino}")));
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn indirdep_parked(&self, blkno: BlockNumber) -> Option<Idx<crate::deps::IndirDep>> {
        self.goingaway.get(&blkno)?.iter().find_map(|w| match w {
            WorkRef::IndirDep(i) => Some(*i),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{AllocIndir, IndirDep};
    use crate::graph::tests::graph;

    fn never_written(g: &mut DepGraph, ino: u64) -> Idx<InodeDep> {
        let id = g.alloc(InodeDep::new(InodeNumber(ino)));
        g.inodedep_hash.insert(InodeNumber(ino), id);
        let sm = g.bmsafemap_lookup(BlockNumber(8)).expect("bmsafemap");
        let dep = g.get_mut(id).expect("dep");
        dep.hdr.state.remove(DepState::DEPCOMPLETE);
        dep.bmsafemap = Some(sm);
        g.get_mut(sm).expect("sm").inodedephd.push(id);
        id
    }

    #[test]
    fn unwritten_inode_is_dropped_from_its_bitmap() {
        let mut g = graph();
        let id = never_written(&mut g, 5);
        assert!(g.check_inode_unwritten(id).expect("check"));
        assert_eq!(g.find_inodedep(InodeNumber(5)), None);
        let WorkRef::BmSafeMap(sm) = g.buf_deps(BlockNumber(8))[0] else {
            panic!("bitmap record expected");
        };
        assert!(g.get(sm).expect("sm").inodedephd.is_empty());
    }

    #[test]
    fn written_inode_is_not_unwritten() {
        let mut g = graph();
        let id = never_written(&mut g, 5);
        *g.state_mut(id).expect("state") |= DepState::DEPCOMPLETE;
        assert!(!g.check_inode_unwritten(id).expect("check"));
        let id2 = never_written(&mut g, 6);
        g.get_mut(id2).expect("dep").nlinkdelta = 1;
        assert!(!g.check_inode_unwritten(id2).expect("check"));
    }

    #[test]
    fn indirect_buffer_is_parked_with_live_pointers() {
        let mut g = graph();
        let id = g.alloc(InodeDep::new(InodeNumber(7)));
        let blkno = BlockNumber(640);
        let ir = g.alloc(IndirDep {
            hdr: WorkHeader::new(DepState::ATTACHED),
            blkno,
            safecopy: vec![0; 8192],
            saveddata: None,
            deplisthd: Vec::new(),
            donehd: Vec::new(),
        });
        g.worklist_insert(ListId::Buf(blkno), WorkRef::IndirDep(ir)).expect("attach");
        let ff = g.newfreefrag(InodeNumber(7), BlockNumber(800), 8192).expect("ff");
        let aip = g.alloc(AllocIndir {
            hdr: WorkHeader::new(DepState::ATTACHED | DepState::DEPCOMPLETE),
            offset: 3,
            newblkno: BlockNumber(900),
            oldblkno: BlockNumber(800),
            freefrag: ff,
            indirdep: Some(ir),
            bmsafemap: None,
            buf: BlockNumber(900),
        });
        g.get_mut(ir).expect("ir").deplisthd.push(aip);

        let mut data = vec![0_u8; 8192];
        g.geometry.format.write_block_ptr(&mut data, 3, 900).expect("ptr");
        let cache = ffs_block::BufferCache::new(std::sync::Arc::new(ffs_block::MemoryByteDevice::new(1 << 20)), 1024)
            .expect("cache");
        let mut bp = cache.getblk(Vnode::File(InodeNumber(7)), LogicalBlock(-12), blkno, 8192);
        bp.data = data.clone();

        g.deallocate_dependencies(&bp, Some(id)).expect("deallocate");
        assert!(g.buf_deps(blkno).is_empty());
        assert_eq!(g.indirdep_parked(blkno), Some(ir));
        let parked = g.get(ir).expect("ir");
        assert!(parked.hdr.state.contains(DepState::GOINGAWAY));
        assert_eq!(parked.safecopy, data);
        assert!(g.get(aip).is_err());
        let bufwait = &g.get(id).expect("dep").bufwait;
        assert!(matches!(bufwait.as_slice(), [WorkRef::FreeFrag(_)]));
        cache.brelse(bp);
    }

    #[test]
    fn directory_page_removals_wait_for_the_zeroed_inode() {
        let mut g = graph();
        let id = g.alloc(InodeDep::new(InodeNumber(7)));
        g.state_mut(id).expect("state").remove(DepState::COMPLETE);
        let blkno = BlockNumber(1000);
        let pd = g.alloc(PageDep::new(InodeNumber(7), LogicalBlock(0)));
        g.pagedep_hash.insert((InodeNumber(7), LogicalBlock(0)), pd);
        g.worklist_insert(ListId::Buf(blkno), WorkRef::PageDep(pd)).expect("attach");
        let rem = g.alloc(crate::deps::DirRem {
            hdr: WorkHeader::new(DepState::ATTACHED),
            oldinum: InodeNumber(9),
            dirinum: InodeNumber(0),
            pagedep: Some(pd),
        });
        g.get_mut(pd).expect("pd").dirremhd.push(rem);
        let cache = ffs_block::BufferCache::new(std::sync::Arc::new(ffs_block::MemoryByteDevice::new(1 << 20)), 1024)
            .expect("cache");
        let bp = cache.getblk(Vnode::File(InodeNumber(7)), LogicalBlock(0), blkno, 8192);

        g.deallocate_dependencies(&bp, Some(id)).expect("deallocate");
        assert_eq!(g.find_pagedep(InodeNumber(7), LogicalBlock(0)), None);
        assert_eq!(g.get(id).expect("dep").bufwait, vec![WorkRef::DirRem(rem)]);
        let r = g.get(rem).expect("dirrem");
        assert_eq!(r.dirinum, InodeNumber(7));
        assert!(r.pagedep.is_none());
        cache.brelse(bp);
    }
}
