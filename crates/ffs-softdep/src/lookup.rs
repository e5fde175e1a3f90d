#![forbid(unsafe_code)]
//! Keyed lookups with on-demand creation.
//!
//! Pagedeps, inodedeps and newblks are found by key. A lookup that may
//! create takes the kind's creation semaphore so that two threads racing on
//! the same key never both insert; the loser sleeps and rescans.

use crate::arena::Idx;
use crate::deps::{BmSafeMap, DepState, InodeDep, ListId, NewBlk, PageDep, WorkHeader, WorkRef};
use crate::graph::{DepGraph, fatal};
use crate::worklist::Resource;
use crate::{Guard, Softdep};
use bitflags::bitflags;
use ffs_error::Result;
use ffs_types::{BlockNumber, InodeNumber, LogicalBlock};
use parking_lot::MutexGuard;
use tracing::trace;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct LookupFlags: u8 {
        /// Create the record when it is absent.
        const DEPALLOC = 0x1;
        /// Never throttle the caller.
        const NODELAY = 0x2;
    }
}

/// Result of a keyed lookup.
#[derive(Debug)]
pub(crate) enum Lookup<T> {
    Found(Idx<T>),
    /// Created by this call, or (pagedeps only) found but not yet attached
    /// to a buffer.
    New(Idx<T>),
    Absent,
}

impl<T> Lookup<T> {
    pub(crate) fn idx(&self) -> Option<Idx<T>> {
        match self {
            Self::Found(i) | Self::New(i) => Some(*i),
            Self::Absent => None,
        }
    }

    /// Index of a lookup made with `DEPALLOC`.
    pub(crate) fn allocated(self) -> Result<Idx<T>> {
        self.idx()
            .ok_or_else(|| fatal("allocating lookup returned nothing"))
    }
}

impl Softdep {
    pub(crate) fn inodedep_lookup(
        &self,
        g: &mut Guard<'_>,
        ino: InodeNumber,
        flags: LookupFlags,
    ) -> Result<Lookup<InodeDep>> {
        let mut first_try = true;
        loop {
            if let Some(idx) = g.find_inodedep(ino) {
                return Ok(Lookup::Found(idx));
            }
            if !flags.contains(LookupFlags::DEPALLOC) {
                return Ok(Lookup::Absent);
            }
            if first_try
                && g.num_inodedep() > self.config.max_softdeps
                && !flags.contains(LookupFlags::NODELAY)
            {
                first_try = false;
                if self.request_cleanup(g, Resource::Inodes)? {
                    continue;
                }
            }
            if g.sema.inodedep {
                self.sema_cv.wait(g);
                continue;
            }
            g.sema.inodedep = true;
            let record = MutexGuard::unlocked(g, || InodeDep::new(ino));
            let idx = g.alloc(record);
            g.inodedep_hash.insert(ino, idx);
            g.sema.inodedep = false;
            self.sema_cv.notify_all();
            trace!(target: "ffs::softdep", event = "inodedep_new", ino = ino.0, live = g.num_inodedep());
            return Ok(Lookup::New(idx));
        }
    }

    pub(crate) fn pagedep_lookup(
        &self,
        g: &mut Guard<'_>,
        ino: InodeNumber,
        lbn: LogicalBlock,
        flags: LookupFlags,
    ) -> Result<Lookup<PageDep>> {
        loop {
            if let Some(idx) = g.find_pagedep(ino, lbn) {
                let attached = g.state(idx)?.contains(DepState::ONWORKLIST);
                if !attached && flags.contains(LookupFlags::DEPALLOC) {
                    return Ok(Lookup::New(idx));
                }
                return Ok(Lookup::Found(idx));
            }
            if !flags.contains(LookupFlags::DEPALLOC) {
                return Ok(Lookup::Absent);
            }
            if g.sema.pagedep {
                self.sema_cv.wait(g);
                continue;
            }
            g.sema.pagedep = true;
            let record = MutexGuard::unlocked(g, || PageDep::new(ino, lbn));
            let idx = g.alloc(record);
            g.pagedep_hash.insert((ino, lbn), idx);
            g.sema.pagedep = false;
            self.sema_cv.notify_all();
            trace!(target: "ffs::softdep", event = "pagedep_new", ino = ino.0, lbn = lbn.0);
            return Ok(Lookup::New(idx));
        }
    }

    /// Find or create the pagedep of `(ino, lbn)` and make sure it sits on
    /// the dependency list of the directory block at `blkno`.
    pub(crate) fn pagedep_attach(
        &self,
        g: &mut Guard<'_>,
        ino: InodeNumber,
        lbn: LogicalBlock,
        blkno: BlockNumber,
    ) -> Result<Idx<PageDep>> {
        match self.pagedep_lookup(g, ino, lbn, LookupFlags::DEPALLOC)? {
            Lookup::Found(idx) => Ok(idx),
            Lookup::New(idx) => {
                g.worklist_insert(ListId::Buf(blkno), WorkRef::PageDep(idx))?;
                Ok(idx)
            }
            Lookup::Absent => Err(fatal("pagedep_attach: lookup returned nothing")),
        }
    }

    pub(crate) fn newblk_lookup(
        &self,
        g: &mut Guard<'_>,
        blkno: BlockNumber,
        flags: LookupFlags,
    ) -> Result<Lookup<NewBlk>> {
        loop {
            if let Some(idx) = g.find_newblk(blkno) {
                return Ok(Lookup::Found(idx));
            }
            if !flags.contains(LookupFlags::DEPALLOC) {
                return Ok(Lookup::Absent);
            }
            if g.sema.newblk {
                self.sema_cv.wait(g);
                continue;
            }
            g.sema.newblk = true;
            let record = MutexGuard::unlocked(g, || NewBlk {
                hdr: WorkHeader::new(DepState::empty()),
                newblkno: blkno,
                bmsafemap: None,
            });
            let idx = g.alloc(record);
            g.newblk_hash.insert(blkno, idx);
            g.sema.newblk = false;
            self.sema_cv.notify_all();
            return Ok(Lookup::New(idx));
        }
    }
}

impl DepGraph {
    /// The bitmap record of the cylinder-group buffer at `cgblk`, created
    /// and attached on first use.
    pub(crate) fn bmsafemap_lookup(&mut self, cgblk: BlockNumber) -> Result<Idx<BmSafeMap>> {
        let existing = self.buf_deps(cgblk).iter().find_map(|w| match w {
            WorkRef::BmSafeMap(idx) => Some(*idx),
            _ => None,
        });
        if let Some(idx) = existing {
            return Ok(idx);
        }
        let idx = self.alloc(BmSafeMap {
            hdr: WorkHeader::new(DepState::empty()),
            buf: cgblk,
            allocdirecthd: Vec::new(),
            allocindirhd: Vec::new(),
            inodedephd: Vec::new(),
            newblkhd: Vec::new(),
        });
        self.worklist_insert(ListId::Buf(cgblk), WorkRef::BmSafeMap(idx))?;
        Ok(idx)
    }

    /// Drop an inodedep that no longer carries anything. Returns whether it
    /// was released.
    pub(crate) fn free_inodedep(&mut self, idx: Idx<InodeDep>) -> Result<bool> {
        let dep = self.get(idx)?;
        if dep.hdr.state.contains(DepState::ONWORKLIST)
            || !dep.hdr.state.all_complete()
            || !dep.lists_empty()
            || dep.nlinkdelta != 0
            || dep.saved_image.is_some()
        {
            return Ok(false);
        }
        let ino = dep.ino;
        self.inodedep_hash.remove(&ino);
        self.workitem_free(WorkRef::InodeDep(idx))?;
        trace!(target: "ffs::softdep", event = "inodedep_free", ino = ino.0);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::graph;

    #[test]
    fn bmsafemap_is_shared_per_buffer() {
        let mut g = graph();
        let a = g.bmsafemap_lookup(BlockNumber(8)).expect("create");
        let b = g.bmsafemap_lookup(BlockNumber(8)).expect("reuse");
        let c = g.bmsafemap_lookup(BlockNumber(40)).expect("other cg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(g.buf_deps(BlockNumber(8)), &[WorkRef::BmSafeMap(a)]);
    }

    #[test]
    fn free_inodedep_refuses_busy_records() {
        let mut g = graph();
        let ino = InodeNumber(9);
        let idx = g.alloc(InodeDep::new(ino));
        g.inodedep_hash.insert(ino, idx);
        g.get_mut(idx).expect("dep").nlinkdelta = 1;
        assert!(!g.free_inodedep(idx).expect("check"));
        g.get_mut(idx).expect("dep").nlinkdelta = 0;
        g.state_mut(idx).expect("state").remove(DepState::DEPCOMPLETE);
        assert!(!g.free_inodedep(idx).expect("check"));
        g.state_mut(idx).expect("state").insert(DepState::DEPCOMPLETE);
        assert!(g.free_inodedep(idx).expect("free"));
        assert_eq!(g.find_inodedep(ino), None);
    }
}
