#![forbid(unsafe_code)]
//! The dependency graph: arenas, lookup tables and the work lists.
//!
//! Everything in here runs under the engine lock and never performs I/O.
//! Linking follows one rule: a record is on at most one work list, and
//! `ONWORKLIST` is set exactly while it is. [`DepGraph::worklist_insert`],
//! [`DepGraph::worklist_remove`] and [`DepGraph::workitem_free`] enforce it.

use crate::arena::{Arena, Idx};
use crate::config::SoftdepConfig;
use crate::deps::{
    AllocDirect, AllocIndir, BmSafeMap, DepKind, DepState, DirAdd, DirRem, FreeBlks, FreeFile,
    FreeFrag, IndirDep, InodeDep, ListId, Mkdir, NewBlk, NewDirBlk, PageDep, WorkHeader, WorkRef,
};
use crate::hash::DepHash;
use crate::stats::{LimitCounter, SoftdepStats};
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, FsGeometry, InodeNumber, LogicalBlock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::thread::ThreadId;
use tracing::{error, trace};

/// Build the fatal error for a broken graph invariant.
pub(crate) fn fatal(what: impl fmt::Display) -> FfsError {
    FfsError::Invariant(what.to_string())
}

/// Typed access to the arena of one record kind.
pub(crate) trait Pooled: Sized {
    const KIND: DepKind;
    fn arena(g: &DepGraph) -> &Arena<Self>;
    fn arena_mut(g: &mut DepGraph) -> &mut Arena<Self>;
    fn wrap(idx: Idx<Self>) -> WorkRef;
    fn hdr(&self) -> &WorkHeader;
    fn hdr_mut(&mut self) -> &mut WorkHeader;
}

/// Creation-in-progress markers for the keyed kinds.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CreationSema {
    pub pagedep: bool,
    pub inodedep: bool,
    pub newblk: bool,
}

#[derive(Debug)]
pub struct DepGraph {
    pub(crate) geometry: FsGeometry,
    pub(crate) config: SoftdepConfig,

    pub(crate) pagedeps: Arena<PageDep>,
    pub(crate) inodedeps: Arena<InodeDep>,
    pub(crate) newblks: Arena<NewBlk>,
    pub(crate) bmsafemaps: Arena<BmSafeMap>,
    pub(crate) allocdirects: Arena<AllocDirect>,
    pub(crate) indirdeps: Arena<IndirDep>,
    pub(crate) allocindirs: Arena<AllocIndir>,
    pub(crate) freefrags: Arena<FreeFrag>,
    pub(crate) freeblks: Arena<FreeBlks>,
    pub(crate) freefiles: Arena<FreeFile>,
    pub(crate) diradds: Arena<DirAdd>,
    pub(crate) mkdirs: Arena<Mkdir>,
    pub(crate) dirrems: Arena<DirRem>,
    pub(crate) newdirblks: Arena<NewDirBlk>,

    pub(crate) pagedep_hash: DepHash<(InodeNumber, LogicalBlock), Idx<PageDep>>,
    pub(crate) inodedep_hash: DepHash<InodeNumber, Idx<InodeDep>>,
    pub(crate) newblk_hash: DepHash<BlockNumber, Idx<NewBlk>>,
    pub(crate) sema: CreationSema,

    /// Dependency lists of buffers, keyed by buffer address.
    pub(crate) bufdeps: HashMap<BlockNumber, Vec<WorkRef>>,
    /// Indirect-block records of truncated files waiting for the release.
    pub(crate) goingaway: HashMap<BlockNumber, Vec<WorkRef>>,
    pub(crate) worklist: VecDeque<WorkRef>,
    /// Every outstanding mkdir half.
    pub(crate) mkdirlist: Vec<Idx<Mkdir>>,
    /// Releases requested from the completion path.
    pub(crate) free_queue: Vec<WorkRef>,
    /// Set while a write completion runs; frees go to `free_queue`.
    pub(crate) deferring: bool,

    pub(crate) num_dirrem: usize,
    pub(crate) req_clear_inodedeps: u32,
    pub(crate) req_clear_remove: u32,
    pub(crate) proc_waiting: u32,
    pub(crate) stat_countp: LimitCounter,
    /// Background passes running (> 0) or a flush owning the list (-1).
    pub(crate) worklist_busy: i32,
    pub(crate) worklist_req: u32,
    pub(crate) syncer: Option<ThreadId>,
    pub(crate) clear_remove_next: usize,
    pub(crate) clear_inodedeps_next: usize,
    pub(crate) stats: SoftdepStats,
    pub(crate) wedged: Option<String>,
}

macro_rules! pooled_kinds {
    ($($ty:ident => $field:ident),* $(,)?) => {
        $(
            impl Pooled for $ty {
                const KIND: DepKind = DepKind::$ty;
                fn arena(g: &DepGraph) -> &Arena<Self> {
                    &g.$field
                }
                fn arena_mut(g: &mut DepGraph) -> &mut Arena<Self> {
                    &mut g.$field
                }
                fn wrap(idx: Idx<Self>) -> WorkRef {
                    WorkRef::$ty(idx)
                }
                fn hdr(&self) -> &WorkHeader {
                    &self.hdr
                }
                fn hdr_mut(&mut self) -> &mut WorkHeader {
                    &mut self.hdr
                }
            }
        )*

        impl DepGraph {
            pub fn header(&self, item: WorkRef) -> Result<&WorkHeader> {
                match item {
                    $(WorkRef::$ty(i) => Ok(&self.get(i)?.hdr),)*
                }
            }

            pub fn header_mut(&mut self, item: WorkRef) -> Result<&mut WorkHeader> {
                match item {
                    $(WorkRef::$ty(i) => Ok(&mut self.get_mut(i)?.hdr),)*
                }
            }

            fn release(&mut self, item: WorkRef) -> bool {
                match item {
                    $(WorkRef::$ty(i) => self.$field.remove(i).is_some(),)*
                }
            }

            /// Live records per kind.
            #[must_use]
            pub fn live_counts(&self) -> Vec<(DepKind, usize)> {
                vec![$((DepKind::$ty, self.$field.len()),)*]
            }
        }
    };
}

pooled_kinds! {
    PageDep => pagedeps,
    InodeDep => inodedeps,
    NewBlk => newblks,
    BmSafeMap => bmsafemaps,
    AllocDirect => allocdirects,
    IndirDep => indirdeps,
    AllocIndir => allocindirs,
    FreeFrag => freefrags,
    FreeBlks => freeblks,
    FreeFile => freefiles,
    DirAdd => diradds,
    Mkdir => mkdirs,
    DirRem => dirrems,
    NewDirBlk => newdirblks,
}

impl DepGraph {
    #[must_use]
    pub fn new(geometry: FsGeometry, config: SoftdepConfig) -> Self {
        Self {
            geometry,
            pagedep_hash: DepHash::with_buckets(config.pagedep_buckets()),
            inodedep_hash: DepHash::with_buckets(config.inodedep_buckets()),
            newblk_hash: DepHash::with_buckets(config.newblk_buckets()),
            config,
            pagedeps: Arena::default(),
            inodedeps: Arena::default(),
            newblks: Arena::default(),
            bmsafemaps: Arena::default(),
            allocdirects: Arena::default(),
            indirdeps: Arena::default(),
            allocindirs: Arena::default(),
            freefrags: Arena::default(),
            freeblks: Arena::default(),
            freefiles: Arena::default(),
            diradds: Arena::default(),
            mkdirs: Arena::default(),
            dirrems: Arena::default(),
            newdirblks: Arena::default(),
            sema: CreationSema::default(),
            bufdeps: HashMap::new(),
            goingaway: HashMap::new(),
            worklist: VecDeque::new(),
            mkdirlist: Vec::new(),
            free_queue: Vec::new(),
            deferring: false,
            num_dirrem: 0,
            req_clear_inodedeps: 0,
            req_clear_remove: 0,
            proc_waiting: 0,
            stat_countp: LimitCounter::default(),
            worklist_busy: 0,
            worklist_req: 0,
            syncer: None,
            clear_remove_next: 0,
            clear_inodedeps_next: 0,
            stats: SoftdepStats::default(),
            wedged: None,
        }
    }

    pub(crate) fn get<T: Pooled>(&self, idx: Idx<T>) -> Result<&T> {
        T::arena(self)
            .get(idx)
            .ok_or_else(|| fatal(format_args!("stale {} index {idx:?}", T::KIND)))
    }

    pub(crate) fn get_mut<T: Pooled>(&mut self, idx: Idx<T>) -> Result<&mut T> {
        T::arena_mut(self)
            .get_mut(idx)
            .ok_or_else(|| fatal(format_args!("stale {} index {idx:?}", T::KIND)))
    }

    pub(crate) fn alloc<T: Pooled>(&mut self, value: T) -> Idx<T> {
        T::arena_mut(self).insert(value)
    }

    pub(crate) fn state<T: Pooled>(&self, idx: Idx<T>) -> Result<DepState> {
        Ok(self.get(idx)?.hdr().state)
    }

    pub(crate) fn state_mut<'a, T: Pooled + 'a>(&'a mut self, idx: Idx<T>) -> Result<&'a mut DepState> {
        Ok(&mut self.get_mut(idx)?.hdr_mut().state)
    }

    // ── Wedge ───────────────────────────────────────────────────────────────

    /// Refuse to run once an invariant has been broken.
    pub(crate) fn ensure_live(&self) -> Result<()> {
        match &self.wedged {
            Some(why) => Err(fatal(format_args!("engine wedged: {why}"))),
            None => Ok(()),
        }
    }

    /// Latch the first fatal error; pass every result through unchanged.
    pub(crate) fn wedge_on<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(FfsError::Invariant(why)) = &result {
            if self.wedged.is_none() {
                error!(target: "ffs::softdep", event = "invariant", detail = %why, "soft dependency engine wedged");
                self.wedged = Some(why.clone());
            }
        }
        result
    }

    #[must_use]
    pub fn is_wedged(&self) -> bool {
        self.wedged.is_some()
    }

    // ── Work lists ──────────────────────────────────────────────────────────

    fn list_vec(&mut self, list: ListId) -> Result<&mut Vec<WorkRef>> {
        Ok(match list {
            ListId::Buf(b) => self.bufdeps.entry(b).or_default(),
            ListId::GoingAway(b) => self.goingaway.entry(b).or_default(),
            ListId::BufWait(i) => &mut self.get_mut(i)?.bufwait,
            ListId::InoWait(i) => &mut self.get_mut(i)?.inowait,
            ListId::PendingHd(i) => &mut self.get_mut(i)?.pendinghd,
            ListId::NewDirBlk(a) => &mut self.get_mut(a)?.newdirblk,
            ListId::Worklist => return Err(fatal("worklist is not a plain list")),
        })
    }

    /// Link `item` onto `list`.
    pub fn worklist_insert(&mut self, list: ListId, item: WorkRef) -> Result<()> {
        let hdr = self.header_mut(item)?;
        if hdr.state.contains(DepState::ONWORKLIST) {
            return Err(fatal(format_args!(
                "worklist_insert: {} already on {:?}",
                item.kind(),
                hdr.link
            )));
        }
        hdr.state |= DepState::ONWORKLIST;
        hdr.link = Some(list);
        if list == ListId::Worklist {
            self.worklist.push_back(item);
        } else {
            self.list_vec(list)?.push(item);
        }
        Ok(())
    }

    /// Unlink `item` from whatever list holds it.
    pub fn worklist_remove(&mut self, item: WorkRef) -> Result<()> {
        let hdr = self.header_mut(item)?;
        if !hdr.state.contains(DepState::ONWORKLIST) {
            return Err(fatal(format_args!("worklist_remove: {} not on list", item.kind())));
        }
        hdr.state.remove(DepState::ONWORKLIST);
        let list = hdr
            .link
            .take()
            .ok_or_else(|| fatal("worklist_remove: on-list flag without a list"))?;
        let found = if list == ListId::Worklist {
            self.worklist
                .iter()
                .position(|w| *w == item)
                .and_then(|p| self.worklist.remove(p))
                .is_some()
        } else {
            let vec = self.list_vec(list)?;
            let found = vec
                .iter()
                .position(|w| *w == item)
                .map(|p| vec.remove(p))
                .is_some();
            match list {
                ListId::Buf(b) if self.bufdeps.get(&b).is_some_and(Vec::is_empty) => {
                    self.bufdeps.remove(&b);
                }
                ListId::GoingAway(b) if self.goingaway.get(&b).is_some_and(Vec::is_empty) => {
                    self.goingaway.remove(&b);
                }
                _ => {}
            }
            found
        };
        if found {
            Ok(())
        } else {
            Err(fatal(format_args!(
                "worklist_remove: {} missing from {list:?}",
                item.kind()
            )))
        }
    }

    /// Release a record. It must not be linked on any list. During a write
    /// completion the release is queued instead.
    pub fn workitem_free(&mut self, item: WorkRef) -> Result<()> {
        if self.header(item)?.state.contains(DepState::ONWORKLIST) {
            return Err(fatal(format_args!(
                "workitem_free: {} still on list",
                item.kind()
            )));
        }
        if self.deferring {
            self.free_queue.push(item);
        } else if !self.release(item) {
            return Err(fatal(format_args!("workitem_free: {} freed twice", item.kind())));
        }
        Ok(())
    }

    /// Release everything queued by the completion path.
    pub fn freequeue_process(&mut self) {
        for item in std::mem::take(&mut self.free_queue) {
            self.release(item);
        }
    }

    /// Queue a deferred action for the background worker.
    pub fn add_to_worklist(&mut self, item: WorkRef) -> Result<()> {
        if !matches!(
            item,
            WorkRef::DirRem(_) | WorkRef::FreeBlks(_) | WorkRef::FreeFrag(_) | WorkRef::FreeFile(_)
        ) {
            return Err(fatal(format_args!("add_to_worklist: {} is not a work item", item.kind())));
        }
        self.worklist_insert(ListId::Worklist, item)?;
        trace!(target: "ffs::softdep", event = "worklist_add", kind = %item.kind(), pending = self.worklist.len());
        Ok(())
    }

    /// Take the head of the worklist, skipping removals for which `skip`
    /// answers true.
    pub(crate) fn worklist_take(&mut self, mut skip: impl FnMut(&Self, WorkRef) -> bool) -> Result<Option<WorkRef>> {
        let Some(item) = self.worklist.iter().copied().find(|w| !skip(self, *w)) else {
            return Ok(None);
        };
        self.worklist_remove(item)?;
        Ok(Some(item))
    }

    /// Dependencies attached to the buffer at `blkno`.
    #[must_use]
    pub fn buf_deps(&self, blkno: BlockNumber) -> &[WorkRef] {
        self.bufdeps.get(&blkno).map_or(&[], Vec::as_slice)
    }

    /// Detach and return the whole dependency list of a buffer.
    pub(crate) fn take_buf_deps(&mut self, blkno: BlockNumber) -> Result<Vec<WorkRef>> {
        let items = self.bufdeps.remove(&blkno).unwrap_or_default();
        for item in &items {
            let hdr = self.header_mut(*item)?;
            hdr.state.remove(DepState::ONWORKLIST);
            hdr.link = None;
        }
        Ok(items)
    }

    // ── Keyed lookups (no allocation) ───────────────────────────────────────

    #[must_use]
    pub fn find_inodedep(&self, ino: InodeNumber) -> Option<Idx<InodeDep>> {
        self.inodedep_hash.get(&ino)
    }

    #[must_use]
    pub fn find_pagedep(&self, ino: InodeNumber, lbn: LogicalBlock) -> Option<Idx<PageDep>> {
        self.pagedep_hash.get(&(ino, lbn))
    }

    #[must_use]
    pub fn find_newblk(&self, blkno: BlockNumber) -> Option<Idx<NewBlk>> {
        self.newblk_hash.get(&blkno)
    }

    #[must_use]
    pub fn num_inodedep(&self) -> usize {
        self.inodedep_hash.len()
    }

    /// Remove `idx` from a vector of indices, reporting whether it was there.
    pub(crate) fn unlink<T>(list: &mut Vec<Idx<T>>, idx: Idx<T>) -> bool {
        match list.iter().position(|x| *x == idx) {
            Some(p) => {
                list.remove(p);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn stats(&self) -> SoftdepStats {
        SoftdepStats {
            inodedeps: self.num_inodedep() as u64,
            dirrems: self.num_dirrem as u64,
            on_worklist: self.worklist.len() as u64,
            ..self.stats
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ffs_types::FsFormat;
    use proptest::prelude::*;

    pub(crate) fn graph() -> DepGraph {
        let g = FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 2, 4096, 128).expect("geometry");
        DepGraph::new(g, SoftdepConfig::default())
    }

    fn freefrag(g: &mut DepGraph) -> WorkRef {
        WorkRef::FreeFrag(g.alloc(FreeFrag {
            hdr: WorkHeader::new(DepState::empty()),
            ino: InodeNumber(3),
            blkno: BlockNumber(100),
            size: 1024,
        }))
    }

    #[test]
    fn double_insert_is_rejected() {
        let mut g = graph();
        let ff = freefrag(&mut g);
        g.worklist_insert(ListId::Buf(BlockNumber(7)), ff).expect("first insert");
        let err = g.add_to_worklist(ff).expect_err("second insert");
        assert!(err.is_fatal());
        assert_eq!(g.buf_deps(BlockNumber(7)), &[ff]);
    }

    #[test]
    fn remove_requires_list_and_cleans_empty_buffer_entry() {
        let mut g = graph();
        let ff = freefrag(&mut g);
        assert!(g.worklist_remove(ff).is_err());
        g.worklist_insert(ListId::Buf(BlockNumber(7)), ff).expect("insert");
        g.worklist_remove(ff).expect("remove");
        assert!(g.bufdeps.is_empty());
        assert!(!g.header(ff).expect("hdr").state.contains(DepState::ONWORKLIST));
    }

    #[test]
    fn free_while_linked_is_rejected() {
        let mut g = graph();
        let ff = freefrag(&mut g);
        g.add_to_worklist(ff).expect("queue");
        assert!(g.workitem_free(ff).is_err());
        g.worklist_remove(ff).expect("dequeue");
        g.workitem_free(ff).expect("free");
        assert!(g.header(ff).is_err(), "freed record is gone");
        assert!(g.workitem_free(ff).is_err());
    }

    #[test]
    fn only_deferred_actions_reach_the_worklist() {
        let mut g = graph();
        let id = g.alloc(InodeDep::new(InodeNumber(5)));
        assert!(g.add_to_worklist(WorkRef::InodeDep(id)).is_err());
    }

    #[test]
    fn completion_frees_are_queued() {
        let mut g = graph();
        let ff = freefrag(&mut g);
        g.deferring = true;
        g.workitem_free(ff).expect("deferred free");
        assert!(g.header(ff).is_ok(), "still allocated until drained");
        g.deferring = false;
        g.freequeue_process();
        assert!(g.header(ff).is_err());
    }

    #[test]
    fn worklist_take_skips_and_preserves_order() {
        let mut g = graph();
        let a = freefrag(&mut g);
        let b = freefrag(&mut g);
        g.add_to_worklist(a).expect("a");
        g.add_to_worklist(b).expect("b");
        let got = g.worklist_take(|_, w| w == a).expect("take");
        assert_eq!(got, Some(b));
        assert_eq!(g.worklist.front(), Some(&a));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn on_list_flag_tracks_membership(ops in proptest::collection::vec((0_usize..6, 0_u8..4), 1..48)) {
            let mut g = graph();
            let items: Vec<WorkRef> = (0..6).map(|_| freefrag(&mut g)).collect();
            for (slot, action) in ops {
                let item = items[slot];
                let linked = g.header(item).expect("hdr").state.contains(DepState::ONWORKLIST);
                let res = match action {
                    0 => g.add_to_worklist(item),
                    1 => g.worklist_insert(ListId::Buf(BlockNumber(7)), item),
                    2 => g.worklist_insert(ListId::GoingAway(BlockNumber(9)), item),
                    _ => g.worklist_remove(item),
                };
                prop_assert_eq!(res.is_ok(), if action == 3 { linked } else { !linked });
            }
            let mut on_lists = g.worklist.len()
                + g.bufdeps.values().map(Vec::len).sum::<usize>()
                + g.goingaway.values().map(Vec::len).sum::<usize>();
            for item in &items {
                let hdr = g.header(*item).expect("hdr");
                prop_assert_eq!(hdr.state.contains(DepState::ONWORKLIST), hdr.link.is_some());
                if hdr.link.is_some() {
                    on_lists -= 1;
                }
            }
            prop_assert_eq!(on_lists, 0);
            prop_assert!(g.bufdeps.values().all(|v| !v.is_empty()));
        }
    }

    #[test]
    fn wedge_latches_first_invariant() {
        let mut g = graph();
        let r: Result<()> = Err(fatal("first"));
        assert!(g.wedge_on(r).is_err());
        let _ = g.wedge_on::<()>(Err(fatal("second")));
        assert_eq!(g.wedged.as_deref(), Some("first"));
        assert!(g.ensure_live().is_err());
    }
}
