#![forbid(unsafe_code)]
//! Deferred work and admission control.
//!
//! Removals, block releases and inode releases that had to wait for the
//! disk are queued on the worklist and run here, in FIFO order, either by
//! the background worker or by an explicit flush. Callers that push the
//! graph past its size limits are throttled by [`Softdep::request_cleanup`].

use crate::deps::WorkRef;
use crate::graph::fatal;
use crate::stats::LimitCounter;
use crate::{Guard, Softdep};
use ffs_error::{FfsError, Result};
use ffs_types::InodeNumber;
use parking_lot::MutexGuard;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Rounds of file flush plus worklist flush attempted before unmount gives up.
const FLUSHFILES_ROUNDS: usize = 10;

thread_local! {
    /// Set while this thread runs worklist items; such a thread is never
    /// throttled, so the handlers cannot recurse into the worklist.
    static IN_WORKLIST: Cell<bool> = const { Cell::new(false) };
}

fn with_worklist_flag<T>(f: impl FnOnce() -> T) -> T {
    let previous = IN_WORKLIST.with(|flag| flag.replace(true));
    let out = f();
    IN_WORKLIST.with(|flag| flag.set(previous));
    out
}

/// Shortage that made a caller ask for cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    /// Too many inode dependencies.
    Inodes,
    /// Too many pending directory removals.
    Removals,
}

/// How a worklist pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Periodic pass: bounded by the configured time budget and abandoned
    /// as soon as a flush asks for the worklist.
    Background,
    /// Drain pass on behalf of [`Softdep::flushworklist`]: runs until the
    /// worklist is empty.
    Flush,
}

impl Softdep {
    /// Run queued work items. Returns how many were processed.
    pub fn process_worklist(&self, mode: PassMode) -> Result<usize> {
        let start = Instant::now();
        {
            let mut g = self.lock()?;
            g.freequeue_process();
            if mode == PassMode::Background {
                if g.worklist_busy < 0 {
                    return Ok(0);
                }
                g.worklist_busy += 1;
            }
        }
        let result = with_worklist_flag(|| self.drain_worklist(mode, start));
        if mode == PassMode::Background {
            let mut g = self.graph.lock();
            g.worklist_busy -= 1;
            if g.worklist_req > 0 && g.worklist_busy == 0 {
                self.worklist_cv.notify_all();
            }
        }
        let count = result?;
        if count > 0 {
            debug!(target: "ffs::softdep", event = "worklist_pass", ?mode, count, elapsed_us = start.elapsed().as_micros() as u64);
        }
        Ok(count)
    }

    fn drain_worklist(&self, mode: PassMode, start: Instant) -> Result<usize> {
        let mut count = 0;
        loop {
            self.service_cleanup_requests()?;
            {
                let mut g = self.lock()?;
                g.freequeue_process();
                if g.worklist.is_empty() {
                    return Ok(count);
                }
            }
            count += self.process_worklist_item(false)?;
            if mode == PassMode::Background {
                if self.graph.lock().worklist_req > 0 {
                    trace!(target: "ffs::softdep", event = "worklist_yield", count);
                    return Ok(count);
                }
                if start.elapsed() >= self.config.worklist_time_budget {
                    return Ok(count);
                }
            }
        }
    }

    /// Honour cleanup requests left by throttled callers.
    fn service_cleanup_requests(&self) -> Result<()> {
        let (inodes, removals) = {
            let g = self.lock()?;
            (g.req_clear_inodedeps > 0, g.req_clear_remove > 0)
        };
        if inodes {
            self.clear_inodedeps()?;
            let mut g = self.graph.lock();
            g.req_clear_inodedeps = g.req_clear_inodedeps.saturating_sub(1);
            self.cleanup_cv.notify_one();
        }
        if removals {
            self.clear_remove()?;
            let mut g = self.graph.lock();
            g.req_clear_remove = g.req_clear_remove.saturating_sub(1);
            self.cleanup_cv.notify_one();
        }
        Ok(())
    }

    /// Run the first eligible item. With `nowait` a removal whose inode is
    /// locked by someone else is passed over. Returns 1 if an item ran.
    pub(crate) fn process_worklist_item(&self, nowait: bool) -> Result<usize> {
        let fs = self.fs()?;
        let mut g = self.lock()?;
        let taken = g.worklist_take(|g, wk| match wk {
            WorkRef::DirRem(rem) if nowait => g.get(rem).is_ok_and(|r| fs.is_inode_locked(r.oldinum)),
            _ => false,
        });
        let Some(item) = g.wedge_on(taken)? else {
            return Ok(0);
        };
        trace!(target: "ffs::softdep", event = "worklist_item", kind = %item.kind(), nowait);
        let handled = match item {
            WorkRef::DirRem(rem) => self.handle_workitem_remove(&mut g, rem),
            WorkRef::FreeBlks(fb) => self.handle_workitem_freeblocks(&mut g, fb),
            WorkRef::FreeFrag(ff) => self.handle_workitem_freefrag(&mut g, ff),
            WorkRef::FreeFile(ff) => self.handle_workitem_freefile(&mut g, ff),
            WorkRef::PageDep(_)
            | WorkRef::InodeDep(_)
            | WorkRef::NewBlk(_)
            | WorkRef::BmSafeMap(_)
            | WorkRef::AllocDirect(_)
            | WorkRef::IndirDep(_)
            | WorkRef::AllocIndir(_)
            | WorkRef::DirAdd(_)
            | WorkRef::Mkdir(_)
            | WorkRef::NewDirBlk(_) => Err(fatal(format_args!("process_worklist: unknown type {}", item.kind()))),
        };
        g.wedge_on(handled)?;
        Ok(1)
    }

    /// Throttle a caller that pushed the graph past a limit. Returns true
    /// when the caller was delayed or did cleanup work, so a lookup should
    /// re-check before allocating.
    pub(crate) fn request_cleanup(&self, g: &mut Guard<'_>, resource: Resource) -> Result<bool> {
        if g.syncer == Some(thread::current().id()) || IN_WORKLIST.with(Cell::get) {
            return Ok(false);
        }
        // A backlogged worklist is helped along inline. Removals of locked
        // inodes are skipped since this caller may hold inode locks.
        if g.worklist.len() > self.config.max_softdeps / 10 {
            let pushed = MutexGuard::unlocked(g, || {
                with_worklist_flag(|| -> Result<usize> {
                    Ok(self.process_worklist_item(true)? + self.process_worklist_item(true)?)
                })
            });
            g.stats.worklist_push += 2;
            pushed?;
            return Ok(true);
        }
        self.speedup_worker();
        match resource {
            Resource::Inodes => {
                g.stats.ino_limit_push += 1;
                g.req_clear_inodedeps += 1;
                g.stat_countp = LimitCounter::Ino;
            }
            Resource::Removals => {
                g.stats.blk_limit_push += 1;
                g.req_clear_remove += 1;
                g.stat_countp = LimitCounter::Blk;
            }
        }
        g.proc_waiting += 1;
        let delay = self.config.effective_tickdelay();
        warn!(target: "ffs::softdep", event = "throttle", ?resource, delay_ms = delay.as_millis() as u64);
        if self.cleanup_cv.wait_for(g, delay).timed_out() {
            match g.stat_countp {
                LimitCounter::Ino => g.stats.ino_limit_hit += 1,
                LimitCounter::Blk => g.stats.blk_limit_hit += 1,
            }
        }
        g.proc_waiting -= 1;
        g.ensure_live()?;
        Ok(true)
    }

    fn speedup_worker(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.unpark();
        }
    }

    /// Whether callers should fall back to synchronous operation because
    /// the graph is at its hard limit.
    pub fn slowdown(&self) -> bool {
        let hard = self.config.max_softdeps_hard();
        let mut g = self.graph.lock();
        if g.num_dirrem < hard / 2 && g.num_inodedep() < hard {
            return false;
        }
        g.stats.sync_limit_hit += 1;
        true
    }

    /// Flush one directory with pending removals, round-robin over the
    /// pagedep table.
    pub(crate) fn clear_remove(&self) -> Result<()> {
        let target = {
            let mut g = self.lock()?;
            let buckets = g.pagedep_hash.bucket_count();
            let mut found = None;
            for _ in 0..buckets {
                let bucket = g.clear_remove_next;
                g.clear_remove_next = (bucket + 1) % buckets;
                for &(_, pd) in g.pagedep_hash.bucket(bucket) {
                    if g.get(pd).is_ok_and(|p| !p.dirremhd.is_empty()) {
                        found = Some(g.get(pd)?.ino);
                        break;
                    }
                }
                if found.is_some() {
                    break;
                }
            }
            found
        };
        let Some(ino) = target else {
            return Ok(());
        };
        let fs = self.fs()?;
        if let Err(err) = fs.vget(ino) {
            self.softdep_error("clear_remove: vget", &err);
            return Ok(());
        }
        if let Err(err) = fs.fsync(ino, false) {
            self.softdep_error("clear_remove: fsync", &err);
        }
        self.drain_output(ino);
        if let Err(err) = fs.release(ino) {
            self.softdep_error("clear_remove: release", &err);
        }
        trace!(target: "ffs::softdep", event = "clear_remove", ino = ino.0);
        Ok(())
    }

    /// Flush the inodes sharing an inode block with some inodedep, the
    /// last one synchronously so that the block reaches the disk.
    pub(crate) fn clear_inodedeps(&self) -> Result<()> {
        let inopb = u64::from(self.geometry.inopb());
        let (firstino, lastino) = {
            let mut g = self.lock()?;
            let buckets = g.inodedep_hash.bucket_count();
            let mut picked = None;
            for _ in 0..buckets {
                let bucket = g.clear_inodedeps_next;
                g.clear_inodedeps_next = (bucket + 1) % buckets;
                if let Some(&(ino, _)) = g.inodedep_hash.bucket(bucket).first() {
                    picked = Some(ino);
                    break;
                }
            }
            let Some(ino) = picked else {
                return Ok(());
            };
            let firstino = ino.0 - ino.0 % inopb;
            let mut lastino = firstino + inopb - 1;
            while lastino > firstino && g.find_inodedep(InodeNumber(lastino)).is_none() {
                lastino -= 1;
            }
            (firstino, lastino)
        };
        let fs = self.fs()?;
        for n in firstino..=lastino {
            let ino = InodeNumber(n);
            if self.lock()?.find_inodedep(ino).is_none() {
                continue;
            }
            if let Err(err) = fs.vget(ino) {
                self.softdep_error("clear_inodedeps: vget", &err);
                return Ok(());
            }
            if n == lastino {
                if let Err(err) = fs.fsync(ino, true) {
                    self.softdep_error("clear_inodedeps: fsync1", &err);
                }
            } else {
                if let Err(err) = fs.fsync(ino, false) {
                    self.softdep_error("clear_inodedeps: fsync2", &err);
                }
                self.drain_output(ino);
            }
            if let Err(err) = fs.release(ino) {
                self.softdep_error("clear_inodedeps: release", &err);
            }
        }
        trace!(target: "ffs::softdep", event = "clear_inodedeps", firstino, lastino);
        Ok(())
    }

    /// Drain the worklist completely, flushing the device between passes
    /// so that the writes it issues produce the next round of work.
    /// Returns the number of items processed.
    pub fn flushworklist(&self) -> Result<usize> {
        {
            let mut g = self.lock()?;
            while g.worklist_busy != 0 {
                g.worklist_req += 1;
                self.worklist_cv.wait(&mut g);
                g.worklist_req -= 1;
            }
            g.worklist_busy = -1;
        }
        let mut total = 0;
        let result = loop {
            match self.process_worklist(PassMode::Flush) {
                Ok(0) => break Ok(()),
                Ok(count) => total += count,
                Err(err) => break Err(err),
            }
            if let Err(err) = self.flush_device() {
                break Err(err);
            }
        };
        let mut g = self.graph.lock();
        g.worklist_busy = 0;
        if g.worklist_req > 0 {
            self.worklist_cv.notify_all();
        }
        drop(g);
        result.map(|()| total)
    }

    /// Alternate flushing every file with draining the worklist until no
    /// more work appears. Gives up with [`FfsError::Busy`] after ten rounds.
    pub fn flushfiles(&self) -> Result<()> {
        let fs = self.fs()?;
        let mut settled = false;
        for round in 0..FLUSHFILES_ROUNDS {
            fs.flush_files()?;
            let count = self.flushworklist()?;
            trace!(target: "ffs::softdep", event = "flushfiles_round", round, count);
            if count == 0 {
                settled = true;
                break;
            }
        }
        fs.flush_files()?;
        if !settled {
            warn!(target: "ffs::softdep", event = "flushfiles_busy", rounds = FLUSHFILES_ROUNDS);
            return Err(FfsError::Busy);
        }
        Ok(())
    }

    /// Start the background worker. It runs a [`PassMode::Background`] pass
    /// every `worklist_interval`, or sooner when a throttled caller wakes it.
    pub fn spawn_worker(self: &Arc<Self>) -> Result<WorkerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let engine = Arc::downgrade(self);
        let interval = self.config.worklist_interval;
        let thread = thread::Builder::new()
            .name("softdep-worker".to_owned())
            .spawn(move || worker_loop(&engine, &flag, interval))?;
        *self.worker.lock() = Some(thread.thread().clone());
        info!(target: "ffs::softdep", event = "worker_started", interval_ms = interval.as_millis() as u64);
        Ok(WorkerHandle {
            shutdown,
            thread: Some(thread),
            engine: Arc::downgrade(self),
        })
    }
}

fn worker_loop(engine: &Weak<Softdep>, shutdown: &AtomicBool, interval: Duration) {
    if let Some(softdep) = engine.upgrade() {
        softdep.graph.lock().syncer = Some(thread::current().id());
    }
    while !shutdown.load(Ordering::Acquire) {
        let Some(softdep) = engine.upgrade() else {
            break;
        };
        match softdep.process_worklist(PassMode::Background) {
            Ok(_) => {}
            Err(err) if err.is_fatal() => {
                error!(target: "ffs::softdep", event = "worker_stopped", error = %err);
                break;
            }
            Err(err) => softdep.softdep_error("process_worklist", &err),
        }
        drop(softdep);
        thread::park_timeout(interval);
    }
}

/// Handle on the background worker; stops it when dropped.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    engine: Weak<Softdep>,
}

impl WorkerHandle {
    /// Ask the worker to exit and wait for it.
    pub fn stop(mut self) {
        self.shutdown_worker();
    }

    fn shutdown_worker(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        thread.thread().unpark();
        if thread.join().is_err() {
            error!(target: "ffs::softdep", event = "worker_panicked");
        }
        if let Some(softdep) = self.engine.upgrade() {
            softdep.worker.lock().take();
            softdep.graph.lock().syncer = None;
        }
        info!(target: "ffs::softdep", event = "worker_stopped");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{DepState, DirRem, InodeDep, PageDep, WorkHeader};
    use crate::lookup::LookupFlags;
    use crate::{FsOps, LinkCounts, SoftdepConfig};
    use ffs_block::{BufferCache, MemoryByteDevice};
    use ffs_types::{BlockNumber, FsFormat, FsGeometry, LogicalBlock};
    use parking_lot::Mutex;

    fn engine(config: SoftdepConfig) -> Arc<Softdep> {
        let geometry = FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 2, 4096, 128).expect("geometry");
        let len = usize::try_from(geometry.total_frags() * u64::from(geometry.fsize)).expect("image length");
        let cache = Arc::new(BufferCache::new(Arc::new(MemoryByteDevice::new(len)), geometry.fsize).expect("cache"));
        Softdep::new(geometry, config, cache)
    }

    /// Sixteen soft and seventeen hard dependencies.
    fn small() -> SoftdepConfig {
        SoftdepConfig::for_vnodes(4)
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Filesystem side that only records the flushes it is asked for.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(&'static str, InodeNumber, bool)>>,
    }

    impl Recorder {
        fn fsyncs(&self) -> Vec<(InodeNumber, bool)> {
            self.calls
                .lock()
                .iter()
                .filter(|(op, ..)| *op == "fsync")
                .map(|&(_, ino, wait)| (ino, wait))
                .collect()
        }
    }

    impl FsOps for Recorder {
        fn free_blocks(&self, _ino: InodeNumber, _blkno: BlockNumber, _size: u32) -> Result<()> {
            Ok(())
        }

        fn free_inode(&self, _ino: InodeNumber, _mode: u16) -> Result<()> {
            Ok(())
        }

        fn vget(&self, ino: InodeNumber) -> Result<()> {
            self.calls.lock().push(("vget", ino, false));
            Ok(())
        }

        fn release(&self, ino: InodeNumber) -> Result<()> {
            self.calls.lock().push(("release", ino, false));
            Ok(())
        }

        fn is_inode_locked(&self, _ino: InodeNumber) -> bool {
            false
        }

        fn adjust_link_count(&self, _ino: InodeNumber, _delta: i16) -> Result<LinkCounts> {
            Ok(LinkCounts { nlink: 1, effnlink: 1 })
        }

        fn truncate(&self, _ino: InodeNumber) -> Result<()> {
            Ok(())
        }

        fn update(&self, _ino: InodeNumber, _wait: bool) -> Result<()> {
            Ok(())
        }

        fn fsync(&self, ino: InodeNumber, wait: bool) -> Result<()> {
            self.calls.lock().push(("fsync", ino, wait));
            Ok(())
        }

        fn bmap(&self, _ino: InodeNumber, _lbn: LogicalBlock) -> Result<Option<(BlockNumber, usize)>> {
            Ok(None)
        }

        fn flush_files(&self) -> Result<()> {
            Ok(())
        }
    }

    fn attach(engine: &Softdep) -> Arc<Recorder> {
        let fs = Arc::new(Recorder::default());
        let weak: Weak<Recorder> = Arc::downgrade(&fs);
        engine.set_fs_ops(weak);
        fs
    }

    fn add_inodedep(engine: &Softdep, ino: u64) {
        let mut g = engine.graph.lock();
        let idx = g.alloc(InodeDep::new(InodeNumber(ino)));
        g.inodedep_hash.insert(InodeNumber(ino), idx);
    }

    #[test]
    fn worklist_flag_nests_and_restores() {
        assert!(!IN_WORKLIST.with(Cell::get));
        with_worklist_flag(|| {
            assert!(IN_WORKLIST.with(Cell::get));
            with_worklist_flag(|| assert!(IN_WORKLIST.with(Cell::get)));
            assert!(IN_WORKLIST.with(Cell::get));
        });
        assert!(!IN_WORKLIST.with(Cell::get));
    }

    #[test]
    fn slowdown_flips_at_the_hard_limit() {
        let engine = engine(small());
        let hard = engine.config().max_softdeps_hard();
        assert_eq!(hard, 17);
        for ino in 0..hard as u64 - 1 {
            add_inodedep(&engine, 100 + ino);
        }
        assert!(!engine.slowdown());
        assert_eq!(engine.stats().sync_limit_hit, 0);

        add_inodedep(&engine, 200);
        assert!(engine.slowdown());
        assert_eq!(engine.stats().sync_limit_hit, 1);
    }

    #[test]
    fn slowdown_counts_pending_removals_at_half_the_limit() {
        let engine = engine(small());
        let half = engine.config().max_softdeps_hard() / 2;
        engine.graph.lock().num_dirrem = half - 1;
        assert!(!engine.slowdown());
        engine.graph.lock().num_dirrem = half;
        assert!(engine.slowdown());
        assert_eq!(engine.stats().sync_limit_hit, 1);
    }

    #[test]
    fn lookup_past_the_limit_is_throttled_until_the_timer() {
        let engine = engine(small());
        let max = engine.config().max_softdeps as u64;
        let lookup = |ino: u64| {
            engine
                .run(|g| engine.inodedep_lookup(g, InodeNumber(ino), LookupFlags::DEPALLOC).map(|_| ()))
                .expect("lookup");
        };
        for ino in 0..=max {
            lookup(100 + ino);
        }
        let stats = engine.stats();
        assert_eq!(stats.inodedeps, max + 1);
        assert_eq!((stats.ino_limit_push, stats.ino_limit_hit), (0, 0));

        let start = Instant::now();
        lookup(100 + max + 1);
        assert!(start.elapsed() >= engine.config().effective_tickdelay());
        let stats = engine.stats();
        assert_eq!(stats.ino_limit_push, 1);
        assert_eq!(stats.ino_limit_hit, 1, "nobody serviced the request");
        assert_eq!(stats.inodedeps, max + 2, "the caller allocates after the delay");
        let g = engine.graph.lock();
        assert_eq!(g.req_clear_inodedeps, 1);
        assert_eq!(g.proc_waiting, 0);
    }

    #[test]
    fn serviced_request_wakes_the_throttled_caller() {
        let engine = engine(SoftdepConfig {
            tickdelay: Duration::from_secs(30),
            ..small()
        });
        let waiter = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut g = engine.lock().expect("lock");
                engine.request_cleanup(&mut g, Resource::Removals).expect("cleanup")
            })
        };
        wait_until("the caller to sleep", || engine.graph.lock().proc_waiting == 1);
        engine.service_cleanup_requests().expect("service");
        assert!(waiter.join().expect("waiter"));

        let stats = engine.stats();
        assert_eq!(stats.blk_limit_push, 1);
        assert_eq!(stats.blk_limit_hit, 0);
        assert_eq!(engine.graph.lock().req_clear_remove, 0);
    }

    #[test]
    fn syncer_and_worklist_threads_are_never_throttled() {
        let engine = engine(small());
        let mut g = engine.lock().expect("lock");
        g.syncer = Some(thread::current().id());
        assert!(!engine.request_cleanup(&mut g, Resource::Inodes).expect("syncer"));
        g.syncer = None;
        assert!(!with_worklist_flag(|| engine.request_cleanup(&mut g, Resource::Removals)).expect("worklist"));
        assert_eq!(g.stats.ino_limit_push + g.stats.blk_limit_push, 0);
        assert_eq!(g.proc_waiting, 0);
    }

    #[test]
    fn clear_inodedeps_flushes_one_inode_block_ending_synchronously() {
        let engine = engine(small());
        let fs = attach(&engine);
        let inopb = u64::from(engine.geometry().inopb());
        for ino in [inopb * 3 + 4, inopb * 3 + 5, inopb * 3 + 9] {
            add_inodedep(&engine, ino);
        }
        engine.clear_inodedeps().expect("clear");
        assert_eq!(
            fs.fsyncs(),
            vec![
                (InodeNumber(inopb * 3 + 4), false),
                (InodeNumber(inopb * 3 + 5), false),
                (InodeNumber(inopb * 3 + 9), true),
            ]
        );
        let calls = fs.calls.lock();
        let vgets = calls.iter().filter(|(op, ..)| *op == "vget").count();
        let releases = calls.iter().filter(|(op, ..)| *op == "release").count();
        assert_eq!((vgets, releases), (3, 3));
    }

    #[test]
    fn clear_remove_flushes_a_directory_with_pending_removals() {
        let engine = engine(small());
        let fs = attach(&engine);
        engine.clear_remove().expect("nothing pending");
        assert!(fs.calls.lock().is_empty());

        let pd = {
            let mut g = engine.graph.lock();
            let idle = g.alloc(PageDep::new(InodeNumber(41), LogicalBlock(0)));
            g.pagedep_hash.insert((InodeNumber(41), LogicalBlock(0)), idle);
            let pd = g.alloc(PageDep::new(InodeNumber(40), LogicalBlock(1)));
            g.pagedep_hash.insert((InodeNumber(40), LogicalBlock(1)), pd);
            let rem = g.alloc(DirRem {
                hdr: WorkHeader::new(DepState::empty()),
                oldinum: InodeNumber(77),
                dirinum: InodeNumber(40),
                pagedep: Some(pd),
            });
            g.get_mut(pd).expect("page").dirremhd.push(rem);
            pd
        };
        engine.clear_remove().expect("clear");
        assert_eq!(fs.fsyncs(), vec![(InodeNumber(40), false)]);
        assert_eq!(
            fs.calls.lock().iter().map(|(op, ..)| *op).collect::<Vec<_>>(),
            vec!["vget", "fsync", "release"]
        );

        engine.graph.lock().get_mut(pd).expect("page").dirremhd.clear();
        engine.clear_remove().expect("drained");
        assert_eq!(fs.fsyncs().len(), 1);
    }

    #[test]
    fn worker_runs_until_stopped() {
        let engine = engine(SoftdepConfig {
            worklist_interval: Duration::from_millis(5),
            ..small()
        });
        let _fs = attach(&engine);
        let handle = engine.spawn_worker().expect("spawn");
        assert!(engine.worker.lock().is_some());
        wait_until("the worker to register", || engine.graph.lock().syncer.is_some());
        handle.stop();
        assert!(engine.worker.lock().is_none());
        assert!(engine.graph.lock().syncer.is_none());

        drop(engine.spawn_worker().expect("respawn"));
        assert!(engine.worker.lock().is_none(), "dropping the handle stops the worker");
    }
}
