#![forbid(unsafe_code)]
//! Crash replay over generated workloads.
//!
//! A [`Workload`] is a sequence of [`Step`]s built around the dependency
//! paths soft updates orders: directory adds and removes, renames that
//! replace a name or move a directory under a new parent, block allocation
//! through direct and indirect pointers, truncation, and `fsync`/`sync`.
//! It runs on a [`MiniFs`] mounted over a [`RecordingDevice`]. The image
//! after any prefix of the recorded writes is what a power failure at that
//! moment leaves behind, and every [`Cut`] of the workload rebuilds one:
//!
//! - [`fsck::check`] must find no violation (leaks are allowed),
//! - whatever an earlier `fsync` or `sync` made durable must be present,
//! - the image must mount, sync and unmount into a consistent state.
//!
//! The completed run must unmount into an image that matches the model
//! exactly with nothing leaked.

use crate::fsck::{self, FsckReport, Image};
use crate::minifs::MiniFs;
use anyhow::{Context, Result, bail};
use ffs_block::{ByteDevice, MemoryByteDevice};
use ffs_softdep::SoftdepConfig;
use ffs_types::{InodeNumber, LogicalBlock, NDADDR};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const ROOT: &str = "/";

/// Blocks past the direct pointers that writes may land on.
const INDIRECT_SPAN: usize = 8;

// ── Recording device ────────────────────────────────────────────────────────

/// One write issued to a [`RecordingDevice`].
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// In-memory device that keeps every write in issue order.
#[derive(Debug)]
pub struct RecordingDevice {
    inner: MemoryByteDevice,
    log: Mutex<Vec<WriteRecord>>,
}

impl RecordingDevice {
    /// Start from a copy of `base`.
    pub fn new(base: &[u8]) -> ffs_error::Result<Self> {
        let inner = MemoryByteDevice::new(base.len());
        inner.write_all_at(0, base)?;
        Ok(Self {
            inner,
            log: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.log.lock().len()
    }

    #[must_use]
    pub fn records(&self) -> Vec<WriteRecord> {
        self.log.lock().clone()
    }
}

impl ByteDevice for RecordingDevice {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> ffs_error::Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> ffs_error::Result<()> {
        let mut log = self.log.lock();
        self.inner.write_all_at(offset, buf)?;
        log.push(WriteRecord {
            offset,
            data: buf.to_vec(),
        });
        Ok(())
    }

    fn sync(&self) -> ffs_error::Result<()> {
        Ok(())
    }
}

// ── Workloads ───────────────────────────────────────────────────────────────

/// One namespace or data operation. Paths are absolute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Mkdir { path: String },
    Rmdir { path: String },
    Create { path: String },
    Write { path: String, lbn: u32, data: Vec<u8> },
    Truncate { path: String },
    Unlink { path: String },
    /// Rename a file, replacing `to` if it names a file.
    Rename { from: String, to: String },
    /// Rename a directory to a fresh name, possibly under a new parent.
    MoveDir { from: String, to: String },
    Fsync { path: String },
    Sync,
}

/// Power failure after every write issued before `step` plus `torn` of the
/// writes that step issued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cut {
    pub step: usize,
    pub torn: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workload {
    pub id: u32,
    pub seed: u64,
    pub steps: Vec<Step>,
    pub cuts: Vec<Cut>,
}

/// What one cut found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutOutcome {
    pub cut: Cut,
    /// Device writes present in the image.
    pub writes: usize,
    /// Steps whose writes all reached the image.
    pub steps_done: usize,
    pub errors: Vec<String>,
    pub leaked_inodes: u64,
    pub leaked_frags: u64,
}

impl CutOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadOutcome {
    pub id: u32,
    pub seed: u64,
    pub steps: usize,
    pub writes: usize,
    /// Problems with the image after the clean unmount.
    pub final_errors: Vec<String>,
    pub cuts: Vec<CutOutcome>,
    pub elapsed_us: u64,
}

impl WorkloadOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.final_errors.is_empty() && self.cuts.iter().all(CutOutcome::passed)
    }
}

/// Settings of [`run_replay`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub workloads: u32,
    pub min_steps: usize,
    pub max_steps: usize,
    /// Every workload seed derives from this one.
    pub seed: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            workloads: 20,
            min_steps: 20,
            max_steps: 80,
            seed: 0x50F7_0DE9_5EED_0001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub workloads: u32,
    /// Ids of the workloads with at least one error.
    pub failed: Vec<u32>,
    pub elapsed_us: u64,
    pub outcomes: Vec<WorkloadOutcome>,
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// Split an absolute path into its parent directory and final name.
fn split(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { ROOT } else { parent }, name))
}

fn parent_of(path: &str) -> Option<&str> {
    split(path).map(|(parent, _)| parent)
}

/// Whether `path` lies strictly below directory `dir`.
fn under(path: &str, dir: &str) -> bool {
    if dir == ROOT {
        return path != ROOT && path.starts_with('/');
    }
    path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// `path` below `from` moved below `to`.
fn rebase(path: &str, from: &str, to: &str) -> String {
    format!("{to}{}", &path[from.len()..])
}

// ── Model ───────────────────────────────────────────────────────────────────

/// The namespace and file contents a workload should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Model {
    dirs: BTreeSet<String>,
    /// File contents by logical block.
    files: BTreeMap<String, BTreeMap<u32, Vec<u8>>>,
}

impl Model {
    fn new() -> Self {
        Self {
            dirs: BTreeSet::from([ROOT.to_owned()]),
            files: BTreeMap::new(),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path)
    }

    fn is_empty_dir(&self, dir: &str) -> bool {
        !self.dirs.iter().any(|d| under(d, dir)) && !self.files.keys().any(|f| under(f, dir))
    }

    fn fresh_target(&self, path: &str) -> Result<()> {
        let parent = parent_of(path).with_context(|| format!("no parent: {path}"))?;
        if !self.dirs.contains(parent) {
            bail!("parent missing: {parent}");
        }
        if self.exists(path) {
            bail!("already exists: {path}");
        }
        Ok(())
    }

    fn file_mut(&mut self, path: &str) -> Result<&mut BTreeMap<u32, Vec<u8>>> {
        self.files.get_mut(path).with_context(|| format!("no such file: {path}"))
    }

    /// Paths a step changes, split into files and directories. Taken before
    /// the step is applied.
    fn touched(&self, step: &Step) -> (Vec<String>, Vec<String>) {
        match step {
            Step::Create { path } | Step::Write { path, .. } | Step::Truncate { path } | Step::Unlink { path } => {
                (vec![path.clone()], Vec::new())
            }
            Step::Mkdir { path } | Step::Rmdir { path } => (Vec::new(), vec![path.clone()]),
            Step::Rename { from, to } => (vec![from.clone(), to.clone()], Vec::new()),
            Step::MoveDir { from, to } => {
                let mut dirs = vec![from.clone(), to.clone()];
                let mut files = Vec::new();
                for dir in self.dirs.iter().filter(|d| under(d, from)) {
                    dirs.push(dir.clone());
                    dirs.push(rebase(dir, from, to));
                }
                for file in self.files.keys().filter(|f| under(f, from)) {
                    files.push(file.clone());
                    files.push(rebase(file, from, to));
                }
                (files, dirs)
            }
            Step::Fsync { .. } | Step::Sync => (Vec::new(), Vec::new()),
        }
    }

    fn apply(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Mkdir { path } => {
                self.fresh_target(path)?;
                self.dirs.insert(path.clone());
            }
            Step::Rmdir { path } => {
                if path == ROOT || !self.dirs.contains(path) {
                    bail!("not a removable directory: {path}");
                }
                if !self.is_empty_dir(path) {
                    bail!("directory not empty: {path}");
                }
                self.dirs.remove(path);
            }
            Step::Create { path } => {
                self.fresh_target(path)?;
                self.files.insert(path.clone(), BTreeMap::new());
            }
            Step::Write { path, lbn, data } => {
                self.file_mut(path)?.insert(*lbn, data.clone());
            }
            Step::Truncate { path } => self.file_mut(path)?.clear(),
            Step::Unlink { path } => {
                self.files.remove(path).with_context(|| format!("no such file: {path}"))?;
            }
            Step::Rename { from, to } => {
                if self.dirs.contains(to) {
                    bail!("rename onto a directory: {to}");
                }
                let parent = parent_of(to).with_context(|| format!("no parent: {to}"))?;
                if !self.dirs.contains(parent) {
                    bail!("parent missing: {parent}");
                }
                let blocks = self.files.remove(from).with_context(|| format!("no such file: {from}"))?;
                self.files.insert(to.clone(), blocks);
            }
            Step::MoveDir { from, to } => {
                if from == ROOT || !self.dirs.contains(from) {
                    bail!("not a movable directory: {from}");
                }
                if to == from || under(to, from) {
                    bail!("cannot move {from} below itself");
                }
                self.fresh_target(to)?;
                let dirs: Vec<String> = self
                    .dirs
                    .iter()
                    .filter(|d| *d == from || under(d, from))
                    .cloned()
                    .collect();
                for dir in dirs {
                    self.dirs.remove(&dir);
                    self.dirs.insert(rebase(&dir, from, to));
                }
                let files: Vec<String> = self.files.keys().filter(|f| under(f, from)).cloned().collect();
                for file in files {
                    if let Some(blocks) = self.files.remove(&file) {
                        self.files.insert(rebase(&file, from, to), blocks);
                    }
                }
            }
            Step::Fsync { path } => {
                if !self.exists(path) {
                    bail!("fsync of missing path: {path}");
                }
            }
            Step::Sync => {}
        }
        Ok(())
    }
}

// ── Planner ─────────────────────────────────────────────────────────────────

/// splitmix64 stream; workloads only need to be reproducible from a seed.
#[derive(Debug, Clone)]
struct Dice(u64);

impl Dice {
    fn roll(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        let n = u64::try_from(n).unwrap_or(u64::MAX);
        usize::try_from(self.roll() % n).unwrap_or(0)
    }

    fn chance(&mut self, percent: usize) -> bool {
        self.below(100) < percent
    }

    fn pick<T: Clone>(&mut self, items: &[T]) -> Option<T> {
        if items.is_empty() {
            None
        } else {
            Some(items[self.below(items.len())].clone())
        }
    }
}

/// Builds a workload one recipe at a time, keeping a model so that every
/// step it emits is valid.
struct Planner {
    dice: Dice,
    model: Model,
    names: u32,
    steps: Vec<Step>,
}

impl Planner {
    fn new(seed: u64) -> Self {
        Self {
            dice: Dice(seed),
            model: Model::new(),
            names: 0,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, step: Step) -> Result<()> {
        self.model.apply(&step)?;
        self.steps.push(step);
        Ok(())
    }

    /// A name never used before. Some are long so that directory entries
    /// vary in size.
    fn fresh(&mut self, dir: &str, prefix: &str) -> String {
        self.names += 1;
        let name = if self.dice.chance(15) {
            format!("{prefix}{:04}-{}", self.names, "n".repeat(48))
        } else {
            format!("{prefix}{:04}", self.names)
        };
        join(dir, &name)
    }

    fn dirs(&self) -> Vec<String> {
        self.model.dirs.iter().cloned().collect()
    }

    fn files(&self) -> Vec<String> {
        self.model.files.keys().cloned().collect()
    }

    fn any_dir(&mut self) -> String {
        let dirs = self.dirs();
        self.dice.pick(&dirs).unwrap_or_else(|| ROOT.to_owned())
    }

    fn payload(&mut self) -> Vec<u8> {
        let len = 24 + self.dice.below(200);
        let step = self.steps.len();
        let mut data: Vec<u8> = (0..len).map(|_| self.dice.roll().to_le_bytes()[3]).collect();
        for (slot, byte) in data.iter_mut().zip(format!("step={step:05};").bytes()) {
            *slot = byte;
        }
        data
    }

    fn lbn(&mut self) -> u32 {
        let lbn = if self.dice.chance(30) {
            NDADDR + self.dice.below(INDIRECT_SPAN)
        } else {
            self.dice.below(NDADDR)
        };
        u32::try_from(lbn).unwrap_or(0)
    }

    fn maybe_fsync(&mut self, path: String, percent: usize) -> Result<()> {
        if self.dice.chance(percent) {
            self.push(Step::Fsync { path })?;
        }
        Ok(())
    }

    fn recipe(&mut self) -> Result<()> {
        match self.dice.below(100) {
            0..14 => self.add_file(),
            14..34 => self.grow(),
            34..40 => self.shrink(),
            40..49 => self.remove(),
            49..56 => self.replace(),
            56..62 => self.relocate(),
            62..70 => self.add_dir(),
            70..75 => self.move_dir(),
            75..80 => self.prune_dir(),
            80..86 => self.churn(),
            86..95 => self.fsync_any(),
            _ => self.push(Step::Sync),
        }
    }

    /// Directory add, usually followed by the first block allocation.
    fn add_file(&mut self) -> Result<()> {
        let dir = self.any_dir();
        let path = self.fresh(&dir, "f");
        self.push(Step::Create { path: path.clone() })?;
        if self.dice.chance(60) {
            let (lbn, data) = (self.lbn(), self.payload());
            self.push(Step::Write {
                path: path.clone(),
                lbn,
                data,
            })?;
        }
        self.maybe_fsync(path, 25)
    }

    /// Block allocation through a direct or an indirect pointer, or an
    /// overwrite of a block that is already mapped.
    fn grow(&mut self) -> Result<()> {
        let files = self.files();
        let Some(path) = self.dice.pick(&files) else {
            return self.add_file();
        };
        let (lbn, data) = (self.lbn(), self.payload());
        self.push(Step::Write {
            path: path.clone(),
            lbn,
            data,
        })?;
        self.maybe_fsync(path, 20)
    }

    fn shrink(&mut self) -> Result<()> {
        let files: Vec<String> = self
            .model
            .files
            .iter()
            .filter(|(_, blocks)| !blocks.is_empty())
            .map(|(path, _)| path.clone())
            .collect();
        let Some(path) = self.dice.pick(&files) else {
            return self.grow();
        };
        self.push(Step::Truncate { path: path.clone() })?;
        self.maybe_fsync(path, 30)
    }

    fn remove(&mut self) -> Result<()> {
        let files = self.files();
        let Some(path) = self.dice.pick(&files) else {
            return self.add_file();
        };
        self.push(Step::Unlink { path: path.clone() })?;
        let dir = parent_of(&path).unwrap_or(ROOT).to_owned();
        self.maybe_fsync(dir, 30)
    }

    /// Rename over an existing file: one entry changes inode in place.
    fn replace(&mut self) -> Result<()> {
        let files = self.files();
        if files.len() < 2 {
            return self.add_file();
        }
        let from = files[self.dice.below(files.len())].clone();
        let others: Vec<String> = files.into_iter().filter(|f| *f != from).collect();
        let Some(to) = self.dice.pick(&others) else {
            return self.add_file();
        };
        self.push(Step::Rename { from, to: to.clone() })?;
        self.maybe_fsync(to, 30)
    }

    /// Move a file to a fresh name, usually in another directory.
    fn relocate(&mut self) -> Result<()> {
        let files = self.files();
        let Some(from) = self.dice.pick(&files) else {
            return self.add_file();
        };
        let dir = self.any_dir();
        let to = self.fresh(&dir, "r");
        self.push(Step::Rename { from, to: to.clone() })?;
        self.maybe_fsync(to, 30)
    }

    fn add_dir(&mut self) -> Result<()> {
        let parent = self.any_dir();
        let path = self.fresh(&parent, "d");
        self.push(Step::Mkdir { path: path.clone() })?;
        if self.dice.chance(40) {
            let child = self.fresh(&path, "f");
            self.push(Step::Create { path: child })?;
        }
        self.maybe_fsync(path, 30)
    }

    /// Move a directory with whatever it holds; `..` is rewritten when the
    /// parent changes.
    fn move_dir(&mut self) -> Result<()> {
        let movable: Vec<String> = self.dirs().into_iter().filter(|d| d != ROOT).collect();
        let Some(from) = self.dice.pick(&movable) else {
            return self.add_dir();
        };
        let targets: Vec<String> = self
            .dirs()
            .into_iter()
            .filter(|d| *d != from && !under(d, &from))
            .collect();
        let Some(parent) = self.dice.pick(&targets) else {
            return self.add_dir();
        };
        let to = self.fresh(&parent, "m");
        self.push(Step::MoveDir { from, to: to.clone() })?;
        self.maybe_fsync(to, 30)
    }

    fn prune_dir(&mut self) -> Result<()> {
        let empty: Vec<String> = self
            .dirs()
            .into_iter()
            .filter(|d| d != ROOT && self.model.is_empty_dir(d))
            .collect();
        let Some(path) = self.dice.pick(&empty) else {
            return self.add_dir();
        };
        self.push(Step::Rmdir { path: path.clone() })?;
        let parent = parent_of(&path).unwrap_or(ROOT).to_owned();
        self.maybe_fsync(parent, 30)
    }

    /// Add a name and remove it again before anything is flushed, then
    /// reuse it.
    fn churn(&mut self) -> Result<()> {
        let dir = self.any_dir();
        let path = self.fresh(&dir, "c");
        self.push(Step::Create { path: path.clone() })?;
        let data = self.payload();
        self.push(Step::Write {
            path: path.clone(),
            lbn: 0,
            data,
        })?;
        self.push(Step::Unlink { path: path.clone() })?;
        self.push(Step::Create { path })
    }

    fn fsync_any(&mut self) -> Result<()> {
        let mut paths = self.dirs();
        paths.extend(self.files());
        let path = self.dice.pick(&paths).unwrap_or_else(|| ROOT.to_owned());
        self.push(Step::Fsync { path })
    }
}

/// Seed of workload `id` in a run seeded with `base`.
#[must_use]
pub fn workload_seed(base: u64, id: u32) -> u64 {
    base.rotate_left(17) ^ u64::from(id).wrapping_mul(0xD6E8_FEB8_6659_FD93)
}

/// Build the workload for `seed`. It has between `min_steps` and
/// `max_steps` steps and up to four cuts.
pub fn plan_workload(id: u32, seed: u64, min_steps: usize, max_steps: usize) -> Result<Workload> {
    if min_steps == 0 || max_steps < min_steps {
        bail!("step range {min_steps}..={max_steps} is empty");
    }
    let mut planner = Planner::new(seed);
    let len = min_steps + planner.dice.below(max_steps - min_steps + 1);
    while planner.steps.len() < len {
        planner.recipe()?;
    }
    // Multi-step recipes may overshoot; any prefix of a valid workload is valid.
    planner.steps.truncate(len);

    let mut cuts = BTreeSet::new();
    let wanted = 1 + planner.dice.below(4);
    while cuts.len() < wanted {
        let step = planner.dice.below(len);
        let torn = planner.dice.below(4);
        cuts.insert(Cut { step, torn });
    }
    Ok(Workload {
        id,
        seed,
        steps: planner.steps,
        cuts: cuts.into_iter().collect(),
    })
}

// ── Expectations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expectation {
    File(BTreeMap<u32, Vec<u8>>),
    Absent,
    Directory(bool),
}

/// What must be on disk from each write index on. `None` forgets an
/// earlier expectation once a later step touches the path.
#[derive(Debug, Default)]
struct ExpectationLog {
    events: Vec<(usize, String, Option<Expectation>)>,
    /// Directories whose path is known to be on disk.
    durable: BTreeSet<String>,
    /// Roots of directory moves since the last sync. Two names may reach
    /// the same directory below these, so nothing there is expected.
    unsettled: BTreeSet<String>,
    seen_files: BTreeSet<String>,
    seen_dirs: BTreeSet<String>,
}

impl ExpectationLog {
    fn new() -> Self {
        let mut log = Self::default();
        log.durable.insert(ROOT.to_owned());
        log.expect(0, ROOT, Expectation::Directory(true));
        log
    }

    fn expect(&mut self, writes: usize, path: &str, expectation: Expectation) {
        self.events.push((writes, path.to_owned(), Some(expectation)));
    }

    fn unsettled(&self, path: &str) -> bool {
        self.unsettled.iter().any(|root| path == root || under(path, root))
    }

    fn parent_durable(&self, path: &str) -> bool {
        parent_of(path).is_some_and(|parent| self.durable.contains(parent))
    }

    /// Called with the model as it was before `step`.
    fn begin(&mut self, step: &Step, model: &Model, writes: usize) {
        let (files, dirs) = model.touched(step);
        for path in files.iter().chain(&dirs) {
            self.events.push((writes, path.clone(), None));
        }
        match step {
            Step::Rmdir { path } => {
                self.durable.remove(path);
            }
            Step::MoveDir { from, to } => {
                self.durable.retain(|dir| dir != from && !under(dir, from));
                self.unsettled.insert(from.clone());
                self.unsettled.insert(to.clone());
            }
            _ => {}
        }
        self.seen_files.extend(files);
        self.seen_dirs.extend(dirs);
    }

    /// Called with the model as it is after `step`.
    fn commit(&mut self, step: &Step, model: &Model, writes: usize) {
        match step {
            Step::Sync => self.settle(model, writes),
            Step::Fsync { path } if !self.unsettled(path) => {
                if let Some(blocks) = model.files.get(path) {
                    if self.parent_durable(path) {
                        self.expect(writes, path, Expectation::File(blocks.clone()));
                    }
                } else if path == ROOT || self.parent_durable(path) {
                    self.fsync_dir(path, model, writes);
                }
            }
            _ => {}
        }
    }

    /// An fsync'd directory is on disk without the names removed from it.
    fn fsync_dir(&mut self, dir: &str, model: &Model, writes: usize) {
        self.durable.insert(dir.to_owned());
        self.expect(writes, dir, Expectation::Directory(true));
        let gone = |path: &&String| {
            parent_of(path) == Some(dir) && !model.exists(path) && !self.unsettled(path)
        };
        let files: Vec<String> = self.seen_files.iter().filter(gone).cloned().collect();
        let dirs: Vec<String> = self.seen_dirs.iter().filter(gone).cloned().collect();
        for path in files {
            self.expect(writes, &path, Expectation::Absent);
        }
        for path in dirs {
            self.expect(writes, &path, Expectation::Directory(false));
        }
    }

    /// After a sync the disk holds the model exactly.
    fn settle(&mut self, model: &Model, writes: usize) {
        self.durable.clone_from(&model.dirs);
        self.unsettled.clear();
        for dir in &model.dirs {
            self.events.push((writes, dir.clone(), Some(Expectation::Directory(true))));
        }
        for dir in self.seen_dirs.iter().filter(|d| !model.exists(d)) {
            self.events.push((writes, dir.clone(), Some(Expectation::Directory(false))));
        }
        for (path, blocks) in &model.files {
            self.events
                .push((writes, path.clone(), Some(Expectation::File(blocks.clone()))));
        }
        for path in self.seen_files.iter().filter(|f| !model.exists(f)) {
            self.events.push((writes, path.clone(), Some(Expectation::Absent)));
        }
    }

    /// Expectations in force once `writes` writes reached the disk.
    fn at(&self, writes: usize) -> BTreeMap<String, Expectation> {
        let mut out = BTreeMap::new();
        for (_, path, expectation) in self.events.iter().filter(|(index, ..)| *index <= writes) {
            match expectation {
                Some(expectation) => {
                    out.insert(path.clone(), expectation.clone());
                }
                None => {
                    out.remove(path);
                }
            }
        }
        out
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

fn parent_ino(fs: &MiniFs, path: &str) -> Result<(InodeNumber, String)> {
    let (parent, name) = split(path).with_context(|| format!("path has no final name: {path}"))?;
    Ok((fs.resolve(parent)?, name.to_owned()))
}

fn run_step(fs: &MiniFs, step: &Step) -> Result<()> {
    match step {
        Step::Mkdir { path } => {
            let (dir, name) = parent_ino(fs, path)?;
            fs.mkdir(dir, &name)?;
        }
        Step::Rmdir { path } => {
            let (dir, name) = parent_ino(fs, path)?;
            fs.rmdir(dir, &name)?;
        }
        Step::Create { path } => {
            let (dir, name) = parent_ino(fs, path)?;
            fs.create(dir, &name)?;
        }
        Step::Write { path, lbn, data } => {
            fs.write_block(fs.resolve(path)?, LogicalBlock(i64::from(*lbn)), data)?;
        }
        Step::Truncate { path } => fs.truncate(fs.resolve(path)?)?,
        Step::Unlink { path } => {
            let (dir, name) = parent_ino(fs, path)?;
            fs.unlink(dir, &name)?;
        }
        Step::Rename { from, to } | Step::MoveDir { from, to } => {
            let (from_dir, from_name) = parent_ino(fs, from)?;
            let (to_dir, to_name) = parent_ino(fs, to)?;
            fs.rename(from_dir, &from_name, to_dir, &to_name)?;
        }
        Step::Fsync { path } => fs.fsync(fs.resolve(path)?)?,
        Step::Sync => fs.sync()?,
    }
    Ok(())
}

fn compare_file(
    image: &Image<'_>,
    path: &str,
    ino: InodeNumber,
    expected: &BTreeMap<u32, Vec<u8>>,
) -> Result<Vec<String>> {
    let actual = image.file_blocks(&image.inode(ino)?)?;
    let want: Vec<i64> = expected.keys().map(|&lbn| i64::from(lbn)).collect();
    let have: Vec<i64> = actual.keys().copied().collect();
    if want != have {
        return Ok(vec![format!("{path}: blocks {have:?}, expected {want:?}")]);
    }
    let mut errors = Vec::new();
    for (lbn, data) in expected {
        let Some(block) = actual.get(&i64::from(*lbn)) else {
            continue;
        };
        let (head, tail) = block.split_at(data.len().min(block.len()));
        if head != data.as_slice() || tail.iter().any(|&byte| byte != 0) {
            errors.push(format!("{path}: block {lbn} differs"));
        }
    }
    Ok(errors)
}

fn check_expectations(
    device: &dyn ByteDevice,
    expectations: &BTreeMap<String, Expectation>,
) -> Result<Vec<String>> {
    let image = Image::open(device)?;
    let ns = match image.namespace() {
        Ok(ns) => ns,
        Err(err) => return Ok(vec![format!("namespace unreadable: {err}")]),
    };
    let mut errors = Vec::new();
    for (path, expectation) in expectations {
        match expectation {
            Expectation::Directory(want) => {
                if ns.directories.contains(path) != *want {
                    errors.push(format!("{path}: directory present={}, expected {want}", !want));
                }
            }
            Expectation::Absent => {
                if ns.files.contains_key(path) {
                    errors.push(format!("{path}: removed name still on disk"));
                }
            }
            Expectation::File(blocks) => match ns.files.get(path) {
                Some(&ino) => errors.extend(compare_file(&image, path, ino, blocks)?),
                None => errors.push(format!("{path}: durable file missing")),
            },
        }
    }
    Ok(errors)
}

/// The cleanly unmounted image must hold the model and nothing else.
fn check_final(device: &dyn ByteDevice, model: &Model) -> Result<Vec<String>> {
    let report = fsck::check(device)?;
    let mut errors = report.violations.clone();
    if !report.is_clean() {
        errors.push(format!(
            "leaks after clean unmount: inodes={} frags={} excess_links={}",
            report.leaked_inodes, report.leaked_frags, report.excess_links
        ));
    }
    let mut expectations: BTreeMap<String, Expectation> = model
        .files
        .iter()
        .map(|(path, blocks)| (path.clone(), Expectation::File(blocks.clone())))
        .collect();
    expectations.extend(model.dirs.iter().map(|dir| (dir.clone(), Expectation::Directory(true))));
    errors.extend(check_expectations(device, &expectations)?);
    let ns = Image::open(device)?.namespace()?;
    errors.extend(
        ns.directories
            .difference(&model.dirs)
            .map(|dir| format!("{dir}: unexpected directory")),
    );
    errors.extend(
        ns.files
            .keys()
            .filter(|path| !model.files.contains_key(*path))
            .map(|path| format!("{path}: unexpected file")),
    );
    Ok(errors)
}

/// Mount a crash image, sync and unmount it, and check the result.
fn recovery_errors(image: &[u8]) -> Result<Vec<String>> {
    let device = Arc::new(MemoryByteDevice::new(image.len()));
    device.write_all_at(0, image)?;
    let cycle = MiniFs::mount(device.clone(), SoftdepConfig::default()).and_then(|fs| {
        fs.sync()?;
        fs.unmount()
    });
    if let Err(err) = cycle {
        return Ok(vec![format!("recovery mount failed: {err}")]);
    }
    let report = fsck::check(device.as_ref())?;
    Ok(report
        .violations
        .into_iter()
        .map(|violation| format!("after recovery: {violation}"))
        .collect())
}

/// Format an empty image with the default geometry.
pub fn formatted_image() -> Result<Vec<u8>> {
    let geometry = MiniFs::default_geometry()?;
    let len = usize::try_from(MiniFs::image_len(&geometry)).context("image length")?;
    let device = MemoryByteDevice::new(len);
    MiniFs::format(&device, geometry)?;
    Ok(device.snapshot())
}

fn elapsed_us(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// Run `workload` to completion, then rebuild and check the image at each
/// of its cuts.
pub fn replay_workload(workload: &Workload) -> Result<WorkloadOutcome> {
    if workload.steps.is_empty() {
        bail!("workload {} has no steps", workload.id);
    }
    if let Some(cut) = workload.cuts.iter().find(|cut| cut.step >= workload.steps.len()) {
        bail!("workload {} cut {cut:?} is past the last step", workload.id);
    }

    let start = Instant::now();
    let base = formatted_image()?;
    let recorder = Arc::new(RecordingDevice::new(&base)?);
    let fs = MiniFs::mount(recorder.clone(), SoftdepConfig::default())?;
    let mut model = Model::new();
    let mut log = ExpectationLog::new();
    let mut spans = Vec::with_capacity(workload.steps.len());
    for (index, step) in workload.steps.iter().enumerate() {
        let before = recorder.write_count();
        log.begin(step, &model, before);
        run_step(&fs, step).with_context(|| format!("workload {} step {index}: {step:?}", workload.id))?;
        model.apply(step)?;
        let after = recorder.write_count();
        log.commit(step, &model, after);
        spans.push((before, after));
    }
    fs.unmount().context("unmount after the last step")?;
    drop(fs);

    let records = recorder.records();
    let final_errors = check_final(recorder.as_ref(), &model)?;

    let mut targets: Vec<(usize, Cut)> = workload
        .cuts
        .iter()
        .map(|&cut| {
            let (before, after) = spans[cut.step];
            ((before + cut.torn).min(after), cut)
        })
        .collect();
    targets.sort_unstable();

    // Cuts are visited in write order, so one replica advances through the log.
    let replica = MemoryByteDevice::new(base.len());
    replica.write_all_at(0, &base)?;
    let mut applied = 0;
    let mut cuts = Vec::with_capacity(targets.len());
    for (writes, cut) in targets {
        for record in &records[applied..writes] {
            replica.write_all_at(record.offset, &record.data)?;
        }
        applied = writes;
        let report = fsck::check(&replica).unwrap_or_else(|err| FsckReport {
            violations: vec![format!("image unreadable: {err}")],
            ..FsckReport::default()
        });
        let mut errors = report.violations.clone();
        if report.is_consistent() {
            errors.extend(check_expectations(&replica, &log.at(writes))?);
            errors.extend(recovery_errors(&replica.snapshot())?);
        }
        if errors.is_empty() {
            debug!(target: "ffs::harness", event = "cut_passed", workload = workload.id, writes);
        } else {
            warn!(
                target: "ffs::harness",
                event = "cut_failed",
                workload = workload.id,
                step = cut.step,
                writes,
                errors = errors.len()
            );
        }
        cuts.push(CutOutcome {
            cut,
            writes,
            steps_done: spans.iter().filter(|(_, after)| *after <= writes).count(),
            errors,
            leaked_inodes: report.leaked_inodes,
            leaked_frags: report.leaked_frags,
        });
    }

    let outcome = WorkloadOutcome {
        id: workload.id,
        seed: workload.seed,
        steps: workload.steps.len(),
        writes: records.len(),
        final_errors,
        cuts,
        elapsed_us: elapsed_us(start),
    };
    info!(
        target: "ffs::harness",
        event = "workload",
        workload = workload.id,
        steps = outcome.steps,
        writes = outcome.writes,
        passed = outcome.passed()
    );
    Ok(outcome)
}

/// Plan and replay `config.workloads` workloads.
pub fn run_replay(config: &ReplayConfig) -> Result<ReplayReport> {
    if config.workloads == 0 {
        bail!("at least one workload is required");
    }
    let start = Instant::now();
    let mut outcomes = Vec::new();
    for id in 0..config.workloads {
        let workload = plan_workload(
            id,
            workload_seed(config.seed, id),
            config.min_steps,
            config.max_steps,
        )?;
        outcomes.push(replay_workload(&workload)?);
    }
    let failed = outcomes
        .iter()
        .filter(|outcome| !outcome.passed())
        .map(|outcome| outcome.id)
        .collect();
    Ok(ReplayReport {
        workloads: config.workloads,
        failed,
        elapsed_us: elapsed_us(start),
        outcomes,
    })
}
