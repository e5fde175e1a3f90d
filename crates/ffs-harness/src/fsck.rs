#![forbid(unsafe_code)]
//! Offline image reader and consistency checker.
//!
//! Soft updates promise an image that is usable after a crash at any
//! point: the only damage allowed is leaked resources (inodes and blocks
//! marked used that nothing references, link counts that are too high).
//! [`check`] walks an image from the root and reports anything worse as a
//! violation.

use crate::minifs::{Superblock, parse_err};
use ffs_alloc::CylinderGroup;
use ffs_block::ByteDevice;
use ffs_dir::DirEntry;
use ffs_error::{FfsError, Result};
use ffs_inode::{Dinode, Inode};
use ffs_types::{BlockNumber, FsGeometry, GroupNumber, InodeNumber, LogicalBlock, NDADDR, NIADDR};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::info;

/// Blocks owned by one inode.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    /// Data blocks by logical block number.
    pub data: BTreeMap<i64, BlockNumber>,
    /// Every fragment run the inode owns, indirect blocks included.
    pub runs: Vec<(BlockNumber, u64)>,
}

/// Names reachable from the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    pub directories: BTreeSet<String>,
    pub files: BTreeMap<String, InodeNumber>,
}

/// Read-only view of a filesystem image. Nothing is cached.
pub struct Image<'a> {
    device: &'a dyn ByteDevice,
    superblock: Superblock,
}

impl<'a> Image<'a> {
    pub fn open(device: &'a dyn ByteDevice) -> Result<Self> {
        let superblock = Superblock::read(device)?;
        Ok(Self { device, superblock })
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.superblock.geometry
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn read(&self, blkno: BlockNumber, len: usize) -> Result<Vec<u8>> {
        let g = self.geometry();
        if blkno.0 >= g.total_frags() {
            return Err(FfsError::Corruption {
                block: blkno.0,
                detail: "block address beyond the device".to_owned(),
            });
        }
        let mut data = vec![0_u8; len];
        self.device.read_exact_at(g.frag_to_byte(blkno), &mut data)?;
        Ok(data)
    }

    /// Raw group block of `group`.
    pub fn group_block(&self, group: GroupNumber) -> Result<Vec<u8>> {
        let g = *self.geometry();
        self.read(g.cgtod(group), g.bsize as usize)
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<Dinode> {
        let g = *self.geometry();
        let block = self.read(g.ino_to_fsba(ino), g.bsize as usize)?;
        Ok(Inode::load(&g, &block, ino).map_err(parse_err)?.din)
    }

    /// Walk the block pointers of `din`.
    pub fn block_map(&self, din: &Dinode) -> Result<BlockMap> {
        let g = *self.geometry();
        let mut map = BlockMap::default();
        for (index, &ptr) in din.db.iter().enumerate() {
            if ptr == 0 {
                continue;
            }
            let lbn = LogicalBlock(index as i64);
            let size = u64::from(g.blksize(din.size, lbn));
            let blkno = self.pointer(ptr)?;
            map.data.insert(lbn.0, blkno);
            map.runs.push((blkno, g.numfrags(size).max(1)));
        }
        let mut first = NDADDR as i64;
        for level in 0..NIADDR {
            let span = g.blocks_per_indir_level(level).cast_signed();
            if din.ib[level] != 0 {
                let blkno = self.pointer(din.ib[level])?;
                self.walk_indirect(blkno, level, first, &mut map)?;
            }
            first += span;
        }
        Ok(map)
    }

    fn pointer(&self, ptr: i64) -> Result<BlockNumber> {
        match u64::try_from(ptr) {
            Ok(blkno) if blkno < self.geometry().total_frags() => Ok(BlockNumber(blkno)),
            _ => Err(FfsError::Corruption {
                block: ptr.cast_unsigned(),
                detail: "block pointer out of range".to_owned(),
            }),
        }
    }

    fn walk_indirect(&self, blkno: BlockNumber, level: usize, first: i64, map: &mut BlockMap) -> Result<()> {
        let g = *self.geometry();
        let frag = u64::from(g.frag());
        map.runs.push((blkno, frag));
        let data = self.read(blkno, g.bsize as usize)?;
        let per = (g.blocks_per_indir_level(level) / g.nindir()).cast_signed();
        for index in 0..g.nindir() as usize {
            let ptr = g.format.read_block_ptr(&data, index).map_err(parse_err)?;
            if ptr == 0 {
                continue;
            }
            let child = self.pointer(ptr)?;
            let lbn = first + index as i64 * per;
            if level == 0 {
                map.data.insert(lbn, child);
                map.runs.push((child, frag));
            } else {
                self.walk_indirect(child, level - 1, lbn, map)?;
            }
        }
        Ok(())
    }

    /// Live entries of directory `din`, `.` and `..` included.
    pub fn dir_entries(&self, din: &Dinode) -> Result<Vec<DirEntry>> {
        let g = *self.geometry();
        let mut out = Vec::new();
        for (&lbn, &blkno) in &self.block_map(din)?.data {
            let size = g.blksize(din.size, LogicalBlock(lbn)) as usize;
            let block = self.read(blkno, size)?;
            out.extend(ffs_dir::parse_block(&block)?);
        }
        Ok(out)
    }

    /// Contents of every allocated block of `din`, by logical block.
    pub fn file_blocks(&self, din: &Dinode) -> Result<BTreeMap<i64, Vec<u8>>> {
        let g = *self.geometry();
        self.block_map(din)?
            .data
            .into_iter()
            .map(|(lbn, blkno)| {
                let size = g.blksize(din.size, LogicalBlock(lbn)) as usize;
                Ok((lbn, self.read(blkno, size)?))
            })
            .collect()
    }

    /// Every directory and file reachable from the root, by path.
    pub fn namespace(&self) -> Result<Namespace> {
        let mut ns = Namespace::default();
        ns.directories.insert("/".to_owned());
        let mut queue = VecDeque::from([(InodeNumber::ROOT, "/".to_owned())]);
        let mut visited = HashSet::from([InodeNumber::ROOT]);
        while let Some((dir, path)) = queue.pop_front() {
            let din = self.inode(dir)?;
            for entry in self.dir_entries(&din)? {
                if entry.name == b"." || entry.name == b".." {
                    continue;
                }
                let name = String::from_utf8_lossy(&entry.name);
                let child_path = if path == "/" {
                    format!("/{name}")
                } else {
                    format!("{path}/{name}")
                };
                let child = InodeNumber(u64::from(entry.ino));
                if self.inode(child)?.is_dir() {
                    if visited.insert(child) {
                        ns.directories.insert(child_path.clone());
                        queue.push_back((child, child_path));
                    }
                } else {
                    ns.files.insert(child_path, child);
                }
            }
        }
        Ok(ns)
    }
}

/// Outcome of [`check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsckReport {
    /// Damage soft updates must never leave behind.
    pub violations: Vec<String>,
    pub directories: u64,
    pub files: u64,
    /// Inodes marked used that no directory names.
    pub leaked_inodes: u64,
    /// Data fragments marked used that no inode owns.
    pub leaked_frags: u64,
    /// Inodes whose link count exceeds the names found for them.
    pub excess_links: u64,
}

impl FsckReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }

    /// Consistent and nothing leaked, as after a clean unmount.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.is_consistent() && self.leaked_inodes == 0 && self.leaked_frags == 0 && self.excess_links == 0
    }
}

struct Maps {
    geometry: FsGeometry,
    groups: Vec<Vec<u8>>,
}

impl Maps {
    fn load(image: &Image<'_>) -> Result<Self> {
        let geometry = *image.geometry();
        let groups = (0..geometry.ncg)
            .map(|cg| image.group_block(GroupNumber(cg)))
            .collect::<Result<_>>()?;
        Ok(Self { geometry, groups })
    }

    fn with_group<T>(&mut self, group: GroupNumber, f: impl FnOnce(&CylinderGroup<'_>) -> Result<T>) -> Result<T> {
        let data = self
            .groups
            .get_mut(group.0 as usize)
            .ok_or_else(|| FfsError::NotFound(format!("cylinder group {group}")))?;
        let map = CylinderGroup::open(&self.geometry, group, data)?;
        f(&map)
    }

    fn inode_used(&mut self, ino: InodeNumber) -> Result<bool> {
        let group = self.geometry.ino_to_cg(ino);
        self.with_group(group, |map| Ok(map.is_inode_used(ino)))
    }

    fn frag_free(&mut self, blkno: BlockNumber) -> Result<bool> {
        let group = self.geometry.dtog(blkno);
        self.with_group(group, |map| map.is_frag_free(blkno))
    }
}

/// Check the image on `device`.
pub fn check(device: &dyn ByteDevice) -> Result<FsckReport> {
    let image = Image::open(device)?;
    let g = *image.geometry();
    let mut maps = Maps::load(&image)?;
    let mut report = FsckReport::default();
    let first_data = g.cgdmin(GroupNumber(0)).0 - g.cgbase(GroupNumber(0)).0;

    // Allocated inodes and the fragments they own.
    let mut inodes: HashMap<InodeNumber, Dinode> = HashMap::new();
    let mut owner: HashMap<u64, InodeNumber> = HashMap::new();
    for raw in InodeNumber::ROOT.0..g.total_inodes() {
        let ino = InodeNumber(raw);
        let din = image.inode(ino)?;
        let used = maps.inode_used(ino)?;
        if din.mode == 0 {
            if used {
                report.leaked_inodes += 1;
            }
            continue;
        }
        if !used {
            report
                .violations
                .push(format!("inode {ino} is allocated but free in the inode map"));
        }
        let blocks = match image.block_map(&din) {
            Ok(blocks) => blocks,
            Err(err) => {
                report.violations.push(format!("inode {ino}: unreadable block map: {err}"));
                inodes.insert(ino, din);
                continue;
            }
        };
        for (start, nfrags) in blocks.runs {
            for frag in start.0..start.0 + nfrags {
                let blkno = BlockNumber(frag);
                if frag >= g.total_frags() || u64::from(g.dtogd(blkno)) < first_data {
                    report
                        .violations
                        .push(format!("inode {ino} points at metadata fragment {frag}"));
                    continue;
                }
                if maps.frag_free(blkno)? {
                    report
                        .violations
                        .push(format!("fragment {frag} of inode {ino} is free in the block map"));
                }
                if let Some(prev) = owner.insert(frag, ino) {
                    report
                        .violations
                        .push(format!("fragment {frag} claimed by inodes {prev} and {ino}"));
                }
            }
        }
        inodes.insert(ino, din);
    }

    // Names reachable from the root.
    let mut names: HashMap<InodeNumber, u64> = HashMap::new();
    if !inodes.get(&InodeNumber::ROOT).is_some_and(Dinode::is_dir) {
        report.violations.push("root inode is not an allocated directory".to_owned());
        return Ok(report);
    }
    let mut queue = VecDeque::from([InodeNumber::ROOT]);
    let mut visited = HashSet::from([InodeNumber::ROOT]);
    while let Some(dir) = queue.pop_front() {
        report.directories += 1;
        let Some(din) = inodes.get(&dir).copied() else {
            continue;
        };
        let entries = match image.dir_entries(&din) {
            Ok(entries) => entries,
            Err(err) => {
                report.violations.push(format!("directory {dir}: {err}"));
                continue;
            }
        };
        for entry in entries {
            let target = InodeNumber(u64::from(entry.ino));
            let name = String::from_utf8_lossy(&entry.name);
            let Some(tdin) = inodes.get(&target) else {
                report
                    .violations
                    .push(format!("entry {name:?} in directory {dir} names unallocated inode {target}"));
                continue;
            };
            *names.entry(target).or_default() += 1;
            if tdin.is_dir() && name != "." && name != ".." && visited.insert(target) {
                queue.push_back(target);
            }
        }
    }

    // Link counts.
    for (ino, din) in &inodes {
        let found = names.get(ino).copied().unwrap_or(0);
        if found == 0 {
            report.leaked_inodes += 1;
            continue;
        }
        if !din.is_dir() {
            report.files += 1;
        }
        let nlink = i64::from(din.nlink);
        let found = found.cast_signed();
        if nlink < found {
            report
                .violations
                .push(format!("inode {ino} has link count {nlink} but {found} names"));
        } else if nlink > found {
            report.excess_links += 1;
        }
    }

    // Fragments nobody owns.
    for cg in 0..g.ncg {
        let group = GroupNumber(cg);
        let base = g.cgbase(group).0;
        for frag in base + first_data..base + u64::from(g.fpg) {
            if !owner.contains_key(&frag) && !maps.frag_free(BlockNumber(frag))? {
                report.leaked_frags += 1;
            }
        }
    }
    report.violations.sort();

    info!(
        target: "ffs::harness",
        event = "fsck",
        violations = report.violations.len(),
        directories = report.directories,
        files = report.files,
        leaked_inodes = report.leaked_inodes,
        leaked_frags = report.leaked_frags,
        excess_links = report.excess_links
    );
    Ok(report)
}
