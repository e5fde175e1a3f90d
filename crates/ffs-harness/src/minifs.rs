#![forbid(unsafe_code)]
//! `MiniFs`: a small UFS2-style filesystem driven by the dependency engine.
//!
//! Regular files hold whole blocks only, addressed through the twelve
//! direct pointers and one single-indirect block. Directories grow one
//! block at a time. Every metadata change is reported to the engine before
//! its buffer is released and every write goes through the engine's buffer
//! hooks, so the device image stays usable after any prefix of the writes
//! issued.
//!
//! ## Locking
//!
//! Namespace operations are serialised by one mutex that engine callbacks
//! never take. Each in-core inode carries a recursive sleep lock held by
//! the operation (or engine callback) working on it: [`FsOps::vget`] takes
//! it and [`FsOps::release`] drops it. The inode table mutex is only held
//! for short sections that never call the engine.

use ffs_alloc::CylinderGroup;
use ffs_block::{Buf, BufferCache, ByteDevice, DirtyBuf, Vnode};
use ffs_dir::{DT_DIR, DT_REG, DirEntry};
use ffs_error::{FfsError, Result};
use ffs_inode::{Dinode, IFDIR, IFMT, IFREG, Inode};
use ffs_softdep::{
    FsOps, LinkCounts, RenameKind, Softdep, SoftdepConfig, SoftdepStats, WorkerHandle,
};
use ffs_types::{
    BlockNumber, CsSummary, DIRBLKSIZ, FsFormat, FsGeometry, GroupNumber, InodeNumber,
    LogicalBlock, MAXNAMLEN, NDADDR, NIADDR, ParseError,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info, trace, warn};

/// Superblock magic (`FS_UFS2_MAGIC`).
pub const FS_MAGIC: u32 = 0x1954_0119;
/// Bytes reserved for the superblock record at the start of the device.
const SBSIZE: usize = 512;
/// Logical block of a file's single-indirect block.
const INDIR_LBN: LogicalBlock = LogicalBlock(-(NDADDR as i64));
/// Whole-cache write passes allowed once the engine settled.
const SETTLE_PASSES: usize = 8;
/// Write passes over a file's buffers during a waiting fsync.
const FSYNC_PASSES: usize = NIADDR + 1;

pub(crate) fn parse_err(err: ParseError) -> FfsError {
    FfsError::Parse(err.to_string())
}

pub(crate) fn dev_lbn(blkno: BlockNumber) -> LogicalBlock {
    LogicalBlock(blkno.0.cast_signed())
}

fn ino32(ino: InodeNumber) -> Result<u32> {
    u32::try_from(ino.0).map_err(|_| FfsError::Format(format!("inode {ino} out of range")))
}

fn no_inode(ino: InodeNumber) -> FfsError {
    FfsError::NotFound(format!("inode {ino}"))
}

fn entry_ino(entry: &DirEntry) -> InodeNumber {
    InodeNumber(u64::from(entry.ino))
}

fn check_name(name: &str) -> Result<&[u8]> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FfsError::Format(format!("invalid name {name:?}")));
    }
    if name.len() > MAXNAMLEN {
        return Err(FfsError::NameTooLong);
    }
    Ok(name.as_bytes())
}

/// Mount-level record kept at the start of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub geometry: FsGeometry,
    /// Set by a clean unmount and cleared while mounted.
    pub clean: bool,
    pub summary: CsSummary,
}

impl Superblock {
    fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)
            .map_err(|err| FfsError::Format(format!("superblock encode: {err}")))?;
        let len = u32::try_from(body.len())
            .ok()
            .filter(|&len| len as usize + 8 <= SBSIZE)
            .ok_or_else(|| FfsError::Format("superblock record too large".to_owned()))?;
        let mut out = vec![0_u8; SBSIZE];
        out[..4].copy_from_slice(&FS_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&len.to_le_bytes());
        out[8..8 + body.len()].copy_from_slice(&body);
        Ok(out)
    }

    /// Parse the record at the start of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let magic = ffs_types::read_le_u32(data, 0).map_err(parse_err)?;
        if magic != FS_MAGIC {
            return Err(FfsError::Format(format!("bad superblock magic {magic:#x}")));
        }
        let len = ffs_types::read_le_u32(data, 4).map_err(parse_err)? as usize;
        let body = data.get(8..8 + len).ok_or_else(|| FfsError::Corruption {
            block: 0,
            detail: "superblock record truncated".to_owned(),
        })?;
        let sb: Self = serde_json::from_slice(body).map_err(|err| FfsError::Corruption {
            block: 0,
            detail: format!("superblock record: {err}"),
        })?;
        let g = sb.geometry;
        FsGeometry::new(g.format, g.bsize, g.fsize, g.ncg, g.fpg, g.ipg)
            .map_err(|err| FfsError::InvalidGeometry(err.to_string()))?;
        Ok(sb)
    }

    /// Read the superblock straight from `device`.
    pub fn read(device: &dyn ByteDevice) -> Result<Self> {
        let mut data = vec![0_u8; SBSIZE];
        device.read_exact_at(0, &mut data)?;
        Self::decode(&data)
    }
}

#[derive(Debug)]
struct Slot {
    inode: Inode,
    /// References taken through `vget`.
    refs: u32,
    owner: Option<ThreadId>,
    depth: u32,
}

/// Hold on an inode's sleep lock; dropping it unlocks.
struct InodeGuard<'a> {
    fs: &'a MiniFs,
    ino: InodeNumber,
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        self.fs.unlock_inode(self.ino);
    }
}

pub struct MiniFs {
    geometry: FsGeometry,
    device: Arc<dyn ByteDevice>,
    cache: Arc<BufferCache>,
    engine: Arc<Softdep>,
    inodes: Mutex<HashMap<InodeNumber, Slot>>,
    inode_released: Condvar,
    namespace: Mutex<()>,
    worker: Mutex<Option<WorkerHandle>>,
    superblock: Mutex<Superblock>,
}

impl fmt::Debug for MiniFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiniFs")
            .field("geometry", &self.geometry)
            .field("resident", &self.inodes.lock().len())
            .finish_non_exhaustive()
    }
}

impl MiniFs {
    /// 8 KiB blocks, 1 KiB fragments and four groups of 2 MiB.
    pub fn default_geometry() -> Result<FsGeometry> {
        FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 4, 2048, 64).map_err(parse_err)
    }

    /// Bytes a device needs to hold `geometry`.
    #[must_use]
    pub fn image_len(geometry: &FsGeometry) -> u64 {
        u64::from(geometry.ncg) * u64::from(geometry.fpg) * u64::from(geometry.fsize)
    }

    /// Write an empty filesystem holding only the root directory.
    pub fn format(device: &dyn ByteDevice, geometry: FsGeometry) -> Result<()> {
        let needed = Self::image_len(&geometry);
        if device.len_bytes() < needed {
            return Err(FfsError::InvalidGeometry(format!(
                "device holds {} bytes, geometry needs {needed}",
                device.len_bytes()
            )));
        }
        let bsize = geometry.bsize as usize;
        let frag = u64::from(geometry.frag());
        let zero = vec![0_u8; bsize];
        let mut summary = CsSummary::default();
        let mut root_block = None;

        for cg in 0..geometry.ncg {
            let group = GroupNumber(cg);
            let mut cgdata = vec![0_u8; bsize];
            let mut map = CylinderGroup::format(&geometry, group, &mut cgdata)?;
            if cg == 0 {
                let root = map.alloc_inode(true)?;
                if root != InodeNumber::ROOT {
                    return Err(FfsError::Format(format!("root allocated as inode {root}")));
                }
                root_block = Some(map.alloc_block(None)?);
            }
            summary = summary.plus(map.summary());
            device.write_all_at(geometry.frag_to_byte(geometry.cgtod(group)), &cgdata)?;
            let inode_blocks = u64::from(geometry.ipg / geometry.inopb());
            for i in 0..inode_blocks {
                let blkno = BlockNumber(geometry.cgimin(group).0 + i * frag);
                device.write_all_at(geometry.frag_to_byte(blkno), &zero)?;
            }
        }

        let root_block =
            root_block.ok_or_else(|| FfsError::Format("no group for the root directory".to_owned()))?;
        let root32 = ino32(InodeNumber::ROOT)?;
        let mut dirblk = vec![0_u8; bsize];
        ffs_dir::init_dir_block(&mut dirblk, root32, root32)?;
        device.write_all_at(geometry.frag_to_byte(root_block), &dirblk)?;

        let mut db = [0_i64; NDADDR];
        db[0] = root_block.0.cast_signed();
        let root = Inode::new(
            InodeNumber::ROOT,
            Dinode {
                mode: IFDIR | 0o755,
                nlink: 2,
                size: u64::from(geometry.bsize),
                blocks: frag,
                generation: 1,
                db,
                ..Dinode::default()
            },
        );
        let mut iblk = vec![0_u8; bsize];
        root.store(&geometry, &mut iblk).map_err(parse_err)?;
        device.write_all_at(geometry.frag_to_byte(geometry.ino_to_fsba(InodeNumber::ROOT)), &iblk)?;

        let sb = Superblock {
            geometry,
            clean: true,
            summary,
        };
        device.write_all_at(0, &sb.encode()?)?;
        device.sync()?;
        info!(
            target: "ffs::harness",
            event = "format",
            ncg = geometry.ncg,
            bsize = geometry.bsize,
            fsize = geometry.fsize,
            nbfree = summary.nbfree,
            nifree = summary.nifree
        );
        Ok(())
    }

    /// Mount the filesystem on `device`. An unclean image has its summary
    /// recomputed from the group maps.
    pub fn mount(device: Arc<dyn ByteDevice>, config: SoftdepConfig) -> Result<Arc<Self>> {
        let mut sb = Superblock::read(device.as_ref())?;
        let geometry = sb.geometry;
        let cache = Arc::new(BufferCache::new(Arc::clone(&device), geometry.fsize)?);
        let engine = Softdep::new(geometry, config, Arc::clone(&cache));
        let was_clean = sb.clean;
        if let Some(summary) = engine.mount(sb.clean)? {
            if summary != sb.summary {
                warn!(
                    target: "ffs::harness",
                    event = "summary_repaired",
                    recorded_nbfree = sb.summary.nbfree,
                    nbfree = summary.nbfree,
                    recorded_nifree = sb.summary.nifree,
                    nifree = summary.nifree
                );
            }
            sb.summary = summary;
        }
        sb.clean = false;

        let fs = Arc::new(Self {
            geometry,
            device,
            cache,
            engine: Arc::clone(&engine),
            inodes: Mutex::new(HashMap::new()),
            inode_released: Condvar::new(),
            namespace: Mutex::new(()),
            worker: Mutex::new(None),
            superblock: Mutex::new(sb),
        });
        let fs_ops: Arc<dyn FsOps> = fs.clone();
        engine.set_fs_ops(Arc::downgrade(&fs_ops));
        fs.write_superblock()?;
        info!(target: "ffs::harness", event = "mount", clean = was_clean, ncg = geometry.ncg);
        Ok(fs)
    }

    /// Flush everything, record the summary and mark the image clean.
    pub fn unmount(&self) -> Result<()> {
        let _ns = self.namespace.lock();
        self.stop_worker();
        self.settle()?;
        self.engine.unmount()?;
        let left = self.cache.stats().dirty;
        if left != 0 {
            warn!(target: "ffs::harness", event = "unmount_busy", dirty = left);
            return Err(FfsError::Busy);
        }
        let summary = self.engine.recompute_summary()?;
        {
            let mut sb = self.superblock.lock();
            sb.summary = summary;
            sb.clean = true;
        }
        self.write_superblock()?;
        self.device.sync()?;
        info!(
            target: "ffs::harness",
            event = "unmount",
            nbfree = summary.nbfree,
            nffree = summary.nffree,
            nifree = summary.nifree
        );
        Ok(())
    }

    /// Drop every unwritten buffer, as a power failure would. The mount
    /// must not be used afterwards; mount the device again instead.
    pub fn crash(&self) {
        self.stop_worker();
        self.cache.crash();
        warn!(target: "ffs::harness", event = "crash");
    }

    /// Run the engine's background worker until unmount or crash.
    pub fn spawn_worker(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(self.engine.spawn_worker()?);
        }
        Ok(())
    }

    fn stop_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.stop();
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Softdep> {
        &self.engine
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn stats(&self) -> SoftdepStats {
        self.engine.stats()
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        *self.superblock.lock()
    }

    fn bsize(&self) -> usize {
        self.geometry.bsize as usize
    }

    fn write_superblock(&self) -> Result<()> {
        let record = self.superblock.lock().encode()?;
        let fsize = self.geometry.fsize as usize;
        let mut bp = self.cache.bread(Vnode::Device, LogicalBlock(0), BlockNumber(0), fsize)?;
        bp.data[..SBSIZE].copy_from_slice(&record);
        self.cache.bwrite(bp)
    }

    // Inode table.

    fn read_inode(&self, ino: InodeNumber) -> Result<Inode> {
        if ino.0 < InodeNumber::ROOT.0 || ino.0 >= self.geometry.total_inodes() {
            return Err(no_inode(ino));
        }
        let blkno = self.geometry.ino_to_fsba(ino);
        let bp = self.cache.bread(Vnode::Device, dev_lbn(blkno), blkno, self.bsize())?;
        let loaded = Inode::load(&self.geometry, &bp.data, ino).map_err(parse_err);
        self.cache.brelse(bp);
        let mut ip = loaded?;
        self.engine.load_inodeblock(&mut ip)?;
        Ok(ip)
    }

    fn make_resident(&self, ino: InodeNumber) -> Result<()> {
        if self.inodes.lock().contains_key(&ino) {
            return Ok(());
        }
        let inode = self.read_inode(ino)?;
        self.inodes.lock().entry(ino).or_insert(Slot {
            inode,
            refs: 0,
            owner: None,
            depth: 0,
        });
        Ok(())
    }

    fn acquire_inode(&self, ino: InodeNumber) -> Result<()> {
        self.make_resident(ino)?;
        let me = thread::current().id();
        let mut slots = self.inodes.lock();
        loop {
            let slot = slots.get_mut(&ino).ok_or_else(|| no_inode(ino))?;
            let owner = slot.owner;
            match owner {
                None => {
                    slot.owner = Some(me);
                    slot.depth = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    slot.depth += 1;
                    return Ok(());
                }
                Some(_) => self.inode_released.wait(&mut slots),
            }
        }
    }

    fn lock_inode(&self, ino: InodeNumber) -> Result<InodeGuard<'_>> {
        self.acquire_inode(ino)?;
        Ok(InodeGuard { fs: self, ino })
    }

    fn unlock_inode(&self, ino: InodeNumber) {
        let mut slots = self.inodes.lock();
        let Some(slot) = slots.get_mut(&ino) else {
            return;
        };
        slot.depth = slot.depth.saturating_sub(1);
        if slot.depth == 0 {
            slot.owner = None;
            drop(slots);
            self.inode_released.notify_all();
        }
    }

    fn snapshot(&self, ino: InodeNumber) -> Result<Inode> {
        self.make_resident(ino)?;
        self.inodes
            .lock()
            .get(&ino)
            .map(|slot| slot.inode.clone())
            .ok_or_else(|| no_inode(ino))
    }

    fn modify<R>(&self, ino: InodeNumber, f: impl FnOnce(&mut Inode) -> R) -> Result<R> {
        self.make_resident(ino)?;
        let mut slots = self.inodes.lock();
        let slot = slots.get_mut(&ino).ok_or_else(|| no_inode(ino))?;
        Ok(f(&mut slot.inode))
    }

    /// Give a freshly allocated inode its first in-core image.
    fn install(&self, ino: InodeNumber, mode: u16, nlink: i16) -> Result<()> {
        self.modify(ino, |ip| {
            let generation = ip.din.generation.wrapping_add(1);
            ip.din = Dinode {
                mode,
                nlink,
                generation,
                ..Dinode::default()
            };
            ip.effnlink = i32::from(nlink);
        })
    }

    fn add_link(&self, ino: InodeNumber, n: i16) -> Result<()> {
        let (nlink, effnlink) = self.modify(ino, |ip| {
            ip.din.nlink += n;
            ip.effnlink += i32::from(n);
            (ip.din.nlink, ip.effnlink)
        })?;
        self.engine.change_linkcnt(ino, nlink, effnlink)
    }

    /// The namespace no longer sees `n` names of `ino`; the on-disk count
    /// follows once the removals are durable.
    fn drop_effnlink(&self, ino: InodeNumber, n: i32) -> Result<()> {
        let (nlink, effnlink) = self.modify(ino, |ip| {
            ip.effnlink -= n;
            (ip.din.nlink, ip.effnlink)
        })?;
        self.engine.change_linkcnt(ino, nlink, effnlink)
    }

    fn update_inode(&self, ino: InodeNumber, wait: bool) -> Result<()> {
        let _il = self.lock_inode(ino)?;
        let ip = self.snapshot(ino)?;
        let blkno = self.geometry.ino_to_fsba(ino);
        let mut bp = self.cache.bread(Vnode::Device, dev_lbn(blkno), blkno, self.bsize())?;
        if let Err(err) = ip.store(&self.geometry, &mut bp.data) {
            self.cache.brelse(bp);
            return Err(parse_err(err));
        }
        if let Err(err) = self.engine.update_inodeblock(&ip, &bp, wait) {
            self.cache.bdwrite(bp);
            return Err(err);
        }
        if wait {
            self.cache.bwrite(bp)
        } else {
            self.cache.bdwrite(bp);
            Ok(())
        }
    }

    // Allocation.

    /// Check out the group block of `group` and run `f` on its maps. The
    /// buffer is returned for the caller to release once `f` succeeded.
    fn update_cg<T>(
        &self,
        group: GroupNumber,
        f: impl FnOnce(&mut CylinderGroup<'_>) -> Result<T>,
    ) -> Result<(Buf, T)> {
        let cgblk = self.geometry.cgtod(group);
        let mut bp = self.cache.bread(Vnode::Device, dev_lbn(cgblk), cgblk, self.bsize())?;
        let result =
            CylinderGroup::open(&self.geometry, group, &mut bp.data).and_then(|mut map| f(&mut map));
        match result {
            Ok(value) => Ok((bp, value)),
            Err(err) => {
                self.cache.brelse(bp);
                Err(err)
            }
        }
    }

    fn groups_from(&self, home: GroupNumber) -> impl Iterator<Item = GroupNumber> {
        let ncg = self.geometry.ncg;
        (0..ncg).map(move |i| GroupNumber((home.0 + i) % ncg))
    }

    fn alloc_inode(&self, near: InodeNumber, is_dir: bool) -> Result<InodeNumber> {
        for group in self.groups_from(self.geometry.ino_to_cg(near)) {
            match self.update_cg(group, |map| map.alloc_inode(is_dir)) {
                Ok((cgbuf, ino)) => {
                    let dep = self.engine.setup_inomapdep(&cgbuf, ino);
                    self.cache.bdwrite(cgbuf);
                    dep?;
                    trace!(target: "ffs::harness", event = "alloc_inode", ino = ino.0, is_dir);
                    return Ok(ino);
                }
                Err(FfsError::NoSpace) => {}
                Err(err) => return Err(err),
            }
        }
        Err(FfsError::NoSpace)
    }

    fn alloc_block(&self, ino: InodeNumber) -> Result<BlockNumber> {
        for group in self.groups_from(self.geometry.ino_to_cg(ino)) {
            match self.update_cg(group, |map| map.alloc_block(None)) {
                Ok((cgbuf, blkno)) => {
                    let dep = self.engine.setup_blkmapdep(&cgbuf, blkno);
                    self.cache.bdwrite(cgbuf);
                    dep?;
                    return Ok(blkno);
                }
                Err(FfsError::NoSpace) => {}
                Err(err) => return Err(err),
            }
        }
        Err(FfsError::NoSpace)
    }

    fn bmap_block(&self, ino: InodeNumber, lbn: LogicalBlock) -> Result<Option<BlockNumber>> {
        let ip = self.snapshot(ino)?;
        let ptr = if let Some(index) = lbn.direct_index() {
            ip.din.db[index]
        } else {
            let index = self.indirect_index(lbn)?;
            let indir = ip.din.ib[0];
            if indir == 0 {
                return Ok(None);
            }
            let blkno = BlockNumber(indir.cast_unsigned());
            let bp = self.cache.bread(Vnode::File(ino), INDIR_LBN, blkno, self.bsize())?;
            let ptr = self.geometry.format.read_block_ptr(&bp.data, index).map_err(parse_err);
            self.cache.brelse(bp);
            ptr?
        };
        Ok((ptr != 0).then(|| BlockNumber(ptr.cast_unsigned())))
    }

    fn indirect_index(&self, lbn: LogicalBlock) -> Result<usize> {
        let index = lbn.0 - NDADDR as i64;
        match u64::try_from(index) {
            Ok(index) if index < self.geometry.nindir() => Ok(index as usize),
            _ => Err(FfsError::Format(format!("logical block {lbn} beyond the single indirect"))),
        }
    }

    /// The single-indirect block of `ino`, allocated when missing.
    fn indirect_buf(&self, ino: InodeNumber) -> Result<Buf> {
        let ip = self.snapshot(ino)?;
        if ip.din.ib[0] != 0 {
            let blkno = BlockNumber(ip.din.ib[0].cast_unsigned());
            return self.cache.bread(Vnode::File(ino), INDIR_LBN, blkno, self.bsize());
        }
        let blkno = self.alloc_block(ino)?;
        let mut bp = self.cache.getblk(Vnode::File(ino), INDIR_LBN, blkno, self.bsize());
        bp.data.fill(0);
        let bsize = self.geometry.bsize;
        if let Err(err) = self.engine.setup_allocdirect(
            &ip,
            LogicalBlock(NDADDR as i64),
            blkno,
            BlockNumber(0),
            bsize,
            0,
            &bp,
        ) {
            self.cache.bdwrite(bp);
            return Err(err);
        }
        let frag = u64::from(self.geometry.frag());
        self.modify(ino, |ip| {
            ip.din.ib[0] = blkno.0.cast_signed();
            ip.din.blocks += frag;
        })?;
        Ok(bp)
    }

    /// Buffer of block `lbn` of `ino`, allocating and zeroing it if it is
    /// a hole. The flag says whether the block is new.
    fn balloc(&self, ino: InodeNumber, lbn: LogicalBlock) -> Result<(Buf, bool)> {
        let bsize = self.bsize();
        if let Some(blkno) = self.bmap_block(ino, lbn)? {
            return Ok((self.cache.bread(Vnode::File(ino), lbn, blkno, bsize)?, false));
        }
        let frag = u64::from(self.geometry.frag());
        if let Some(index) = lbn.direct_index() {
            let ip = self.snapshot(ino)?;
            let blkno = self.alloc_block(ino)?;
            let mut nbp = self.cache.getblk(Vnode::File(ino), lbn, blkno, bsize);
            nbp.data.fill(0);
            let staged = self.engine.setup_allocdirect(
                &ip,
                lbn,
                blkno,
                BlockNumber(0),
                self.geometry.bsize,
                0,
                &nbp,
            );
            if let Err(err) = staged {
                self.cache.bdwrite(nbp);
                return Err(err);
            }
            self.modify(ino, |ip| {
                ip.din.db[index] = blkno.0.cast_signed();
                ip.din.blocks += frag;
            })?;
            return Ok((nbp, true));
        }

        let ptrno = self.indirect_index(lbn)?;
        let mut ibp = self.indirect_buf(ino)?;
        let blkno = match self.alloc_block(ino) {
            Ok(blkno) => blkno,
            Err(err) => {
                self.cache.bdwrite(ibp);
                return Err(err);
            }
        };
        let mut nbp = self.cache.getblk(Vnode::File(ino), lbn, blkno, bsize);
        nbp.data.fill(0);
        let ip = self.snapshot(ino)?;
        let staged = self
            .engine
            .setup_allocindir_page(&ip, lbn, &ibp, ptrno, blkno, BlockNumber(0), &nbp)
            .and_then(|()| {
                self.geometry
                    .format
                    .write_block_ptr(&mut ibp.data, ptrno, blkno.0.cast_signed())
                    .map_err(parse_err)
            });
        self.cache.bdwrite(ibp);
        if let Err(err) = staged {
            self.cache.bdwrite(nbp);
            return Err(err);
        }
        self.modify(ino, |ip| ip.din.blocks += frag)?;
        Ok((nbp, true))
    }

    // Directories.

    fn ensure_dir(&self, ino: InodeNumber) -> Result<()> {
        if self.snapshot(ino)?.is_dir() {
            Ok(())
        } else {
            Err(FfsError::NotDirectory)
        }
    }

    fn dir_blocks(&self, dir: InodeNumber) -> Result<i64> {
        let size = self.snapshot(dir)?.din.size;
        Ok((size / u64::from(self.geometry.bsize)).cast_signed())
    }

    /// Find `name` in `dir`, returning the block holding it and the entry.
    fn dir_lookup(&self, dir: InodeNumber, name: &[u8]) -> Result<Option<(LogicalBlock, DirEntry)>> {
        self.ensure_dir(dir)?;
        for n in 0..self.dir_blocks(dir)? {
            let lbn = LogicalBlock(n);
            let Some(blkno) = self.bmap_block(dir, lbn)? else {
                continue;
            };
            let bp = self.cache.bread(Vnode::File(dir), lbn, blkno, self.bsize())?;
            let found = ffs_dir::lookup(&bp.data, name);
            self.cache.brelse(bp);
            if let Some(entry) = found? {
                return Ok(Some((lbn, entry)));
            }
        }
        Ok(None)
    }

    fn dir_is_empty(&self, dir: InodeNumber) -> Result<bool> {
        for n in 0..self.dir_blocks(dir)? {
            let lbn = LogicalBlock(n);
            let Some(blkno) = self.bmap_block(dir, lbn)? else {
                continue;
            };
            let bp = self.cache.bread(Vnode::File(dir), lbn, blkno, self.bsize())?;
            let empty = ffs_dir::is_empty_dir_block(&bp.data);
            self.cache.brelse(bp);
            if !empty? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_ancestor(&self, ancestor: InodeNumber, mut dir: InodeNumber) -> Result<bool> {
        for _ in 0..self.geometry.total_inodes() {
            if dir == ancestor {
                return Ok(true);
            }
            if dir == InodeNumber::ROOT {
                return Ok(false);
            }
            let (_, parent) = self.dir_lookup(dir, b"..")?.ok_or_else(|| FfsError::Corruption {
                block: 0,
                detail: format!("directory {dir} has no parent entry"),
            })?;
            dir = entry_ino(&parent);
        }
        Err(FfsError::Corruption {
            block: 0,
            detail: format!("directory loop above {dir}"),
        })
    }

    /// Squeeze the free space of every chunk of a directory block together.
    fn compact_block(&self, dir: InodeNumber, lbn: LogicalBlock, bp: &mut Buf) -> Result<()> {
        for chunk in (0..bp.data.len()).step_by(DIRBLKSIZ) {
            ffs_dir::compact_chunk(&mut bp.data, chunk, |block, mv| {
                self.engine.change_directoryentry_offset(dir, lbn, block, mv)
            })?;
        }
        Ok(())
    }

    /// Add `name` for `ino` to `dir`. `newdirbp` is the first block of a
    /// directory being created.
    fn direnter(
        &self,
        dir: InodeNumber,
        name: &[u8],
        ino: InodeNumber,
        dtype: u8,
        newdirbp: Option<Buf>,
    ) -> Result<()> {
        let mut newdirbp = newdirbp;
        let result = self.place_entry(dir, name, ino, dtype, &mut newdirbp);
        if let Some(bp) = newdirbp.take() {
            self.cache.bdwrite(bp);
        }
        result
    }

    fn place_entry(
        &self,
        dir: InodeNumber,
        name: &[u8],
        ino: InodeNumber,
        dtype: u8,
        newdirbp: &mut Option<Buf>,
    ) -> Result<()> {
        let entry = ino32(ino)?;
        let nblocks = self.dir_blocks(dir)?;
        for n in 0..nblocks {
            let lbn = LogicalBlock(n);
            let Some(blkno) = self.bmap_block(dir, lbn)? else {
                continue;
            };
            let mut bp = self.cache.bread(Vnode::File(dir), lbn, blkno, self.bsize())?;
            let mut added = ffs_dir::add_entry(&mut bp.data, entry, name, dtype);
            if matches!(added, Err(FfsError::NoSpace)) {
                if let Err(err) = self.compact_block(dir, lbn, &mut bp) {
                    self.cache.bdwrite(bp);
                    return Err(err);
                }
                added = ffs_dir::add_entry(&mut bp.data, entry, name, dtype);
            }
            match added {
                Ok(offset) => {
                    let diroffset = self.geometry.lblktosize(lbn) + offset as u64;
                    return self.finish_entry(bp, dir, diroffset, ino, newdirbp.take(), false);
                }
                Err(FfsError::NoSpace) => self.cache.bdwrite(bp),
                Err(err) => {
                    self.cache.bdwrite(bp);
                    return Err(err);
                }
            }
        }

        let lbn = LogicalBlock(nblocks);
        let (mut bp, _) = self.balloc(dir, lbn)?;
        let placed = ffs_dir::init_empty_block(&mut bp.data)
            .and_then(|()| ffs_dir::add_entry(&mut bp.data, entry, name, dtype));
        let offset = match placed {
            Ok(offset) => offset,
            Err(err) => {
                self.cache.bdwrite(bp);
                return Err(err);
            }
        };
        let bsize = u64::from(self.geometry.bsize);
        self.modify(dir, |ip| ip.din.size += bsize)?;
        let diroffset = self.geometry.lblktosize(lbn) + offset as u64;
        self.finish_entry(bp, dir, diroffset, ino, newdirbp.take(), true)
    }

    fn finish_entry(
        &self,
        bp: Buf,
        dir: InodeNumber,
        diroffset: u64,
        ino: InodeNumber,
        newdirbp: Option<Buf>,
        isnewblk: bool,
    ) -> Result<()> {
        match self
            .engine
            .setup_directory_add(&bp, dir, diroffset, ino, newdirbp, isnewblk)
        {
            Ok(true) => self.cache.bwrite(bp),
            Ok(false) => {
                self.cache.bdwrite(bp);
                Ok(())
            }
            Err(err) => {
                self.cache.bdwrite(bp);
                Err(err)
            }
        }
    }

    /// Clear the entry `name` (naming `ino`) in block `lbn` of `dir`.
    fn dirremove(
        &self,
        dir: InodeNumber,
        lbn: LogicalBlock,
        name: &[u8],
        ino: InodeNumber,
        isrmdir: bool,
    ) -> Result<()> {
        let blkno = self.bmap_block(dir, lbn)?.ok_or_else(|| FfsError::Corruption {
            block: 0,
            detail: format!("directory {dir} lost block {lbn}"),
        })?;
        let mut bp = self.cache.bread(Vnode::File(dir), lbn, blkno, self.bsize())?;
        let offset = match ffs_dir::remove_entry(&mut bp.data, name) {
            Ok(Some((offset, _))) => offset,
            Ok(None) => {
                self.cache.brelse(bp);
                return Err(FfsError::NotFound(String::from_utf8_lossy(name).into_owned()));
            }
            Err(err) => {
                self.cache.brelse(bp);
                return Err(err);
            }
        };
        if let Err(err) = self.drop_effnlink(ino, 1) {
            self.cache.bdwrite(bp);
            return Err(err);
        }
        let diroffset = self.geometry.lblktosize(lbn) + offset as u64;
        let staged = self.engine.setup_remove(&bp, dir, diroffset, ino, isrmdir);
        self.cache.bdwrite(bp);
        staged
    }

    /// Point the entry at `diroffset` of `dir` from `old` to `new`.
    fn dirrewrite(
        &self,
        dir: InodeNumber,
        diroffset: u64,
        old: InodeNumber,
        new: InodeNumber,
        dtype: u8,
        kind: RenameKind,
    ) -> Result<()> {
        let lbn = self.geometry.lblkno(diroffset);
        let offset = self.geometry.blkoff(diroffset) as usize;
        let target = ino32(new)?;
        let blkno = self.bmap_block(dir, lbn)?.ok_or_else(|| FfsError::Corruption {
            block: 0,
            detail: format!("directory {dir} lost block {lbn}"),
        })?;
        let mut bp = self.cache.bread(Vnode::File(dir), lbn, blkno, self.bsize())?;
        if let Err(err) = ffs_dir::set_entry_ino(&mut bp.data, offset, target, dtype) {
            self.cache.brelse(bp);
            return Err(err);
        }
        if let Err(err) = self.drop_effnlink(old, 1) {
            self.cache.bdwrite(bp);
            return Err(err);
        }
        let staged = self
            .engine
            .setup_directory_change(&bp, dir, diroffset, old, new, kind);
        self.cache.bdwrite(bp);
        staged
    }

    // Public namespace operations.

    /// Inode named `name` in directory `dir`.
    pub fn lookup(&self, dir: InodeNumber, name: &str) -> Result<Option<InodeNumber>> {
        Ok(self
            .dir_lookup(dir, name.as_bytes())?
            .map(|(_, entry)| entry_ino(&entry)))
    }

    /// Resolve an absolute slash-separated path.
    pub fn resolve(&self, path: &str) -> Result<InodeNumber> {
        let mut ino = InodeNumber::ROOT;
        for part in path.split('/').filter(|part| !part.is_empty()) {
            ino = self.lookup(ino, part)?.ok_or_else(|| FfsError::NotFound(path.to_owned()))?;
        }
        Ok(ino)
    }

    /// Live entries of `dir` other than `.` and `..`, in block order.
    pub fn readdir(&self, dir: InodeNumber) -> Result<Vec<(String, InodeNumber)>> {
        self.ensure_dir(dir)?;
        let mut out = Vec::new();
        for n in 0..self.dir_blocks(dir)? {
            let lbn = LogicalBlock(n);
            let Some(blkno) = self.bmap_block(dir, lbn)? else {
                continue;
            };
            let bp = self.cache.bread(Vnode::File(dir), lbn, blkno, self.bsize())?;
            let entries = ffs_dir::parse_block(&bp.data);
            self.cache.brelse(bp);
            for entry in entries? {
                if entry.name == b"." || entry.name == b".." {
                    continue;
                }
                out.push((String::from_utf8_lossy(&entry.name).into_owned(), entry_ino(&entry)));
            }
        }
        Ok(out)
    }

    /// In-core image of `ino`.
    pub fn stat(&self, ino: InodeNumber) -> Result<Inode> {
        self.snapshot(ino)
    }

    /// Contents of block `lbn` of `ino`, or `None` for a hole.
    pub fn read_block(&self, ino: InodeNumber, lbn: LogicalBlock) -> Result<Option<Vec<u8>>> {
        let Some(blkno) = self.bmap_block(ino, lbn)? else {
            return Ok(None);
        };
        let bp = self.cache.bread(Vnode::File(ino), lbn, blkno, self.bsize())?;
        let data = bp.data.clone();
        self.cache.brelse(bp);
        Ok(Some(data))
    }

    pub fn create(&self, dir: InodeNumber, name: &str) -> Result<InodeNumber> {
        self.make_node(dir, name, false)
    }

    pub fn mkdir(&self, dir: InodeNumber, name: &str) -> Result<InodeNumber> {
        self.make_node(dir, name, true)
    }

    fn make_node(&self, dir: InodeNumber, name: &str, is_dir: bool) -> Result<InodeNumber> {
        let name_bytes = check_name(name)?;
        let _ns = self.namespace.lock();
        let _dl = self.lock_inode(dir)?;
        if self.dir_lookup(dir, name_bytes)?.is_some() {
            return Err(FfsError::Exists);
        }
        let ino = self.alloc_inode(dir, is_dir)?;
        let _il = self.lock_inode(ino)?;
        if is_dir {
            let (me, parent) = (ino32(ino)?, ino32(dir)?);
            self.install(ino, IFDIR | 0o755, 2)?;
            self.engine.change_linkcnt(ino, 2, 2)?;
            self.add_link(dir, 1)?;
            self.update_inode(dir, false)?;
            let (mut body, _) = self.balloc(ino, LogicalBlock(0))?;
            if let Err(err) = ffs_dir::init_dir_block(&mut body.data, me, parent) {
                self.cache.bdwrite(body);
                return Err(err);
            }
            let bsize = u64::from(self.geometry.bsize);
            self.modify(ino, |ip| ip.din.size = bsize)?;
            self.update_inode(ino, false)?;
            self.direnter(dir, name_bytes, ino, DT_DIR, Some(body))?;
        } else {
            self.install(ino, IFREG | 0o644, 1)?;
            self.engine.change_linkcnt(ino, 1, 1)?;
            self.update_inode(ino, false)?;
            self.direnter(dir, name_bytes, ino, DT_REG, None)?;
        }
        self.update_inode(dir, false)?;
        let event = if is_dir { "mkdir" } else { "create" };
        debug!(target: "ffs::harness", event, dir = dir.0, ino = ino.0, name);
        Ok(ino)
    }

    /// Store `data` (at most one block) as block `lbn` of a regular file.
    /// The rest of the block reads as zeros.
    pub fn write_block(&self, ino: InodeNumber, lbn: LogicalBlock, data: &[u8]) -> Result<()> {
        if data.len() > self.bsize() || lbn.0 < 0 {
            return Err(FfsError::Format(format!(
                "write of {} bytes at block {lbn}",
                data.len()
            )));
        }
        let _ns = self.namespace.lock();
        let _il = self.lock_inode(ino)?;
        let mode = self.snapshot(ino)?.din.mode;
        if mode & IFMT != IFREG {
            return Err(FfsError::IsDirectory);
        }
        let (mut bp, fresh) = self.balloc(ino, lbn)?;
        bp.data[..data.len()].copy_from_slice(data);
        bp.data[data.len()..].fill(0);
        self.cache.bdwrite(bp);
        let end = self.geometry.lblktosize(lbn) + u64::from(self.geometry.bsize);
        self.modify(ino, |ip| ip.din.size = ip.din.size.max(end))?;
        self.update_inode(ino, false)?;
        trace!(target: "ffs::harness", event = "write_block", ino = ino.0, lbn = lbn.0, fresh);
        Ok(())
    }

    /// Truncate a regular file to zero length.
    pub fn truncate(&self, ino: InodeNumber) -> Result<()> {
        let _ns = self.namespace.lock();
        let _il = self.lock_inode(ino)?;
        if self.snapshot(ino)?.is_dir() {
            return Err(FfsError::IsDirectory);
        }
        self.truncate_locked(ino)
    }

    fn truncate_locked(&self, ino: InodeNumber) -> Result<()> {
        let mut ip = self.snapshot(ino)?;
        self.engine.setup_freeblocks(&mut ip)?;
        self.modify(ino, |slot| {
            slot.din.db = ip.din.db;
            slot.din.ib = ip.din.ib;
            slot.din.blocks = ip.din.blocks;
            slot.din.size = ip.din.size;
        })?;
        self.update_inode(ino, false)
    }

    pub fn unlink(&self, dir: InodeNumber, name: &str) -> Result<()> {
        let name_bytes = check_name(name)?;
        let _ns = self.namespace.lock();
        let _dl = self.lock_inode(dir)?;
        let (lbn, entry) = self
            .dir_lookup(dir, name_bytes)?
            .ok_or_else(|| FfsError::NotFound(name.to_owned()))?;
        let ino = entry_ino(&entry);
        let _il = self.lock_inode(ino)?;
        if self.snapshot(ino)?.is_dir() {
            return Err(FfsError::IsDirectory);
        }
        self.dirremove(dir, lbn, name_bytes, ino, false)?;
        debug!(target: "ffs::harness", event = "unlink", dir = dir.0, ino = ino.0, name);
        Ok(())
    }

    pub fn rmdir(&self, dir: InodeNumber, name: &str) -> Result<()> {
        let name_bytes = check_name(name)?;
        let _ns = self.namespace.lock();
        let _dl = self.lock_inode(dir)?;
        let (lbn, entry) = self
            .dir_lookup(dir, name_bytes)?
            .ok_or_else(|| FfsError::NotFound(name.to_owned()))?;
        let ino = entry_ino(&entry);
        let _il = self.lock_inode(ino)?;
        let ip = self.snapshot(ino)?;
        if !ip.is_dir() {
            return Err(FfsError::NotDirectory);
        }
        if ip.effnlink > 2 || !self.dir_is_empty(ino)? {
            return Err(FfsError::NotEmpty);
        }
        // The parent loses the child's `..` and the child its `.`.
        self.drop_effnlink(dir, 1)?;
        self.drop_effnlink(ino, 1)?;
        self.dirremove(dir, lbn, name_bytes, ino, true)?;
        debug!(target: "ffs::harness", event = "rmdir", dir = dir.0, ino = ino.0, name);
        Ok(())
    }

    /// Move `from_name` in `from_dir` to `to_name` in `to_dir`, replacing a
    /// file there or an empty directory when moving a directory.
    pub fn rename(
        &self,
        from_dir: InodeNumber,
        from_name: &str,
        to_dir: InodeNumber,
        to_name: &str,
    ) -> Result<()> {
        let from = check_name(from_name)?;
        let to = check_name(to_name)?;
        let _ns = self.namespace.lock();
        let _fl = self.lock_inode(from_dir)?;
        let _tl = self.lock_inode(to_dir)?;
        let (from_lbn, entry) = self
            .dir_lookup(from_dir, from)?
            .ok_or_else(|| FfsError::NotFound(from_name.to_owned()))?;
        let ino = entry_ino(&entry);
        if from_dir == to_dir && from == to {
            return Ok(());
        }
        let _il = self.lock_inode(ino)?;
        let is_dir = self.snapshot(ino)?.is_dir();
        let newparent = is_dir && from_dir != to_dir;
        if newparent && self.is_ancestor(ino, to_dir)? {
            return Err(FfsError::Format(format!(
                "cannot move directory {ino} below itself"
            )));
        }

        let target = self.dir_lookup(to_dir, to)?;
        let replaced = match &target {
            Some((_, old)) => {
                let old_ino = entry_ino(old);
                if old_ino == ino {
                    return Ok(());
                }
                let old_ip = self.snapshot(old_ino)?;
                match (is_dir, old_ip.is_dir()) {
                    (true, false) => return Err(FfsError::NotDirectory),
                    (false, true) => return Err(FfsError::IsDirectory),
                    (true, true) if old_ip.effnlink > 2 || !self.dir_is_empty(old_ino)? => {
                        return Err(FfsError::NotEmpty);
                    }
                    _ => {}
                }
                Some(old_ino)
            }
            None => None,
        };
        let dtype = if is_dir { DT_DIR } else { DT_REG };

        // The new name is counted before it can reach the disk.
        self.add_link(ino, 1)?;
        self.update_inode(ino, false)?;

        match (target, replaced) {
            (Some((lbn, old)), Some(old_ino)) => {
                let _xl = self.lock_inode(old_ino)?;
                let kind = match (is_dir, newparent) {
                    (false, _) => RenameKind::File,
                    (true, false) => RenameKind::Dir,
                    (true, true) => RenameKind::DirNewParent,
                };
                let diroffset = self.geometry.lblktosize(lbn) + old.offset as u64;
                self.dirrewrite(to_dir, diroffset, old_ino, ino, dtype, kind)?;
                if is_dir {
                    if !newparent {
                        self.drop_effnlink(to_dir, 1)?;
                    }
                    self.drop_effnlink(old_ino, 1)?;
                }
            }
            _ => {
                if newparent {
                    self.add_link(to_dir, 1)?;
                    self.update_inode(to_dir, false)?;
                }
                self.direnter(to_dir, to, ino, dtype, None)?;
            }
        }

        if newparent {
            let (lbn, dotdot) = self.dir_lookup(ino, b"..")?.ok_or_else(|| FfsError::Corruption {
                block: 0,
                detail: format!("directory {ino} has no parent entry"),
            })?;
            let diroffset = self.geometry.lblktosize(lbn) + dotdot.offset as u64;
            self.dirrewrite(ino, diroffset, from_dir, to_dir, DT_DIR, RenameKind::File)?;
        }
        self.dirremove(from_dir, from_lbn, from, ino, false)?;
        self.update_inode(to_dir, false)?;
        if from_dir != to_dir {
            self.update_inode(from_dir, false)?;
        }
        debug!(
            target: "ffs::harness",
            event = "rename",
            ino = ino.0,
            from_dir = from_dir.0,
            to_dir = to_dir.0,
            from = from_name,
            to = to_name
        );
        Ok(())
    }

    /// Make `ino`, its data and every name leading to it durable.
    pub fn fsync(&self, ino: InodeNumber) -> Result<()> {
        let _ns = self.namespace.lock();
        self.fsync_inner(ino, true)
    }

    /// Flush the whole filesystem and run the worklist until it is empty.
    pub fn sync(&self) -> Result<()> {
        let _ns = self.namespace.lock();
        self.settle()
    }

    /// Write rolled-back buffers again until no buffer is dirty and no work
    /// is pending.
    fn settle(&self) -> Result<()> {
        self.engine.flushfiles()?;
        for _ in 0..SETTLE_PASSES {
            self.cache.flush_all(SETTLE_PASSES)?;
            if self.engine.flushworklist()? == 0 && self.cache.stats().dirty == 0 {
                break;
            }
        }
        Ok(())
    }

    fn write_file_buffers(&self, ino: InodeNumber) -> Result<()> {
        for blkno in self.cache.dirty_blocks(Vnode::File(ino)) {
            if let DirtyBuf::Acquired(bp) = self.cache.try_acquire(blkno, true) {
                self.cache.bawrite(bp)?;
            }
        }
        Ok(())
    }

    fn fsync_inner(&self, ino: InodeNumber, wait: bool) -> Result<()> {
        let _il = self.lock_inode(ino)?;
        let passes = if wait { FSYNC_PASSES } else { 1 };
        for _ in 0..passes {
            self.write_file_buffers(ino)?;
            if !wait {
                break;
            }
            self.engine.sync_metadata(Vnode::File(ino))?;
            if self.cache.dirty_blocks(Vnode::File(ino)).is_empty() {
                break;
            }
        }
        self.update_inode(ino, wait)?;
        if wait {
            self.engine.fsync(ino)?;
        }
        trace!(target: "ffs::harness", event = "fsync", ino = ino.0, wait);
        Ok(())
    }

    /// Last reference to an unlinked inode went away.
    fn inactive(&self, ino: InodeNumber) -> Result<()> {
        let ip = self.snapshot(ino)?;
        let has_blocks = ip.din.db.iter().chain(&ip.din.ib).any(|&ptr| ptr != 0);
        if ip.din.size != 0 || ip.din.blocks != 0 || has_blocks {
            self.truncate_locked(ino)?;
        }
        let mode = ip.din.mode;
        self.modify(ino, |slot| slot.din.mode = 0)?;
        self.engine.freefile(ino, mode)?;
        self.update_inode(ino, false)?;
        debug!(target: "ffs::harness", event = "inactive", ino = ino.0, mode);
        Ok(())
    }
}

impl FsOps for MiniFs {
    fn free_blocks(&self, ino: InodeNumber, blkno: BlockNumber, size: u32) -> Result<()> {
        let nfrags = size / self.geometry.fsize;
        let (bp, ()) = self.update_cg(self.geometry.dtog(blkno), |map| map.free_frags(blkno, nfrags))?;
        self.cache.bdwrite(bp);
        trace!(target: "ffs::harness", event = "free_blocks", ino = ino.0, blkno = blkno.0, size);
        Ok(())
    }

    fn free_inode(&self, ino: InodeNumber, mode: u16) -> Result<()> {
        let is_dir = mode & IFMT == IFDIR;
        let (bp, ()) = self.update_cg(self.geometry.ino_to_cg(ino), |map| map.free_inode(ino, is_dir))?;
        self.cache.bdwrite(bp);
        debug!(target: "ffs::harness", event = "free_inode", ino = ino.0, is_dir);
        Ok(())
    }

    fn vget(&self, ino: InodeNumber) -> Result<()> {
        self.acquire_inode(ino)?;
        if let Some(slot) = self.inodes.lock().get_mut(&ino) {
            slot.refs += 1;
        }
        Ok(())
    }

    fn release(&self, ino: InodeNumber) -> Result<()> {
        let doomed = {
            let mut slots = self.inodes.lock();
            let slot = slots.get_mut(&ino).ok_or_else(|| no_inode(ino))?;
            slot.refs = slot.refs.saturating_sub(1);
            slot.refs == 0 && slot.inode.din.nlink <= 0 && slot.inode.din.mode != 0
        };
        let result = if doomed { self.inactive(ino) } else { Ok(()) };
        self.unlock_inode(ino);
        result
    }

    fn is_inode_locked(&self, ino: InodeNumber) -> bool {
        self.inodes
            .lock()
            .get(&ino)
            .is_some_and(|slot| slot.owner.is_some())
    }

    fn adjust_link_count(&self, ino: InodeNumber, delta: i16) -> Result<LinkCounts> {
        let mut slots = self.inodes.lock();
        let slot = slots.get_mut(&ino).ok_or_else(|| no_inode(ino))?;
        slot.inode.din.nlink += delta;
        Ok(LinkCounts {
            nlink: slot.inode.din.nlink,
            effnlink: slot.inode.effnlink,
        })
    }

    fn truncate(&self, ino: InodeNumber) -> Result<()> {
        let _il = self.lock_inode(ino)?;
        self.truncate_locked(ino)
    }

    fn update(&self, ino: InodeNumber, wait: bool) -> Result<()> {
        self.update_inode(ino, wait)
    }

    fn fsync(&self, ino: InodeNumber, wait: bool) -> Result<()> {
        self.fsync_inner(ino, wait)
    }

    fn bmap(&self, ino: InodeNumber, lbn: LogicalBlock) -> Result<Option<(BlockNumber, usize)>> {
        Ok(self.bmap_block(ino, lbn)?.map(|blkno| (blkno, self.bsize())))
    }

    fn flush_files(&self) -> Result<()> {
        let mut live: Vec<InodeNumber> = self
            .inodes
            .lock()
            .iter()
            .filter(|(_, slot)| slot.inode.din.mode != 0)
            .map(|(&ino, _)| ino)
            .collect();
        live.sort_unstable();
        for ino in live {
            self.fsync_inner(ino, false)?;
        }
        for blkno in self.cache.dirty_blocks(Vnode::Device) {
            if let DirtyBuf::Acquired(bp) = self.cache.try_acquire(blkno, true) {
                self.cache.bwrite(bp)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_block::MemoryByteDevice;

    fn small_geometry() -> FsGeometry {
        FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 2, 2048, 64).expect("geometry")
    }

    fn fresh() -> (Arc<MemoryByteDevice>, Arc<MiniFs>) {
        let geometry = small_geometry();
        let len = usize::try_from(MiniFs::image_len(&geometry)).expect("len");
        let device = Arc::new(MemoryByteDevice::new(len));
        MiniFs::format(device.as_ref(), geometry).expect("format");
        let fs = MiniFs::mount(device.clone(), SoftdepConfig::default()).expect("mount");
        (device, fs)
    }

    #[test]
    fn superblock_record_round_trips_and_rejects_bad_magic() {
        let sb = Superblock {
            geometry: small_geometry(),
            clean: true,
            summary: CsSummary {
                ndir: 1,
                nbfree: 400,
                nifree: 126,
                nffree: 0,
            },
        };
        let raw = sb.encode().expect("encode");
        assert_eq!(raw.len(), SBSIZE);
        assert_eq!(Superblock::decode(&raw).expect("decode"), sb);

        let mut bad = raw;
        bad[0] ^= 0xff;
        assert!(matches!(Superblock::decode(&bad), Err(FfsError::Format(_))));
    }

    #[test]
    fn fresh_image_has_an_empty_root() {
        let (device, fs) = fresh();
        assert!(fs.readdir(InodeNumber::ROOT).expect("readdir").is_empty());
        let root = fs.stat(InodeNumber::ROOT).expect("stat");
        assert!(root.is_dir());
        assert_eq!(root.din.nlink, 2);
        fs.unmount().expect("unmount");
        assert!(Superblock::read(device.as_ref()).expect("sb").clean);
    }

    #[test]
    fn names_are_validated() {
        let (_device, fs) = fresh();
        assert!(matches!(fs.create(InodeNumber::ROOT, ""), Err(FfsError::Format(_))));
        assert!(matches!(fs.create(InodeNumber::ROOT, "a/b"), Err(FfsError::Format(_))));
        assert!(matches!(fs.mkdir(InodeNumber::ROOT, ".."), Err(FfsError::Format(_))));
        let long = "x".repeat(MAXNAMLEN + 1);
        assert!(matches!(fs.create(InodeNumber::ROOT, &long), Err(FfsError::NameTooLong)));
    }

    #[test]
    fn create_write_and_read_back_through_the_indirect_block() {
        let (_device, fs) = fresh();
        let ino = fs.create(InodeNumber::ROOT, "file").expect("create");
        assert!(matches!(fs.create(InodeNumber::ROOT, "file"), Err(FfsError::Exists)));
        fs.write_block(ino, LogicalBlock(0), b"first").expect("write 0");
        fs.write_block(ino, LogicalBlock(14), b"far").expect("write 14");

        let first = fs.read_block(ino, LogicalBlock(0)).expect("read").expect("block");
        assert_eq!(&first[..5], b"first");
        assert!(first[5..].iter().all(|&b| b == 0));
        let far = fs.read_block(ino, LogicalBlock(14)).expect("read").expect("block");
        assert_eq!(&far[..3], b"far");
        assert_eq!(fs.read_block(ino, LogicalBlock(5)).expect("read"), None);

        let ip = fs.stat(ino).expect("stat");
        assert_eq!(ip.din.size, 15 * 8192);
        // Two data blocks and the indirect block.
        assert_eq!(ip.din.blocks, 3 * 8);
        assert_ne!(ip.din.ib[0], 0);
        fs.unmount().expect("unmount");
    }

    #[test]
    fn directory_operations_keep_link_counts() {
        let (_device, fs) = fresh();
        let a = fs.mkdir(InodeNumber::ROOT, "a").expect("mkdir a");
        let b = fs.mkdir(InodeNumber::ROOT, "b").expect("mkdir b");
        assert_eq!(fs.stat(InodeNumber::ROOT).expect("root").effnlink, 4);
        let f = fs.create(a, "f").expect("create");
        assert!(matches!(fs.rmdir(InodeNumber::ROOT, "a"), Err(FfsError::NotEmpty)));
        assert!(matches!(fs.unlink(InodeNumber::ROOT, "a"), Err(FfsError::IsDirectory)));
        assert!(matches!(fs.rmdir(a, "f"), Err(FfsError::NotDirectory)));

        fs.rename(a, "f", b, "g").expect("rename file");
        assert_eq!(fs.lookup(b, "g").expect("lookup"), Some(f));
        assert_eq!(fs.lookup(a, "f").expect("lookup"), None);

        fs.rename(InodeNumber::ROOT, "a", b, "a2").expect("rename dir");
        assert_eq!(fs.resolve("/b/a2").expect("resolve"), a);
        assert_eq!(fs.lookup(a, "..").expect("dotdot"), Some(b));
        assert!(matches!(
            fs.rename(InodeNumber::ROOT, "b", a, "loop"),
            Err(FfsError::Format(_))
        ));
        assert_eq!(fs.stat(InodeNumber::ROOT).expect("root").effnlink, 3);
        assert_eq!(fs.stat(b).expect("b").effnlink, 3);

        fs.rmdir(b, "a2").expect("rmdir");
        fs.unlink(b, "g").expect("unlink");
        fs.rmdir(InodeNumber::ROOT, "b").expect("rmdir b");
        fs.sync().expect("sync");
        assert_eq!(fs.stat(InodeNumber::ROOT).expect("root").din.nlink, 2);
        assert!(fs.readdir(InodeNumber::ROOT).expect("readdir").is_empty());
        fs.unmount().expect("unmount");
    }

    #[test]
    fn rename_over_existing_file_frees_the_old_one() {
        let (_device, fs) = fresh();
        let keep = fs.create(InodeNumber::ROOT, "keep").expect("create");
        let gone = fs.create(InodeNumber::ROOT, "gone").expect("create");
        fs.write_block(gone, LogicalBlock(0), b"old").expect("write");
        fs.sync().expect("sync");
        let before = fs.engine().recompute_summary().expect("summary");

        fs.rename(InodeNumber::ROOT, "keep", InodeNumber::ROOT, "gone").expect("rename");
        assert_eq!(fs.lookup(InodeNumber::ROOT, "gone").expect("lookup"), Some(keep));
        fs.sync().expect("sync");
        assert_eq!(fs.stat(gone).expect("stat").din.mode, 0);
        let after = fs.engine().recompute_summary().expect("summary");
        assert_eq!(after.nifree, before.nifree + 1);
        assert_eq!(fs.stat(keep).expect("stat").din.nlink, 1);
        fs.unmount().expect("unmount");
    }

    #[test]
    fn directory_grows_a_block_when_full() {
        let (_device, fs) = fresh();
        let dir = fs.mkdir(InodeNumber::ROOT, "d").expect("mkdir");
        // 20-byte entries: one 8 KiB block holds 399 of them.
        for n in 0..400 {
            fs.create(dir, &format!("entry{n:05}")).expect("create");
        }
        assert_eq!(fs.stat(dir).expect("stat").din.size, 2 * 8192);
        assert_eq!(fs.readdir(dir).expect("readdir").len(), 400);
        for n in (0..400).step_by(2) {
            fs.unlink(dir, &format!("entry{n:05}")).expect("unlink");
        }
        fs.create(dir, "a-much-longer-name-that-needs-compaction-to-fit").expect("create");
        assert_eq!(fs.stat(dir).expect("stat").din.size, 2 * 8192);
        fs.unmount().expect("unmount");
    }
}
