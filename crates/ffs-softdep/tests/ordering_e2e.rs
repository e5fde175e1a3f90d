#![forbid(unsafe_code)]

use ffs_alloc::CylinderGroup;
use ffs_block::{BufferCache, ByteDevice, DirtyBuf, MemoryByteDevice, Vnode};
use ffs_dir::DT_REG;
use ffs_error::{FfsError, Result};
use ffs_inode::{Dinode, IFREG, Inode};
use ffs_softdep::{FsOps, LinkCounts, PassMode, Softdep, SoftdepConfig};
use ffs_types::{BlockNumber, FsFormat, FsGeometry, GroupNumber, InodeNumber, LogicalBlock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Filesystem side of the engine: keeps inodes in a map and records what
/// the engine releases.
struct StubFs {
    geometry: FsGeometry,
    cache: Arc<BufferCache>,
    engine: Mutex<Weak<Softdep>>,
    inodes: Mutex<HashMap<InodeNumber, Inode>>,
    freed_blocks: Mutex<Vec<(InodeNumber, BlockNumber, u32)>>,
    freed_inodes: Mutex<Vec<InodeNumber>>,
    released: Mutex<Vec<InodeNumber>>,
}

impl StubFs {
    fn inode(&self, ino: InodeNumber) -> Inode {
        self.inodes.lock().get(&ino).cloned().expect("inode is resident")
    }

    fn put(&self, ip: Inode) {
        self.inodes.lock().insert(ip.number, ip);
    }

    fn write_inode(&self, ino: InodeNumber, wait: bool) -> Result<()> {
        let engine = self
            .engine
            .lock()
            .upgrade()
            .ok_or_else(|| FfsError::Format("engine gone".to_owned()))?;
        let ip = self.inode(ino);
        let blkno = self.geometry.ino_to_fsba(ino);
        let mut bp = self.cache.bread(
            Vnode::Device,
            LogicalBlock(blkno.0.cast_signed()),
            blkno,
            self.geometry.bsize as usize,
        )?;
        ip.store(&self.geometry, &mut bp.data)
            .map_err(|err| FfsError::Parse(err.to_string()))?;
        engine.update_inodeblock(&ip, &bp, wait)?;
        if wait {
            self.cache.bwrite(bp)
        } else {
            self.cache.bdwrite(bp);
            Ok(())
        }
    }
}

impl FsOps for StubFs {
    fn free_blocks(&self, ino: InodeNumber, blkno: BlockNumber, size: u32) -> Result<()> {
        self.freed_blocks.lock().push((ino, blkno, size));
        Ok(())
    }

    fn free_inode(&self, ino: InodeNumber, _mode: u16) -> Result<()> {
        self.freed_inodes.lock().push(ino);
        Ok(())
    }

    fn vget(&self, _ino: InodeNumber) -> Result<()> {
        Ok(())
    }

    fn release(&self, ino: InodeNumber) -> Result<()> {
        self.released.lock().push(ino);
        Ok(())
    }

    fn is_inode_locked(&self, _ino: InodeNumber) -> bool {
        false
    }

    fn adjust_link_count(&self, ino: InodeNumber, delta: i16) -> Result<LinkCounts> {
        let mut inodes = self.inodes.lock();
        let ip = inodes
            .get_mut(&ino)
            .ok_or_else(|| FfsError::Format(format!("inode {ino} not resident")))?;
        ip.din.nlink += delta;
        Ok(LinkCounts {
            nlink: ip.din.nlink,
            effnlink: ip.effnlink,
        })
    }

    fn truncate(&self, _ino: InodeNumber) -> Result<()> {
        Ok(())
    }

    fn update(&self, ino: InodeNumber, wait: bool) -> Result<()> {
        self.write_inode(ino, wait)
    }

    fn fsync(&self, _ino: InodeNumber, _wait: bool) -> Result<()> {
        Ok(())
    }

    fn bmap(&self, _ino: InodeNumber, _lbn: LogicalBlock) -> Result<Option<(BlockNumber, usize)>> {
        Ok(None)
    }

    fn flush_files(&self) -> Result<()> {
        Ok(())
    }
}

struct Fixture {
    geometry: FsGeometry,
    device: Arc<MemoryByteDevice>,
    cache: Arc<BufferCache>,
    engine: Arc<Softdep>,
    fs: Arc<StubFs>,
}

impl Fixture {
    fn new() -> Self {
        let geometry = FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 2, 2048, 64).expect("geometry");
        let len = usize::try_from(u64::from(geometry.ncg) * u64::from(geometry.fpg) * u64::from(geometry.fsize))
            .expect("image length");
        let device = Arc::new(MemoryByteDevice::new(len));
        for cg in 0..geometry.ncg {
            let group = GroupNumber(cg);
            let mut data = vec![0_u8; geometry.bsize as usize];
            CylinderGroup::format(&geometry, group, &mut data).expect("format group");
            device
                .write_all_at(geometry.frag_to_byte(geometry.cgtod(group)), &data)
                .expect("write group");
        }
        let cache = Arc::new(BufferCache::new(device.clone(), geometry.fsize).expect("cache"));
        let engine = Softdep::new(geometry, SoftdepConfig::default(), Arc::clone(&cache));
        let fs = Arc::new(StubFs {
            geometry,
            cache: Arc::clone(&cache),
            engine: Mutex::new(Arc::downgrade(&engine)),
            inodes: Mutex::new(HashMap::new()),
            freed_blocks: Mutex::new(Vec::new()),
            freed_inodes: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        });
        engine.set_fs_ops(Arc::downgrade(&fs) as Weak<dyn FsOps>);
        Self {
            geometry,
            device,
            cache,
            engine,
            fs,
        }
    }

    fn bsize(&self) -> usize {
        self.geometry.bsize as usize
    }

    fn cg_blkno(&self) -> BlockNumber {
        self.geometry.cgtod(GroupNumber(0))
    }

    /// The `n`th full block of the data area of group 0.
    fn data_block(&self, n: u64) -> BlockNumber {
        BlockNumber(self.geometry.cgdmin(GroupNumber(0)).0 + n * u64::from(self.geometry.frag()))
    }

    fn with_cg(&self, f: impl FnOnce(&ffs_block::Buf)) {
        let blkno = self.cg_blkno();
        let bp = self
            .cache
            .bread(Vnode::Device, LogicalBlock(blkno.0.cast_signed()), blkno, self.bsize())
            .expect("read group");
        f(&bp);
        self.cache.bdwrite(bp);
    }

    fn write(&self, blkno: BlockNumber) {
        match self.cache.try_acquire(blkno, true) {
            DirtyBuf::Acquired(bp) => self.cache.bwrite(bp).expect("write"),
            other => panic!("block {blkno} not dirty: {other:?}"),
        }
    }

    fn disk_block(&self, blkno: BlockNumber) -> Vec<u8> {
        let mut data = vec![0_u8; self.bsize()];
        self.device
            .read_exact_at(self.geometry.frag_to_byte(blkno), &mut data)
            .expect("read device");
        data
    }

    fn disk_inode(&self, ino: InodeNumber) -> Inode {
        Inode::load(&self.geometry, &self.disk_block(self.geometry.ino_to_fsba(ino)), ino).expect("decode inode")
    }

    /// Lay down a root directory block naming `entries` directly on disk.
    fn root_block_on_disk(&self, blkno: BlockNumber, entries: &[(&str, u32)]) -> Vec<usize> {
        let mut block = vec![0_u8; self.bsize()];
        ffs_dir::init_dir_block(&mut block, 2, 2).expect("init");
        let offsets = entries
            .iter()
            .map(|(name, ino)| ffs_dir::add_entry(&mut block, *ino, name.as_bytes(), DT_REG).expect("add"))
            .collect();
        self.device
            .write_all_at(self.geometry.frag_to_byte(blkno), &block)
            .expect("write dir block");
        offsets
    }
}

fn regular_file(ino: InodeNumber) -> Inode {
    Inode::new(
        ino,
        Dinode {
            mode: IFREG | 0o644,
            nlink: 1,
            generation: 1,
            ..Dinode::default()
        },
    )
}

#[test]
fn new_entry_stays_rolled_back_until_its_inode_is_durable() {
    let fx = Fixture::new();
    let ino = InodeNumber(5);
    let dirblk = fx.data_block(1);
    fx.root_block_on_disk(dirblk, &[]);

    fx.with_cg(|cg| fx.engine.setup_inomapdep(cg, ino).expect("inomapdep"));
    fx.fs.put(regular_file(ino));
    let mut bp = fx
        .cache
        .bread(Vnode::File(InodeNumber::ROOT), LogicalBlock(0), dirblk, fx.bsize())
        .expect("read dir");
    let offset = ffs_dir::add_entry(&mut bp.data, 5, b"a", DT_REG).expect("add entry");
    let sync = fx
        .engine
        .setup_directory_add(&bp, InodeNumber::ROOT, offset as u64, ino, None, false)
        .expect("directory add");
    assert!(!sync);
    fx.cache.bdwrite(bp);

    // The page goes out first: the entry must not name the inode yet.
    fx.write(dirblk);
    assert_eq!(ffs_dir::entry_ino(&fx.disk_block(dirblk), offset).expect("entry"), 0);
    assert!(fx.cache.is_dirty(dirblk));
    assert_eq!(fx.engine.stats().dir_entry, 1);

    // The inode block before the bitmap: the inode goes out zeroed.
    fx.fs.update(ino, false).expect("update");
    let iblk = fx.geometry.ino_to_fsba(ino);
    fx.write(iblk);
    assert_eq!(fx.disk_inode(ino).din.mode, 0);
    assert_eq!(fx.engine.stats().inode_bitmap, 1);

    fx.write(fx.cg_blkno());
    fx.write(iblk);
    assert_eq!(fx.disk_inode(ino).din.mode, IFREG | 0o644);
    fx.write(dirblk);
    assert_eq!(ffs_dir::entry_ino(&fx.disk_block(dirblk), offset).expect("entry"), 5);

    fx.engine.with_graph(|g| {
        assert!(g.buf_deps(dirblk).is_empty());
        assert!(g.find_inodedep(ino).is_none());
    });
    assert_eq!(fx.cache.stats().dirty, 0);
}

#[test]
fn rewriting_a_durable_directory_page_changes_nothing() {
    let fx = Fixture::new();
    let ino = InodeNumber(7);
    let dirblk = fx.data_block(3);
    fx.root_block_on_disk(dirblk, &[]);

    fx.with_cg(|cg| fx.engine.setup_inomapdep(cg, ino).expect("inomapdep"));
    fx.fs.put(regular_file(ino));
    let mut bp = fx
        .cache
        .bread(Vnode::File(InodeNumber::ROOT), LogicalBlock(0), dirblk, fx.bsize())
        .expect("read dir");
    let offset = ffs_dir::add_entry(&mut bp.data, 7, b"kept", DT_REG).expect("add entry");
    fx.engine
        .setup_directory_add(&bp, InodeNumber::ROOT, offset as u64, ino, None, false)
        .expect("directory add");
    fx.cache.bdwrite(bp);

    // Bitmap, then inode, then the page: nothing is rolled back.
    fx.write(fx.cg_blkno());
    fx.fs.update(ino, false).expect("update");
    fx.write(fx.geometry.ino_to_fsba(ino));
    fx.write(dirblk);
    let durable = fx.disk_block(dirblk);
    assert_eq!(ffs_dir::entry_ino(&durable, offset).expect("entry"), 7);
    let rollbacks = fx.engine.stats().dir_entry;
    assert_eq!(rollbacks, 0);

    for _ in 0..2 {
        let bp = fx
            .cache
            .bread(Vnode::File(InodeNumber::ROOT), LogicalBlock(0), dirblk, fx.bsize())
            .expect("read dir");
        fx.cache.bdwrite(bp);
        fx.write(dirblk);
        assert_eq!(fx.disk_block(dirblk), durable);
    }
    fx.engine.with_graph(|g| {
        assert!(g.find_pagedep(InodeNumber::ROOT, LogicalBlock(0)).is_none());
        assert!(g.buf_deps(dirblk).is_empty());
    });
    assert_eq!(fx.engine.stats().dir_entry, rollbacks);
    assert_eq!(fx.cache.stats().dirty, 0);
}

#[test]
fn removal_drops_the_link_only_after_the_page_is_durable() {
    let fx = Fixture::new();
    let ino = InodeNumber(6);
    let dirblk = fx.data_block(2);
    fx.root_block_on_disk(dirblk, &[("victim", 6)]);
    fx.fs.put(regular_file(ino));

    let mut bp = fx
        .cache
        .bread(Vnode::File(InodeNumber::ROOT), LogicalBlock(0), dirblk, fx.bsize())
        .expect("read dir");
    let (offset, old) = ffs_dir::remove_entry(&mut bp.data, b"victim")
        .expect("remove")
        .expect("entry present");
    assert_eq!(old, 6);
    fx.fs.inodes.lock().get_mut(&ino).expect("resident").effnlink = 0;
    fx.engine.change_linkcnt(ino, 1, 0).expect("linkcnt");
    fx.engine
        .setup_remove(&bp, InodeNumber::ROOT, offset as u64, ino, false)
        .expect("remove");
    fx.cache.bdwrite(bp);

    assert_eq!(fx.engine.process_worklist(PassMode::Flush).expect("pass"), 0);
    assert_eq!(fx.fs.inode(ino).din.nlink, 1);

    fx.write(dirblk);
    assert!(ffs_dir::lookup(&fx.disk_block(dirblk), b"victim").expect("lookup").is_none());
    assert!(fx.engine.process_worklist(PassMode::Flush).expect("pass") >= 1);
    assert_eq!(fx.fs.inode(ino).din.nlink, 0);
    assert_eq!(fx.fs.released.lock().as_slice(), &[ino]);
}

#[test]
fn truncated_blocks_wait_for_the_zeroed_inode() {
    let fx = Fixture::new();
    let ino = InodeNumber(7);
    let blk = fx.data_block(3);
    let bsize = fx.geometry.bsize;

    fx.with_cg(|cg| {
        fx.engine.setup_inomapdep(cg, ino).expect("inomapdep");
        fx.engine.setup_blkmapdep(cg, blk).expect("blkmapdep");
    });
    let mut ip = regular_file(ino);
    ip.din.size = u64::from(bsize);
    ip.din.blocks = u64::from(fx.geometry.frag());
    ip.din.db[0] = blk.0.cast_signed();
    let mut dbp = fx.cache.getblk(Vnode::File(ino), LogicalBlock(0), blk, fx.bsize());
    dbp.data[..4].copy_from_slice(b"data");
    fx.engine
        .setup_allocdirect(&ip, LogicalBlock(0), blk, BlockNumber(0), bsize, 0, &dbp)
        .expect("allocdirect");
    fx.cache.bdwrite(dbp);
    fx.fs.put(ip);
    fx.fs.update(ino, false).expect("update");
    fx.cache.flush_all(8).expect("flush");
    assert_eq!(fx.cache.stats().dirty, 0);
    assert_eq!(fx.disk_inode(ino).din.db[0], blk.0.cast_signed());

    let mut ip = fx.fs.inode(ino);
    fx.engine.setup_freeblocks(&mut ip).expect("freeblocks");
    assert_eq!(ip.din.db[0], 0);
    assert_eq!(ip.din.size, 0);
    fx.fs.put(ip);
    fx.fs.update(ino, false).expect("update");
    assert!(!fx.cache.incore(blk), "file buffers are discarded");

    assert_eq!(fx.engine.process_worklist(PassMode::Flush).expect("pass"), 0);
    assert!(fx.fs.freed_blocks.lock().is_empty(), "old inode still on disk");

    fx.write(fx.geometry.ino_to_fsba(ino));
    assert_eq!(fx.disk_inode(ino).din.db[0], 0);
    assert!(fx.engine.process_worklist(PassMode::Flush).expect("pass") >= 1);
    assert_eq!(fx.fs.freed_blocks.lock().as_slice(), &[(ino, blk, bsize)]);
}

#[test]
fn never_written_inode_is_released_at_once() {
    let fx = Fixture::new();
    let ino = InodeNumber(8);
    let blk = fx.data_block(4);
    let bsize = fx.geometry.bsize;

    fx.with_cg(|cg| {
        fx.engine.setup_inomapdep(cg, ino).expect("inomapdep");
        fx.engine.setup_blkmapdep(cg, blk).expect("blkmapdep");
    });
    let mut ip = regular_file(ino);
    ip.din.size = u64::from(bsize);
    ip.din.blocks = u64::from(fx.geometry.frag());
    ip.din.db[0] = blk.0.cast_signed();
    let dbp = fx.cache.getblk(Vnode::File(ino), LogicalBlock(0), blk, fx.bsize());
    fx.engine
        .setup_allocdirect(&ip, LogicalBlock(0), blk, BlockNumber(0), bsize, 0, &dbp)
        .expect("allocdirect");
    fx.cache.bdwrite(dbp);
    fx.fs.put(ip.clone());

    fx.engine.setup_freeblocks(&mut ip).expect("freeblocks");
    assert_eq!(fx.fs.freed_blocks.lock().as_slice(), &[(ino, blk, bsize)]);
    fx.engine.freefile(ino, IFREG | 0o644).expect("freefile");
    assert_eq!(fx.fs.freed_inodes.lock().as_slice(), &[ino]);
}

#[test]
fn fsync_with_unwritten_pointer_updates_wedges_the_engine() {
    let fx = Fixture::new();
    let ino = InodeNumber(9);
    let blk = fx.data_block(5);
    fx.with_cg(|cg| fx.engine.setup_blkmapdep(cg, blk).expect("blkmapdep"));
    let ip = regular_file(ino);
    let dbp = fx.cache.getblk(Vnode::File(ino), LogicalBlock(0), blk, fx.bsize());
    fx.engine
        .setup_allocdirect(&ip, LogicalBlock(0), blk, BlockNumber(0), fx.geometry.bsize, 0, &dbp)
        .expect("allocdirect");
    fx.cache.bdwrite(dbp);

    let err = fx.engine.fsync(ino).expect_err("pending pointer update");
    assert!(matches!(err, FfsError::Invariant(_)), "{err:?}");
    assert!(fx.engine.is_wedged());
    assert!(matches!(
        fx.engine.process_worklist(PassMode::Flush),
        Err(FfsError::Invariant(_))
    ));
}

#[test]
fn dump_lists_the_dependencies_of_a_buffer() {
    let fx = Fixture::new();
    let ino = InodeNumber(10);
    fx.with_cg(|cg| fx.engine.setup_inomapdep(cg, ino).expect("inomapdep"));
    let dump = fx.engine.print(fx.cg_blkno());
    assert!(dump.starts_with("  deps:\n"));
    assert!(dump.contains("bmsafemap"), "{dump}");
}
