#![forbid(unsafe_code)]

use ffs_block::{BufferCache, ByteDevice, DirtyBuf, MemoryByteDevice, Vnode};
use ffs_types::{BlockNumber, InodeNumber, LogicalBlock};
use std::sync::Arc;

const FSIZE: u32 = 1024;

fn setup(frags: usize) -> (Arc<MemoryByteDevice>, Arc<BufferCache>) {
    let dev = Arc::new(MemoryByteDevice::new(frags * FSIZE as usize));
    let cache = Arc::new(BufferCache::new(dev.clone(), FSIZE).expect("cache"));
    (dev, cache)
}

#[test]
fn concurrent_writers_on_disjoint_blocks_all_reach_disk() {
    let (dev, cache) = setup(64);
    let handles: Vec<_> = (0..4_u64)
        .map(|t| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..8_u64 {
                    let blkno = BlockNumber(t * 16 + i * 2);
                    let vnode = Vnode::File(InodeNumber(10 + t));
                    let mut buf = cache.getblk(vnode, LogicalBlock(i.cast_signed()), blkno, 2048);
                    buf.data.fill(u8::try_from(t + 1).expect("small"));
                    cache.bdwrite(buf);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("writer");
    }

    assert_eq!(cache.dirty_blocks(Vnode::File(InodeNumber(11))).len(), 8);
    assert_eq!(cache.stats().dirty, 32);
    assert_eq!(cache.flush_all(3).expect("flush"), 32);

    let image = dev.snapshot();
    for t in 0..4_usize {
        let first = t * 16 * FSIZE as usize;
        assert_eq!(image[first], u8::try_from(t + 1).expect("small"));
    }
    assert_eq!(cache.stats().dirty, 0);
}

#[test]
fn contended_block_serializes_read_modify_write() {
    let (dev, cache) = setup(8);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let mut buf = cache
                        .bread(Vnode::Device, LogicalBlock(1), BlockNumber(1), 1024)
                        .expect("bread");
                    let n = u32::from_le_bytes(buf.data[..4].try_into().expect("4 bytes"));
                    buf.data[..4].copy_from_slice(&(n + 1).to_le_bytes());
                    cache.bdwrite(buf);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("worker");
    }
    match cache.try_acquire(BlockNumber(1), true) {
        DirtyBuf::Acquired(buf) => cache.bwrite(buf).expect("write"),
        other => panic!("expected dirty buffer, got {other:?}"),
    }
    let mut out = [0_u8; 4];
    dev.read_exact_at(1024, &mut out).expect("read back");
    assert_eq!(u32::from_le_bytes(out), 200);
}

#[test]
fn invalidated_buffer_is_reread_from_disk() {
    let (dev, cache) = setup(8);
    dev.write_all_at(2048, &[5_u8; 1024]).expect("seed");
    let mut buf = cache
        .bread(Vnode::Device, LogicalBlock(2), BlockNumber(2), 1024)
        .expect("bread");
    buf.data.fill(6);
    cache.invalidate(buf).expect("invalidate");
    assert!(!cache.incore(BlockNumber(2)));
    let buf = cache
        .bread(Vnode::Device, LogicalBlock(2), BlockNumber(2), 1024)
        .expect("bread again");
    assert!(buf.data.iter().all(|b| *b == 5));
    cache.brelse(buf);
}
