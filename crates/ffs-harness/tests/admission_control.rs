#![forbid(unsafe_code)]

use ffs_block::{ByteDevice, MemoryByteDevice};
use ffs_harness::crash::formatted_image;
use ffs_harness::{MiniFs, check};
use ffs_softdep::SoftdepConfig;
use ffs_types::InodeNumber;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Sixteen inodedeps before callers are throttled; removals are throttled
/// past eight and the worklist counts as backlogged past one item.
fn tight() -> SoftdepConfig {
    SoftdepConfig {
        worklist_interval: Duration::from_millis(5),
        ..SoftdepConfig::for_vnodes(4)
    }
}

fn mount(config: SoftdepConfig) -> (Arc<MemoryByteDevice>, Arc<MiniFs>) {
    let image = formatted_image().expect("format");
    let device = Arc::new(MemoryByteDevice::new(image.len()));
    device.write_all_at(0, &image).expect("copy image");
    let fs = MiniFs::mount(device.clone(), config).expect("mount");
    (device, fs)
}

fn unmount_clean(device: &MemoryByteDevice, fs: &MiniFs) {
    fs.unmount().expect("unmount");
    let report = check(device).expect("fsck");
    assert!(report.is_clean(), "{report:?}");
}

#[test]
fn inode_pressure_throttles_unlinks_until_sync_clears_it() {
    let (device, fs) = mount(tight());
    let engine = fs.engine();
    assert!(!engine.slowdown());

    for i in 0..24 {
        fs.create(InodeNumber::ROOT, &format!("f{i}")).expect("create");
    }
    assert!(fs.stats().inodedeps as usize >= engine.config().max_softdeps_hard());
    assert!(engine.slowdown());

    fs.sync().expect("sync");
    assert!(!engine.slowdown(), "{:?}", fs.stats());
    let before = fs.stats();
    assert!(before.inodedeps < 4, "{before:?}");

    // Each unlink tracks the link count drop of an inode the engine had
    // already forgotten.
    for i in 0..22 {
        fs.unlink(InodeNumber::ROOT, &format!("f{i}")).expect("unlink");
    }
    let after = fs.stats();
    assert!(after.ino_limit_push > before.ino_limit_push, "{after:?}");
    assert_eq!(
        after.ino_limit_hit - before.ino_limit_hit,
        after.ino_limit_push - before.ino_limit_push,
        "no worker, so every wait runs out"
    );
    assert!(after.blk_limit_push > before.blk_limit_push, "{after:?}");
    assert_eq!(after.worklist_push, before.worklist_push, "nothing was queued yet");
    assert!(engine.slowdown());
    assert_eq!(fs.stats().sync_limit_hit, after.sync_limit_hit + 1);

    fs.sync().expect("sync");
    assert!(!engine.slowdown(), "{:?}", fs.stats());
    unmount_clean(&device, &fs);
}

#[test]
fn backlogged_worklist_is_drained_by_the_removing_caller() {
    let (device, fs) = mount(tight());
    for i in 0..12 {
        fs.create(InodeNumber::ROOT, &format!("f{i}")).expect("create");
    }
    fs.sync().expect("sync");
    for i in 0..10 {
        fs.unlink(InodeNumber::ROOT, &format!("f{i}")).expect("unlink");
    }
    // Writing the directory page turns the removals into work items.
    fs.fsync(InodeNumber::ROOT).expect("fsync root");
    let before = fs.stats();
    assert!(before.on_worklist > 1, "{before:?}");
    assert!(before.dirrems as usize > fs.engine().config().max_softdeps / 2, "{before:?}");

    fs.unlink(InodeNumber::ROOT, "f10").expect("unlink f10");
    let after = fs.stats();
    assert_eq!(after.worklist_push, before.worklist_push + 2);
    assert_eq!(after.dirrems + 1, before.dirrems, "two ran inline, one was added");
    assert_eq!(after.blk_limit_push, before.blk_limit_push, "no sleep when work can be done");

    unmount_clean(&device, &fs);
}

#[test]
fn background_worker_empties_the_worklist() {
    let (device, fs) = mount(tight());
    for i in 0..6 {
        fs.create(InodeNumber::ROOT, &format!("f{i}")).expect("create");
    }
    fs.sync().expect("sync");
    for i in 0..6 {
        fs.unlink(InodeNumber::ROOT, &format!("f{i}")).expect("unlink");
    }
    fs.fsync(InodeNumber::ROOT).expect("fsync root");
    assert!(fs.stats().on_worklist > 0);

    fs.spawn_worker().expect("spawn worker");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = fs.stats();
        if stats.on_worklist == 0 && stats.dirrems == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "worker left {stats:?}");
        thread::sleep(Duration::from_millis(2));
    }
    // Unmount stops the worker before the final flush.
    unmount_clean(&device, &fs);
}
