#![forbid(unsafe_code)]
//! Reference filesystem, consistency checker and crash-replay suite for the
//! soft-updates engine.
//!
//! [`MiniFs`] is a small FFS that routes every metadata update through
//! [`ffs_softdep::Softdep`]. [`check`] inspects a raw image the way `fsck`
//! would after a crash, and [`crash`] replays write prefixes of generated
//! workloads against both.

pub mod crash;
pub mod fsck;
pub mod minifs;

pub use crash::{
    RecordingDevice, ReplayConfig, ReplayReport, Workload, plan_workload, replay_workload, run_replay,
};
pub use fsck::{FsckReport, Image, check};
pub use minifs::{FS_MAGIC, MiniFs, Superblock};
