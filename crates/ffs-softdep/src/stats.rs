#![forbid(unsafe_code)]
//! Engine counters.

use serde::{Deserialize, Serialize};

/// Snapshot of the engine's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftdepStats {
    /// Items processed inline by throttled callers.
    pub worklist_push: u64,
    /// Removal cleanups requested / satisfied by the timer.
    pub blk_limit_push: u64,
    pub blk_limit_hit: u64,
    /// Inode cleanups requested / satisfied by the timer.
    pub ino_limit_push: u64,
    pub ino_limit_hit: u64,
    /// Slowdown queries that answered yes.
    pub sync_limit_hit: u64,
    /// Buffers redirtied after rolling back indirect pointers.
    pub indir_blk_ptrs: u64,
    /// Buffers redirtied after writing a zeroed, not yet allocated inode.
    pub inode_bitmap: u64,
    /// Buffers redirtied after rolling back direct pointers.
    pub direct_blk_ptrs: u64,
    /// Buffers redirtied after rolling back directory entries.
    pub dir_entry: u64,
    /// Live record counts at snapshot time.
    pub inodedeps: u64,
    pub dirrems: u64,
    pub on_worklist: u64,
}

/// Which timer-hit counter a pending cleanup request charges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum LimitCounter {
    #[default]
    Ino,
    Blk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_serialize_as_flat_object() {
        let stats = SoftdepStats {
            dir_entry: 3,
            inodedeps: 7,
            ..SoftdepStats::default()
        };
        let value = serde_json::to_value(stats).expect("serialize");
        assert_eq!(value["dir_entry"], 3);
        assert_eq!(value["inodedeps"], 7);
        let back: SoftdepStats = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, stats);
    }
}
