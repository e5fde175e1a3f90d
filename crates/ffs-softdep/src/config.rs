#![forbid(unsafe_code)]
//! Engine tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest admission-control sleep: two ticks of a 100 Hz clock.
pub const MIN_TICKDELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftdepConfig {
    /// Expected number of in-core vnodes; sizes the lookup tables.
    pub initial_vnodes: usize,
    /// Soft cap on inodedeps and half-cap on dirrems.
    pub max_softdeps: usize,
    /// Longest a throttled caller waits for the background worker.
    pub tickdelay: Duration,
    /// Period of the background worker.
    pub worklist_interval: Duration,
    /// Longest a single background pass may run.
    pub worklist_time_budget: Duration,
}

impl Default for SoftdepConfig {
    fn default() -> Self {
        Self::for_vnodes(256)
    }
}

impl SoftdepConfig {
    /// Defaults derived from a vnode count.
    #[must_use]
    pub fn for_vnodes(initial_vnodes: usize) -> Self {
        Self {
            initial_vnodes,
            max_softdeps: initial_vnodes.saturating_mul(4),
            tickdelay: MIN_TICKDELAY,
            worklist_interval: Duration::from_secs(1),
            worklist_time_budget: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn pagedep_buckets(&self) -> usize {
        (self.initial_vnodes / 5).max(1)
    }

    #[must_use]
    pub fn inodedep_buckets(&self) -> usize {
        self.initial_vnodes.max(1)
    }

    #[must_use]
    pub fn newblk_buckets(&self) -> usize {
        64
    }

    /// `tickdelay`, never below [`MIN_TICKDELAY`].
    #[must_use]
    pub fn effective_tickdelay(&self) -> Duration {
        self.tickdelay.max(MIN_TICKDELAY)
    }

    /// Hard limit used by the slowdown query.
    #[must_use]
    pub fn max_softdeps_hard(&self) -> usize {
        self.max_softdeps.saturating_mul(11) / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_vnode_count() {
        let c = SoftdepConfig::default();
        assert_eq!(c.initial_vnodes, 256);
        assert_eq!(c.max_softdeps, 1024);
        assert_eq!(c.pagedep_buckets(), 51);
        assert_eq!(c.max_softdeps_hard(), 1126);
        assert_eq!(c.effective_tickdelay(), Duration::from_millis(20));
    }

    #[test]
    fn tickdelay_is_clamped() {
        let c = SoftdepConfig {
            tickdelay: Duration::from_millis(1),
            ..SoftdepConfig::default()
        };
        assert_eq!(c.effective_tickdelay(), MIN_TICKDELAY);
    }

    #[test]
    fn json_round_trip_with_missing_fields() {
        let c: SoftdepConfig =
            serde_json::from_str(r#"{"initial_vnodes": 1000}"#).expect("parse partial config");
        assert_eq!(c.initial_vnodes, 1000);
        assert_eq!(c.max_softdeps, 1024, "missing fields take the defaults");
        let text = serde_json::to_string(&c).expect("serialize");
        let back: SoftdepConfig = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, c);
    }
}
