//! Quorum decisions over independent failure observations

use serde::{Deserialize, Serialize};

use crate::config::{QuorumConfig, QuorumMode};

/// One observer's verdict on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub observer: String,
    pub down: bool,
    pub observed_at_ms: i64,
}

/// Down votes out of all counted observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub down: usize,
    pub total: usize,
}

impl Tally {
    /// Count the local verdict plus every fresh peer observation
    ///
    /// Observations by `local_id` and those older than `max_age_ms` are
    /// ignored.
    pub fn collect(
        local_id: &str,
        local_down: bool,
        peers: &[Observation],
        now_ms: i64,
        max_age_ms: i64,
    ) -> Self {
        let mut tally = Tally {
            down: usize::from(local_down),
            total: 1,
        };
        for peer in peers {
            if peer.observer == local_id || now_ms - peer.observed_at_ms > max_age_ms {
                continue;
            }
            tally.total += 1;
            if peer.down {
                tally.down += 1;
            }
        }
        tally
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumPolicy {
    mode: QuorumMode,
    min_votes: usize,
}

impl QuorumPolicy {
    pub fn new(config: &QuorumConfig) -> Self {
        Self {
            mode: config.mode,
            min_votes: config.min_votes.max(1),
        }
    }

    pub fn reached(&self, tally: Tally) -> bool {
        match self.mode {
            QuorumMode::Majority => tally.down * 2 > tally.total,
            QuorumMode::Fixed => tally.down >= self.min_votes,
        }
    }
}
