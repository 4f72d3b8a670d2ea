//! Shard topology: placement snapshots and consistency levels
//!
//! A placement describes which hosts serve which shards and in what state.
//! The [`accumulator`] submodule turns per-host response events into a
//! request-level consistency decision over a placement.

pub mod accumulator;

pub use accumulator::{ConsistencyAccumulator, HostOutcome, RequestState};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TopologyError};

/// State of one shard assignment on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    /// Replica is backfilling; does not count toward successful reads
    Initializing,
    /// Replica serves reads and writes
    Available,
    /// Replica still serves but is being decommissioned
    Leaving,
}

impl ShardState {
    /// Whether a response from this assignment can count as a success
    pub fn is_serving(&self) -> bool {
        matches!(self, ShardState::Available | ShardState::Leaving)
    }
}

/// One shard assignment: shard id plus the assignment's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Shard id in `[0, num_shards)`
    pub id: u32,
    /// Assignment state on the owning host
    pub state: ShardState,
}

impl Shard {
    /// Create a shard assignment
    pub fn new(id: u32, state: ShardState) -> Self {
        Self { id, state }
    }
}

/// Build the inclusive range `[from, to]` of shard assignments in one state
///
/// Mirrors how placements are written out in tests and fixtures.
pub fn shards_range(from: u32, to: u32, state: ShardState) -> Vec<Shard> {
    (from..=to).map(|id| Shard::new(id, state)).collect()
}

/// Consistency level of a fan-out request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// At least one serving copy per shard
    One,
    /// A strict majority of serving copies per shard
    Majority,
    /// A majority when reachable, otherwise any success per shard
    UnstrictMajority,
    /// Every copy per shard
    All,
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyLevel::One => write!(f, "one"),
            ConsistencyLevel::Majority => write!(f, "majority"),
            ConsistencyLevel::UnstrictMajority => write!(f, "unstrict_majority"),
            ConsistencyLevel::All => write!(f, "all"),
        }
    }
}

/// Immutable placement snapshot: hosts and their shard assignments
///
/// # Example
///
/// ```rust
/// use shardflow::topology::{Placement, ShardState, shards_range};
///
/// let placement = Placement::new(
///     3,
///     30,
///     [
///         ("host0".to_string(), shards_range(0, 29, ShardState::Available)),
///         ("host1".to_string(), shards_range(0, 29, ShardState::Available)),
///         ("host2".to_string(), shards_range(0, 29, ShardState::Available)),
///     ],
/// )
/// .unwrap();
/// assert_eq!(placement.replicas(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Placement {
    replicas: usize,
    num_shards: u32,
    assignments: HashMap<String, Vec<Shard>>,
}

impl Placement {
    /// Create a placement from host shard assignments
    ///
    /// Validates the replication factor, the shard count, shard id ranges,
    /// and host uniqueness. It deliberately does not require every shard to
    /// have `replicas` serving copies: placements observed mid-topology-change
    /// routinely violate that, and the accumulator must still decide over
    /// them.
    pub fn new(
        replicas: usize,
        num_shards: u32,
        assignments: impl IntoIterator<Item = (String, Vec<Shard>)>,
    ) -> Result<Self> {
        if replicas == 0 {
            return Err(TopologyError::InvalidReplicaFactor(replicas).into());
        }
        if num_shards == 0 {
            return Err(TopologyError::InvalidShardCount(num_shards).into());
        }

        let mut hosts: HashMap<String, Vec<Shard>> = HashMap::new();
        for (host, shards) in assignments {
            for shard in &shards {
                if shard.id >= num_shards {
                    return Err(TopologyError::ShardOutOfRange {
                        host,
                        shard: shard.id,
                        total: num_shards,
                    }
                    .into());
                }
            }
            if hosts.insert(host.clone(), shards).is_some() {
                return Err(TopologyError::DuplicateHost(host).into());
            }
        }

        Ok(Self {
            replicas,
            num_shards,
            assignments: hosts,
        })
    }

    /// Replication factor of the placement
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Total number of shards in the placement's shard space
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Shard assignments of a host, if the host is in the placement
    pub fn host_shards(&self, host: &str) -> Option<&[Shard]> {
        self.assignments.get(host).map(|shards| shards.as_slice())
    }

    /// Iterate over `(host, assignments)` pairs
    pub fn hosts(&self) -> impl Iterator<Item = (&str, &[Shard])> {
        self.assignments
            .iter()
            .map(|(host, shards)| (host.as_str(), shards.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shards_range() {
        let shards = shards_range(3, 5, ShardState::Leaving);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].id, 3);
        assert_eq!(shards[2].id, 5);
        assert!(shards.iter().all(|s| s.state == ShardState::Leaving));
    }

    #[test]
    fn test_shard_state_serving() {
        assert!(ShardState::Available.is_serving());
        assert!(ShardState::Leaving.is_serving());
        assert!(!ShardState::Initializing.is_serving());
    }

    #[test]
    fn test_placement_validation() {
        let err = Placement::new(0, 4, []).unwrap_err();
        assert!(err.to_string().contains("replication factor"));

        let err = Placement::new(3, 0, []).unwrap_err();
        assert!(err.to_string().contains("shard count"));

        let err = Placement::new(
            3,
            4,
            [(
                "h0".to_string(),
                vec![Shard::new(4, ShardState::Available)],
            )],
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_placement_accessors() {
        let placement = Placement::new(
            3,
            8,
            [
                ("h0".to_string(), shards_range(0, 7, ShardState::Available)),
                ("h1".to_string(), shards_range(0, 3, ShardState::Initializing)),
            ],
        )
        .unwrap();

        assert_eq!(placement.replicas(), 3);
        assert_eq!(placement.num_shards(), 8);
        assert_eq!(placement.host_shards("h0").unwrap().len(), 8);
        assert_eq!(placement.host_shards("h1").unwrap().len(), 4);
        assert!(placement.host_shards("missing").is_none());
        assert_eq!(placement.hosts().count(), 2);
    }

    #[test]
    fn test_consistency_level_display() {
        assert_eq!(ConsistencyLevel::UnstrictMajority.to_string(), "unstrict_majority");
        assert_eq!(ConsistencyLevel::All.to_string(), "all");
    }
}
