//! Consistency accumulator for fan-out requests
//!
//! Pure in-memory state machine: given a placement snapshot and a
//! consistency level, it folds per-host response events into per-shard
//! tallies and decides when the logical request is done. It performs no
//! I/O and never retries; the caller dispatches requests and stops as soon
//! as the returned state is terminal.
//!
//! Accounting is per shard, not per host: a host serving a partial shard
//! range advances only the shards it serves, so responses from several
//! partial hosts can jointly satisfy the level for the whole shard space.

use std::collections::HashMap;

use crate::topology::{ConsistencyLevel, Placement, ShardState};

/// Outcome of one per-host response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    /// The host answered successfully
    Success,
    /// The host answered with an error (or timed out upstream)
    Error,
}

/// Request-level state after an accumulated event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// More responses are needed
    Pending,
    /// Every shard met its success threshold
    Success,
    /// Some shard can no longer meet the level
    Failed,
}

impl RequestState {
    /// Whether the request has reached a terminal state
    pub fn is_done(&self) -> bool {
        !matches!(self, RequestState::Pending)
    }

    /// Whether the request terminated in failure
    pub fn is_failed(&self) -> bool {
        matches!(self, RequestState::Failed)
    }
}

/// Per-shard response tally
///
/// `responders` is the number of hosts serving the shard in any state; a
/// response from any of them consumes one outstanding slot. Successes are
/// clamped to the replication factor, errors to the responder count.
#[derive(Debug, Clone, Copy, Default)]
struct ShardTally {
    successes: u32,
    errors: u32,
    responders: u32,
}

impl ShardTally {
    fn pending(&self) -> u32 {
        self.responders
            .saturating_sub(self.successes.saturating_add(self.errors))
    }
}

/// Decides request completion over per-shard tallies
///
/// # Example
///
/// ```rust
/// use shardflow::topology::{
///     ConsistencyAccumulator, ConsistencyLevel, HostOutcome, Placement, RequestState,
///     ShardState, shards_range,
/// };
///
/// let placement = Placement::new(
///     3,
///     4,
///     [
///         ("h0".to_string(), shards_range(0, 3, ShardState::Available)),
///         ("h1".to_string(), shards_range(0, 3, ShardState::Available)),
///         ("h2".to_string(), shards_range(0, 3, ShardState::Available)),
///     ],
/// )
/// .unwrap();
///
/// let mut accum = ConsistencyAccumulator::new(&placement, ConsistencyLevel::One);
/// assert_eq!(accum.add("h1", HostOutcome::Success), RequestState::Success);
/// ```
pub struct ConsistencyAccumulator {
    level: ConsistencyLevel,
    replicas: u32,
    majority: u32,
    tallies: Vec<ShardTally>,
    host_shards: HashMap<String, Vec<(u32, ShardState)>>,
    state: RequestState,
}

impl ConsistencyAccumulator {
    /// Create an accumulator over a placement snapshot
    pub fn new(placement: &Placement, level: ConsistencyLevel) -> Self {
        let replicas = placement.replicas() as u32;
        let mut tallies = vec![ShardTally::default(); placement.num_shards() as usize];
        let mut host_shards = HashMap::new();

        for (host, shards) in placement.hosts() {
            let assignments: Vec<(u32, ShardState)> =
                shards.iter().map(|s| (s.id, s.state)).collect();
            for (shard, _) in &assignments {
                tallies[*shard as usize].responders += 1;
            }
            host_shards.insert(host.to_string(), assignments);
        }

        Self {
            level,
            replicas,
            majority: replicas / 2 + 1,
            tallies,
            host_shards,
            state: RequestState::Pending,
        }
    }

    /// Fold one per-host response into the tallies
    ///
    /// Returns the request state after the event. Once terminal, further
    /// calls return the terminal state without accumulating. Duplicate
    /// responses from the same host count independently; responses from
    /// hosts outside the placement are ignored.
    pub fn add(&mut self, host: &str, outcome: HostOutcome) -> RequestState {
        if self.state.is_done() {
            return self.state;
        }

        let assignments = match self.host_shards.get(host) {
            Some(assignments) => assignments,
            None => {
                tracing::debug!(host, "response from host not in placement, ignoring");
                return self.state;
            }
        };

        for (shard, state) in assignments {
            let tally = &mut self.tallies[*shard as usize];
            if outcome == HostOutcome::Success && state.is_serving() {
                tally.successes = (tally.successes + 1).min(self.replicas);
            } else {
                // Errors, and successes from initializing copies, consume a
                // responder slot without contributing success.
                tally.errors = (tally.errors + 1).min(tally.responders);
            }
        }

        self.state = self.evaluate();
        self.state
    }

    /// Current request state without accumulating an event
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Evaluate the request-level result from the per-shard tallies
    ///
    /// Success is checked before failure so that an event pushing a shard
    /// to both thresholds resolves in favor of success.
    fn evaluate(&self) -> RequestState {
        if self.tallies.iter().all(|t| self.shard_satisfied(t)) {
            return RequestState::Success;
        }
        if self.tallies.iter().any(|t| self.shard_unreachable(t)) {
            return RequestState::Failed;
        }
        RequestState::Pending
    }

    fn shard_satisfied(&self, tally: &ShardTally) -> bool {
        let reachable = tally.successes + tally.pending();
        match self.level {
            ConsistencyLevel::One => tally.successes >= 1,
            ConsistencyLevel::Majority => tally.successes >= self.majority,
            ConsistencyLevel::UnstrictMajority => {
                // Majority when reachable, otherwise settle for any success.
                tally.successes >= self.majority
                    || (tally.successes >= 1 && reachable < self.majority)
            }
            ConsistencyLevel::All => tally.successes >= self.replicas,
        }
    }

    fn shard_unreachable(&self, tally: &ShardTally) -> bool {
        let reachable = tally.successes + tally.pending();
        match self.level {
            ConsistencyLevel::One | ConsistencyLevel::UnstrictMajority => {
                tally.pending() == 0 && tally.successes == 0
            }
            ConsistencyLevel::Majority => reachable < self.majority,
            ConsistencyLevel::All => reachable < self.replicas,
        }
    }
}
