use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-replica event counters. Keys are replica IDs, values are the
/// highest counter observed for that replica; absent means zero.
pub type VersionVector = BTreeMap<String, u64>;

/// A single event issued by one replica.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    pub replica: String,
    pub counter: u64,
}

impl Dot {
    pub fn new(replica: impl Into<String>, counter: u64) -> Self {
        Self {
            replica: replica.into(),
            counter,
        }
    }
}

/// Dotted version vector: the causal history a writer had observed
/// (`context`) plus the one new event it issued (`dot`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dvv {
    pub dot: Dot,
    pub context: VersionVector,
}

impl Dvv {
    pub fn new(dot: Dot, context: VersionVector) -> Self {
        Self { dot, context }
    }

    fn context_counter(&self, replica: &str) -> u64 {
        self.context.get(replica).copied().unwrap_or(0)
    }

    /// Highest counter this clock carries for `replica`, considering
    /// both the context and the dot itself.
    pub fn max_dot(&self, replica: &str) -> u64 {
        let mut max = self.context_counter(replica);
        if self.dot.replica == replica && self.dot.counter > max {
            max = self.dot.counter;
        }
        max
    }

    /// Replica IDs mentioned anywhere in this clock.
    pub fn replicas(&self) -> impl Iterator<Item = &str> {
        let dot_replica = if self.context.contains_key(&self.dot.replica) {
            None
        } else {
            Some(self.dot.replica.as_str())
        };
        self.context.keys().map(|r| r.as_str()).chain(dot_replica)
    }

    /// Happens-before: `other` has observed every event this clock
    /// carries, including its dot, with at least one comparison strict.
    /// Equal clocks and incomparable (concurrent) clocks are both false.
    pub fn happened_before(&self, other: &Dvv) -> bool {
        if self == other {
            return false;
        }

        let mut strict = false;

        let dot_ceiling = other.context_counter(&self.dot.replica);
        if self.dot.counter > dot_ceiling {
            return false;
        }
        strict |= self.dot.counter < dot_ceiling;

        for (replica, counter) in &self.context {
            let theirs = other.context_counter(replica);
            if *counter > theirs {
                return false;
            }
            strict |= *counter < theirs;
        }

        // replicas we have never heard of count as zero on our side
        for (replica, counter) in &other.context {
            strict |= *counter > 0 && !self.context.contains_key(replica);
        }

        strict
    }
}
