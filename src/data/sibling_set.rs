use serde::{Deserialize, Deserializer, Serialize};

use super::hash::{hash_bytes, Hash};
use super::sibling::Sibling;
use super::version::{Dot, Dvv, VersionVector};

/// The antichain of currently-live siblings for one key. No member
/// happens-before another; the set is kept sorted so structural equality
/// and the JSON encoding are canonical.
///
/// Serialized as a plain JSON array of siblings; this is both the
/// persisted per-key record and the wire form carried by sync pushes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SiblingSet {
    siblings: Vec<Sibling>,
}

// Decoded records pass through the constructor so the antichain and
// ordering invariants hold no matter what the wire carried.
impl<'de> Deserialize<'de> for SiblingSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let siblings = Vec::<Sibling>::deserialize(deserializer)?;
        Ok(SiblingSet::new(siblings))
    }
}

impl SiblingSet {
    pub fn new(siblings: Vec<Sibling>) -> Self {
        let mut set = Self { siblings };
        set.normalize();
        set
    }

    pub fn empty() -> Self {
        Self::default()
    }

    // Invariant: the set is an antichain under happens-before. Sorting
    // makes equality and the JSON encoding canonical; the dominance
    // filter drops anything a sibling in the same set supersedes.
    fn normalize(&mut self) {
        self.siblings.sort();
        self.siblings.dedup();

        let dominated: Vec<bool> = self
            .siblings
            .iter()
            .map(|s| {
                self.siblings
                    .iter()
                    .any(|other| s.clock.happened_before(&other.clock))
            })
            .collect();
        let mut index = 0;
        self.siblings.retain(|_| {
            let keep = !dominated[index];
            index += 1;
            keep
        });
    }

    pub fn size(&self) -> usize {
        self.siblings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sibling> {
        self.siblings.iter()
    }

    /// Resolved value when the key has exactly one live version.
    /// Conflicting or deleted keys resolve to `None`.
    pub fn value(&self) -> Option<&[u8]> {
        if self.siblings.len() != 1 {
            return None;
        }
        self.siblings[0].value.as_deref()
    }

    pub fn is_tombstone_set(&self) -> bool {
        !self.is_empty() && self.siblings.iter().all(|s| s.is_tombstone())
    }

    /// True when every sibling is a tombstone older than the purge
    /// cutoff, which makes the key eligible for physical deletion.
    pub fn can_purge(&self, timestamp_cutoff: u64) -> bool {
        !self.is_empty()
            && self
                .siblings
                .iter()
                .all(|s| s.is_tombstone() && s.timestamp < timestamp_cutoff)
    }

    /// CRDT merge. Keeps every sibling from either side that is not
    /// causally dominated by a sibling from the union; equal-clock
    /// duplicates from the other side are dropped in favor of ours.
    /// Commutative, associative, and idempotent.
    pub fn sync(&self, other: &SiblingSet) -> SiblingSet {
        let mut merged = Vec::new();

        for mine in &self.siblings {
            let obsolete = other
                .siblings
                .iter()
                .any(|theirs| mine.clock.happened_before(&theirs.clock) || mine.clock == theirs.clock);
            if !obsolete {
                merged.push(mine.clone());
            }
        }

        for theirs in &other.siblings {
            let obsolete = self
                .siblings
                .iter()
                .any(|mine| theirs.clock.happened_before(&mine.clock));
            if !obsolete {
                merged.push(theirs.clone());
            }
        }

        SiblingSet::new(merged)
    }

    /// Drop siblings whose clock happened before `clock`. Used to
    /// garbage-collect the causal predecessors of an incoming write.
    pub fn discard(&self, clock: &Dvv) -> SiblingSet {
        SiblingSet::new(
            self.siblings
                .iter()
                .filter(|s| !s.clock.happened_before(clock))
                .cloned()
                .collect(),
        )
    }

    /// Produce the clock for a new write issued by `replica` with the
    /// client-supplied causal context.
    pub fn event(&self, context: &VersionVector, replica: &str) -> Dvv {
        let mut counter = context.get(replica).copied().unwrap_or(0);

        for sibling in &self.siblings {
            let max_dot = sibling.clock.max_dot(replica);
            if max_dot > counter {
                counter = max_dot;
            }
        }

        Dvv::new(Dot::new(replica, counter + 1), context.clone())
    }

    /// Per-replica maximum across all siblings' clocks. Clients echo
    /// this back as the context of their next write.
    pub fn join(&self) -> VersionVector {
        let mut collective = VersionVector::new();

        for sibling in &self.siblings {
            let replicas: Vec<String> = sibling.clock.replicas().map(|r| r.to_string()).collect();
            for replica in replicas {
                let max_dot = sibling.clock.max_dot(&replica);
                let entry = collective.entry(replica).or_insert(0);
                if *entry < max_dot {
                    *entry = max_dot;
                }
            }
        }

        collective
    }

    pub fn insert(&self, sibling: Sibling) -> SiblingSet {
        let mut siblings = self.siblings.clone();
        siblings.push(sibling);
        SiblingSet::new(siblings)
    }

    /// Deterministic merkle contribution for this key. An empty set
    /// hashes to zero so deleted-and-purged keys vanish from the tree.
    pub fn hash(&self, key: &[u8]) -> Hash {
        let mut result = Hash::ZERO;

        for sibling in &self.siblings {
            result = result.xor(sibling.hash());
        }

        if !result.is_zero() {
            result = result.xor(hash_bytes(key));
        }

        result
    }
}
