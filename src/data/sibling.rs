use serde::{Deserialize, Serialize};

use super::hash::{hash_bytes, Hash};
use super::version::Dvv;

/// One concurrent version of a key's value. Immutable once created; a
/// `None` value marks a tombstone awaiting purge.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sibling {
    pub clock: Dvv,
    pub value: Option<Vec<u8>>,
    pub timestamp: u64,
}

impl Sibling {
    pub fn new(clock: Dvv, value: Vec<u8>, timestamp: u64) -> Self {
        Self {
            clock,
            value: Some(value),
            timestamp,
        }
    }

    pub fn tombstone(clock: Dvv, timestamp: u64) -> Self {
        Self {
            clock,
            value: None,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Digest over the canonical JSON encoding. The JSON form is stable
    /// (context maps are ordered), so replicas that converge on the same
    /// sibling produce the same digest.
    pub fn hash(&self) -> Hash {
        let encoded = serde_json::to_vec(self).expect("sibling encoding is infallible");
        hash_bytes(&encoded)
    }
}
