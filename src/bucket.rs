use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::clock::Clock;
use crate::data::{Sibling, SiblingSet, UpdateBatch, UpdateOp};
use crate::data::Hash;
use crate::error::DbError;
use crate::merkle::MerkleTree;
use crate::storage::{StorageDriver, WriteBatch};
use crate::sync::{MERKLE_DEFAULT_DEPTH, MERKLE_MAX_DEPTH, MERKLE_MIN_DEPTH};

// Sub-namespaces inside a bucket's (already prefixed) storage: per-key
// sibling set records, and the leaf-to-key index the sync responder
// walks when streaming objects under a merkle subtree.
const DATA_PREFIX: u8 = 0;
const INDEX_PREFIX: u8 = 1;

/// How a bucket resolves concurrent writes to one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Keep every concurrent sibling; clients see conflicts.
    Causal,
    /// Collapse to the sibling with the largest timestamp.
    LastWriterWins,
}

#[derive(Clone, Debug)]
pub struct BucketConfig {
    pub name: String,
    /// Replica ID stamped into the dots of writes this bucket accepts.
    pub replica_id: String,
    pub merkle_depth: u8,
    pub strategy: ConflictStrategy,
}

/// Streamed `(prefix, key, sibling set)` rows from a match scan.
pub trait SiblingSetIterator: Send {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>, SiblingSet)>, DbError>;
}

pub struct VecSiblingSetIterator {
    rows: std::vec::IntoIter<(Vec<u8>, Vec<u8>, SiblingSet)>,
}

impl VecSiblingSetIterator {
    pub fn new(rows: Vec<(Vec<u8>, Vec<u8>, SiblingSet)>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl SiblingSetIterator for VecSiblingSetIterator {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>, SiblingSet)>, DbError> {
        Ok(self.rows.next())
    }
}

/// One replica's store for a named bucket: per-key sibling sets plus the
/// merkle summary tree, kept consistent under a single exclusive lock so
/// batches are linearizable with respect to each other and to merges.
pub struct Bucket {
    name: String,
    replica_id: String,
    strategy: ConflictStrategy,
    storage: Arc<dyn StorageDriver>,
    clock: Arc<dyn Clock>,
    merkle: Mutex<MerkleTree>,
}

fn data_key(key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + key.len());
    k.push(DATA_PREFIX);
    k.extend_from_slice(key);
    k
}

fn index_key(leaf: u32, key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(5 + key.len());
    k.push(INDEX_PREFIX);
    k.extend_from_slice(&leaf.to_be_bytes());
    k.extend_from_slice(key);
    k
}

fn decode_set(key: &[u8], raw: &[u8]) -> Option<SiblingSet> {
    match serde_json::from_slice::<SiblingSet>(raw) {
        Ok(set) => Some(set),
        Err(e) => {
            // Treated as absent for reads; the next merge overwrites it.
            warn!(key = ?String::from_utf8_lossy(key), %e, "bucket: corrupt sibling set record");
            None
        }
    }
}

impl Bucket {
    /// Opens the bucket and rebuilds the merkle tree by streaming every
    /// persisted record.
    pub fn open(
        config: BucketConfig,
        storage: Arc<dyn StorageDriver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DbError> {
        let mut depth = config.merkle_depth;
        if !(MERKLE_MIN_DEPTH..=MERKLE_MAX_DEPTH).contains(&depth) {
            depth = MERKLE_DEFAULT_DEPTH;
        }

        let mut tree = MerkleTree::new(depth);
        let mut it = storage.get_matches(&[vec![DATA_PREFIX]]).map_err(DbError::from)?;
        while let Some(row) = it.next_row().map_err(DbError::from)? {
            let key = &row.key[1..];
            if let Some(set) = decode_set(key, &row.value) {
                let leaf = tree.leaf_for_key(key);
                tree.update_leaf(leaf, Hash::ZERO, set.hash(key));
            }
        }

        Ok(Self {
            name: config.name,
            replica_id: config.replica_id,
            strategy: config.strategy,
            storage,
            clock,
            merkle: Mutex::new(tree),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Run a closure against the merkle tree snapshot. Sync sessions use
    /// this for all tree math and hash lookups.
    pub async fn with_merkle<R>(&self, f: impl FnOnce(&MerkleTree) -> R) -> R {
        let tree = self.merkle.lock().await;
        f(&tree)
    }

    pub async fn merkle_depth(&self) -> u8 {
        self.with_merkle(|t| t.depth()).await
    }

    fn resolve(&self, set: SiblingSet) -> SiblingSet {
        match self.strategy {
            ConflictStrategy::Causal => set,
            ConflictStrategy::LastWriterWins => {
                if set.size() <= 1 {
                    return set;
                }
                let winner = set
                    .iter()
                    .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.cmp(b)))
                    .cloned();
                match winner {
                    Some(w) => SiblingSet::new(vec![w]),
                    None => set,
                }
            }
        }
    }

    fn load_set(&self, key: &[u8]) -> Result<Option<SiblingSet>, DbError> {
        let values = self.storage.get(&[data_key(key)]).map_err(DbError::from)?;
        Ok(values
            .into_iter()
            .next()
            .flatten()
            .and_then(|raw| decode_set(key, &raw)))
    }

    /// Loads each key's sibling set; missing keys yield `None`.
    pub async fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<SiblingSet>>, DbError> {
        if keys.is_empty() || keys.iter().any(|k| k.is_empty()) {
            return Err(DbError::InvalidInput);
        }

        let _tree = self.merkle.lock().await;
        let data_keys: Vec<Vec<u8>> = keys.iter().map(|k| data_key(k)).collect();
        let values = self.storage.get(&data_keys).map_err(DbError::from)?;

        Ok(keys
            .iter()
            .zip(values)
            .map(|(key, raw)| raw.and_then(|raw| decode_set(key, &raw)))
            .collect())
    }

    /// Streams `(prefix, key, set)` for every key matching one of the
    /// prefixes, prefix by prefix in key order. A key matching several
    /// prefixes is emitted once per matching prefix.
    pub async fn get_matches(
        &self,
        prefixes: &[Vec<u8>],
    ) -> Result<Box<dyn SiblingSetIterator>, DbError> {
        if prefixes.is_empty() || prefixes.iter().any(|p| p.is_empty()) {
            return Err(DbError::InvalidInput);
        }

        let _tree = self.merkle.lock().await;
        let data_prefixes: Vec<Vec<u8>> = prefixes.iter().map(|p| data_key(p)).collect();
        let mut it = self.storage.get_matches(&data_prefixes).map_err(DbError::from)?;

        let mut rows = Vec::new();
        while let Some(row) = it.next_row().map_err(DbError::from)? {
            let key = row.key[1..].to_vec();
            let prefix = row.prefix[1..].to_vec();
            if let Some(set) = decode_set(&key, &row.value) {
                rows.push((prefix, key, set));
            }
        }
        Ok(Box::new(VecSiblingSetIterator::new(rows)))
    }

    /// Applies a client update batch: one storage batch covering every
    /// new sibling set and its merkle index row, with the tree updated
    /// under the same exclusive lock. Returns the updated sets, which
    /// the sync controller broadcasts to peers.
    pub async fn batch(
        &self,
        updates: &UpdateBatch,
    ) -> Result<BTreeMap<Vec<u8>, SiblingSet>, DbError> {
        let mut tree = self.merkle.lock().await;

        let mut updated: BTreeMap<Vec<u8>, SiblingSet> = BTreeMap::new();
        let mut originals: BTreeMap<Vec<u8>, SiblingSet> = BTreeMap::new();
        let timestamp = self.clock.now();

        for update in updates.updates() {
            if update.key.is_empty() {
                return Err(DbError::InvalidInput);
            }

            let current = match updated.get(&update.key) {
                Some(set) => set.clone(),
                None => {
                    let set = self.load_set(&update.key)?.unwrap_or_default();
                    originals.insert(update.key.clone(), set.clone());
                    set
                }
            };

            let clock = current.event(&update.context, &self.replica_id);
            let sibling = match update.op {
                UpdateOp::Put => Sibling::new(
                    clock.clone(),
                    update.value.clone().unwrap_or_default(),
                    timestamp,
                ),
                UpdateOp::Delete => Sibling::tombstone(clock.clone(), timestamp),
            };

            let next = self.resolve(current.discard(&clock).insert(sibling));
            updated.insert(update.key.clone(), next);
        }

        let mut batch = WriteBatch::new();
        for (key, set) in &updated {
            let encoded = serde_json::to_vec(set).map_err(|e| DbError::Storage(e.to_string()))?;
            batch.put(data_key(key), encoded);
            batch.put(index_key(tree.leaf_for_key(key), key), Vec::new());
        }
        self.storage.batch(batch).map_err(DbError::from)?;

        for (key, set) in &updated {
            let old_hash = originals
                .get(key)
                .map(|s| s.hash(key))
                .unwrap_or(Hash::ZERO);
            let leaf = tree.leaf_for_key(key);
            tree.update_leaf(leaf, old_hash, set.hash(key));
        }

        Ok(updated)
    }

    /// Merges an incoming sibling set (from a sync push or read repair)
    /// into the local record. A no-op when the merge changes nothing.
    pub async fn merge(&self, key: &[u8], incoming: &SiblingSet) -> Result<(), DbError> {
        if key.is_empty() {
            return Err(DbError::InvalidInput);
        }

        let mut tree = self.merkle.lock().await;

        let current = self.load_set(key)?.unwrap_or_default();
        let merged = self.resolve(current.sync(incoming));
        if merged == current {
            return Ok(());
        }

        let encoded = serde_json::to_vec(&merged).map_err(|e| DbError::Storage(e.to_string()))?;
        let leaf = tree.leaf_for_key(key);
        let mut batch = WriteBatch::new();
        batch.put(data_key(key), encoded);
        batch.put(index_key(leaf, key), Vec::new());
        self.storage.batch(batch).map_err(DbError::from)?;

        tree.update_leaf(leaf, current.hash(key), merged.hash(key));
        Ok(())
    }

    /// Physically deletes keys whose sibling sets are entirely
    /// tombstones older than the cutoff. Returns the purge count.
    pub async fn garbage_collect(&self, purge_cutoff: u64) -> Result<usize, DbError> {
        let mut tree = self.merkle.lock().await;

        let mut it = self.storage.get_matches(&[vec![DATA_PREFIX]]).map_err(DbError::from)?;
        let mut purged: Vec<(Vec<u8>, SiblingSet)> = Vec::new();
        while let Some(row) = it.next_row().map_err(DbError::from)? {
            let key = row.key[1..].to_vec();
            if let Some(set) = decode_set(&key, &row.value) {
                if set.can_purge(purge_cutoff) {
                    purged.push((key, set));
                }
            }
        }

        if purged.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for (key, _) in &purged {
            batch.delete(data_key(key));
            batch.delete(index_key(tree.leaf_for_key(key), key));
        }
        self.storage.batch(batch).map_err(DbError::from)?;

        for (key, set) in &purged {
            let leaf = tree.leaf_for_key(key);
            tree.update_leaf(leaf, set.hash(key), Hash::ZERO);
        }

        Ok(purged.len())
    }

    /// Next `(key, set)` under the merkle subtree rooted at `node`,
    /// strictly after `cursor` in index order. The sync responder walks
    /// this one object at a time.
    pub async fn next_merkle_object(
        &self,
        node: u32,
        cursor: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, SiblingSet, Vec<u8>)>, DbError> {
        let tree = self.merkle.lock().await;
        if node == 0 || node >= tree.node_limit() {
            return Err(DbError::InvalidInput);
        }
        let (low, high) = tree.leaf_range(node);

        let start = match cursor {
            Some(cursor) => {
                // smallest index key strictly greater than the cursor
                let mut s = cursor.to_vec();
                s.push(0x00);
                s
            }
            None => index_key(low, &[]),
        };
        let end = index_key(high + 1, &[]);

        let mut it = self.storage.get_range(&start, &end).map_err(DbError::from)?;
        while let Some(row) = it.next_row().map_err(DbError::from)? {
            let key = row.key[5..].to_vec();
            match self.load_set(&key)? {
                Some(set) => return Ok(Some((key, set, row.key))),
                // index row left behind by a purge racing the scan
                None => continue,
            }
        }
        Ok(None)
    }
}
