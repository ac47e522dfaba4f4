use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use super::{
    prefix_successor, BatchOp, StorageDriver, StorageError, StorageIterator, StorageRow,
    VecIterator, WriteBatch,
};

/// Ordered in-memory driver. Useful for tests and ephemeral replicas;
/// the durable deployments use the redb-backed driver.
#[derive(Default)]
pub struct MemoryStorageDriver {
    state: Mutex<Option<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorageDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Some(BTreeMap::new())),
        }
    }
}

impl MemoryStorageDriver {
    fn scan(
        map: &BTreeMap<Vec<u8>, Vec<u8>>,
        prefix: &[u8],
        out: &mut Vec<StorageRow>,
    ) {
        let upper = match prefix_successor(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        for (key, value) in map.range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), upper)) {
            out.push(StorageRow {
                prefix: prefix.to_vec(),
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
}

impl StorageDriver for MemoryStorageDriver {
    fn open(&self) -> Result<(), StorageError> {
        let mut guard = self.state.lock().unwrap();
        if guard.is_none() {
            *guard = Some(BTreeMap::new());
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        *self.state.lock().unwrap() = None;
        Ok(())
    }

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        let guard = self.state.lock().unwrap();
        let map = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(keys.iter().map(|k| map.get(k).cloned()).collect())
    }

    fn get_matches(&self, prefixes: &[Vec<u8>]) -> Result<Box<dyn StorageIterator>, StorageError> {
        let guard = self.state.lock().unwrap();
        let map = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut rows = Vec::new();
        for prefix in prefixes {
            Self::scan(map, prefix, &mut rows);
        }
        Ok(Box::new(VecIterator::new(rows)))
    }

    fn get_range(&self, start: &[u8], end: &[u8]) -> Result<Box<dyn StorageIterator>, StorageError> {
        let guard = self.state.lock().unwrap();
        let map = guard.as_ref().ok_or(StorageError::Closed)?;

        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        let rows = map
            .range::<Vec<u8>, _>((Bound::Included(start.to_vec()), upper))
            .map(|(key, value)| StorageRow {
                prefix: Vec::new(),
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(Box::new(VecIterator::new(rows)))
    }

    fn batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut guard = self.state.lock().unwrap();
        let map = guard.as_mut().ok_or(StorageError::Closed)?;

        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}
