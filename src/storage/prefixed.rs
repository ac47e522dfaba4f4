use std::sync::Arc;

use super::{
    BatchOp, StorageDriver, StorageError, StorageIterator, StorageRow, WriteBatch,
};

/// Namespacing wrapper: every key passing through is prepended with a
/// fixed byte prefix, and rows coming back have it stripped. Sites use
/// this to pack several buckets into one storage engine.
pub struct PrefixedStorageDriver {
    prefix: Vec<u8>,
    inner: Arc<dyn StorageDriver>,
}

impl PrefixedStorageDriver {
    pub fn new(prefix: Vec<u8>, inner: Arc<dyn StorageDriver>) -> Self {
        Self { prefix, inner }
    }

    fn add_prefix(&self, key: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(self.prefix.len() + key.len());
        prefixed.extend_from_slice(&self.prefix);
        prefixed.extend_from_slice(key);
        prefixed
    }
}

struct StrippingIterator {
    strip: usize,
    inner: Box<dyn StorageIterator>,
}

impl StorageIterator for StrippingIterator {
    fn next_row(&mut self) -> Result<Option<StorageRow>, StorageError> {
        match self.inner.next_row()? {
            Some(row) => Ok(Some(StorageRow {
                prefix: row.prefix[self.strip.min(row.prefix.len())..].to_vec(),
                key: row.key[self.strip..].to_vec(),
                value: row.value,
            })),
            None => Ok(None),
        }
    }
}

impl StorageDriver for PrefixedStorageDriver {
    fn open(&self) -> Result<(), StorageError> {
        self.inner.open()
    }

    fn close(&self) -> Result<(), StorageError> {
        // The wrapped driver is shared with sibling namespaces; closing
        // it is the owner's call.
        Ok(())
    }

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        let prefixed: Vec<Vec<u8>> = keys.iter().map(|k| self.add_prefix(k)).collect();
        self.inner.get(&prefixed)
    }

    fn get_matches(&self, prefixes: &[Vec<u8>]) -> Result<Box<dyn StorageIterator>, StorageError> {
        let prefixed: Vec<Vec<u8>> = prefixes.iter().map(|p| self.add_prefix(p)).collect();
        Ok(Box::new(StrippingIterator {
            strip: self.prefix.len(),
            inner: self.inner.get_matches(&prefixed)?,
        }))
    }

    fn get_range(&self, start: &[u8], end: &[u8]) -> Result<Box<dyn StorageIterator>, StorageError> {
        let start = self.add_prefix(start);
        let end = if end.is_empty() {
            match super::prefix_successor(&self.prefix) {
                Some(end) => end,
                None => Vec::new(),
            }
        } else {
            self.add_prefix(end)
        };
        Ok(Box::new(StrippingIterator {
            strip: self.prefix.len(),
            inner: self.inner.get_range(&start, &end)?,
        }))
    }

    fn batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut prefixed = WriteBatch::new();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    prefixed.put(self.add_prefix(&key), value);
                }
                BatchOp::Delete { key } => {
                    prefixed.delete(self.add_prefix(&key));
                }
            }
        }
        self.inner.batch(prefixed)
    }
}
