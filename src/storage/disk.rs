use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Mutex;

use redb::{Database, TableDefinition};

use super::{
    prefix_successor, BatchOp, StorageDriver, StorageError, StorageIterator, StorageRow,
    VecIterator, WriteBatch,
};

const KV_TABLE: TableDefinition<&[u8], Vec<u8>> = TableDefinition::new("kv");

fn redb_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

/// Durable ordered-KV driver backed by redb. Scans snapshot matching
/// rows under a read transaction; bucket-sized result sets are expected.
pub struct DiskStorageDriver {
    path: PathBuf,
    db: Mutex<Option<Database>>,
}

impl DiskStorageDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: Mutex::new(None),
        }
    }

    fn collect_range(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        prefix: &[u8],
        out: &mut Vec<StorageRow>,
    ) -> Result<(), StorageError> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;

        let txn = db.begin_read().map_err(redb_err)?;
        let table = txn.open_table(KV_TABLE).map_err(redb_err)?;
        for entry in table.range::<&[u8]>((lower, upper)).map_err(redb_err)? {
            let (key, value) = entry.map_err(redb_err)?;
            out.push(StorageRow {
                prefix: prefix.to_vec(),
                key: key.value().to_vec(),
                value: value.value(),
            });
        }
        Ok(())
    }
}

impl StorageDriver for DiskStorageDriver {
    fn open(&self) -> Result<(), StorageError> {
        let mut guard = self.db.lock().unwrap();
        // Reopening implicitly closes the previous handle.
        guard.take();

        let db = Database::create(&self.path).map_err(redb_err)?;
        let txn = db.begin_write().map_err(redb_err)?;
        txn.open_table(KV_TABLE).map_err(redb_err)?;
        txn.commit().map_err(redb_err)?;

        *guard = Some(db);
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.lock().unwrap().take();
        Ok(())
    }

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;

        let txn = db.begin_read().map_err(redb_err)?;
        let table = txn.open_table(KV_TABLE).map_err(redb_err)?;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let got = table.get(key.as_slice()).map_err(redb_err)?;
            values.push(got.map(|v| v.value()));
        }
        Ok(values)
    }

    fn get_matches(&self, prefixes: &[Vec<u8>]) -> Result<Box<dyn StorageIterator>, StorageError> {
        let mut rows = Vec::new();
        for prefix in prefixes {
            let end = prefix_successor(prefix);
            let upper = match &end {
                Some(end) => Bound::Excluded(end.as_slice()),
                None => Bound::Unbounded,
            };
            self.collect_range(Bound::Included(prefix.as_slice()), upper, prefix, &mut rows)?;
        }
        Ok(Box::new(VecIterator::new(rows)))
    }

    fn get_range(&self, start: &[u8], end: &[u8]) -> Result<Box<dyn StorageIterator>, StorageError> {
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };
        let mut rows = Vec::new();
        self.collect_range(Bound::Included(start), upper, &[], &mut rows)?;
        Ok(Box::new(VecIterator::new(rows)))
    }

    fn batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let guard = self.db.lock().unwrap();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;

        let txn = db.begin_write().map_err(redb_err)?;
        {
            let mut table = txn.open_table(KV_TABLE).map_err(redb_err)?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value).map_err(redb_err)?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_slice()).map_err(redb_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(redb_err)?;
        Ok(())
    }
}
