use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::DbError;
use crate::site::Site;

/// One partition's local holdings: the site replicas placed on this node
/// plus the transfer gates. A partition starts fully locked and is
/// unlocked by the node coordinator once its data is in place.
pub struct Partition {
    number: u64,
    writes_locked: AtomicBool,
    reads_locked: AtomicBool,
    sites: RwLock<HashMap<String, Arc<Site>>>,
}

impl Partition {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            writes_locked: AtomicBool::new(true),
            reads_locked: AtomicBool::new(true),
            sites: RwLock::new(HashMap::new()),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn lock_writes(&self) {
        self.writes_locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock_writes(&self) {
        self.writes_locked.store(false, Ordering::SeqCst);
    }

    pub fn lock_reads(&self) {
        self.reads_locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock_reads(&self) {
        self.reads_locked.store(false, Ordering::SeqCst);
    }

    /// Write paths call this first and fail fast during transfers.
    pub fn check_writable(&self) -> Result<(), DbError> {
        if self.writes_locked.load(Ordering::SeqCst) {
            Err(DbError::PartitionLocked)
        } else {
            Ok(())
        }
    }

    /// Gate for the anti-entropy surface: sync sessions, push ingest,
    /// repair write-back, and outgoing transfers all check this first.
    pub fn check_readable(&self) -> Result<(), DbError> {
        if self.reads_locked.load(Ordering::SeqCst) {
            Err(DbError::PartitionLocked)
        } else {
            Ok(())
        }
    }

    pub fn add_site(&self, site: Arc<Site>) {
        self.sites
            .write()
            .unwrap()
            .insert(site.id().to_string(), site);
    }

    pub fn remove_site(&self, site_id: &str) {
        self.sites.write().unwrap().remove(site_id);
    }

    pub fn site(&self, site_id: &str) -> Result<Arc<Site>, DbError> {
        self.sites
            .read()
            .unwrap()
            .get(site_id)
            .cloned()
            .ok_or(DbError::NoSuchSite)
    }
}

/// The partitions this node currently holds.
#[derive(Default)]
pub struct PartitionPool {
    partitions: RwLock<HashMap<u64, Arc<Partition>>>,
}

impl PartitionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the partition (read and write locked) if absent.
    pub fn add(&self, number: u64) -> Arc<Partition> {
        self.partitions
            .write()
            .unwrap()
            .entry(number)
            .or_insert_with(|| Arc::new(Partition::new(number)))
            .clone()
    }

    pub fn remove(&self, number: u64) {
        self.partitions.write().unwrap().remove(&number);
    }

    pub fn get(&self, number: u64) -> Result<Arc<Partition>, DbError> {
        self.partitions
            .read()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or(DbError::NoSuchPartition)
    }
}
