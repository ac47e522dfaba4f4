use std::collections::HashMap;
use std::sync::Arc;

use crate::bucket::{Bucket, BucketConfig, ConflictStrategy};
use crate::clock::Clock;
use crate::error::DbError;
use crate::storage::{PrefixedStorageDriver, StorageDriver};
use crate::sync::MERKLE_MIN_DEPTH;

// Bucket namespaces inside a site's storage. Stable across
// implementations; never reorder.
const DEFAULT_BUCKET_PREFIX: u8 = 0;
const CLOUD_BUCKET_PREFIX: u8 = 1;
const LWW_BUCKET_PREFIX: u8 = 2;
const LOCAL_BUCKET_PREFIX: u8 = 3;

/*──────────────────── replication policies ─────────────────*/

/// Which peers a bucket exchanges data with. Outgoing governs initiating
/// sync sessions and update broadcast; incoming governs accepting
/// sessions and standalone pushes.
pub trait ReplicationPolicy: Send + Sync + 'static {
    fn should_replicate_outgoing(&self, peer_id: &str) -> bool;
    fn should_replicate_incoming(&self, peer_id: &str) -> bool;
}

/// Replicates both ways with any peer.
pub struct Shared;

impl ReplicationPolicy for Shared {
    fn should_replicate_outgoing(&self, _peer_id: &str) -> bool {
        true
    }

    fn should_replicate_incoming(&self, _peer_id: &str) -> bool {
        true
    }
}

/// Never pushed out; accepts incoming data only from the authoritative
/// cloud peer.
pub struct Cloud;

pub const CLOUD_PEER_ID: &str = "cloud";

impl ReplicationPolicy for Cloud {
    fn should_replicate_outgoing(&self, _peer_id: &str) -> bool {
        false
    }

    fn should_replicate_incoming(&self, peer_id: &str) -> bool {
        peer_id == CLOUD_PEER_ID
    }
}

/// Device-private data; never replicated in either direction.
pub struct Local;

impl ReplicationPolicy for Local {
    fn should_replicate_outgoing(&self, _peer_id: &str) -> bool {
        false
    }

    fn should_replicate_incoming(&self, _peer_id: &str) -> bool {
        false
    }
}

/*──────────────────── bucket registry ──────────────────────*/

#[derive(Clone)]
pub struct BucketRef {
    pub bucket: Arc<Bucket>,
    pub policy: Arc<dyn ReplicationPolicy>,
}

/// Name-to-bucket registry for one site replica. Consulted by the sync
/// controller, the garbage collector, and the local request paths.
#[derive(Default)]
pub struct BucketList {
    buckets: HashMap<String, BucketRef>,
}

impl BucketList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bucket: Arc<Bucket>, policy: Arc<dyn ReplicationPolicy>) -> &mut Self {
        self.buckets
            .insert(bucket.name().to_string(), BucketRef { bucket, policy });
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&BucketRef, DbError> {
        self.buckets.get(name).ok_or(DbError::NoSuchBucket)
    }

    pub fn all(&self) -> impl Iterator<Item = &BucketRef> {
        self.buckets.values()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.keys().cloned().collect();
        names.sort();
        names
    }
}

/*──────────────────── site construction ────────────────────*/

/// A site replica: the standard bucket set for one tenant, packed into
/// one storage engine under per-bucket prefixes.
pub struct Site {
    id: String,
    buckets: Arc<BucketList>,
}

impl Site {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn buckets(&self) -> &Arc<BucketList> {
        &self.buckets
    }
}

/// Builds site replicas over a shared storage engine. Cloud nodes key
/// each site's namespace by site ID; relays hold exactly one site and
/// use the bucket prefix alone.
pub struct SiteFactory {
    pub node_id: String,
    pub merkle_depth: u8,
    pub storage: Arc<dyn StorageDriver>,
    pub clock: Arc<dyn Clock>,
    /// Prepend the site ID to each bucket namespace (cloud mode).
    pub per_site_namespaces: bool,
}

impl SiteFactory {
    fn bucket_storage(&self, site_id: &str, bucket_prefix: u8) -> Arc<dyn StorageDriver> {
        let mut prefix = Vec::new();
        if self.per_site_namespaces {
            prefix.extend_from_slice(site_id.as_bytes());
        }
        prefix.push(bucket_prefix);
        Arc::new(PrefixedStorageDriver::new(prefix, self.storage.clone()))
    }

    fn open_bucket(
        &self,
        site_id: &str,
        name: &str,
        prefix: u8,
        depth: u8,
        strategy: ConflictStrategy,
    ) -> Result<Arc<Bucket>, DbError> {
        Ok(Arc::new(Bucket::open(
            BucketConfig {
                name: name.to_string(),
                replica_id: self.node_id.clone(),
                merkle_depth: depth,
                strategy,
            },
            self.bucket_storage(site_id, prefix),
            self.clock.clone(),
        )?))
    }

    pub fn create_site(&self, site_id: &str) -> Result<Site, DbError> {
        let mut buckets = BucketList::new();

        buckets.add(
            self.open_bucket(
                site_id,
                "default",
                DEFAULT_BUCKET_PREFIX,
                self.merkle_depth,
                ConflictStrategy::Causal,
            )?,
            Arc::new(Shared),
        );
        buckets.add(
            self.open_bucket(
                site_id,
                "cloud",
                CLOUD_BUCKET_PREFIX,
                self.merkle_depth,
                ConflictStrategy::Causal,
            )?,
            Arc::new(Cloud),
        );
        buckets.add(
            self.open_bucket(
                site_id,
                "lww",
                LWW_BUCKET_PREFIX,
                self.merkle_depth,
                ConflictStrategy::LastWriterWins,
            )?,
            Arc::new(Shared),
        );
        buckets.add(
            self.open_bucket(
                site_id,
                "local",
                LOCAL_BUCKET_PREFIX,
                MERKLE_MIN_DEPTH,
                ConflictStrategy::Causal,
            )?,
            Arc::new(Local),
        );

        Ok(Site {
            id: site_id.to_string(),
            buckets: Arc::new(buckets),
        })
    }
}
