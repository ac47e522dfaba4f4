use std::sync::Arc;

use async_trait::async_trait;

use crate::bucket::SiblingSetIterator;
use crate::data::{SiblingSet, UpdateBatch};
use crate::error::DbError;
use crate::partition::PartitionPool;

use super::state::NodeId;

/// Per-remote-node transport for the agent's fan-out. Implementations
/// route by `(node_id, partition)` and honour the caller's deadline by
/// returning promptly once the calling future is dropped.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    async fn batch(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        updates: &UpdateBatch,
    ) -> Result<(), DbError>;

    async fn get(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<SiblingSet>>, DbError>;

    async fn get_matches(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[Vec<u8>],
    ) -> Result<Box<dyn SiblingSetIterator>, DbError>;

    async fn merge(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        key: &[u8],
        set: &SiblingSet,
    ) -> Result<(), DbError>;
}

/// Routes node-client calls into in-process partitions. Serves the
/// single-node deployment and the integration tests; the multi-node
/// transport lives behind the same trait.
pub struct LocalNodeClient {
    local_node_id: NodeId,
    partitions: Arc<PartitionPool>,
}

impl LocalNodeClient {
    pub fn new(local_node_id: NodeId, partitions: Arc<PartitionPool>) -> Self {
        Self {
            local_node_id,
            partitions,
        }
    }

    fn bucket(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
    ) -> Result<(Arc<crate::partition::Partition>, Arc<crate::bucket::Bucket>), DbError> {
        if node_id != self.local_node_id {
            return Err(DbError::NoSuchNode);
        }
        let partition = self.partitions.get(partition)?;
        let site = partition.site(site_id)?;
        let bucket = site.buckets().get(bucket)?.bucket.clone();
        Ok((partition, bucket))
    }
}

#[async_trait]
impl NodeClient for LocalNodeClient {
    async fn batch(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        updates: &UpdateBatch,
    ) -> Result<(), DbError> {
        let (partition, bucket) = self.bucket(node_id, partition, site_id, bucket)?;
        partition.check_writable()?;
        bucket.batch(updates).await.map(|_| ())
    }

    async fn get(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<SiblingSet>>, DbError> {
        let (_, bucket) = self.bucket(node_id, partition, site_id, bucket)?;
        bucket.get(keys).await
    }

    async fn get_matches(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[Vec<u8>],
    ) -> Result<Box<dyn SiblingSetIterator>, DbError> {
        let (_, bucket) = self.bucket(node_id, partition, site_id, bucket)?;
        bucket.get_matches(keys).await
    }

    async fn merge(
        &self,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        key: &[u8],
        set: &SiblingSet,
    ) -> Result<(), DbError> {
        let (partition, bucket) = self.bucket(node_id, partition, site_id, bucket)?;
        // merge is the anti-entropy surface (sync pushes, read repair);
        // the read gate governs it, the write gate is for client batches
        partition.check_readable()?;
        bucket.merge(key, set).await
    }
}
