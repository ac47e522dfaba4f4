use std::sync::Arc;

use crate::stable_hash;

use super::config::ConfigController;
use super::state::NodeId;

/// Maps site IDs to partitions and partitions to the nodes currently
/// holding their replicas. Pure and synchronous; built from cluster
/// state snapshots.
pub trait PartitionResolver: Send + Sync + 'static {
    fn partition(&self, site_id: &str) -> u64;

    /// Distinct holders of the partition's replicas, primary first.
    /// Unassigned slots are omitted; length is at most the replication
    /// factor.
    fn replica_nodes(&self, partition: u64) -> Vec<NodeId>;
}

pub struct ClusterPartitionResolver {
    config: Arc<dyn ConfigController>,
}

impl ClusterPartitionResolver {
    pub fn new(config: Arc<dyn ConfigController>) -> Self {
        Self { config }
    }
}

impl PartitionResolver for ClusterPartitionResolver {
    fn partition(&self, site_id: &str) -> u64 {
        let partitions = self.config.state().settings.partitions;
        if partitions == 0 {
            return 0;
        }
        stable_hash(site_id.as_bytes()) % partitions
    }

    fn replica_nodes(&self, partition: u64) -> Vec<NodeId> {
        let state = self.config.state();
        let Some(replicas) = state.partitions.get(partition as usize) else {
            return Vec::new();
        };

        let mut nodes = Vec::new();
        for replica in replicas {
            if replica.holder != 0 && !nodes.contains(&replica.holder) {
                nodes.push(replica.holder);
            }
        }
        nodes
    }
}
