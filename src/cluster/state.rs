use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::DbError;

pub type NodeId = u64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub address: PeerAddress,
    /// Capacity in bytes; zero marks a node that holds no data.
    pub capacity: u64,
    pub tokens: BTreeSet<u64>,
    /// partition → replicas currently held. Derived from the partition
    /// table for quick lookup; not part of the replicated configuration.
    pub partition_replicas: BTreeMap<u64, BTreeSet<u64>>,
}

impl NodeConfig {
    fn take_partition_replica(&mut self, partition: u64, replica: u64) {
        self.partition_replicas
            .entry(partition)
            .or_default()
            .insert(replica);
    }

    fn relinquish_partition_replica(&mut self, partition: u64, replica: u64) {
        if let Some(replicas) = self.partition_replicas.get_mut(&partition) {
            replicas.remove(&replica);
            if replicas.is_empty() {
                self.partition_replicas.remove(&partition);
            }
        }
    }
}

/// One slot in the partition table. The holder can differ from the token
/// owner while the cluster is mid-transfer; zero means unassigned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReplica {
    pub partition: u64,
    pub replica: u64,
    pub holder: NodeId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub replication_factor: u64,
    pub partitions: u64,
}

impl ClusterSettings {
    pub fn are_initialized(&self) -> bool {
        self.replication_factor != 0 && self.partitions != 0
    }
}

/// The consensus-replicated cluster configuration. The replication core
/// reads snapshots of this; only the consensus apply loop writes it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub nodes: BTreeMap<NodeId, NodeConfig>,
    /// token → owner node, zero = unassigned
    pub tokens: Vec<NodeId>,
    /// partition → replica slots
    pub partitions: Vec<Vec<PartitionReplica>>,
    pub settings: ClusterSettings,
}

impl ClusterState {
    pub fn initialize(&mut self) {
        if !self.settings.are_initialized() {
            return;
        }

        self.tokens = vec![0; self.settings.partitions as usize];
        self.partitions = (0..self.settings.partitions)
            .map(|partition| {
                (0..self.settings.replication_factor)
                    .map(|replica| PartitionReplica {
                        partition,
                        replica,
                        holder: 0,
                    })
                    .collect()
            })
            .collect();
    }

    pub fn add_node(&mut self, config: NodeConfig) {
        if config.address.node_id == 0 {
            return;
        }
        // ignore rejoin of a known member
        self.nodes.entry(config.address.node_id).or_insert(config);
    }

    pub fn remove_node(&mut self, node_id: NodeId) {
        let Some(config) = self.nodes.remove(&node_id) else {
            return;
        };

        // anything the node held or owned is now held by nobody
        for (partition, replicas) in &config.partition_replicas {
            for replica in replicas {
                self.partitions[*partition as usize][*replica as usize].holder = 0;
            }
        }
        for token in &config.tokens {
            self.tokens[*token as usize] = 0;
        }
    }

    /// Change the owner of a token. A token is owned by exactly one node
    /// at a time.
    pub fn assign_token(&mut self, node_id: NodeId, token: u64) -> Result<(), DbError> {
        if token >= self.tokens.len() as u64 {
            return Err(DbError::NoSuchToken);
        }
        if !self.nodes.contains_key(&node_id) {
            return Err(DbError::NoSuchNode);
        }

        let current = self.tokens[token as usize];
        if current != 0 {
            if let Some(owner) = self.nodes.get_mut(&current) {
                owner.tokens.remove(&token);
            }
        }

        self.tokens[token as usize] = node_id;
        self.nodes
            .get_mut(&node_id)
            .expect("checked above")
            .tokens
            .insert(token);
        Ok(())
    }

    /// Change the holder of a partition replica. A replica is held by
    /// exactly one node at a time.
    pub fn assign_partition_replica(
        &mut self,
        partition: u64,
        replica: u64,
        node_id: NodeId,
    ) -> Result<(), DbError> {
        if partition >= self.partitions.len() as u64 {
            return Err(DbError::NoSuchPartition);
        }
        if !self.nodes.contains_key(&node_id) {
            return Err(DbError::NoSuchNode);
        }
        let replicas = &mut self.partitions[partition as usize];
        if replica >= replicas.len() as u64 {
            return Err(DbError::NoSuchReplica);
        }

        let current = replicas[replica as usize].holder;
        if current != 0 {
            if let Some(holder) = self.nodes.get_mut(&current) {
                holder.relinquish_partition_replica(partition, replica);
            }
        }

        self.partitions[partition as usize][replica as usize].holder = node_id;
        self.nodes
            .get_mut(&node_id)
            .expect("checked above")
            .take_partition_replica(partition, replica);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, DbError> {
        serde_json::to_vec(self).map_err(|e| DbError::Storage(e.to_string()))
    }

    pub fn recover(&mut self, snapshot: &[u8]) -> Result<(), DbError> {
        *self = serde_json::from_slice(snapshot)
            .map_err(|e| DbError::Storage(e.to_string()))?;
        Ok(())
    }
}
