use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DbError;

use super::state::{ClusterState, NodeId};

/// Commands submitted to the consensus log. The core only proposes;
/// application happens in the consensus apply loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCommand {
    TakePartitionReplica {
        node_id: NodeId,
        partition: u64,
        replica: u64,
    },
}

/// Window onto the consensus-replicated cluster configuration. `state`
/// returns a consistent snapshot; `cluster_command` resolves once the
/// command has committed.
#[async_trait]
pub trait ConfigController: Send + Sync + 'static {
    fn local_node_id(&self) -> NodeId;
    fn state(&self) -> ClusterState;
    async fn cluster_command(&self, command: ClusterCommand) -> Result<(), DbError>;
}

/// Single-process controller: applies commands directly to a local
/// state copy. Stands in for the consensus tier in tests and
/// single-node deployments.
pub struct InMemoryConfigController {
    local_node_id: NodeId,
    state: Mutex<ClusterState>,
    submitted: Mutex<Vec<ClusterCommand>>,
}

impl InMemoryConfigController {
    pub fn new(local_node_id: NodeId, state: ClusterState) -> Self {
        Self {
            local_node_id,
            state: Mutex::new(state),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Commands submitted so far, in order.
    pub fn submitted_commands(&self) -> Vec<ClusterCommand> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigController for InMemoryConfigController {
    fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    fn state(&self) -> ClusterState {
        self.state.lock().unwrap().clone()
    }

    async fn cluster_command(&self, command: ClusterCommand) -> Result<(), DbError> {
        self.submitted.lock().unwrap().push(command.clone());

        match command {
            ClusterCommand::TakePartitionReplica {
                node_id,
                partition,
                replica,
            } => {
                let mut state = self.state.lock().unwrap();
                state.assign_partition_replica(partition, replica, node_id)
            }
        }
    }
}
