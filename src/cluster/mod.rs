pub mod agent;
pub mod config;
pub mod node_client;
pub mod read_repair;
pub mod resolver;
pub mod state;

pub use agent::{Agent, WriteReceipt};
pub use config::{ClusterCommand, ConfigController, InMemoryConfigController};
pub use node_client::{LocalNodeClient, NodeClient};
pub use read_repair::{NodeReadRepairer, ReadMerger, ReadRepairScheduler};
pub use resolver::{ClusterPartitionResolver, PartitionResolver};
pub use state::{ClusterSettings, ClusterState, NodeConfig, NodeId, PartitionReplica, PeerAddress};
