use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::data::SiblingSet;

use super::node_client::NodeClient;
use super::state::NodeId;

/*──────────────────────── read merger ──────────────────────*/

/// Accumulates per-replica read results into the causally merged view,
/// remembering what each node actually returned so repair jobs target
/// only the replicas that are behind.
pub struct ReadMerger {
    nodes: Vec<NodeId>,
    merged: BTreeMap<Vec<u8>, SiblingSet>,
    prefixes: BTreeMap<Vec<u8>, Vec<u8>>,
    observed: HashMap<NodeId, BTreeMap<Vec<u8>, SiblingSet>>,
}

impl ReadMerger {
    /// `nodes` is the full replica set of the partition; nodes that
    /// never report anything count as stale for every merged key.
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self {
            nodes,
            merged: BTreeMap::new(),
            prefixes: BTreeMap::new(),
            observed: HashMap::new(),
        }
    }

    pub fn insert(&mut self, node: NodeId, key: &[u8], set: &SiblingSet) {
        let merged = match self.merged.get(key) {
            Some(current) => current.sync(set),
            None => set.clone(),
        };
        self.merged.insert(key.to_vec(), merged);

        let per_node = self.observed.entry(node).or_default();
        let observed = match per_node.get(key) {
            Some(current) => current.sync(set),
            None => set.clone(),
        };
        per_node.insert(key.to_vec(), observed);
    }

    pub fn insert_with_prefix(
        &mut self,
        node: NodeId,
        prefix: &[u8],
        key: &[u8],
        set: &SiblingSet,
    ) {
        self.prefixes.insert(key.to_vec(), prefix.to_vec());
        self.insert(node, key, set);
    }

    pub fn get(&self, key: &[u8]) -> Option<&SiblingSet> {
        self.merged.get(key)
    }

    pub fn prefix(&self, key: &[u8]) -> Option<&[u8]> {
        self.prefixes.get(key).map(|p| p.as_slice())
    }

    /// Merged keys in lexicographic order.
    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.merged.keys()
    }

    /// Replica nodes whose observed set for `key` is behind the merged
    /// one (including nodes that returned nothing at all).
    pub fn stale_nodes(&self, key: &[u8]) -> Vec<NodeId> {
        let Some(merged) = self.merged.get(key) else {
            return Vec::new();
        };

        self.nodes
            .iter()
            .copied()
            .filter(|node| {
                match self.observed.get(node).and_then(|sets| sets.get(key)) {
                    Some(observed) => observed != merged,
                    None => true,
                }
            })
            .collect()
    }
}

/*──────────────────────── repair scheduler ─────────────────*/

#[async_trait]
pub trait NodeReadRepairer: Send + Sync + 'static {
    /// Hand over everything a read fan-out learned. Called exactly once
    /// per fan-out, after all replies settled, quorum or not.
    async fn begin_repair(&self, partition: u64, site_id: &str, bucket: &str, merger: ReadMerger);

    /// Drain pending jobs and stop the workers.
    fn stop_repairs(&self);
}

struct RepairJob {
    partition: u64,
    site_id: String,
    bucket: String,
    key: Vec<u8>,
    set: SiblingSet,
    stale_nodes: Vec<NodeId>,
}

/// Bounded-queue worker pool writing merged sibling sets back to stale
/// replicas. Best-effort: failures are logged and dropped; the next read
/// rediscovers any divergence that remains.
pub struct ReadRepairScheduler {
    queue: mpsc::Sender<RepairJob>,
    shutdown: watch::Sender<bool>,
}

impl ReadRepairScheduler {
    pub fn new(node_client: Arc<dyn NodeClient>, queue_depth: usize, workers: usize) -> Self {
        let (queue, rx) = mpsc::channel::<RepairJob>(queue_depth.max(1));
        let (shutdown, _) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let node_client = node_client.clone();
            let mut shutdown = shutdown.subscribe();

            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            job = rx.recv() => match job {
                                Some(job) => job,
                                None => return,
                            },
                        }
                    };

                    for node in &job.stale_nodes {
                        if let Err(e) = node_client
                            .merge(
                                *node,
                                job.partition,
                                &job.site_id,
                                &job.bucket,
                                &job.key,
                                &job.set,
                            )
                            .await
                        {
                            warn!(node, %e, "read repair: merge failed");
                        }
                    }
                }
            });
        }

        Self { queue, shutdown }
    }
}

#[async_trait]
impl NodeReadRepairer for ReadRepairScheduler {
    async fn begin_repair(&self, partition: u64, site_id: &str, bucket: &str, merger: ReadMerger) {
        for key in merger.keys().cloned().collect::<Vec<_>>() {
            let stale_nodes = merger.stale_nodes(&key);
            if stale_nodes.is_empty() {
                continue;
            }
            let Some(set) = merger.get(&key) else {
                continue;
            };

            let job = RepairJob {
                partition,
                site_id: site_id.to_string(),
                bucket: bucket.to_string(),
                key: key.clone(),
                set: set.clone(),
                stale_nodes,
            };
            if self.queue.try_send(job).is_err() {
                debug!("read repair: queue full, dropping job");
            }
        }
    }

    fn stop_repairs(&self) {
        let _ = self.shutdown.send(true);
    }
}
