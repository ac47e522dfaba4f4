use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::bucket::{SiblingSetIterator, VecSiblingSetIterator};
use crate::data::{SiblingSet, UpdateBatch};
use crate::error::DbError;

use super::node_client::NodeClient;
use super::read_repair::{NodeReadRepairer, ReadMerger};
use super::resolver::PartitionResolver;

/// Replicas needed for a strict majority of `n`.
pub fn n_quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Outcome of a quorum write: how many replicas were asked, how many
/// applied the batch, and the error when no quorum formed.
#[derive(Debug)]
pub struct WriteReceipt {
    pub n_replicas: usize,
    pub n_applied: usize,
    pub error: Option<DbError>,
}

type CancelerMap = Arc<Mutex<HashMap<u64, watch::Sender<bool>>>>;

/// Client-facing replication coordinator. Fans one operation out to the
/// replica holders of the target partition, collects replies against a
/// deadline, enforces majority quorum, and schedules read repair from
/// whatever a read fan-out learned.
pub struct Agent {
    pub timeout: Duration,
    partition_resolver: Arc<dyn PartitionResolver>,
    node_client: Arc<dyn NodeClient>,
    read_repairer: Arc<dyn NodeReadRepairer>,
    cancelers: CancelerMap,
    next_op: AtomicU64,
}

impl Agent {
    pub fn new(
        partition_resolver: Arc<dyn PartitionResolver>,
        node_client: Arc<dyn NodeClient>,
        read_repairer: Arc<dyn NodeReadRepairer>,
        timeout: Duration,
    ) -> Self {
        Self {
            timeout,
            partition_resolver,
            node_client,
            read_repairer,
            cancelers: Arc::new(Mutex::new(HashMap::new())),
            next_op: AtomicU64::new(1),
        }
    }

    pub fn n_quorum(&self, n: usize) -> usize {
        n_quorum(n)
    }

    fn register_canceler(&self) -> (u64, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let id = self.next_op.fetch_add(1, Ordering::Relaxed);
        self.cancelers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn unregister_canceler(cancelers: &CancelerMap, id: u64) {
        cancelers.lock().unwrap().remove(&id);
    }

    /// Cancels every in-flight fan-out and stops the repair workers.
    pub fn cancel_all(&self) {
        let cancelers = self.cancelers.lock().unwrap();
        for tx in cancelers.values() {
            let _ = tx.send(true);
        }
        self.read_repairer.stop_repairs();
    }

    /*──────────────────── write path ───────────────────────*/

    pub async fn batch(&self, site_id: &str, bucket: &str, updates: UpdateBatch) -> WriteReceipt {
        let partition = self.partition_resolver.partition(site_id);
        let nodes = self.partition_resolver.replica_nodes(partition);
        let n = nodes.len();
        if n == 0 {
            return WriteReceipt {
                n_replicas: 0,
                n_applied: 0,
                error: Some(DbError::NoQuorum),
            };
        }
        let quorum = n_quorum(n);
        let deadline = Instant::now() + self.timeout;

        let (op_id, cancel_rx) = self.register_canceler();
        let (tx, mut rx) = mpsc::channel::<Result<(), DbError>>(n);
        let updates = Arc::new(updates);

        for node in nodes {
            let client = self.node_client.clone();
            let tx = tx.clone();
            let mut cancel = cancel_rx.clone();
            let updates = updates.clone();
            let site_id = site_id.to_string();
            let bucket = bucket.to_string();

            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = cancel.changed() => Err(DbError::Cancelled),
                    r = tokio::time::timeout_at(
                        deadline,
                        client.batch(node, partition, &site_id, &bucket, &updates),
                    ) => r.unwrap_or(Err(DbError::Cancelled)),
                };
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut n_applied = 0;
        let mut n_failed = 0;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(()) => n_applied += 1,
                Err(e) => {
                    debug!(%e, "agent: batch replica failed");
                    n_failed += 1;
                }
            }
            if n_applied >= quorum {
                break;
            }
            // remaining replies can no longer reach a majority
            if n - n_failed < quorum {
                break;
            }
        }

        Self::unregister_canceler(&self.cancelers, op_id);

        WriteReceipt {
            n_replicas: n,
            n_applied,
            error: if n_applied >= quorum {
                None
            } else {
                Some(DbError::NoQuorum)
            },
        }
    }

    /*──────────────────── read paths ───────────────────────*/

    pub async fn get(
        &self,
        site_id: &str,
        bucket: &str,
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<SiblingSet>>, DbError> {
        let partition = self.partition_resolver.partition(site_id);
        let nodes = self.partition_resolver.replica_nodes(partition);
        let n = nodes.len();
        let quorum = n_quorum(n.max(1));
        let deadline = Instant::now() + self.timeout;

        let (op_id, cancel_rx) = self.register_canceler();
        let merger = Arc::new(Mutex::new(ReadMerger::new(nodes.clone())));
        let (tx, mut rx) = mpsc::channel::<bool>(n.max(1));

        for node in nodes {
            let client = self.node_client.clone();
            let tx = tx.clone();
            let mut cancel = cancel_rx.clone();
            let merger = merger.clone();
            let site_id = site_id.to_string();
            let bucket = bucket.to_string();
            let keys = keys.to_vec();

            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = cancel.changed() => Err(DbError::Cancelled),
                    r = tokio::time::timeout_at(
                        deadline,
                        client.get(node, partition, &site_id, &bucket, &keys),
                    ) => r.unwrap_or(Err(DbError::Cancelled)),
                };

                let ok = match result {
                    // a reply of the wrong shape counts as a failure
                    Ok(sets) if sets.len() == keys.len() => {
                        let mut merger = merger.lock().unwrap();
                        for (key, set) in keys.iter().zip(&sets) {
                            if let Some(set) = set {
                                merger.insert(node, key, set);
                            }
                        }
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        debug!(%e, "agent: get replica failed");
                        false
                    }
                };
                let _ = tx.send(ok).await;
            });
        }
        drop(tx);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let keys_for_snapshot = keys.to_vec();
        let merger_for_driver = merger.clone();
        let read_repairer = self.read_repairer.clone();
        let cancelers = self.cancelers.clone();
        let site_id = site_id.to_string();
        let bucket = bucket.to_string();

        // The driver keeps draining replies into the merger after the
        // caller has its answer, then hands everything to read repair —
        // unconditionally, since partial reconciliation is still useful.
        tokio::spawn(async move {
            let mut outcome_tx = Some(outcome_tx);
            let mut n_success = 0;

            while let Some(ok) = rx.recv().await {
                if ok {
                    n_success += 1;
                }
                if n_success >= quorum {
                    if let Some(tx) = outcome_tx.take() {
                        let snapshot = {
                            let merger = merger_for_driver.lock().unwrap();
                            keys_for_snapshot
                                .iter()
                                .map(|k| merger.get(k).cloned())
                                .collect::<Vec<_>>()
                        };
                        let _ = tx.send(Ok(snapshot));
                    }
                }
            }

            if let Some(tx) = outcome_tx.take() {
                let _ = tx.send(Err(DbError::NoQuorum));
            }

            Self::unregister_canceler(&cancelers, op_id);
            let merger = {
                let mut guard = merger_for_driver.lock().unwrap();
                std::mem::replace(&mut *guard, ReadMerger::new(Vec::new()))
            };
            read_repairer
                .begin_repair(partition, &site_id, &bucket, merger)
                .await;
        });

        outcome_rx.await.unwrap_or(Err(DbError::Cancelled))
    }

    pub async fn get_matches(
        &self,
        site_id: &str,
        bucket: &str,
        keys: &[Vec<u8>],
    ) -> Result<Box<dyn SiblingSetIterator>, DbError> {
        let partition = self.partition_resolver.partition(site_id);
        let nodes = self.partition_resolver.replica_nodes(partition);
        let n = nodes.len();
        let quorum = n_quorum(n.max(1));
        let deadline = Instant::now() + self.timeout;

        let (op_id, cancel_rx) = self.register_canceler();
        let merger = Arc::new(Mutex::new(ReadMerger::new(nodes.clone())));
        let (tx, mut rx) = mpsc::channel::<bool>(n.max(1));

        for node in nodes {
            let client = self.node_client.clone();
            let tx = tx.clone();
            let mut cancel = cancel_rx.clone();
            let merger = merger.clone();
            let site_id = site_id.to_string();
            let bucket = bucket.to_string();
            let keys = keys.to_vec();

            tokio::spawn(async move {
                // quorum counts iterators drained to completion without
                // error; partial output stays in the merger for repair
                let drain = async {
                    let mut it = client
                        .get_matches(node, partition, &site_id, &bucket, &keys)
                        .await?;
                    loop {
                        match it.next_entry()? {
                            Some((prefix, key, set)) => {
                                merger
                                    .lock()
                                    .unwrap()
                                    .insert_with_prefix(node, &prefix, &key, &set);
                            }
                            None => return Ok::<(), DbError>(()),
                        }
                    }
                };

                let result = tokio::select! {
                    _ = cancel.changed() => Err(DbError::Cancelled),
                    r = tokio::time::timeout_at(deadline, drain) =>
                        r.unwrap_or(Err(DbError::Cancelled)),
                };
                if let Err(e) = &result {
                    debug!(%e, "agent: get_matches replica failed");
                }
                let _ = tx.send(result.is_ok()).await;
            });
        }
        drop(tx);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let merger_for_driver = merger.clone();
        let read_repairer = self.read_repairer.clone();
        let cancelers = self.cancelers.clone();
        let site_id = site_id.to_string();
        let bucket = bucket.to_string();

        tokio::spawn(async move {
            let mut outcome_tx = Some(outcome_tx);
            let mut n_success = 0;

            while let Some(ok) = rx.recv().await {
                if ok {
                    n_success += 1;
                }
                if n_success >= quorum {
                    if let Some(tx) = outcome_tx.take() {
                        let rows = {
                            let merger = merger_for_driver.lock().unwrap();
                            merger
                                .keys()
                                .map(|key| {
                                    (
                                        merger.prefix(key).unwrap_or_default().to_vec(),
                                        key.clone(),
                                        merger.get(key).cloned().unwrap_or_default(),
                                    )
                                })
                                .collect::<Vec<_>>()
                        };
                        let _ = tx.send(Ok(
                            Box::new(VecSiblingSetIterator::new(rows)) as Box<dyn SiblingSetIterator>
                        ));
                    }
                }
            }

            if let Some(tx) = outcome_tx.take() {
                let _ = tx.send(Err(DbError::NoQuorum));
            }

            Self::unregister_canceler(&cancelers, op_id);
            let merger = {
                let mut guard = merger_for_driver.lock().unwrap();
                std::mem::replace(&mut *guard, ReadMerger::new(Vec::new()))
            };
            read_repairer
                .begin_repair(partition, &site_id, &bucket, merger)
                .await;
        });

        outcome_rx.await.unwrap_or(Err(DbError::Cancelled))
    }
}
