use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};

use crate::cluster::{ClusterCommand, ConfigController};
use crate::error::DbError;

/// Cancellation handle with identity semantics: cleanup only removes a
/// canceler from the map when it is still the exact one it registered,
/// so a cancel racing a re-enqueue never tears down the newer proposal.
pub struct Canceler {
    cancel: watch::Sender<bool>,
}

impl Canceler {
    fn new() -> (Arc<Self>, watch::Receiver<bool>) {
        let (cancel, rx) = watch::channel(false);
        (Arc::new(Self { cancel }), rx)
    }

    fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

type CancelerMap = HashMap<u64, HashMap<u64, Arc<Canceler>>>;

/// Queues proposals to take holdership of partition replicas. Each
/// proposal waits for its `after` signal, then submits a cluster
/// command; proposals can be chained through their completion signals
/// and cancelled individually or per partition.
pub struct TransferProposer {
    config: Arc<dyn ConfigController>,
    cancelers: Arc<Mutex<CancelerMap>>,
}

impl TransferProposer {
    pub fn new(config: Arc<dyn ConfigController>) -> Self {
        Self {
            config,
            cancelers: Arc::new(Mutex::new(CancelerMap::new())),
        }
    }

    /// Queue a proposal for `(partition, replica)`. It submits its
    /// cluster command only once `after` fires (a closed channel counts
    /// as fired); cancelling beforehand suppresses the submission
    /// entirely. The returned channel yields the command's outcome and
    /// stays silent forever when the proposal was cancelled early.
    pub fn queue_transfer_proposal(
        &self,
        partition: u64,
        replica: u64,
        after: oneshot::Receiver<()>,
    ) -> oneshot::Receiver<Result<(), DbError>> {
        let (result_tx, result_rx) = oneshot::channel();
        let (canceler, mut cancel_rx) = Canceler::new();

        {
            let mut cancelers = self.cancelers.lock().unwrap();
            cancelers
                .entry(partition)
                .or_default()
                .insert(replica, canceler.clone());
        }

        let config = self.config.clone();
        let cancelers = self.cancelers.clone();
        let node_id = self.config.local_node_id();

        tokio::spawn(async move {
            // wait for the preceding proposal, unless cancelled first
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => return,
                _ = after => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel_rx.changed() => Err(DbError::Cancelled),
                r = config.cluster_command(ClusterCommand::TakePartitionReplica {
                    node_id,
                    partition,
                    replica,
                }) => r,
            };

            {
                let mut cancelers = cancelers.lock().unwrap();
                if let Some(replicas) = cancelers.get_mut(&partition) {
                    let ours = replicas
                        .get(&replica)
                        .map(|current| Arc::ptr_eq(current, &canceler))
                        .unwrap_or(false);
                    if ours {
                        replicas.remove(&replica);
                        if replicas.is_empty() {
                            cancelers.remove(&partition);
                        }
                    }
                }
            }

            let _ = result_tx.send(result);
        });

        result_rx
    }

    pub fn cancel_transfer_proposal(&self, partition: u64, replica: u64) {
        let mut cancelers = self.cancelers.lock().unwrap();
        Self::cancel_locked(&mut cancelers, partition, replica);
    }

    pub fn cancel_transfer_proposals(&self, partition: u64) {
        let mut cancelers = self.cancelers.lock().unwrap();
        let replicas: Vec<u64> = cancelers
            .get(&partition)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        for replica in replicas {
            Self::cancel_locked(&mut cancelers, partition, replica);
        }
    }

    fn cancel_locked(cancelers: &mut CancelerMap, partition: u64, replica: u64) {
        if let Some(replicas) = cancelers.get_mut(&partition) {
            if let Some(canceler) = replicas.remove(&replica) {
                canceler.cancel();
            }
            if replicas.is_empty() {
                cancelers.remove(&partition);
            }
        }
    }

    pub fn pending_proposals(&self, partition: u64) -> usize {
        self.cancelers
            .lock()
            .unwrap()
            .get(&partition)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn queued_proposals(&self) -> BTreeMap<u64, BTreeSet<u64>> {
        self.cancelers
            .lock()
            .unwrap()
            .iter()
            .map(|(partition, replicas)| (*partition, replicas.keys().copied().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        ClusterSettings, ClusterState, InMemoryConfigController, NodeConfig, PeerAddress,
    };

    fn controller() -> Arc<InMemoryConfigController> {
        let mut state = ClusterState {
            settings: ClusterSettings {
                replication_factor: 3,
                partitions: 8,
            },
            ..Default::default()
        };
        state.initialize();
        state.add_node(NodeConfig {
            address: PeerAddress {
                node_id: 1,
                host: "node1".into(),
                port: 9090,
            },
            capacity: 1,
            ..Default::default()
        });
        Arc::new(InMemoryConfigController::new(1, state))
    }

    /// A signal that has already fired, like a closed channel.
    fn fired() -> oneshot::Receiver<()> {
        let (_tx, rx) = oneshot::channel();
        rx
    }

    #[tokio::test]
    async fn proposal_submits_once_its_signal_fires() {
        let config = controller();
        let proposer = TransferProposer::new(config.clone());

        let result = proposer.queue_transfer_proposal(2, 0, fired());
        assert_eq!(result.await.unwrap(), Ok(()));

        let commands = config.submitted_commands();
        assert_eq!(
            commands,
            vec![ClusterCommand::TakePartitionReplica {
                node_id: 1,
                partition: 2,
                replica: 0,
            }]
        );
        assert_eq!(proposer.pending_proposals(2), 0);
    }

    #[tokio::test]
    async fn cancelled_proposal_never_submits() {
        let config = controller();
        let proposer = TransferProposer::new(config.clone());

        let (gate_tx, gate_rx) = oneshot::channel();
        let _result = proposer.queue_transfer_proposal(2, 0, gate_rx);

        proposer.cancel_transfer_proposal(2, 0);
        let _ = gate_tx.send(());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(config.submitted_commands().is_empty());
        assert_eq!(proposer.pending_proposals(2), 0);
    }

    #[tokio::test]
    async fn chained_proposal_stays_quiet_when_its_predecessor_is_cancelled() {
        let config = controller();
        let proposer = TransferProposer::new(config.clone());

        let first_result = proposer.queue_transfer_proposal(0, 0, fired());

        // second fires only when the first completes successfully
        let (chain_tx, chain_rx) = oneshot::channel();
        tokio::spawn(async move {
            match first_result.await {
                Ok(_) => {
                    let _ = chain_tx.send(());
                }
                // first never completed: hold the chain open forever
                Err(_) => std::future::pending::<()>().await,
            }
        });
        let _second_result = proposer.queue_transfer_proposal(0, 1, chain_rx);

        proposer.cancel_transfer_proposal(0, 0);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(config
            .submitted_commands()
            .iter()
            .all(|c| !matches!(c, ClusterCommand::TakePartitionReplica { replica: 1, .. })));
    }

    /// Controller whose commands block until released, so a cancel can
    /// land while a proposal is mid-submission.
    struct BlockingController {
        inner: Arc<InMemoryConfigController>,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl crate::cluster::ConfigController for BlockingController {
        fn local_node_id(&self) -> u64 {
            self.inner.local_node_id()
        }

        fn state(&self) -> ClusterState {
            self.inner.state()
        }

        async fn cluster_command(&self, command: ClusterCommand) -> Result<(), DbError> {
            self.release.notified().await;
            self.inner.cluster_command(command).await
        }
    }

    #[tokio::test]
    async fn rapid_reenqueue_survives_the_old_proposal_cleanup() {
        let config = Arc::new(BlockingController {
            inner: controller(),
            release: tokio::sync::Notify::new(),
        });
        let proposer = TransferProposer::new(config.clone());

        // first proposal reaches its (blocked) cluster command
        let first = proposer.queue_transfer_proposal(4, 1, fired());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // cancel it mid-command and immediately queue a replacement for
        // the same slot
        proposer.cancel_transfer_proposal(4, 1);
        let (gate2_tx, gate2_rx) = oneshot::channel();
        let second = proposer.queue_transfer_proposal(4, 1, gate2_rx);

        // the first task's cleanup runs now; the identity check must
        // leave the replacement's canceler in place
        assert_eq!(first.await.unwrap(), Err(DbError::Cancelled));
        assert_eq!(proposer.pending_proposals(4), 1);
        assert_eq!(
            proposer.queued_proposals().get(&4),
            Some(&[1u64].into_iter().collect())
        );

        let _ = gate2_tx.send(());
        config.release.notify_one();
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(proposer.pending_proposals(4), 0);
    }

    #[tokio::test]
    async fn cancel_all_for_a_partition_clears_every_replica() {
        let config = controller();
        let proposer = TransferProposer::new(config.clone());

        let (_g0, gate0) = oneshot::channel();
        let (_g1, gate1) = oneshot::channel();
        let _r0 = proposer.queue_transfer_proposal(6, 0, gate0);
        let _r1 = proposer.queue_transfer_proposal(6, 1, gate1);
        assert_eq!(proposer.pending_proposals(6), 2);

        proposer.cancel_transfer_proposals(6);
        assert_eq!(proposer.pending_proposals(6), 0);
        assert!(proposer.queued_proposals().is_empty());
    }
}
