//! Quorum fan-out behavior of the replication agent against scripted
//! replica responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{advance, Instant};

use crate::bucket::{SiblingSetIterator, VecSiblingSetIterator};
use crate::cluster::{
    Agent, NodeClient, NodeId, NodeReadRepairer, PartitionResolver, ReadMerger,
};
use crate::data::{Dot, Dvv, Sibling, SiblingSet, UpdateBatch, VersionVector};
use crate::error::DbError;

/*──────────────────────── scripted collaborators ───────────────────*/

struct MockPartitionResolver {
    partition: u64,
    nodes: Vec<NodeId>,
}

impl PartitionResolver for MockPartitionResolver {
    fn partition(&self, _site_id: &str) -> u64 {
        self.partition
    }

    fn replica_nodes(&self, _partition: u64) -> Vec<NodeId> {
        self.nodes.clone()
    }
}

#[derive(Clone)]
enum Reply<T: Clone> {
    Ok(T),
    Error,
    /// Never responds; the agent's deadline has to cut it off.
    Hang,
}

type MatchRows = Vec<(Vec<u8>, Vec<u8>, SiblingSet)>;

#[derive(Default)]
struct MockNodeClient {
    batch_replies: HashMap<NodeId, Reply<()>>,
    get_replies: HashMap<NodeId, Reply<Vec<Option<SiblingSet>>>>,
    // rows plus whether the iterator fails after yielding them
    match_replies: HashMap<NodeId, Reply<(MatchRows, bool)>>,
}

struct FailingIterator {
    rows: std::vec::IntoIter<(Vec<u8>, Vec<u8>, SiblingSet)>,
}

impl SiblingSetIterator for FailingIterator {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>, SiblingSet)>, DbError> {
        match self.rows.next() {
            Some(row) => Ok(Some(row)),
            None => Err(DbError::Storage("iterator failed".into())),
        }
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn batch(
        &self,
        node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        _updates: &UpdateBatch,
    ) -> Result<(), DbError> {
        match self.batch_replies.get(&node_id) {
            Some(Reply::Ok(())) => Ok(()),
            Some(Reply::Error) | None => Err(DbError::Storage("scripted failure".into())),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }

    async fn get(
        &self,
        node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        _keys: &[Vec<u8>],
    ) -> Result<Vec<Option<SiblingSet>>, DbError> {
        match self.get_replies.get(&node_id) {
            Some(Reply::Ok(sets)) => Ok(sets.clone()),
            Some(Reply::Error) | None => Err(DbError::Storage("scripted failure".into())),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }

    async fn get_matches(
        &self,
        node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        _keys: &[Vec<u8>],
    ) -> Result<Box<dyn SiblingSetIterator>, DbError> {
        match self.match_replies.get(&node_id) {
            Some(Reply::Ok((rows, fails))) => {
                if *fails {
                    Ok(Box::new(FailingIterator {
                        rows: rows.clone().into_iter(),
                    }))
                } else {
                    Ok(Box::new(VecSiblingSetIterator::new(rows.clone())))
                }
            }
            Some(Reply::Error) | None => Err(DbError::Storage("scripted failure".into())),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }

    async fn merge(
        &self,
        _node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        _key: &[u8],
        _set: &SiblingSet,
    ) -> Result<(), DbError> {
        Ok(())
    }
}

#[derive(Default)]
struct MockRepairer {
    repairs: Mutex<Vec<(u64, String, String, ReadMerger)>>,
    called: Notify,
}

#[async_trait]
impl NodeReadRepairer for MockRepairer {
    async fn begin_repair(&self, partition: u64, site_id: &str, bucket: &str, merger: ReadMerger) {
        self.repairs.lock().unwrap().push((
            partition,
            site_id.to_string(),
            bucket.to_string(),
            merger,
        ));
        self.called.notify_one();
    }

    fn stop_repairs(&self) {}
}

fn agent_with(
    nodes: Vec<NodeId>,
    client: MockNodeClient,
) -> (Agent, Arc<MockRepairer>) {
    let repairer = Arc::new(MockRepairer::default());
    let agent = Agent::new(
        Arc::new(MockPartitionResolver {
            partition: 500,
            nodes,
        }),
        Arc::new(client),
        repairer.clone(),
        Duration::from_secs(1),
    );
    (agent, repairer)
}

fn set(replica: &str, counter: u64, value: &[u8]) -> SiblingSet {
    SiblingSet::new(vec![Sibling::new(
        Dvv::new(Dot::new(replica, counter), VersionVector::new()),
        value.to_vec(),
        0,
    )])
}

/*──────────────────────── batch quorum ─────────────────────────────*/

#[tokio::test(start_paused = true)]
async fn batch_returns_as_soon_as_quorum_is_established() {
    let mut client = MockNodeClient::default();
    client.batch_replies.insert(2, Reply::Ok(()));
    client.batch_replies.insert(4, Reply::Ok(()));
    client.batch_replies.insert(6, Reply::Hang);
    let (agent, _) = agent_with(vec![2, 4, 6], client);

    let start = Instant::now();
    let receipt = agent.batch("site1", "default", UpdateBatch::new()).await;

    assert_eq!(receipt.n_replicas, 3);
    assert_eq!(receipt.n_applied, 2);
    assert_eq!(receipt.error, None);
    // no timer in the critical path: the hanging replica did not delay us
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn batch_without_quorum_waits_for_the_deadline() {
    let mut client = MockNodeClient::default();
    client.batch_replies.insert(2, Reply::Ok(()));
    client.batch_replies.insert(4, Reply::Hang);
    client.batch_replies.insert(6, Reply::Hang);
    let (agent, _) = agent_with(vec![2, 4, 6], client);

    let start = Instant::now();
    let handle = tokio::spawn(async move {
        let receipt = agent.batch("site1", "default", UpdateBatch::new()).await;
        (receipt, Instant::now())
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    advance(Duration::from_millis(1_050)).await;

    let (receipt, finished) = handle.await.unwrap();
    assert_eq!(receipt.n_replicas, 3);
    assert_eq!(receipt.n_applied, 1);
    assert_eq!(receipt.error, Some(DbError::NoQuorum));
    assert!(finished - start >= Duration::from_secs(1));
    assert!(finished - start < Duration::from_millis(1_100));
}

#[tokio::test(start_paused = true)]
async fn batch_fails_fast_once_quorum_is_impossible() {
    let mut client = MockNodeClient::default();
    client.batch_replies.insert(2, Reply::Ok(()));
    client.batch_replies.insert(4, Reply::Error);
    client.batch_replies.insert(6, Reply::Error);
    let (agent, _) = agent_with(vec![2, 4, 6], client);

    let start = Instant::now();
    let receipt = agent.batch("site1", "default", UpdateBatch::new()).await;

    assert_eq!(receipt.n_replicas, 3);
    assert_eq!(receipt.error, Some(DbError::NoQuorum));
    assert!(start.elapsed() < Duration::from_millis(100));
}

/*──────────────────────── read merge ───────────────────────────────*/

#[tokio::test(start_paused = true)]
async fn get_merges_replica_reads_and_schedules_repair() {
    let s1 = set("r1", 1, b"v1");
    let s2 = set("r2", 1, b"v2");

    let mut client = MockNodeClient::default();
    client
        .get_replies
        .insert(2, Reply::Ok(vec![Some(s1.clone()), Some(s2.clone()), None]));
    client.get_replies.insert(
        4,
        Reply::Ok(vec![Some(s2.clone()), Some(s1.clone()), Some(s1.clone())]),
    );
    client.get_replies.insert(6, Reply::Error);
    let (agent, repairer) = agent_with(vec![2, 4, 6], client);

    let start = Instant::now();
    let keys = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
    let sets = agent.get("site1", "default", &keys).await.unwrap();

    let merged = s1.sync(&s2);
    assert_eq!(sets[0].as_ref(), Some(&merged));
    assert_eq!(sets[1].as_ref(), Some(&merged));
    assert_eq!(sets[2].as_ref(), Some(&s1));
    assert!(start.elapsed() < Duration::from_millis(100));

    repairer.called.notified().await;
    let repairs = repairer.repairs.lock().unwrap();
    let (partition, site, bucket, merger) = &repairs[0];
    assert_eq!((*partition, site.as_str(), bucket.as_str()), (500, "site1", "default"));

    assert_eq!(merger.get(b"a"), Some(&merged));
    assert_eq!(merger.get(b"b"), Some(&merged));
    assert_eq!(merger.get(b"c"), Some(&s1));
    // every replica whose reply is behind the merged view is a repair
    // target; a failed replica is behind for every key
    assert_eq!(merger.stale_nodes(b"a"), vec![2, 4, 6]);
    assert_eq!(merger.stale_nodes(b"b"), vec![2, 4, 6]);
    assert_eq!(merger.stale_nodes(b"c"), vec![2, 6]);
}

#[tokio::test(start_paused = true)]
async fn get_without_quorum_reports_but_still_repairs() {
    let s1 = set("r1", 1, b"v1");

    let mut client = MockNodeClient::default();
    client
        .get_replies
        .insert(2, Reply::Ok(vec![Some(s1.clone())]));
    client.get_replies.insert(4, Reply::Error);
    client.get_replies.insert(6, Reply::Hang);
    let (agent, repairer) = agent_with(vec![2, 4, 6], client);

    let agent = Arc::new(agent);
    let task_agent = agent.clone();
    let handle = tokio::spawn(async move {
        task_agent.get("site1", "default", &[b"a".to_vec()]).await
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    advance(Duration::from_millis(1_050)).await;

    assert_eq!(handle.await.unwrap(), Err(DbError::NoQuorum));

    repairer.called.notified().await;
    let repairs = repairer.repairs.lock().unwrap();
    let merger = &repairs[0].3;
    assert_eq!(merger.get(b"a"), Some(&s1));
    assert_eq!(merger.stale_nodes(b"a"), vec![4, 6]);
}

/*──────────────────────── streaming reads ──────────────────────────*/

#[tokio::test(start_paused = true)]
async fn get_matches_merges_streams_in_key_order() {
    let s1 = set("r1", 1, b"v1");
    let s2 = set("r2", 1, b"v2");
    let a = b"a".to_vec();

    let mut client = MockNodeClient::default();
    client.match_replies.insert(
        2,
        Reply::Ok((
            vec![
                (a.clone(), b"ab".to_vec(), s1.clone()),
                (a.clone(), b"ac".to_vec(), s2.clone()),
                (a.clone(), b"ad".to_vec(), s2.clone()),
                (a.clone(), b"af".to_vec(), s2.clone()),
            ],
            false,
        )),
    );
    client.match_replies.insert(
        4,
        Reply::Ok((
            vec![
                (a.clone(), b"ab".to_vec(), s1.clone()),
                (a.clone(), b"ac".to_vec(), s2.clone()),
                (a.clone(), b"ad".to_vec(), s1.clone()),
                (a.clone(), b"ae".to_vec(), s1.clone()),
            ],
            false,
        )),
    );
    client.match_replies.insert(6, Reply::Hang);
    let (agent, _) = agent_with(vec![2, 4, 6], client);

    let mut it = agent
        .get_matches("site1", "default", &[b"a".to_vec()])
        .await
        .unwrap();

    let mut rows = Vec::new();
    while let Some((prefix, key, merged)) = it.next_entry().unwrap() {
        assert_eq!(prefix, b"a".to_vec());
        rows.push((key, merged));
    }
    assert_eq!(
        rows,
        vec![
            (b"ab".to_vec(), s1.clone()),
            (b"ac".to_vec(), s2.clone()),
            (b"ad".to_vec(), s1.sync(&s2)),
            (b"ae".to_vec(), s1.clone()),
            (b"af".to_vec(), s2.clone()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn a_failing_iterator_counts_against_quorum_but_feeds_repair() {
    let s1 = set("r1", 1, b"v1");
    let a = b"a".to_vec();

    let mut client = MockNodeClient::default();
    // node 2's stream dies after one row; nodes 4 and 6 fail outright
    client.match_replies.insert(
        2,
        Reply::Ok((vec![(a.clone(), b"ab".to_vec(), s1.clone())], true)),
    );
    client.match_replies.insert(4, Reply::Error);
    client.match_replies.insert(6, Reply::Error);
    let (agent, repairer) = agent_with(vec![2, 4, 6], client);

    let result = agent.get_matches("site1", "default", &[b"a".to_vec()]).await;
    assert!(matches!(result, Err(DbError::NoQuorum)));

    repairer.called.notified().await;
    let repairs = repairer.repairs.lock().unwrap();
    let merger = &repairs[0].3;
    assert_eq!(merger.get(b"ab"), Some(&s1));
}

/*──────────────────────── cancellation ─────────────────────────────*/

#[tokio::test(start_paused = true)]
async fn cancel_all_aborts_inflight_fanouts() {
    let mut client = MockNodeClient::default();
    client.batch_replies.insert(2, Reply::Hang);
    client.batch_replies.insert(4, Reply::Hang);
    client.batch_replies.insert(6, Reply::Hang);
    let (agent, _) = agent_with(vec![2, 4, 6], client);

    let agent = Arc::new(agent);
    let task_agent = agent.clone();
    let handle = tokio::spawn(async move {
        task_agent.batch("site1", "default", UpdateBatch::new()).await
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    agent.cancel_all();
    let receipt = handle.await.unwrap();
    assert_eq!(receipt.n_applied, 0);
    assert_eq!(receipt.error, Some(DbError::NoQuorum));
}
