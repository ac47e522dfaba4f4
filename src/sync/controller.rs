use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::data::SiblingSet;
use crate::partition::Partition;
use crate::site::BucketList;
use crate::transport::{PeerConn, PeerId};

use super::initiator::{InitiatorState, InitiatorSyncSession};
use super::message::{PushMessage, SyncMessage, SyncMessageBody};
use super::responder::{ResponderState, ResponderSyncSession};

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Hard cap on concurrent sessions, initiators and responders
    /// combined. New sessions are rejected when the pool is full.
    pub max_sessions: usize,
    /// How often each peer gets an outgoing sync attempt.
    pub sync_interval: Duration,
    /// How long a session waits for the peer's next message.
    pub message_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            sync_interval: Duration::from_secs(2),
            message_timeout: Duration::from_secs(10),
        }
    }
}

struct PeerHandle {
    conn: Arc<dyn PeerConn>,
    next_bucket: usize,
}

type SessionKey = (PeerId, u64);
type SessionMap = Arc<Mutex<HashMap<SessionKey, mpsc::Sender<SyncMessage>>>>;

/// Runs the anti-entropy machinery for one site replica: a bounded pool
/// of sessions, periodic outgoing sync per peer and bucket policy, and
/// best-effort broadcast of fresh writes as standalone pushes.
pub struct SyncController {
    buckets: Arc<BucketList>,
    config: SyncConfig,
    /// Transfer gate of the partition these buckets belong to. While
    /// the partition's reads are locked the whole anti-entropy surface
    /// is refused: no sessions in or out, no push ingest.
    partition: Option<Arc<Partition>>,
    slots: Arc<Semaphore>,
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    initiators: SessionMap,
    responders: SessionMap,
    next_session: AtomicU64,
    shutdown: watch::Sender<bool>,
}

async fn send_frame(conn: &Arc<dyn PeerConn>, msg: &SyncMessage) -> bool {
    conn.send_bytes(msg.encode()).await.is_ok()
}

impl SyncController {
    /// Controller for a replica with no partition gate (relay side).
    pub fn new(buckets: Arc<BucketList>, config: SyncConfig) -> Arc<Self> {
        Self::build(buckets, config, None)
    }

    /// Controller for a cloud-node site replica, gated by its
    /// partition's transfer locks.
    pub fn with_partition(
        buckets: Arc<BucketList>,
        config: SyncConfig,
        partition: Arc<Partition>,
    ) -> Arc<Self> {
        Self::build(buckets, config, Some(partition))
    }

    fn build(
        buckets: Arc<BucketList>,
        config: SyncConfig,
        partition: Option<Arc<Partition>>,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_sessions));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            buckets,
            config,
            partition,
            slots,
            peers: Mutex::new(HashMap::new()),
            initiators: Arc::new(Mutex::new(HashMap::new())),
            responders: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(1),
            shutdown,
        })
    }

    fn sync_allowed(&self) -> bool {
        match &self.partition {
            Some(partition) => partition.check_readable().is_ok(),
            None => true,
        }
    }

    /// Kick off the periodic sync loop. Each tick initiates one session
    /// per connected peer, rotating through that peer's buckets.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(this.config.sync_interval) => {}
                }

                let due: Vec<(PeerId, String)> = {
                    let mut peers = this.peers.lock().unwrap();
                    let names = this.buckets.names();
                    if names.is_empty() {
                        continue;
                    }
                    peers
                        .iter_mut()
                        .map(|(peer, handle)| {
                            let bucket = names[handle.next_bucket % names.len()].clone();
                            handle.next_bucket = handle.next_bucket.wrapping_add(1);
                            (peer.clone(), bucket)
                        })
                        .collect()
                };

                for (peer, bucket) in due {
                    this.initiate_sync(&peer, &bucket);
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Attach a peer connection and spawn its read loop.
    pub fn add_peer(self: &Arc<Self>, peer_id: PeerId, conn: Arc<dyn PeerConn>) {
        info!(peer = %peer_id, "sync: peer connected");
        let mut rx = conn.recv();
        self.peers.lock().unwrap().insert(
            peer_id.clone(),
            PeerHandle {
                conn,
                next_bucket: 0,
            },
        );

        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    _ = shutdown.changed() => break,
                    bytes = rx.recv() => match bytes {
                        Some(bytes) => bytes,
                        None => break,
                    },
                };
                match SyncMessage::decode(&bytes) {
                    Ok(msg) => this.dispatch(&peer_id, msg).await,
                    Err(e) => warn!(peer = %peer_id, %e, "sync: bad frame"),
                }
            }
            debug!(peer = %peer_id, "sync: peer read loop exit");
            this.remove_peer(&peer_id);
        });
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.peers.lock().unwrap().remove(peer_id);
    }

    /// Broadcast a single-key update to every peer the bucket's policy
    /// replicates to, outside any session. Best-effort: a lost push is
    /// repaired by the next merkle sync.
    pub fn broadcast_update(self: &Arc<Self>, bucket: &str, key: &[u8], set: &SiblingSet) {
        let Ok(entry) = self.buckets.get(bucket) else {
            return;
        };

        let msg = SyncMessage {
            session_id: 0,
            body: SyncMessageBody::Push(PushMessage {
                bucket: bucket.to_string(),
                key: String::from_utf8_lossy(key).into_owned(),
                value: set.clone(),
            }),
        };

        let peers = self.peers.lock().unwrap();
        for (peer_id, handle) in peers.iter() {
            if !entry.policy.should_replicate_outgoing(peer_id) {
                continue;
            }
            let conn = handle.conn.clone();
            let msg = msg.clone();
            tokio::spawn(async move {
                let _ = send_frame(&conn, &msg).await;
            });
        }
    }

    /// Start an outgoing session with `peer_id` for one bucket, subject
    /// to the bucket's policy and a free session slot.
    pub fn initiate_sync(self: &Arc<Self>, peer_id: &str, bucket: &str) {
        if !self.sync_allowed() {
            debug!(peer = %peer_id, bucket, "sync: partition reads locked, not initiating");
            return;
        }
        let Ok(entry) = self.buckets.get(bucket) else {
            return;
        };
        if !entry.policy.should_replicate_outgoing(peer_id) {
            return;
        }
        let Some(conn) = self
            .peers
            .lock()
            .unwrap()
            .get(peer_id)
            .map(|h| h.conn.clone())
        else {
            return;
        };
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            debug!(peer = %peer_id, "sync: session pool full, skipping initiation");
            return;
        };

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<SyncMessage>(16);
        let key: SessionKey = (peer_id.to_string(), session_id);
        self.initiators.lock().unwrap().insert(key.clone(), inbox_tx);

        let initiators = self.initiators.clone();
        let bucket = entry.bucket.clone();
        let timeout = self.config.message_timeout;
        let peer = peer_id.to_string();

        tokio::spawn(async move {
            let _permit = permit;
            let mut session = InitiatorSyncSession::new(session_id, bucket);
            let mut next: Option<SyncMessage> = None;

            loop {
                let out = session.next_state(next.take()).await;
                if !send_frame(&conn, &out).await {
                    break;
                }
                if session.state() == InitiatorState::End {
                    break;
                }
                next = match tokio::time::timeout(timeout, inbox_rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => None,
                };
            }

            debug!(peer = %peer, session_id, "sync: initiator session finished");
            initiators.lock().unwrap().remove(&key);
        });
    }

    async fn dispatch(self: &Arc<Self>, peer_id: &str, msg: SyncMessage) {
        // standalone pushes bypass session state machines entirely
        if msg.session_id == 0 {
            if let SyncMessageBody::Push(push) = msg.body {
                self.apply_push(peer_id, push).await;
            }
            return;
        }

        let key: SessionKey = (peer_id.to_string(), msg.session_id);

        let initiator_tx = self.initiators.lock().unwrap().get(&key).cloned();
        if let Some(tx) = initiator_tx {
            let _ = tx.send(msg).await;
            return;
        }

        let responder_tx = self.responders.lock().unwrap().get(&key).cloned();
        if let Some(tx) = responder_tx {
            let _ = tx.send(msg).await;
            return;
        }

        if matches!(msg.body, SyncMessageBody::Start(_)) {
            self.accept_session(peer_id, msg);
        }
    }

    async fn apply_push(&self, peer_id: &str, push: PushMessage) {
        if !self.sync_allowed() {
            debug!(peer = %peer_id, bucket = %push.bucket, "sync: partition reads locked, dropping push");
            return;
        }
        let Ok(entry) = self.buckets.get(&push.bucket) else {
            debug!(peer = %peer_id, bucket = %push.bucket, "sync: push for unknown bucket");
            return;
        };
        if !entry.policy.should_replicate_incoming(peer_id) {
            debug!(peer = %peer_id, bucket = %push.bucket, "sync: push refused by policy");
            return;
        }
        if let Err(e) = entry.bucket.merge(push.key.as_bytes(), &push.value).await {
            warn!(peer = %peer_id, %e, "sync: push merge failed");
        }
    }

    fn accept_session(self: &Arc<Self>, peer_id: &str, first: SyncMessage) {
        let Some(conn) = self
            .peers
            .lock()
            .unwrap()
            .get(peer_id)
            .map(|h| h.conn.clone())
        else {
            return;
        };

        let reject = |session_id: u64, conn: Arc<dyn PeerConn>| {
            tokio::spawn(async move {
                let _ = send_frame(&conn, &SyncMessage::abort(session_id)).await;
            });
        };

        let SyncMessageBody::Start(ref start) = first.body else {
            return;
        };
        if !self.sync_allowed() {
            debug!(peer = %peer_id, bucket = %start.bucket, "sync: partition reads locked, rejecting incoming session");
            reject(first.session_id, conn);
            return;
        }
        let Ok(entry) = self.buckets.get(&start.bucket) else {
            reject(first.session_id, conn);
            return;
        };
        if !entry.policy.should_replicate_incoming(peer_id) {
            debug!(peer = %peer_id, bucket = %start.bucket, "sync: incoming session refused by policy");
            reject(first.session_id, conn);
            return;
        }
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            debug!(peer = %peer_id, "sync: session pool full, rejecting incoming session");
            reject(first.session_id, conn);
            return;
        };

        let session_id = first.session_id;
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<SyncMessage>(16);
        let key: SessionKey = (peer_id.to_string(), session_id);
        self.responders.lock().unwrap().insert(key.clone(), inbox_tx);

        let responders = self.responders.clone();
        let bucket = entry.bucket.clone();
        let timeout = self.config.message_timeout;
        let peer = peer_id.to_string();

        tokio::spawn(async move {
            let _permit = permit;
            let mut session = ResponderSyncSession::new(bucket);
            let mut next = Some(first);

            loop {
                let out = session.next_state(next.take()).await;
                if !send_frame(&conn, &out).await {
                    break;
                }
                if session.state() == ResponderState::End {
                    break;
                }
                next = match tokio::time::timeout(timeout, inbox_rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => None,
                };
            }

            debug!(peer = %peer, session_id, "sync: responder session finished");
            responders.lock().unwrap().remove(&key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{Bucket, BucketConfig, ConflictStrategy};
    use crate::clock::MockClock;
    use crate::data::{UpdateBatch, VersionVector};
    use crate::site::{Cloud, Shared, CLOUD_PEER_ID};
    use crate::storage::MemoryStorageDriver;
    use crate::transport::inmem::pipe;

    fn bucket(name: &str, replica: &str) -> Arc<Bucket> {
        Arc::new(
            Bucket::open(
                BucketConfig {
                    name: name.into(),
                    replica_id: replica.into(),
                    merkle_depth: 6,
                    strategy: ConflictStrategy::Causal,
                },
                Arc::new(MemoryStorageDriver::new()),
                Arc::new(MockClock::new(0)),
            )
            .unwrap(),
        )
    }

    async fn put(bucket: &Bucket, key: &[u8], value: &[u8]) -> crate::data::SiblingSet {
        let mut batch = UpdateBatch::new();
        batch
            .put(key.to_vec(), value.to_vec(), VersionVector::new())
            .unwrap();
        bucket.batch(&batch).await.unwrap().remove(key).unwrap()
    }

    async fn connected_pair(
        buckets_a: BucketList,
        buckets_b: BucketList,
    ) -> (Arc<SyncController>, Arc<SyncController>) {
        let ctrl_a = SyncController::new(Arc::new(buckets_a), SyncConfig::default());
        let ctrl_b = SyncController::new(Arc::new(buckets_b), SyncConfig::default());
        connect(&ctrl_a, &ctrl_b);
        (ctrl_a, ctrl_b)
    }

    fn connect(ctrl_a: &Arc<SyncController>, ctrl_b: &Arc<SyncController>) {
        let (end_a, end_b) = pipe(64);
        ctrl_a.add_peer("b".into(), end_a);
        ctrl_b.add_peer("a".into(), end_b);
    }

    async fn settle() {
        for _ in 0..400 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn standalone_push_merges_subject_to_policy() {
        let shared_bucket = bucket("default", "b");
        let cloud_bucket = bucket("cloud", "b");
        let mut list_b = BucketList::new();
        list_b.add(shared_bucket.clone(), Arc::new(Shared));
        list_b.add(cloud_bucket.clone(), Arc::new(Cloud));

        // peer a pushes freely on both buckets; b's policies decide
        let bucket_a = bucket("default", "a");
        let cloud_a = bucket("cloud", "a");
        let mut list_a = BucketList::new();
        list_a.add(bucket_a.clone(), Arc::new(Shared));
        list_a.add(cloud_a.clone(), Arc::new(Shared));

        let (ctrl_a, _ctrl_b) = connected_pair(list_a, list_b).await;

        let set = put(&bucket_a, b"k", b"v").await;
        ctrl_a.broadcast_update("default", b"k", &set);
        settle().await;

        let got = shared_bucket.get(&[b"k".to_vec()]).await.unwrap();
        assert_eq!(got[0].as_ref().unwrap().value(), Some(b"v".as_ref()));

        // b's cloud bucket refuses pushes from a non-cloud peer
        ctrl_a.broadcast_update("cloud", b"k2", &set);
        settle().await;
        let got = cloud_bucket.get(&[b"k2".to_vec()]).await.unwrap();
        assert!(got[0].is_none());
    }

    #[tokio::test]
    async fn initiated_sessions_pull_missing_objects() {
        // responder (b) has data the initiator (a) lacks
        let bucket_a = bucket("default", "a");
        let bucket_b = bucket("default", "b");
        put(&bucket_b, b"OBJ1", b"hello").await;

        let mut list_a = BucketList::new();
        list_a.add(bucket_a.clone(), Arc::new(Shared));
        let mut list_b = BucketList::new();
        list_b.add(bucket_b.clone(), Arc::new(Shared));

        let (ctrl_a, _ctrl_b) = connected_pair(list_a, list_b).await;

        ctrl_a.initiate_sync("b", "default");
        settle().await;

        let got = bucket_a.get(&[b"OBJ1".to_vec()]).await.unwrap();
        assert_eq!(got[0].as_ref().unwrap().value(), Some(b"hello".as_ref()));
        assert_eq!(
            bucket_a.with_merkle(|t| t.root_hash()).await,
            bucket_b.with_merkle(|t| t.root_hash()).await
        );
    }

    #[tokio::test]
    async fn repeated_sessions_converge_many_keys() {
        let bucket_a = bucket("default", "a");
        let bucket_b = bucket("default", "b");
        for i in 0..8 {
            put(&bucket_b, format!("key{i}").as_bytes(), b"v").await;
        }

        let mut list_a = BucketList::new();
        list_a.add(bucket_a.clone(), Arc::new(Shared));
        let mut list_b = BucketList::new();
        list_b.add(bucket_b.clone(), Arc::new(Shared));

        let (ctrl_a, _ctrl_b) = connected_pair(list_a, list_b).await;

        for _ in 0..64 {
            ctrl_a.initiate_sync("b", "default");
            settle().await;
            let (ra, rb) = (
                bucket_a.with_merkle(|t| t.root_hash()).await,
                bucket_b.with_merkle(|t| t.root_hash()).await,
            );
            if ra == rb {
                break;
            }
        }

        assert_eq!(
            bucket_a.with_merkle(|t| t.root_hash()).await,
            bucket_b.with_merkle(|t| t.root_hash()).await
        );
        for i in 0..8 {
            let got = bucket_a
                .get(&[format!("key{i}").into_bytes()])
                .await
                .unwrap();
            assert!(got[0].is_some(), "key{i} should have synced");
        }
    }

    #[tokio::test]
    async fn incoming_sessions_are_refused_while_partition_reads_are_locked() {
        let bucket_a = bucket("default", "a");
        let bucket_b = bucket("default", "b");
        put(&bucket_b, b"OBJ1", b"hello").await;

        let mut list_a = BucketList::new();
        list_a.add(bucket_a.clone(), Arc::new(Shared));
        let mut list_b = BucketList::new();
        list_b.add(bucket_b.clone(), Arc::new(Shared));

        // b's partition is mid-transfer: reads locked, writes open
        let partition_b = Arc::new(Partition::new(3));
        partition_b.unlock_writes();

        let ctrl_a = SyncController::new(Arc::new(list_a), SyncConfig::default());
        let ctrl_b = SyncController::with_partition(
            Arc::new(list_b),
            SyncConfig::default(),
            partition_b.clone(),
        );
        connect(&ctrl_a, &ctrl_b);

        ctrl_a.initiate_sync("b", "default");
        settle().await;
        let got = bucket_a.get(&[b"OBJ1".to_vec()]).await.unwrap();
        assert!(got[0].is_none(), "a refused session must not move data");

        // releasing the gate lets the next session through
        partition_b.unlock_reads();
        ctrl_a.initiate_sync("b", "default");
        settle().await;
        let got = bucket_a.get(&[b"OBJ1".to_vec()]).await.unwrap();
        assert_eq!(got[0].as_ref().unwrap().value(), Some(b"hello".as_ref()));
    }

    #[tokio::test]
    async fn a_read_locked_partition_neither_initiates_nor_ingests_pushes() {
        let bucket_a = bucket("default", "a");
        let bucket_b = bucket("default", "b");
        put(&bucket_b, b"OBJ1", b"hello").await;

        let mut list_a = BucketList::new();
        list_a.add(bucket_a.clone(), Arc::new(Shared));
        let mut list_b = BucketList::new();
        list_b.add(bucket_b.clone(), Arc::new(Shared));

        let partition_a = Arc::new(Partition::new(3));

        let ctrl_a = SyncController::with_partition(
            Arc::new(list_a),
            SyncConfig::default(),
            partition_a.clone(),
        );
        let ctrl_b = SyncController::new(Arc::new(list_b), SyncConfig::default());
        connect(&ctrl_a, &ctrl_b);

        // outgoing sessions are not even started
        ctrl_a.initiate_sync("b", "default");
        settle().await;
        assert!(bucket_a.get(&[b"OBJ1".to_vec()]).await.unwrap()[0].is_none());

        // standalone pushes are dropped at the gate
        let set = bucket_b.get(&[b"OBJ1".to_vec()]).await.unwrap()[0]
            .clone()
            .unwrap();
        ctrl_b.broadcast_update("default", b"OBJ1", &set);
        settle().await;
        assert!(bucket_a.get(&[b"OBJ1".to_vec()]).await.unwrap()[0].is_none());

        partition_a.unlock_reads();
        ctrl_b.broadcast_update("default", b"OBJ1", &set);
        settle().await;
        let got = bucket_a.get(&[b"OBJ1".to_vec()]).await.unwrap();
        assert_eq!(got[0].as_ref().unwrap().value(), Some(b"hello".as_ref()));
    }

    #[tokio::test]
    async fn cloud_buckets_do_not_initiate_to_ordinary_peers() {
        let bucket_a = bucket("cloud", "a");
        let bucket_b = bucket("cloud", "b");
        put(&bucket_b, b"k", b"v").await;

        let mut list_a = BucketList::new();
        list_a.add(bucket_a.clone(), Arc::new(Cloud));
        let mut list_b = BucketList::new();
        list_b.add(bucket_b.clone(), Arc::new(Cloud));

        let (ctrl_a, _ctrl_b) = connected_pair(list_a, list_b).await;

        // outgoing is never allowed for cloud buckets, even toward the
        // cloud peer name
        ctrl_a.initiate_sync("b", "cloud");
        ctrl_a.initiate_sync(CLOUD_PEER_ID, "cloud");
        settle().await;

        let got = bucket_a.get(&[b"k".to_vec()]).await.unwrap();
        assert!(got[0].is_none());
    }
}
