use std::sync::Arc;

use tracing::warn;

use crate::bucket::Bucket;
use crate::data::Hash;
use crate::merkle::MerkleTree;

use super::message::{
    MerkleNodeHash, ObjectNext, PushMessage, Start, SyncMessage, SyncMessageBody,
};
use super::PROTOCOL_VERSION;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitiatorState {
    Start,
    Handshake,
    RootHashCompare,
    LeftHashCompare,
    RightHashCompare,
    DbObjectPush,
    End,
}

/// Driving half of a sync session. Walks its own merkle tree down the
/// first divergent path, one comparison per round trip, then pulls the
/// divergent leaf's objects from the responder. Every call emits exactly
/// one message; reaching `End` means the emitted message was the final
/// `SYNC_ABORT`.
pub struct InitiatorSyncSession {
    session_id: u64,
    bucket: Arc<Bucket>,
    state: InitiatorState,
    responder_depth: u8,
    current_node: u32,
}

impl InitiatorSyncSession {
    pub fn new(session_id: u64, bucket: Arc<Bucket>) -> Self {
        Self {
            session_id,
            bucket,
            state: InitiatorState::Start,
            responder_depth: 0,
            current_node: 1,
        }
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    pub fn set_state(&mut self, state: InitiatorState) {
        self.state = state;
    }

    pub fn responder_depth(&self) -> u8 {
        self.responder_depth
    }

    pub fn set_responder_depth(&mut self, depth: u8) {
        self.responder_depth = depth;
    }

    pub fn current_node(&self) -> u32 {
        self.current_node
    }

    pub fn set_current_node(&mut self, node: u32) {
        self.current_node = node;
    }

    fn abort(&mut self) -> SyncMessage {
        self.state = InitiatorState::End;
        SyncMessage::abort(self.session_id)
    }

    /// A node is terminal when either side's tree bottoms out there.
    fn is_shared_leaf(&self, tree: &MerkleTree, node: u32) -> bool {
        let shared_depth = tree.depth().min(self.responder_depth);
        MerkleTree::node_level(node) == shared_depth as u32 - 1
    }

    async fn node_hash_message(&self, node: u32) -> SyncMessage {
        let responder_depth = self.responder_depth;
        let (translated, hash) = self
            .bucket
            .with_merkle(|t| (t.translate_node(node, responder_depth), t.node_hash(node)))
            .await;
        SyncMessage {
            session_id: self.session_id,
            body: SyncMessageBody::NodeHash(MerkleNodeHash::new(translated, hash)),
        }
    }

    async fn object_next_message(&self, node: u32) -> SyncMessage {
        let responder_depth = self.responder_depth;
        let translated = self
            .bucket
            .with_merkle(|t| t.translate_node(node, responder_depth))
            .await;
        SyncMessage {
            session_id: self.session_id,
            body: SyncMessageBody::ObjectNext(ObjectNext { node_id: translated }),
        }
    }

    /// Compare the responder's hash for a child of `current_node`
    /// against ours and pick the next move: descend, switch to the right
    /// sibling, pull objects, or finish.
    async fn compare_child(
        &mut self,
        child: u32,
        theirs: Hash,
        on_match: InitiatorState,
    ) -> SyncMessage {
        let (ours, terminal) = self
            .bucket
            .with_merkle(|t| (t.node_hash(child), self.is_shared_leaf(t, child)))
            .await;

        if theirs == ours {
            match on_match {
                InitiatorState::RightHashCompare => {
                    self.state = InitiatorState::RightHashCompare;
                    let right = self.current_node * 2 + 1;
                    self.node_hash_message(right).await
                }
                // matching right child: this subtree is reconciled
                _ => self.abort(),
            }
        } else if terminal {
            self.current_node = child;
            self.state = InitiatorState::DbObjectPush;
            self.object_next_message(child).await
        } else {
            self.current_node = child;
            self.state = InitiatorState::LeftHashCompare;
            self.node_hash_message(child * 2).await
        }
    }

    pub async fn next_state(&mut self, message: Option<SyncMessage>) -> SyncMessage {
        match self.state {
            InitiatorState::Start => {
                self.state = InitiatorState::Handshake;
                let (depth, bucket) = (
                    self.bucket.merkle_depth().await,
                    self.bucket.name().to_string(),
                );
                SyncMessage {
                    session_id: self.session_id,
                    body: SyncMessageBody::Start(Start {
                        protocol_version: PROTOCOL_VERSION,
                        merkle_depth: depth,
                        bucket,
                    }),
                }
            }

            InitiatorState::Handshake => match message.map(|m| m.body) {
                Some(SyncMessageBody::Start(start)) if start.merkle_depth >= 1 => {
                    self.responder_depth = start.merkle_depth;
                    self.state = InitiatorState::RootHashCompare;
                    self.node_hash_message(1).await
                }
                _ => self.abort(),
            },

            InitiatorState::RootHashCompare => match message.map(|m| m.body) {
                Some(SyncMessageBody::NodeHash(theirs)) => {
                    let (ours, terminal) = self
                        .bucket
                        .with_merkle(|t| (t.root_hash(), self.is_shared_leaf(t, 1)))
                        .await;
                    if theirs.hash() == ours {
                        self.abort()
                    } else if terminal {
                        self.state = InitiatorState::DbObjectPush;
                        self.object_next_message(1).await
                    } else {
                        self.state = InitiatorState::LeftHashCompare;
                        self.node_hash_message(2).await
                    }
                }
                _ => self.abort(),
            },

            InitiatorState::LeftHashCompare => match message.map(|m| m.body) {
                Some(SyncMessageBody::NodeHash(theirs)) => {
                    let left = self.current_node * 2;
                    self.compare_child(left, theirs.hash(), InitiatorState::RightHashCompare)
                        .await
                }
                _ => self.abort(),
            },

            InitiatorState::RightHashCompare => match message.map(|m| m.body) {
                Some(SyncMessageBody::NodeHash(theirs)) => {
                    let right = self.current_node * 2 + 1;
                    self.compare_child(right, theirs.hash(), InitiatorState::End)
                        .await
                }
                _ => self.abort(),
            },

            InitiatorState::DbObjectPush => match message.map(|m| m.body) {
                Some(SyncMessageBody::Push(PushMessage { key, value, .. })) => {
                    if let Err(e) = self.bucket.merge(key.as_bytes(), &value).await {
                        warn!(%e, "sync initiator: merge of pushed object failed");
                        return self.abort();
                    }
                    self.object_next_message(self.current_node).await
                }
                _ => self.abort(),
            },

            InitiatorState::End => self.abort(),
        }
    }
}
