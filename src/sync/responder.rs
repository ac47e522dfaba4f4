use std::sync::Arc;

use tracing::warn;

use crate::bucket::Bucket;

use super::message::{MerkleNodeHash, PushMessage, Start, SyncMessage, SyncMessageBody};
use super::PROTOCOL_VERSION;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponderState {
    Start,
    HashCompare,
    DbObjectPush,
    End,
}

/// Answering half of a sync session: replies to hash probes with local
/// hashes and streams the objects under a requested subtree one at a
/// time, ending with `SYNC_ABORT` when the cursor is exhausted.
pub struct ResponderSyncSession {
    bucket: Arc<Bucket>,
    state: ResponderState,
    session_id: u64,
    initiator_depth: u8,
    current_node: u32,
    cursor: Option<Vec<u8>>,
}

impl ResponderSyncSession {
    pub fn new(bucket: Arc<Bucket>) -> Self {
        Self {
            bucket,
            state: ResponderState::Start,
            session_id: 0,
            initiator_depth: 0,
            current_node: 0,
            cursor: None,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn set_state(&mut self, state: ResponderState) {
        self.state = state;
    }

    pub fn initiator_depth(&self) -> u8 {
        self.initiator_depth
    }

    pub fn set_initiator_depth(&mut self, depth: u8) {
        self.initiator_depth = depth;
    }

    fn abort(&mut self) -> SyncMessage {
        self.state = ResponderState::End;
        SyncMessage::abort(self.session_id)
    }

    async fn push_next_object(&mut self) -> SyncMessage {
        match self
            .bucket
            .next_merkle_object(self.current_node, self.cursor.as_deref())
            .await
        {
            Ok(Some((key, set, cursor))) => {
                self.cursor = Some(cursor);
                self.state = ResponderState::DbObjectPush;
                SyncMessage {
                    session_id: self.session_id,
                    body: SyncMessageBody::Push(PushMessage {
                        bucket: self.bucket.name().to_string(),
                        key: String::from_utf8_lossy(&key).into_owned(),
                        value: set,
                    }),
                }
            }
            Ok(None) => self.abort(),
            Err(e) => {
                warn!(%e, "sync responder: object walk failed");
                self.abort()
            }
        }
    }

    pub async fn next_state(&mut self, message: Option<SyncMessage>) -> SyncMessage {
        match self.state {
            ResponderState::Start => {
                let Some(message) = message else {
                    return self.abort();
                };
                self.session_id = message.session_id;

                match message.body {
                    SyncMessageBody::Start(Start {
                        protocol_version,
                        merkle_depth,
                        bucket,
                    }) if protocol_version == PROTOCOL_VERSION
                        && merkle_depth >= 1
                        && bucket == self.bucket.name() =>
                    {
                        self.initiator_depth = merkle_depth;
                        self.state = ResponderState::HashCompare;
                        let depth = self.bucket.merkle_depth().await;
                        SyncMessage {
                            session_id: self.session_id,
                            body: SyncMessageBody::Start(Start {
                                protocol_version: PROTOCOL_VERSION,
                                merkle_depth: depth,
                                bucket: self.bucket.name().to_string(),
                            }),
                        }
                    }
                    _ => self.abort(),
                }
            }

            ResponderState::HashCompare => match message.map(|m| m.body) {
                Some(SyncMessageBody::NodeHash(MerkleNodeHash { node_id, .. })) => {
                    let initiator_depth = self.initiator_depth;
                    let reply = self
                        .bucket
                        .with_merkle(|t| {
                            if node_id == 0 || node_id >= t.node_limit() {
                                None
                            } else {
                                Some(MerkleNodeHash::new(
                                    t.translate_node(node_id, initiator_depth),
                                    t.node_hash(node_id),
                                ))
                            }
                        })
                        .await;
                    match reply {
                        Some(hash) => SyncMessage {
                            session_id: self.session_id,
                            body: SyncMessageBody::NodeHash(hash),
                        },
                        None => self.abort(),
                    }
                }
                Some(SyncMessageBody::ObjectNext(next)) => {
                    let valid = self
                        .bucket
                        .with_merkle(|t| next.node_id > 0 && next.node_id < t.node_limit())
                        .await;
                    if !valid {
                        return self.abort();
                    }
                    self.current_node = next.node_id;
                    self.cursor = None;
                    self.push_next_object().await
                }
                _ => self.abort(),
            },

            ResponderState::DbObjectPush => match message.map(|m| m.body) {
                Some(SyncMessageBody::ObjectNext(_)) => self.push_next_object().await,
                _ => self.abort(),
            },

            ResponderState::End => self.abort(),
        }
    }
}
