use serde::{Deserialize, Serialize};

use crate::data::{Hash, SiblingSet};
use crate::error::DbError;

/// One JSON frame of the sync protocol. Standalone pushes (post-write
/// broadcast) travel as session 0 and bypass the session state machines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "sessionID")]
    pub session_id: u64,
    #[serde(flatten)]
    pub body: SyncMessageBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "messageBody")]
pub enum SyncMessageBody {
    #[serde(rename = "SYNC_START")]
    Start(Start),
    #[serde(rename = "SYNC_NODE_HASH")]
    NodeHash(MerkleNodeHash),
    #[serde(rename = "SYNC_OBJECT_NEXT")]
    ObjectNext(ObjectNext),
    #[serde(rename = "SYNC_PUSH_MESSAGE")]
    Push(PushMessage),
    #[serde(rename = "SYNC_ABORT")]
    Abort(Abort),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "merkleDepth")]
    pub merkle_depth: u8,
    pub bucket: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNodeHash {
    #[serde(rename = "nodeID")]
    pub node_id: u32,
    #[serde(rename = "hashHigh")]
    pub hash_high: u64,
    #[serde(rename = "hashLow")]
    pub hash_low: u64,
}

impl MerkleNodeHash {
    pub fn new(node_id: u32, hash: Hash) -> Self {
        Self {
            node_id,
            hash_high: hash.high(),
            hash_low: hash.low(),
        }
    }

    pub fn hash(&self) -> Hash {
        Hash::new(self.hash_high, self.hash_low)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectNext {
    #[serde(rename = "nodeID")]
    pub node_id: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub bucket: String,
    pub key: String,
    pub value: SiblingSet,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {}

impl SyncMessage {
    pub fn abort(session_id: u64) -> Self {
        Self {
            session_id,
            body: SyncMessageBody::Abort(Abort {}),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("sync frame encoding is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        serde_json::from_slice(bytes).map_err(|e| DbError::ProtocolViolation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PROTOCOL_VERSION;

    #[test]
    fn frames_use_the_wire_field_names() {
        let msg = SyncMessage {
            session_id: 7,
            body: SyncMessageBody::Start(Start {
                protocol_version: PROTOCOL_VERSION,
                merkle_depth: 19,
                bucket: "default".into(),
            }),
        };

        let json: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(json["sessionID"], 7);
        assert_eq!(json["messageType"], "SYNC_START");
        assert_eq!(json["messageBody"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(json["messageBody"]["merkleDepth"], 19);
        assert_eq!(json["messageBody"]["bucket"], "default");
    }

    #[test]
    fn node_hash_round_trips_the_split_hash() {
        let hash = crate::data::hash::hash_bytes(b"x");
        let msg = SyncMessage {
            session_id: 1,
            body: SyncMessageBody::NodeHash(MerkleNodeHash::new(3, hash)),
        };

        let decoded = SyncMessage::decode(&msg.encode()).unwrap();
        match decoded.body {
            SyncMessageBody::NodeHash(h) => {
                assert_eq!(h.node_id, 3);
                assert_eq!(h.hash(), hash);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_protocol_violations() {
        assert!(matches!(
            SyncMessage::decode(b"{\"sessionID\": 1}"),
            Err(DbError::ProtocolViolation(_))
        ));
        assert!(matches!(
            SyncMessage::decode(b"not json"),
            Err(DbError::ProtocolViolation(_))
        ));
    }
}
