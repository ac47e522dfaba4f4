use serde::{Deserialize, Serialize};

use crate::error::DbError;

use super::version::VersionVector;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOp {
    Put,
    Delete,
}

/// One keyed mutation plus the causal context the writer had observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub op: UpdateOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub context: VersionVector,
}

/// An ordered list of updates applied atomically by `Bucket::batch`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateBatch {
    updates: Vec<Update>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        context: VersionVector,
    ) -> Result<&mut Self, DbError> {
        if key.is_empty() {
            return Err(DbError::InvalidInput);
        }
        self.updates.push(Update {
            op: UpdateOp::Put,
            key,
            value: Some(value),
            context,
        });
        Ok(self)
    }

    pub fn delete(&mut self, key: Vec<u8>, context: VersionVector) -> Result<&mut Self, DbError> {
        if key.is_empty() {
            return Err(DbError::InvalidInput);
        }
        self.updates.push(Update {
            op: UpdateOp::Delete,
            key,
            value: None,
            context,
        });
        Ok(self)
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
