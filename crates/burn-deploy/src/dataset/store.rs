use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Identifier of an image stored in an [`ImageStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Image store is unavailable: {0}")]
    Unavailable(String),
    #[error("Image store rejected the operation: {0}")]
    Rejected(String),
}

/// Persistent storage of raw image bytes keyed by [`RecordId`].
pub trait ImageStore: Send + Sync {
    /// Returns `Ok(None)` when no record has this id.
    fn lookup(&self, id: RecordId) -> Result<Option<Vec<u8>>, StoreError>;

    fn insert(&self, bytes: Vec<u8>) -> Result<RecordId, StoreError>;
}

/// Store held in memory, assigning sequential ids starting at 1.
#[derive(Debug)]
pub struct InMemoryImageStore {
    records: RwLock<BTreeMap<RecordId, Vec<u8>>>,
    next_id: AtomicU64,
}

impl Default for InMemoryImageStore {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImageStore for InMemoryImageStore {
    fn lookup(&self, id: RecordId) -> Result<Option<Vec<u8>>, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&id).cloned())
    }

    fn insert(&self, bytes: Vec<u8>) -> Result<RecordId, StoreError> {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, bytes);
        Ok(id)
    }
}
