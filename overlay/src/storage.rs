//! The on-disk storage collaborator (§1, out of scope) and the
//! content-key-to-content-id mapping the application layer supplies.

use async_trait::async_trait;
use bytes::Bytes;
use ethereum_types::U256;
use thiserror::Error;

/// A content id shares the same 256-bit XOR-metric space as a [`enr::NodeId`]
/// — `within_radius`, bucket-style closeness, and the lookup engine's
/// priority queue all operate on it identically, so it is the same type
/// rather than a parallel newtype.
pub type ContentId = enr::NodeId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// `get(key) -> value | NotFound`, `put(key, value)`, `radius()` (§1).
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, key: &[u8], id: &ContentId) -> Result<Option<Bytes>, StoreError>;
    async fn put(&self, key: &[u8], id: ContentId, value: Bytes) -> Result<(), StoreError>;
    fn radius(&self) -> U256;
}

/// Maps an opaque content key to its 32-byte content id. Must be pure and
/// total; `None` signals a malformed key (§3).
pub trait ContentKeyValidator: Send + Sync {
    fn content_id(&self, key: &[u8]) -> Option<ContentId>;
}
