use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryCache;

#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// A binary-keyed, binary-valued store holding serialized payloads.
///
/// Backends must be safe for concurrent use: the orchestrator holds no locks
/// and issues reads and writes from every request handler. A lost race
/// between two concurrent writes of the same key is acceptable, the last
/// write wins.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Atomic read of the latest committed value.
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, Error>;

    /// Atomic overwrite.
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Idempotent removal.
    async fn delete(&self, key: &[u8]) -> Result<(), Error>;

    /// Returns a point-in-time snapshot of all entries. Writes issued while
    /// the snapshot is being consumed may or may not appear.
    async fn iterate(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error>;

    /// Removes all entries.
    async fn wipe(&self) -> Result<(), Error>;
}
