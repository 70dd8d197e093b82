use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cache::{Cache, Error};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// A process-local cache backend over a `BTreeMap`.
///
/// Optionally applies a uniform TTL to every entry: expired entries behave
/// as missing on read and are purged on the next write.
pub struct InMemoryCache {
    entries: RwLock<BTreeMap<Vec<u8>, Entry>>,
    ttl: Option<Duration>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        InMemoryCache {
            entries: RwLock::new(BTreeMap::new()),
            ttl: None,
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        InMemoryCache {
            entries: RwLock::new(BTreeMap::new()),
            ttl: Some(ttl),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        InMemoryCache::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());

        match entries.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => Ok(entry.value.clone()),
            _ => Err(Error::NotFound),
        }
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());

        if self.ttl.is_some() {
            let now = Instant::now();
            entries.retain(|_, entry| !entry.is_expired(now));
        }

        entries.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
            },
        );

        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), Error> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn iterate(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();

        Ok(entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn wipe(&self) -> Result<(), Error> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.clear();
        log::debug!("cache wiped");
        Ok(())
    }
}
