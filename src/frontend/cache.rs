//! Bounded caches over the agent store
//!
//! Two independent LRU maps: verified public keys and open record handles.
//! Verification traffic dwarfs record-handle use, so the key cache is kept
//! 50× larger — handle pressure must not evict hot keys. A miss is never an
//! error; callers fall back to the store.

use crate::crypto::{ExchangePublic, PublicKey};
use crate::frontend::message::AgentId;
use crate::store::AgentRecord;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

pub const PUB_KEY_CACHE_SIZE: usize = 50_000;
pub const CLIENT_CACHE_SIZE: usize = 1_000;

/// Keys extracted from a verified certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentPublicKey {
    pub signing_key: PublicKey,
    pub exchange_key: ExchangePublic,
}

/// Shared working copy of an agent record. The store stays the
/// serialization point; handles never write back on their own.
pub type ClientHandle = Arc<Mutex<AgentRecord>>;

pub struct PublicKeyCache {
    inner: Mutex<LruCache<AgentId, AgentPublicKey>>,
}

impl PublicKeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentPublicKey> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(id).cloned()
    }

    pub fn insert(&self, id: AgentId, key: AgentPublicKey) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(id, key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ClientCache {
    inner: Mutex<LruCache<AgentId, ClientHandle>>,
}

impl ClientCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<ClientHandle> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(id).cloned()
    }

    pub fn insert(&self, id: AgentId, handle: ClientHandle) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(id, handle);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_key(seed: u8) -> AgentPublicKey {
        AgentPublicKey {
            signing_key: vec![seed; 32],
            exchange_key: [seed; 32],
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = PublicKeyCache::new(10);
        let id = AgentId::from("A1");
        assert!(cache.get(&id).is_none());

        cache.insert(id.clone(), make_key(1));
        assert_eq!(cache.get(&id), Some(make_key(1)));
    }

    #[test]
    fn test_capacity_eviction_is_lru() {
        let cache = PublicKeyCache::new(2);
        cache.insert(AgentId::from("A1"), make_key(1));
        cache.insert(AgentId::from("A2"), make_key(2));

        // Touch A1 so A2 is the eviction candidate.
        assert!(cache.get(&AgentId::from("A1")).is_some());
        cache.insert(AgentId::from("A3"), make_key(3));

        assert!(cache.get(&AgentId::from("A1")).is_some());
        assert!(cache.get(&AgentId::from("A2")).is_none());
        assert!(cache.get(&AgentId::from("A3")).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_client_handles_are_shared() {
        let cache = ClientCache::new(10);
        let id = AgentId::from("A1");
        let handle: ClientHandle = Arc::new(Mutex::new(AgentRecord::default()));
        cache.insert(id.clone(), Arc::clone(&handle));

        let cached = cache.get(&id).unwrap();
        cached.lock().unwrap().clock = 42;
        assert_eq!(handle.lock().unwrap().clock, 42);
    }
}
