//! Per-node content storage.
//!
//! Each content kind (CHK blocks, SSK values, SSK public keys) has two
//! independent LRU tiers: the "store", for content this node is responsible
//! for, and the "cache", for everything that passes through. Lookups consult
//! the store first. Both `get` and `put` promote an entry to most recently used.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::Key;

/// A store tier and a cache tier for one content kind.
#[derive(Debug)]
pub struct Tiers<V> {
    store: LruCache<Key, V>,
    cache: LruCache<Key, V>,
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl<V: Clone> Tiers<V> {
    pub fn new(store_size: usize, cache_size: usize) -> Self {
        Self {
            store: LruCache::new(capacity(store_size)),
            cache: LruCache::new(capacity(cache_size)),
        }
    }

    pub fn get(&mut self, key: Key) -> Option<V> {
        if let Some(value) = self.store.get(&key) {
            return Some(value.clone());
        }
        self.cache.get(&key).cloned()
    }

    /// Always caches; also stores when `store` is set.
    pub fn put(&mut self, key: Key, value: V, store: bool) {
        if store {
            self.store.put(key, value.clone());
        }
        self.cache.put(key, value);
    }

    /// Store tier, for inspection without promoting.
    pub fn store(&self) -> &LruCache<Key, V> {
        &self.store
    }

    pub fn cache(&self) -> &LruCache<Key, V> {
        &self.cache
    }
}

#[derive(Debug)]
pub struct Datastore {
    chk: Tiers<()>,
    ssk: Tiers<u64>,
    pub_keys: Tiers<()>,
}

impl Datastore {
    pub fn new(store_size: usize, cache_size: usize) -> Self {
        Self {
            chk: Tiers::new(store_size, cache_size),
            ssk: Tiers::new(store_size, cache_size),
            pub_keys: Tiers::new(store_size, cache_size),
        }
    }

    pub fn has_chk(&mut self, key: Key) -> bool {
        self.chk.get(key).is_some()
    }

    pub fn put_chk(&mut self, key: Key, store: bool) {
        self.chk.put(key, (), store);
    }

    pub fn ssk(&mut self, key: Key) -> Option<u64> {
        self.ssk.get(key)
    }

    pub fn put_ssk(&mut self, key: Key, value: u64, store: bool) {
        self.ssk.put(key, value, store);
    }

    pub fn has_pub_key(&mut self, key: Key) -> bool {
        self.pub_keys.get(key).is_some()
    }

    pub fn put_pub_key(&mut self, key: Key, store: bool) {
        self.pub_keys.put(key, (), store);
    }

    pub fn chk_tiers(&self) -> &Tiers<()> {
        &self.chk
    }

    pub fn ssk_tiers(&self) -> &Tiers<u64> {
        &self.ssk
    }

    pub fn pub_key_tiers(&self) -> &Tiers<()> {
        &self.pub_keys
    }
}
