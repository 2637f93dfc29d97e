//! Key-value backend seam. The production store (RocksDB or similar) lives
//! outside this crate; everything here talks to [KvStore] so the whole
//! pipeline can run against [MemKv] in tests. Three namespaces partition the
//! store: chain data, state trie nodes, and plugin metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Write batch applied atomically by [KvStore::write].
#[derive(Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], val: &[u8]) {
        self.ops.push((key.to_vec(), Some(val.to_vec())));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push((key.to_vec(), None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], val: &[u8]);
    fn delete(&self, key: &[u8]);
    /// Apply a batch atomically: either the whole batch is visible or none.
    fn write(&self, batch: WriteBatch);
    /// Key-ordered scan of all entries whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// In-memory store used by tests and as the staging area for state sync.
pub struct MemKv {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], val: &[u8]) {
        self.map.write().insert(key.to_vec(), val.to_vec());
    }

    fn delete(&self, key: &[u8]) {
        self.map.write().remove(key);
    }

    fn write(&self, batch: WriteBatch) {
        let mut map = self.map.write();
        for (key, val) in batch.ops {
            match val {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Namespace wrapper that prefixes every key before hitting the shared
/// backend.
#[derive(Clone)]
pub struct PrefixDb {
    inner: Arc<dyn KvStore>,
    prefix: Vec<u8>,
}

impl PrefixDb {
    pub fn new(inner: Arc<dyn KvStore>, prefix: &[u8]) -> Self {
        Self {
            inner,
            prefix: prefix.to_vec(),
        }
    }

    fn wrap(&self, key: &[u8]) -> Vec<u8> {
        let mut buff = self.prefix.clone();
        buff.extend_from_slice(key);
        buff
    }
}

impl KvStore for PrefixDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(&self.wrap(key))
    }

    fn put(&self, key: &[u8], val: &[u8]) {
        self.inner.put(&self.wrap(key), val)
    }

    fn delete(&self, key: &[u8]) {
        self.inner.delete(&self.wrap(key))
    }

    fn write(&self, batch: WriteBatch) {
        let mut wrapped = WriteBatch::new();
        for (key, val) in batch.ops {
            wrapped.ops.push((self.wrap(&key), val));
        }
        self.inner.write(wrapped)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .scan_prefix(&self.wrap(prefix))
            .into_iter()
            .map(|(k, v)| (k[self.prefix.len()..].to_vec(), v))
            .collect()
    }
}

/// Well-known namespace prefixes within the backing store.
pub mod namespace {
    /// Headers, bodies, receipts and the canonical number index.
    pub const CHAIN: &[u8] = b"c/";
    /// State trie nodes and contract code.
    pub const STATE: &[u8] = b"s/";
    /// Last-accepted pointer, sync progress, upgrade journal, warp intents.
    pub const META: &[u8] = b"m/";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_atomic_and_prefix_scoped() {
        let kv = Arc::new(MemKv::new());
        let a = PrefixDb::new(kv.clone(), b"a/");
        let b = PrefixDb::new(kv.clone(), b"b/");
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        a.write(batch);
        assert_eq!(a.get(b"k1"), Some(b"v1".to_vec()));
        assert_eq!(b.get(b"k1"), None);
        assert_eq!(a.scan_prefix(b"k").len(), 2);
        a.delete(b"k1");
        assert_eq!(a.get(b"k1"), None);
    }
}
