//! The key-value store contract the core persists through.
//!
//! A [Store] only has to offer two things: point-in-time read views ([StoreView], typically a
//! snapshot) and atomic application of a [WriteBatch]. Everything transactional the core needs
//! is layered on top by [Transaction]: it reads from one snapshot, buffers writes (with
//! read-your-writes semantics, including for ordered seeks) and commits the buffer as a single
//! batch. Dropping a [Transaction] without committing rolls it back.
//!
//! [MemStore] is a copy-on-write, in-memory implementation. A persistent implementation backed
//! by RocksDB lives in the tools crate.

use std::collections::btree_map::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The underlying storage failed to read or write.
    Io(String),
    /// The write batch was rejected because it conflicts with another writer.
    Conflict,
    /// Data read back from the store is malformed.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "store I/O error: {}", e),
            StoreError::Conflict => write!(f, "store transaction conflict"),
            StoreError::Corrupt(e) => write!(f, "store data corrupted: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Read access to a consistent view of the store.
pub trait StoreView {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    /// The smallest entry whose key is in `[from, to)`.
    fn first_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError>;
    /// The largest entry whose key is in `[from, to]`.
    fn last_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError>;
    /// All entries whose keys are in `[from, to)`, in key order.
    fn range(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Vec<KeyValue>, StoreError>;
}

/// A set of puts and deletes applied atomically by [Store::write].
#[derive(Default, Debug)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, val: Vec<u8>) {
        self.ops.insert(key, Some(val));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.insert(key, None);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = (Vec<u8>, Option<Vec<u8>>);
    type IntoIter =
        std::collections::btree_map::IntoIter<Vec<u8>, Option<Vec<u8>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

pub trait Store: Send + Sync {
    /// Take a consistent read view that does not observe later writes.
    fn snapshot(&self) -> Box<dyn StoreView + '_>;
    /// Apply all operations of the batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Read-only transaction over one snapshot.
pub struct ReadTransaction<'a> {
    view: Box<dyn StoreView + 'a>,
}

impl<'a> ReadTransaction<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            view: store.snapshot(),
        }
    }
}

impl<'a> StoreView for ReadTransaction<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.view.get(key)
    }
    fn first_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        self.view.first_in(from, to)
    }
    fn last_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        self.view.last_in(from, to)
    }
    fn range(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Vec<KeyValue>, StoreError> {
        self.view.range(from, to)
    }
}

/// Read-write transaction: snapshot reads overlaid with the buffered writes.
pub struct Transaction<'a> {
    store: &'a dyn Store,
    view: Box<dyn StoreView + 'a>,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            view: store.snapshot(),
            writes: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, val: Vec<u8>) {
        self.writes.insert(key, Some(val));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Atomically apply all buffered writes.
    pub fn commit(self) -> Result<(), StoreError> {
        let Self {
            store,
            view,
            writes,
        } = self;
        // the snapshot is not needed for writing
        drop(view);
        if writes.is_empty() {
            return Ok(())
        }
        let mut batch = WriteBatch::default();
        for (k, v) in writes.into_iter() {
            match v {
                Some(v) => batch.put(k, v),
                None => batch.delete(k),
            }
        }
        store.write(batch)
    }

    /// Discard all buffered writes.
    pub fn rollback(self) {}

    fn buffered(
        &self, from: &[u8], to: Bound<&[u8]>,
    ) -> impl DoubleEndedIterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        self.writes.range::<[u8], _>((Bound::Included(from), to))
    }
}

impl<'a> StoreView for Transaction<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.writes.get(key) {
            Some(v) => Ok(v.clone()),
            None => self.view.get(key),
        }
    }

    fn first_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        if from >= to {
            return Ok(None)
        }
        // the first live buffered entry bounds the search in the snapshot
        let pending = self
            .buffered(from, Bound::Excluded(to))
            .find(|(_, v)| v.is_some())
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()));
        let mut cursor = from.to_vec();
        loop {
            let upper = match &pending {
                Some((k, _)) => k.as_slice(),
                None => to,
            };
            match self.view.first_in(&cursor, upper)? {
                Some((k, v)) => {
                    if let Some(None) = self.writes.get(&k) {
                        // deleted in this transaction, keep looking
                        cursor = k;
                        cursor.push(0);
                        continue
                    }
                    return Ok(Some((k, v)))
                }
                None => return Ok(pending),
            }
        }
    }

    fn last_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        if from > to {
            return Ok(None)
        }
        let pending = self
            .buffered(from, Bound::Included(to))
            .rev()
            .find(|(_, v)| v.is_some())
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()));
        let mut cursor = to.to_vec();
        loop {
            let found = self.view.last_in(from, &cursor)?;
            match found {
                Some((k, v)) => {
                    if let Some((pk, _)) = &pending {
                        if pk >= &k {
                            return Ok(pending)
                        }
                    }
                    if let Some(None) = self.writes.get(&k) {
                        match predecessor(&k) {
                            Some(p) if p.as_slice() >= from => cursor = p,
                            _ => return Ok(pending),
                        }
                        continue
                    }
                    return Ok(Some((k, v)))
                }
                None => return Ok(pending),
            }
        }
    }

    fn range(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Vec<KeyValue>, StoreError> {
        if from >= to {
            return Ok(Vec::new())
        }
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.view.range(from, to)?.into_iter().collect();
        for (k, v) in self.buffered(from, Bound::Excluded(to)) {
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

/// The largest key below `key` among keys of at most twice its length. Store keys are fixed
/// width per namespace, so this steps a reverse seek past exactly one key.
fn predecessor(key: &[u8]) -> Option<Vec<u8>> {
    let mut p = key.to_vec();
    match p.pop()? {
        0 => Some(p),
        b => {
            p.push(b - 1);
            p.extend(std::iter::repeat(0xff).take(key.len()));
            Some(p)
        }
    }
}

type MemMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory store. Snapshots share the current map; a write clones it only while some snapshot
/// still holds on to it.
#[derive(Default)]
pub struct MemStore {
    map: RwLock<Arc<MemMap>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

struct MemView(Arc<MemMap>);

impl StoreView for MemView {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.0.get(key).cloned())
    }

    fn first_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        if from >= to {
            return Ok(None)
        }
        Ok(self
            .0
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn last_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        if from > to {
            return Ok(None)
        }
        Ok(self
            .0
            .range::<[u8], _>((Bound::Included(from), Bound::Included(to)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn range(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Vec<KeyValue>, StoreError> {
        if from >= to {
            return Ok(Vec::new())
        }
        Ok(self
            .0
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl Store for MemStore {
    fn snapshot(&self) -> Box<dyn StoreView + '_> {
        Box::new(MemView(self.map.read().clone()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write();
        let map = Arc::make_mut(&mut map);
        for (k, v) in batch {
            match v {
                Some(v) => {
                    map.insert(k, v);
                }
                None => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &MemStore, kvs: &[(&[u8], &[u8])]) {
        let mut tx = Transaction::new(store);
        for (k, v) in kvs {
            tx.put(k.to_vec(), v.to_vec());
        }
        tx.commit().unwrap();
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = MemStore::new();
        put(&store, &[(b"a", b"1")]);
        let rtx = ReadTransaction::new(&store);
        put(&store, &[(b"a", b"2"), (b"b", b"3")]);
        assert_eq!(rtx.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(rtx.get(b"b").unwrap(), None);
        let rtx = ReadTransaction::new(&store);
        assert_eq!(rtx.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let store = MemStore::new();
        let mut tx = Transaction::new(&store);
        tx.put(b"a".to_vec(), b"1".to_vec());
        assert_eq!(tx.get(b"a").unwrap(), Some(b"1".to_vec()));
        tx.rollback();
        assert!(store.is_empty());
    }

    #[test]
    fn test_seeks_see_buffered_writes() {
        let store = MemStore::new();
        put(&store, &[(b"k1", b"1"), (b"k3", b"3"), (b"k5", b"5")]);
        let mut tx = Transaction::new(&store);
        tx.delete(b"k1".to_vec());
        tx.put(b"k2".to_vec(), b"2".to_vec());
        tx.delete(b"k5".to_vec());
        assert_eq!(
            tx.first_in(b"k", b"l").unwrap().map(|kv| kv.0),
            Some(b"k2".to_vec())
        );
        assert_eq!(
            tx.last_in(b"k", b"k9").unwrap().map(|kv| kv.0),
            Some(b"k3".to_vec())
        );
        tx.delete(b"k3".to_vec());
        tx.delete(b"k2".to_vec());
        assert_eq!(tx.first_in(b"k", b"l").unwrap(), None);
        assert_eq!(tx.last_in(b"k", b"k9").unwrap(), None);
        let keys: Vec<_> = tx
            .range(b"k", b"l")
            .unwrap()
            .into_iter()
            .map(|kv| kv.0)
            .collect();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_range_merges_buffer() {
        let store = MemStore::new();
        put(&store, &[(b"a1", b"x"), (b"a2", b"y")]);
        let mut tx = Transaction::new(&store);
        tx.put(b"a0".to_vec(), b"w".to_vec());
        tx.delete(b"a2".to_vec());
        let keys: Vec<_> = tx
            .range(b"a", b"b")
            .unwrap()
            .into_iter()
            .map(|kv| kv.0)
            .collect();
        assert_eq!(keys, vec![b"a0".to_vec(), b"a1".to_vec()]);
    }
}
