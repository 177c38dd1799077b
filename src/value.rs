//! Content-addressed VM values.
//!
//! A [Value] is immutable and cheap to clone: buffers and tuples are shared behind `Arc`, so two
//! machine states (or a machine state and a log) that contain the same tuple hold the very same
//! allocation. Every value is identified by its hash, which is also its key in the value table.
//!
//! Persisted values are reference counted. Saving a value that already exists only bumps its
//! count; saving a new tuple also saves (and counts a reference to) each of its items. Deleting
//! a value drops one reference and frees the record, recursively, once the count reaches zero.
//! Only checkpoint and log truncation delete values.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use log::warn;
use rlp::{Rlp, RlpStream};

use crate::common::{u256_to_bytes, Bytes, Hash, U256RLP, U256};
use crate::core::{keys, CoreError};
use crate::store::{StoreView, Transaction};

const TAG_INT: u8 = 0;
const TAG_BUFFER: u8 = 1;
const TAG_CODE_POINT: u8 = 2;
const TAG_TUPLE: u8 = 3;

/// Position inside a segment of the code table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CodePointRef {
    pub segment: u64,
    pub pc: u64,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Int(U256),
    Buffer(Arc<Bytes>),
    CodePoint(CodePointRef),
    Tuple(Arc<Tuple>),
}

/// An ordered list of values. Its hash is computed once, on construction.
pub struct Tuple {
    items: Vec<Value>,
    hash: Hash,
}

impl Tuple {
    pub fn new(items: Vec<Value>) -> Self {
        let mut buff = Vec::with_capacity(1 + items.len() * 32);
        buff.push(TAG_TUPLE);
        for item in items.iter() {
            buff.extend_from_slice(item.hash().as_bytes());
        }
        Self {
            hash: Hash::hash(&buff),
            items,
        }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.items.get(idx)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Tuple {}

impl Value {
    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::new(Tuple::new(items)))
    }

    pub fn buffer(bytes: Bytes) -> Self {
        Value::Buffer(Arc::new(bytes))
    }

    pub fn hash(&self) -> Hash {
        match self {
            Value::Int(i) => {
                let mut buff = [0u8; 33];
                buff[0] = TAG_INT;
                buff[1..].copy_from_slice(&u256_to_bytes(i));
                Hash::hash(&buff)
            }
            Value::Buffer(b) => {
                let mut buff = Vec::with_capacity(1 + b.len());
                buff.push(TAG_BUFFER);
                buff.extend_from_slice(b);
                Hash::hash(&buff)
            }
            Value::CodePoint(cp) => {
                let mut buff = [0u8; 17];
                buff[0] = TAG_CODE_POINT;
                buff[1..9].copy_from_slice(&cp.segment.to_be_bytes());
                buff[9..].copy_from_slice(&cp.pc.to_be_bytes());
                Hash::hash(&buff)
            }
            Value::Tuple(t) => t.hash,
        }
    }

    pub fn as_int(&self) -> Option<&U256> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Bytes> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_code_point(&self) -> Option<&CodePointRef> {
        match self {
            Value::CodePoint(cp) => Some(cp),
            _ => None,
        }
    }
}

impl From<U256> for Value {
    fn from(i: U256) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Int(i.into())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Buffer(b) => write!(f, "Buffer({:?})", b),
            Value::CodePoint(cp) => {
                write!(f, "CodePoint({}:{})", cp.segment, cp.pc)
            }
            Value::Tuple(t) => f.debug_list().entries(t.items.iter()).finish(),
        }
    }
}

/// Process-wide cache of deserialized values, keyed by hash. Entries are only ever inserted
/// (first writer wins) or evicted, never mutated, so concurrent misses on the same hash converge
/// to a single shared instance.
#[derive(Default)]
pub struct ValueCache {
    values: DashMap<Hash, Value>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &Hash) -> Option<Value> {
        self.values.get(hash).map(|v| v.value().clone())
    }

    /// Returns the cached instance for the value's hash, inserting `value` if there is none.
    pub fn get_or_insert(&self, value: Value) -> Value {
        self.values.entry(value.hash()).or_insert(value).value().clone()
    }

    pub fn evict(&self, hash: &Hash) {
        self.values.remove(hash);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&self) {
        self.values.clear()
    }
}

enum ValueBody {
    Int(U256),
    Buffer(Bytes),
    CodePoint(CodePointRef),
    Tuple(Vec<Hash>),
}

struct ValueRecord {
    refcount: u64,
    body: ValueBody,
}

impl ValueRecord {
    fn from_value(value: &Value) -> Self {
        let body = match value {
            Value::Int(i) => ValueBody::Int(*i),
            Value::Buffer(b) => ValueBody::Buffer((**b).clone()),
            Value::CodePoint(cp) => ValueBody::CodePoint(*cp),
            Value::Tuple(t) => {
                ValueBody::Tuple(t.items.iter().map(|v| v.hash()).collect())
            }
        };
        Self { refcount: 1, body }
    }

    fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(3);
        s.append(&self.refcount);
        match &self.body {
            ValueBody::Int(i) => {
                s.append(&TAG_INT);
                s.append(&U256RLP(*i));
            }
            ValueBody::Buffer(b) => {
                s.append(&TAG_BUFFER);
                s.append(b);
            }
            ValueBody::CodePoint(cp) => {
                s.append(&TAG_CODE_POINT);
                s.begin_list(2);
                s.append(&cp.segment);
                s.append(&cp.pc);
            }
            ValueBody::Tuple(items) => {
                s.append(&TAG_TUPLE);
                s.append_list::<Hash, Hash>(items);
            }
        }
        s.out().to_vec()
    }

    fn decode(raw: &[u8]) -> Result<Self, rlp::DecoderError> {
        let rlp = Rlp::new(raw);
        let refcount: u64 = rlp.val_at(0)?;
        let tag: u8 = rlp.val_at(1)?;
        let body = match tag {
            TAG_INT => ValueBody::Int(rlp.val_at::<U256RLP>(2)?.0),
            TAG_BUFFER => ValueBody::Buffer(rlp.val_at(2)?),
            TAG_CODE_POINT => {
                let cp = rlp.at(2)?;
                ValueBody::CodePoint(CodePointRef {
                    segment: cp.val_at(0)?,
                    pc: cp.val_at(1)?,
                })
            }
            TAG_TUPLE => ValueBody::Tuple(rlp.list_at(2)?),
            _ => return Err(rlp::DecoderError::Custom("unknown value tag")),
        };
        Ok(Self { refcount, body })
    }
}

fn read_record(
    view: &dyn StoreView, hash: &Hash,
) -> Result<Option<ValueRecord>, CoreError> {
    match view.get(&keys::value(hash))? {
        Some(raw) => ValueRecord::decode(&raw).map(Some).map_err(|e| {
            CoreError::Corrupt(format!("value {}: {:?}", hash, e))
        }),
        None => Ok(None),
    }
}

/// Record one more reference to `value`, persisting it (and its items) if it is new.
pub fn save_value(tx: &mut Transaction, value: &Value) -> Result<(), CoreError> {
    let mut todo = vec![value.clone()];
    while let Some(v) = todo.pop() {
        let key = keys::value(&v.hash());
        match read_record(&*tx, &v.hash())? {
            Some(mut record) => {
                record.refcount += 1;
                tx.put(key, record.encode());
            }
            None => {
                tx.put(key, ValueRecord::from_value(&v).encode());
                if let Value::Tuple(t) = &v {
                    todo.extend(t.items.iter().cloned());
                }
            }
        }
    }
    Ok(())
}

/// Drop one reference to the value; frees it (and drops its references to its items) when no
/// reference is left. Returns the number of records freed.
pub fn delete_value(
    tx: &mut Transaction, hash: &Hash, cache: &ValueCache,
) -> Result<usize, CoreError> {
    let mut freed = 0;
    let mut todo = vec![*hash];
    while let Some(h) = todo.pop() {
        let key = keys::value(&h);
        let mut record = match read_record(&*tx, &h)? {
            Some(r) => r,
            None => {
                warn!("dropping reference to missing value {}", h);
                continue
            }
        };
        if record.refcount > 1 {
            record.refcount -= 1;
            tx.put(key, record.encode());
            continue
        }
        tx.delete(key);
        cache.evict(&h);
        freed += 1;
        if let ValueBody::Tuple(items) = record.body {
            todo.extend(items);
        }
    }
    Ok(freed)
}

/// Load a persisted value, going through (and populating) the cache.
pub fn get_value(
    view: &dyn StoreView, hash: &Hash, cache: &ValueCache,
) -> Result<Option<Value>, CoreError> {
    if let Some(v) = cache.get(hash) {
        return Ok(Some(v))
    }
    let record = match read_record(view, hash)? {
        Some(r) => r,
        None => return Ok(None),
    };
    let value = match record.body {
        ValueBody::Int(i) => Value::Int(i),
        ValueBody::Buffer(b) => Value::buffer(b),
        ValueBody::CodePoint(cp) => Value::CodePoint(cp),
        ValueBody::Tuple(items) => {
            let mut vals = Vec::with_capacity(items.len());
            for item in items.iter() {
                match get_value(view, item, cache)? {
                    Some(v) => vals.push(v),
                    None => {
                        return Err(CoreError::Corrupt(format!(
                            "tuple {} refers to missing value {}",
                            hash, item
                        )))
                    }
                }
            }
            Value::tuple(vals)
        }
    };
    Ok(Some(cache.get_or_insert(value)))
}

/// Number of references currently recorded for a persisted value.
pub fn value_refcount(
    view: &dyn StoreView, hash: &Hash,
) -> Result<Option<u64>, CoreError> {
    Ok(read_record(view, hash)?.map(|r| r.refcount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn sample() -> (Value, Value) {
        let shared = Value::tuple(vec![1u64.into(), 2u64.into()]);
        let outer = Value::tuple(vec![
            shared.clone(),
            Value::buffer(b"hello"[..].into()),
            Value::CodePoint(CodePointRef { segment: 0, pc: 7 }),
        ]);
        (shared, outer)
    }

    #[test]
    fn test_hash_identifies_content() {
        let (shared, outer) = sample();
        let again = Value::tuple(vec![1u64.into(), 2u64.into()]);
        assert_eq!(shared.hash(), again.hash());
        assert_ne!(shared.hash(), outer.hash());
        assert_ne!(Value::from(1u64).hash(), Value::from(2u64).hash());
    }

    #[test]
    fn test_refcounted_save_and_delete() {
        let store = MemStore::new();
        let cache = ValueCache::new();
        let (shared, outer) = sample();
        let mut tx = Transaction::new(&store);
        save_value(&mut tx, &outer).unwrap();
        save_value(&mut tx, &shared).unwrap();
        tx.commit().unwrap();

        let mut tx = Transaction::new(&store);
        assert_eq!(value_refcount(&tx, &shared.hash()).unwrap(), Some(2));
        assert_eq!(value_refcount(&tx, &outer.hash()).unwrap(), Some(1));
        let loaded = get_value(&tx, &outer.hash(), &cache).unwrap().unwrap();
        assert_eq!(loaded, outer);
        assert!(cache.get(&outer.hash()).is_some());

        // freeing the outer tuple keeps the shared one alive
        assert_eq!(delete_value(&mut tx, &outer.hash(), &cache).unwrap(), 3);
        assert!(cache.get(&outer.hash()).is_none());
        assert_eq!(value_refcount(&tx, &shared.hash()).unwrap(), Some(1));
        assert!(get_value(&tx, &outer.hash(), &cache).unwrap().is_none());
        assert_eq!(delete_value(&mut tx, &shared.hash(), &cache).unwrap(), 3);
        tx.commit().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_cache_converges_to_one_instance() {
        let cache = ValueCache::new();
        let (_, outer) = sample();
        let (_, other) = sample();
        let a = cache.get_or_insert(outer);
        let b = cache.get_or_insert(other);
        match (a, b) {
            (Value::Tuple(a), Value::Tuple(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => unreachable!(),
        }
        assert_eq!(cache.len(), 1);
    }
}
