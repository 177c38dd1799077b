//! The code table: append-only segments of executable code, shared by every machine.
//!
//! Segments get consecutive ids. New segments live in memory until they are written out with
//! [Code::save] and the enclosing transaction commits, after which [Code::mark_saved] moves the
//! persisted watermark. Rewriting an already persisted segment is harmless, segments never
//! change once added.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::common::{Bytes, Hash};
use crate::core::{keys, CoreError};
use crate::store::{StoreView, Transaction};

#[derive(Debug)]
pub struct CodeSegment {
    id: u64,
    code: Bytes,
    hash: Hash,
}

impl CodeSegment {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn code(&self) -> &Bytes {
        &self.code
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }
}

struct CodeInner {
    segments: BTreeMap<u64, Arc<CodeSegment>>,
    next_segment_id: u64,
    saved_up_to: u64,
}

pub struct Code {
    inner: RwLock<CodeInner>,
}

impl Code {
    pub fn new(next_segment_id: u64) -> Self {
        Self {
            inner: RwLock::new(CodeInner {
                segments: BTreeMap::new(),
                next_segment_id,
                saved_up_to: next_segment_id,
            }),
        }
    }

    /// Restore the table from the store.
    pub fn load(view: &dyn StoreView) -> Result<Self, CoreError> {
        let next_segment_id = match view.get(&keys::NEXT_SEGMENT_ID)? {
            Some(raw) => keys::decode_u64(&raw)?,
            None => 0,
        };
        let mut segments = BTreeMap::new();
        for (k, v) in
            view.range(&[keys::CODE], &[keys::CODE + 1])?.into_iter()
        {
            let id = keys::decode_u64(&k[1..])?;
            let code: Bytes = v.into();
            segments.insert(
                id,
                Arc::new(CodeSegment {
                    id,
                    hash: Hash::hash(&code),
                    code,
                }),
            );
        }
        debug!("loaded {} code segments", segments.len());
        Ok(Self {
            inner: RwLock::new(CodeInner {
                segments,
                next_segment_id,
                saved_up_to: next_segment_id,
            }),
        })
    }

    pub fn add_segment(&self, code: Bytes) -> Arc<CodeSegment> {
        let mut inner = self.inner.write();
        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        let seg = Arc::new(CodeSegment {
            id,
            hash: Hash::hash(&code),
            code,
        });
        inner.segments.insert(id, seg.clone());
        seg
    }

    pub fn get_segment(&self, id: u64) -> Option<Arc<CodeSegment>> {
        self.inner.read().segments.get(&id).cloned()
    }

    pub fn next_segment_id(&self) -> u64 {
        self.inner.read().next_segment_id
    }

    /// Write all segments added since the last [Code::mark_saved]. Returns the watermark to pass
    /// to [Code::mark_saved] after `tx` commits.
    pub fn save(&self, tx: &mut Transaction) -> u64 {
        let inner = self.inner.read();
        for (id, seg) in inner.segments.range(inner.saved_up_to..) {
            tx.put(keys::code_segment(*id), seg.code.to_vec());
        }
        tx.put(
            keys::NEXT_SEGMENT_ID.to_vec(),
            inner.next_segment_id.to_be_bytes().to_vec(),
        );
        inner.next_segment_id
    }

    pub fn mark_saved(&self, watermark: u64) {
        let mut inner = self.inner.write();
        if watermark > inner.saved_up_to {
            inner.saved_up_to = watermark
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, Store};

    #[test]
    fn test_segments_survive_reload() {
        let store = MemStore::new();
        let code = Code::new(0);
        let a = code.add_segment(vec![1, 2, 3].into());
        let b = code.add_segment(vec![4].into());
        assert_eq!((a.id(), b.id()), (0, 1));

        let mut tx = Transaction::new(&store);
        let watermark = code.save(&mut tx);
        tx.commit().unwrap();
        code.mark_saved(watermark);
        // unsaved segments are not visible after a reload
        code.add_segment(vec![5].into());

        let reloaded = Code::load(&*store.snapshot()).unwrap();
        assert_eq!(reloaded.next_segment_id(), 2);
        assert_eq!(reloaded.get_segment(0).unwrap().code(), a.code());
        assert_eq!(reloaded.get_segment(1).unwrap().hash(), b.hash());
        assert!(reloaded.get_segment(2).is_none());
        assert_eq!(reloaded.add_segment(vec![6].into()).id(), 2);
    }
}
