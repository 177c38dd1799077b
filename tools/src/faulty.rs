use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::warn;

use avmcore::store::{Store, StoreError, StoreView, WriteBatch};

/// Wraps a [Store] and, while [FaultyStore::fail_writes] is on, rejects every write with an I/O
/// error without applying it. Reads always go through.
pub struct FaultyStore<S> {
    inner: S,
    fail: AtomicBool,
    rejected: AtomicUsize,
}

impl<S: Store> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release)
    }

    /// Number of writes rejected so far.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Acquire)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Store> Store for FaultyStore<S> {
    fn snapshot(&self) -> Box<dyn StoreView + '_> {
        self.inner.snapshot()
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.fail.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::AcqRel);
            warn!("rejecting a write of {} operations", batch.len());
            return Err(StoreError::Io("injected write failure".into()))
        }
        self.inner.write(batch)
    }
}
