use std::path::Path;

use log::info;
use rocksdb::{Direction, IteratorMode, Options, Snapshot, WriteBatch, DB};

use avmcore::store::{KeyValue, Store, StoreError, StoreView};

fn io_error(e: rocksdb::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

/// A [Store] on top of a RocksDB database.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).map_err(io_error)?;
        info!("opened rocksdb store at {}", path.as_ref().display());
        Ok(Self { db })
    }

    pub fn destroy<P: AsRef<Path>>(path: P) -> Result<(), StoreError> {
        DB::destroy(&Options::default(), path).map_err(io_error)
    }

    pub fn db(&self) -> &DB {
        &self.db
    }
}

struct RocksView<'a> {
    snapshot: Snapshot<'a>,
}

impl<'a> StoreView for RocksView<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.snapshot.get(key).map_err(io_error)
    }

    fn first_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        Ok(self
            .snapshot
            .iterator(IteratorMode::From(from, Direction::Forward))
            .next()
            .filter(|(k, _)| &k[..] < to)
            .map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    fn last_in(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Option<KeyValue>, StoreError> {
        Ok(self
            .snapshot
            .iterator(IteratorMode::From(to, Direction::Reverse))
            .next()
            .filter(|(k, _)| &k[..] >= from)
            .map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    fn range(
        &self, from: &[u8], to: &[u8],
    ) -> Result<Vec<KeyValue>, StoreError> {
        Ok(self
            .snapshot
            .iterator(IteratorMode::From(from, Direction::Forward))
            .take_while(|(k, _)| &k[..] < to)
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect())
    }
}

impl Store for RocksStore {
    fn snapshot(&self) -> Box<dyn StoreView + '_> {
        Box::new(RocksView {
            snapshot: self.db.snapshot(),
        })
    }

    fn write(&self, batch: avmcore::store::WriteBatch) -> Result<(), StoreError> {
        let mut wb = WriteBatch::default();
        for (k, v) in batch {
            match v {
                Some(v) => wb.put(k, v),
                None => wb.delete(k),
            }
        }
        self.db.write(wb).map_err(io_error)
    }
}
