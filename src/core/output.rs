//! Machine output: the log table (hashes into the value table) and the send table (raw bytes).

use crate::common::{Bytes, Hash, U256};
use crate::machine::Machine;
use crate::store::{StoreView, Transaction};
use crate::value::{delete_value, get_value, save_value, Value, ValueCache};

use super::{keys, ArbCore, CoreError};

/// End of what can be read of `index..index + count`: cut off at `inserted`, or `None` if
/// `index` is past it.
pub(super) fn read_end(
    index: &U256, count: &U256, inserted: &U256,
) -> Option<U256> {
    if index > inserted {
        return None
    }
    Some(index.saturating_add(*count).min(*inserted))
}

/// `Some(index + count)` if the whole range fits below `inserted`. Accumulators use this, a
/// fold over fewer items than asked for would be a different accumulator.
pub(super) fn range_end(
    index: &U256, count: &U256, inserted: &U256,
) -> Option<U256> {
    match index.checked_add(*count) {
        Some(end) if end <= *inserted => Some(end),
        _ => None,
    }
}

pub(super) fn delete_logs_starting_at(
    tx: &mut Transaction, index: &U256, cache: &ValueCache,
) -> Result<usize, CoreError> {
    let rows = tx.range(&keys::log(index), &keys::end(keys::LOG))?;
    let deleted = rows.len();
    for (k, v) in rows {
        tx.delete(k);
        delete_value(tx, &keys::decode_hash(&v)?, cache)?;
    }
    Ok(deleted)
}

pub(super) fn delete_sends_starting_at(
    tx: &mut Transaction, index: &U256,
) -> Result<usize, CoreError> {
    let rows = tx.range(&keys::send(index), &keys::end(keys::SEND))?;
    let deleted = rows.len();
    for (k, _) in rows {
        tx.delete(k);
    }
    Ok(deleted)
}

fn sends_in(
    view: &dyn StoreView, index: &U256, end: &U256,
) -> Result<Vec<Bytes>, CoreError> {
    Ok(view
        .range(&keys::send(index), &keys::send(end))?
        .into_iter()
        .map(|(_, v)| v.into())
        .collect())
}

fn log_hashes(
    view: &dyn StoreView, index: &U256, end: &U256,
) -> Result<Vec<Hash>, CoreError> {
    view.range(&keys::log(index), &keys::log(end))?
        .into_iter()
        .map(|(_, v)| keys::decode_hash(&v))
        .collect()
}

impl<M: Machine> ArbCore<M> {
    /// Append `logs` to the log table, taking a reference to each value.
    pub fn save_logs(
        &self, tx: &mut Transaction, logs: &[Value],
    ) -> Result<(), CoreError> {
        let mut count = self.log_inserted_count(&*tx)?;
        for log in logs.iter() {
            save_value(tx, log)?;
            tx.put(keys::log(&count), log.hash().as_bytes().to_vec());
            count += U256::one();
        }
        self.update_log_inserted_count(tx, &count);
        Ok(())
    }

    pub fn save_sends(
        &self, tx: &mut Transaction, sends: &[Bytes],
    ) -> Result<(), CoreError> {
        let mut count = self.send_inserted_count(&*tx)?;
        for send in sends.iter() {
            tx.put(keys::send(&count), send.to_vec());
            count += U256::one();
        }
        self.update_send_inserted_count(tx, &count);
        Ok(())
    }

    /// Logs `index..index + count`, fewer if the range goes past the inserted logs, or `None` if
    /// `index` does.
    pub fn get_logs(
        &self, index: &U256, count: &U256, cache: &ValueCache,
    ) -> Result<Option<Vec<Value>>, CoreError> {
        let _guard = self.reorg_lock.lock();
        let rtx = self.make_const_transaction();
        self.get_logs_no_lock(&rtx, index, count, cache)
    }

    pub(super) fn get_logs_no_lock(
        &self, view: &dyn StoreView, index: &U256, count: &U256,
        cache: &ValueCache,
    ) -> Result<Option<Vec<Value>>, CoreError> {
        let inserted = self.log_inserted_count(view)?;
        let end = match read_end(index, count, &inserted) {
            Some(end) => end,
            None => return Ok(None),
        };
        let mut logs = Vec::new();
        for hash in log_hashes(view, index, &end)? {
            match get_value(view, &hash, cache)? {
                Some(v) => logs.push(v),
                None => {
                    return Err(CoreError::Corrupt(format!(
                        "log refers to missing value {}",
                        hash
                    )))
                }
            }
        }
        Ok(Some(logs))
    }

    pub fn get_sends(
        &self, index: &U256, count: &U256,
    ) -> Result<Option<Vec<Bytes>>, CoreError> {
        let rtx = self.make_const_transaction();
        let inserted = self.send_inserted_count(&rtx)?;
        match read_end(index, count, &inserted) {
            Some(end) => sends_in(&rtx, index, &end).map(Some),
            None => Ok(None),
        }
    }

    /// Fold sends `start_index..start_index + count` into `start_acc`.
    pub fn get_send_acc(
        &self, start_acc: &Hash, start_index: &U256, count: &U256,
    ) -> Result<Option<Hash>, CoreError> {
        let rtx = self.make_const_transaction();
        let inserted = self.send_inserted_count(&rtx)?;
        let end = match range_end(start_index, count, &inserted) {
            Some(end) => end,
            None => return Ok(None),
        };
        let sends = sends_in(&rtx, start_index, &end)?;
        Ok(Some(sends.iter().fold(*start_acc, |acc, send| {
            Hash::chain(&acc, &Hash::hash(send))
        })))
    }

    /// Fold the hashes of logs `start_index..start_index + count` into `start_acc`.
    pub fn get_log_acc(
        &self, start_acc: &Hash, start_index: &U256, count: &U256,
    ) -> Result<Option<Hash>, CoreError> {
        let _guard = self.reorg_lock.lock();
        let rtx = self.make_const_transaction();
        let inserted = self.log_inserted_count(&rtx)?;
        let end = match range_end(start_index, count, &inserted) {
            Some(end) => end,
            None => return Ok(None),
        };
        Ok(Some(
            log_hashes(&rtx, start_index, &end)?
                .iter()
                .fold(*start_acc, |acc, h| Hash::chain(&acc, h)),
        ))
    }
}

#[test]
fn test_range_end() {
    let ten = U256::from(10u64);
    assert_eq!(range_end(&U256::zero(), &ten, &ten), Some(ten));
    assert_eq!(range_end(&ten, &U256::zero(), &ten), Some(ten));
    assert_eq!(range_end(&ten, &U256::one(), &ten), None);
    assert_eq!(range_end(&U256::max_value(), &ten, &ten), None);
    assert_eq!(range_end(&U256::one(), &ten, &ten), None);
}

#[test]
fn test_read_end() {
    let ten = U256::from(10u64);
    assert_eq!(read_end(&U256::one(), &ten, &ten), Some(ten));
    assert_eq!(read_end(&U256::one(), &U256::one(), &ten), Some(2u64.into()));
    assert_eq!(read_end(&ten, &ten, &ten), Some(ten));
    assert_eq!(read_end(&U256::max_value(), &ten, &ten), None);
    assert_eq!(read_end(&U256::zero(), &U256::max_value(), &ten), Some(ten));
}
