//! Persisted counters. A counter that was never written reads as zero.

use crate::common::{u256_to_bytes, U256};
use crate::machine::Machine;
use crate::store::{StoreView, Transaction};

use super::{keys, ArbCore, CoreError};

fn read_count(view: &dyn StoreView, key: &[u8]) -> Result<U256, CoreError> {
    match view.get(key)? {
        Some(raw) => keys::decode_u256(&raw),
        None => Ok(U256::zero()),
    }
}

fn write_count(tx: &mut Transaction, key: &[u8], count: &U256) {
    tx.put(key.to_vec(), u256_to_bytes(count).to_vec())
}

impl<M: Machine> ArbCore<M> {
    pub fn log_inserted_count(
        &self, view: &dyn StoreView,
    ) -> Result<U256, CoreError> {
        read_count(view, &keys::LOG_INSERTED)
    }

    pub fn update_log_inserted_count(&self, tx: &mut Transaction, count: &U256) {
        write_count(tx, &keys::LOG_INSERTED, count)
    }

    /// Number of logs the logs-cursor consumer has confirmed.
    pub fn log_processed_count(
        &self, view: &dyn StoreView,
    ) -> Result<U256, CoreError> {
        read_count(view, &keys::LOG_PROCESSED)
    }

    pub fn update_log_processed_count(
        &self, tx: &mut Transaction, count: &U256,
    ) {
        write_count(tx, &keys::LOG_PROCESSED, count)
    }

    pub fn send_inserted_count(
        &self, view: &dyn StoreView,
    ) -> Result<U256, CoreError> {
        read_count(view, &keys::SEND_INSERTED)
    }

    pub fn update_send_inserted_count(
        &self, tx: &mut Transaction, count: &U256,
    ) {
        write_count(tx, &keys::SEND_INSERTED, count)
    }

    pub fn send_processed_count(
        &self, view: &dyn StoreView,
    ) -> Result<U256, CoreError> {
        read_count(view, &keys::SEND_PROCESSED)
    }

    pub fn update_send_processed_count(
        &self, tx: &mut Transaction, count: &U256,
    ) {
        write_count(tx, &keys::SEND_PROCESSED, count)
    }

    pub fn message_entry_inserted_count(
        &self, view: &dyn StoreView,
    ) -> Result<U256, CoreError> {
        read_count(view, &keys::MESSAGE_INSERTED)
    }

    pub fn update_message_entry_inserted_count(
        &self, tx: &mut Transaction, count: &U256,
    ) {
        write_count(tx, &keys::MESSAGE_INSERTED, count)
    }

    /// Number of inbox messages the live machine has consumed.
    pub fn message_entry_processed_count(
        &self, view: &dyn StoreView,
    ) -> Result<U256, CoreError> {
        read_count(view, &keys::MESSAGE_PROCESSED)
    }

    pub fn update_message_entry_processed_count(
        &self, tx: &mut Transaction, count: &U256,
    ) {
        write_count(tx, &keys::MESSAGE_PROCESSED, count)
    }
}
