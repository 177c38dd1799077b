use log::{debug, info};
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{Hash, U256RLP, U256};
use crate::machine::{Assertion, Machine};
use crate::store::{StoreView, Transaction};
use crate::value::{delete_value, save_value, Value, ValueCache};

use super::{keys, output, ArbCore, CoreError};

/// A durable snapshot of the machine together with the counters it was taken at.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Checkpoint {
    /// Hash of the machine state; the state itself lives in the value table.
    pub machine_hash: Hash,
    /// Number of inbox messages the machine had consumed.
    pub messages_read: U256,
    /// Inbox accumulator after the last consumed message.
    pub inbox_hash: Hash,
    pub total_gas: U256,
    pub log_count: U256,
    pub send_count: U256,
}

#[derive(RlpDecodable, RlpEncodable)]
struct CheckpointRecord {
    machine_hash: Hash,
    messages_read: U256RLP,
    inbox_hash: Hash,
    total_gas: U256RLP,
    log_count: U256RLP,
    send_count: U256RLP,
}

impl Checkpoint {
    fn key(&self) -> Vec<u8> {
        keys::checkpoint(&self.messages_read, &self.total_gas)
    }

    fn encode(&self) -> Vec<u8> {
        rlp::encode(&CheckpointRecord {
            machine_hash: self.machine_hash,
            messages_read: self.messages_read.into(),
            inbox_hash: self.inbox_hash,
            total_gas: self.total_gas.into(),
            log_count: self.log_count.into(),
            send_count: self.send_count.into(),
        })
        .to_vec()
    }

    fn decode(raw: &[u8]) -> Result<Self, CoreError> {
        let r: CheckpointRecord = rlp::decode(raw).map_err(|e| {
            CoreError::Corrupt(format!("checkpoint: {:?}", e))
        })?;
        Ok(Self {
            machine_hash: r.machine_hash,
            messages_read: r.messages_read.0,
            inbox_hash: r.inbox_hash,
            total_gas: r.total_gas.0,
            log_count: r.log_count.0,
            send_count: r.send_count.0,
        })
    }

    /// Move the counters past the output of a run. `inbox_hash` is the accumulator after the
    /// last message the run consumed, if it consumed any.
    pub(super) fn advance(
        &mut self, assertion: &Assertion, inbox_hash: Option<Hash>,
    ) {
        self.total_gas += assertion.gas_used;
        self.messages_read += U256::from(assertion.inbox_messages_consumed);
        self.log_count += U256::from(assertion.logs.len());
        self.send_count += U256::from(assertion.sends.len());
        if let Some(h) = inbox_hash {
            self.inbox_hash = h
        }
    }
}

/// The newest checkpoint that had consumed at most `messages_read` messages.
fn floor(
    view: &dyn StoreView, messages_read: &U256,
) -> Result<Option<Checkpoint>, CoreError> {
    match view.last_in(
        &[keys::CHECKPOINT],
        &keys::pair_upper(keys::CHECKPOINT, messages_read),
    )? {
        Some((_, raw)) => Checkpoint::decode(&raw).map(Some),
        None => Ok(None),
    }
}

/// Resolve an entry of the gas index to its checkpoint.
fn from_gas_index(
    view: &dyn StoreView, key: &[u8],
) -> Result<Checkpoint, CoreError> {
    let (total_gas, messages_read) = keys::decode_pair(key)?;
    match view.get(&keys::checkpoint(&messages_read, &total_gas))? {
        Some(raw) => Checkpoint::decode(&raw),
        None => Err(CoreError::Corrupt(format!(
            "gas index refers to missing checkpoint at {} gas",
            total_gas
        ))),
    }
}

/// Persist `cp` and take a reference to its machine state. Returns false (and does nothing) if
/// the checkpoint already exists.
pub(super) fn save_checkpoint_tx(
    tx: &mut Transaction, cp: &Checkpoint, state: &Value,
) -> Result<bool, CoreError> {
    let key = cp.key();
    if tx.get(&key)?.is_some() {
        return Ok(false)
    }
    save_value(tx, state)?;
    tx.put(key, cp.encode());
    tx.put(
        keys::checkpoint_gas(&cp.total_gas, &cp.messages_read),
        Vec::new(),
    );
    Ok(true)
}

fn delete_checkpoint_tx(
    tx: &mut Transaction, cp: &Checkpoint, cache: &ValueCache,
) -> Result<(), CoreError> {
    tx.delete(cp.key());
    tx.delete(keys::checkpoint_gas(&cp.total_gas, &cp.messages_read));
    delete_value(tx, &cp.machine_hash, cache)?;
    Ok(())
}

impl<M: Machine> ArbCore<M> {
    /// Persist the checkpoint of the live machine.
    pub fn save_checkpoint(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        let (cp, value) = state.pending().ok_or(CoreError::NotInitialized)?;
        let mut tx = self.make_transaction();
        let watermark = self.code.save(&mut tx);
        let saved = save_checkpoint_tx(&mut tx, &cp, &value)?;
        tx.commit()?;
        self.code.mark_saved(watermark);
        if saved {
            debug!(
                "checkpoint at {} messages, {} gas",
                cp.messages_read, cp.total_gas
            );
        }
        state.last_checkpoint = cp;
        Ok(())
    }

    /// The newest checkpoint whose consumed messages all have sequence numbers up to
    /// `sequence_number`.
    pub fn get_checkpoint(
        &self, sequence_number: &U256,
    ) -> Result<Option<Checkpoint>, CoreError> {
        let rtx = self.make_const_transaction();
        floor(&rtx, &sequence_number.saturating_add(U256::one()))
    }

    pub fn is_checkpoints_empty(&self) -> Result<bool, CoreError> {
        let rtx = self.make_const_transaction();
        Ok(rtx
            .first_in(&[keys::CHECKPOINT], &keys::end(keys::CHECKPOINT))?
            .is_none())
    }

    /// Total gas of the newest checkpoint, zero if there is none.
    pub fn max_checkpoint_gas(&self) -> Result<U256, CoreError> {
        let rtx = self.make_const_transaction();
        match rtx.last_in(
            &[keys::CHECKPOINT_GAS],
            &keys::pair_upper(keys::CHECKPOINT_GAS, &U256::max_value()),
        )? {
            Some((k, _)) => Ok(keys::decode_pair(&k)?.0),
            None => Ok(U256::zero()),
        }
    }

    /// With `after_gas`, the oldest checkpoint that used at least `total_gas`; otherwise the
    /// newest one that used at most `total_gas`.
    pub fn get_checkpoint_using_gas(
        &self, view: &dyn StoreView, total_gas: &U256, after_gas: bool,
    ) -> Result<Option<Checkpoint>, CoreError> {
        let entry = if after_gas {
            view.first_in(
                &keys::checkpoint_gas(total_gas, &U256::zero()),
                &keys::end(keys::CHECKPOINT_GAS),
            )?
        } else {
            view.last_in(
                &[keys::CHECKPOINT_GAS],
                &keys::pair_upper(keys::CHECKPOINT_GAS, total_gas),
            )?
        };
        match entry {
            Some((k, _)) => from_gas_index(view, &k).map(Some),
            None => Ok(None),
        }
    }

    /// Roll the core back to the newest checkpoint at or before `sequence_number`. Message
    /// entries after `sequence_number`, and all checkpoints, logs and sends produced after the
    /// retained checkpoint are deleted in one transaction. The live machine and the logs cursor
    /// are only reset once that transaction has committed; on error nothing changes.
    pub fn reorg_to_message_or_before(
        &self, sequence_number: &U256, cache: &ValueCache,
    ) -> Result<Checkpoint, CoreError> {
        self.reorg_keeping(sequence_number.saturating_add(U256::one()), cache)
    }

    /// Reorg keeping the first `keep_messages` message entries, as its own transaction.
    pub(super) fn reorg_keeping(
        &self, keep_messages: U256, cache: &ValueCache,
    ) -> Result<Checkpoint, CoreError> {
        let mut state = self.state.lock();
        let _guard = self.reorg_lock.lock();
        let mut tx = self.make_transaction();
        let reorg = self.reorg_locked(&mut tx, keep_messages, cache)?;
        tx.commit()?;
        let cp = reorg.checkpoint.clone();
        self.rewind_logs_cursor(&cp.log_count, reorg.logs_lost);
        state.reset(reorg.machine, cp.clone());
        Ok(cp)
    }

    /// Record in `tx` a reorg keeping the first `keep_messages` message entries. The caller holds
    /// the reorg lock until `tx` commits, then applies the returned [Reorg].
    pub(super) fn reorg_locked(
        &self, tx: &mut Transaction, keep_messages: U256, cache: &ValueCache,
    ) -> Result<Reorg<M>, CoreError> {
        let cp = floor(&*tx, &keep_messages)?.ok_or(CoreError::NotInitialized)?;

        let mut later = cp.key();
        later.push(0);
        let mut dropped = 0;
        for (_, raw) in tx.range(&later, &keys::end(keys::CHECKPOINT))? {
            delete_checkpoint_tx(tx, &Checkpoint::decode(&raw)?, cache)?;
            dropped += 1;
        }

        output::delete_logs_starting_at(tx, &cp.log_count, cache)?;
        output::delete_sends_starting_at(tx, &cp.send_count)?;
        self.update_log_inserted_count(tx, &cp.log_count);
        self.update_send_inserted_count(tx, &cp.send_count);
        if self.send_processed_count(&*tx)? > cp.send_count {
            self.update_send_processed_count(tx, &cp.send_count)
        }

        let inserted = self.message_entry_inserted_count(&*tx)?;
        if inserted > keep_messages {
            for (k, _) in tx.range(
                &keys::message(&keep_messages),
                &keys::end(keys::MESSAGE),
            )? {
                tx.delete(k)
            }
            self.update_message_entry_inserted_count(tx, &keep_messages);
        }
        self.update_message_entry_processed_count(tx, &cp.messages_read);

        let logs_lost = self.handle_logs_cursor_reorg(tx, &cp.log_count)?;

        let machine = self.load_machine(&*tx, &cp.machine_hash, cache)?;
        info!(
            "reorg keeping {} messages: back to checkpoint at {} messages, \
             {} gas ({} later checkpoints dropped)",
            keep_messages.min(inserted),
            cp.messages_read,
            cp.total_gas,
            dropped
        );
        Ok(Reorg {
            checkpoint: cp,
            machine,
            logs_lost,
        })
    }
}

/// A reorg recorded in a transaction but not yet applied to the in-memory state.
pub(super) struct Reorg<M> {
    pub checkpoint: Checkpoint,
    /// The machine at `checkpoint`.
    pub machine: M,
    /// Whether logs the consumer had processed were removed.
    pub logs_lost: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_record() {
        let cp = Checkpoint {
            machine_hash: Hash::hash(b"machine"),
            messages_read: 7u64.into(),
            inbox_hash: Hash::hash(b"inbox"),
            total_gas: U256::max_value(),
            log_count: 3u64.into(),
            send_count: U256::zero(),
        };
        assert_eq!(Checkpoint::decode(&cp.encode()).unwrap(), cp);
        assert!(Checkpoint::decode(b"garbage").is_err());
    }
}
