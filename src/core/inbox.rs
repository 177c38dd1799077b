use log::{debug, info, warn};
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{Bytes, Hash, U256RLP, U256};
use crate::machine::{InboxMessage, Machine};
use crate::store::StoreView;
use crate::value::ValueCache;

use super::output::{range_end, read_end};
use super::{keys, ArbCore, CoreError, CoreState, InboxBatch, MessagesStatus};

/// A stored inbox message together with the inbox accumulator after it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MessageEntry {
    pub sequence_number: U256,
    pub block_height: u64,
    pub inbox_hash: Hash,
    pub data: Bytes,
}

#[derive(RlpDecodable, RlpEncodable)]
struct MessageRecord {
    sequence_number: U256RLP,
    block_height: u64,
    inbox_hash: Hash,
    data: Bytes,
}

impl MessageEntry {
    pub fn message(&self) -> InboxMessage {
        InboxMessage::new(
            self.sequence_number,
            self.block_height,
            self.data.clone(),
        )
    }

    fn encode(&self) -> Vec<u8> {
        rlp::encode(&MessageRecord {
            sequence_number: self.sequence_number.into(),
            block_height: self.block_height,
            inbox_hash: self.inbox_hash,
            data: self.data.clone(),
        })
        .to_vec()
    }

    fn decode(raw: &[u8]) -> Result<Self, CoreError> {
        let r: MessageRecord = rlp::decode(raw).map_err(|e| {
            CoreError::Corrupt(format!("message entry: {:?}", e))
        })?;
        Ok(Self {
            sequence_number: r.sequence_number.0,
            block_height: r.block_height,
            inbox_hash: r.inbox_hash,
            data: r.data,
        })
    }
}

fn read_entry(
    view: &dyn StoreView, index: &U256,
) -> Result<Option<MessageEntry>, CoreError> {
    match view.get(&keys::message(index))? {
        Some(raw) => MessageEntry::decode(&raw).map(Some),
        None => Ok(None),
    }
}

/// Entries `index..end`, all of which must exist.
pub(super) fn read_entries(
    view: &dyn StoreView, index: &U256, end: &U256,
) -> Result<Vec<MessageEntry>, CoreError> {
    if index >= end {
        return Ok(Vec::new())
    }
    let entries = view
        .range(&keys::message(index), &keys::message(end))?
        .into_iter()
        .map(|(_, v)| MessageEntry::decode(&v))
        .collect::<Result<Vec<_>, _>>()?;
    if U256::from(entries.len()) != end - index {
        return Err(CoreError::Corrupt(format!(
            "missing message entries in {}..{}",
            index, end
        )))
    }
    Ok(entries)
}

impl<M: Machine> ArbCore<M> {
    /// Validate `batch` against the stored inbox and append it, rolling back first if it
    /// disagrees with stored messages, then run the machine over the new messages and take a
    /// checkpoint. Everything happens in one transaction; on error the caller restores `state`,
    /// and the logs cursor is untouched.
    pub(super) fn add_messages(
        &self, state: &mut CoreState<M>, batch: InboxBatch, cache: &ValueCache,
    ) -> Result<MessagesStatus, CoreError> {
        let mut tx = self.make_transaction();
        let inserted = self.message_entry_inserted_count(&tx)?;
        let first = batch.first_sequence_number;
        if first > inserted {
            warn!(
                "inbox batch starts at {} but only {} messages are known",
                first, inserted
            );
            return Ok(MessagesStatus::NeedOlder)
        }
        let prev = if first.is_zero() {
            *Hash::zero()
        } else {
            match read_entry(&tx, &(first - U256::one()))? {
                Some(e) => e.inbox_hash,
                None => {
                    return Err(CoreError::Corrupt(format!(
                        "missing message entry {}",
                        first - U256::one()
                    )))
                }
            }
        };
        if prev != batch.previous_inbox_hash {
            warn!(
                "inbox batch at {} does not extend the stored inbox",
                first
            );
            return Ok(MessagesStatus::NeedOlder)
        }

        let mut acc = prev;
        let mut entries = Vec::with_capacity(batch.messages.len());
        for (i, data) in batch.messages.into_iter().enumerate() {
            let msg = InboxMessage::new(
                first + U256::from(i),
                batch.block_height,
                data,
            );
            acc = msg.accumulate(&acc);
            entries.push(MessageEntry {
                sequence_number: msg.sequence_number,
                block_height: msg.block_height,
                inbox_hash: acc,
                data: msg.data,
            });
        }

        // skip the prefix we already have
        let mut known = 0;
        for e in entries.iter() {
            if e.sequence_number >= inserted {
                break
            }
            match read_entry(&tx, &e.sequence_number)? {
                Some(stored) if stored.inbox_hash == e.inbox_hash => known += 1,
                _ => break,
            }
        }
        // held until commit when the batch reorgs
        let mut reorg_guard = None;
        let mut rewind = None;
        if let Some(e) = entries.get(known) {
            if e.sequence_number < inserted {
                info!("inbox diverges at message {}", e.sequence_number);
                let guard = self.reorg_lock.lock();
                let reorg = self.reorg_locked(&mut tx, e.sequence_number, cache)?;
                rewind = Some((reorg.checkpoint.log_count, reorg.logs_lost));
                state.reset(reorg.machine, reorg.checkpoint);
                reorg_guard = Some(guard);
            }
        }

        let new = &entries[known..];
        for e in new.iter() {
            tx.put(keys::message(&e.sequence_number), e.encode());
        }
        if let Some(last) = new.last() {
            self.update_message_entry_inserted_count(
                &mut tx,
                &(last.sequence_number + U256::one()),
            );
        }

        let executed = self.execute(&mut tx, state, true)?;
        tx.commit()?;
        if let Some((log_count, logs_lost)) = rewind {
            self.rewind_logs_cursor(&log_count, logs_lost)
        }
        drop(reorg_guard);
        if let Some(watermark) = executed.code_watermark {
            self.code.mark_saved(watermark)
        }
        debug!(
            "added {} messages at {} ({} already known)",
            new.len(),
            first,
            known
        );
        Ok(MessagesStatus::Success)
    }

    pub fn get_messages(
        &self, index: &U256, count: &U256,
    ) -> Result<Option<Vec<Bytes>>, CoreError> {
        Ok(self
            .get_message_entries(index, count)?
            .map(|entries| entries.into_iter().map(|e| e.data).collect()))
    }

    pub fn get_inbox_hashes(
        &self, index: &U256, count: &U256,
    ) -> Result<Option<Vec<Hash>>, CoreError> {
        Ok(self
            .get_message_entries(index, count)?
            .map(|entries| entries.into_iter().map(|e| e.inbox_hash).collect()))
    }

    /// Entries `index..index + count`, fewer at the end of the inbox, or `None` if `index` is
    /// past it.
    pub fn get_message_entries(
        &self, index: &U256, count: &U256,
    ) -> Result<Option<Vec<MessageEntry>>, CoreError> {
        let rtx = self.make_const_transaction();
        let inserted = self.message_entry_inserted_count(&rtx)?;
        match read_end(index, count, &inserted) {
            Some(end) => read_entries(&rtx, index, &end).map(Some),
            None => Ok(None),
        }
    }

    /// Inbox accumulator after message `index`.
    pub fn get_inbox_acc(&self, index: &U256) -> Result<Option<Hash>, CoreError> {
        let rtx = self.make_const_transaction();
        if *index >= self.message_entry_inserted_count(&rtx)? {
            return Ok(None)
        }
        Ok(read_entry(&rtx, index)?.map(|e| e.inbox_hash))
    }

    /// Accumulator of messages `start_index..start_index + count` alone, starting from the zero
    /// hash. `None` unless all of them are inserted.
    pub fn get_inbox_delta(
        &self, start_index: &U256, count: &U256,
    ) -> Result<Option<Hash>, CoreError> {
        let rtx = self.make_const_transaction();
        let inserted = self.message_entry_inserted_count(&rtx)?;
        let end = match range_end(start_index, count, &inserted) {
            Some(end) => end,
            None => return Ok(None),
        };
        Ok(Some(read_entries(&rtx, start_index, &end)?.iter().fold(
            *Hash::zero(),
            |acc, e| e.message().accumulate(&acc),
        )))
    }

    /// True if the live machine has consumed every inserted message.
    pub fn messages_empty(&self) -> Result<bool, CoreError> {
        let rtx = self.make_const_transaction();
        Ok(self.message_entry_processed_count(&rtx)? >=
            self.message_entry_inserted_count(&rtx)?)
    }
}
