use crate::common::{Bytes, Hash, U256};
use crate::machine::Machine;
use crate::store::StoreView;
use crate::value::{Value, ValueCache};

use super::inbox::read_entries;
use super::{ArbCore, Checkpoint, CoreError};

/// A private replay of the machine, detached from the live one. It starts at a checkpoint and
/// is moved forward by re-running the stored inbox; the logs and sends it produced since the
/// checkpoint are kept along.
#[derive(Clone)]
pub struct ExecutionCursor<M> {
    machine: M,
    checkpoint: Checkpoint,
    position: Checkpoint,
    logs: Vec<Value>,
    sends: Vec<Bytes>,
}

impl<M: Machine> ExecutionCursor<M> {
    fn new(machine: M, checkpoint: Checkpoint) -> Self {
        Self {
            machine,
            position: checkpoint.clone(),
            checkpoint,
            logs: Vec::new(),
            sends: Vec::new(),
        }
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_hash(&self) -> Hash {
        self.machine.hash()
    }

    /// The checkpoint the replay started from.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn total_gas_used(&self) -> &U256 {
        &self.position.total_gas
    }

    pub fn messages_read(&self) -> &U256 {
        &self.position.messages_read
    }

    pub fn inbox_hash(&self) -> &Hash {
        &self.position.inbox_hash
    }

    pub fn log_count(&self) -> &U256 {
        &self.position.log_count
    }

    pub fn send_count(&self) -> &U256 {
        &self.position.send_count
    }

    pub fn logs(&self) -> &[Value] {
        &self.logs
    }

    pub fn sends(&self) -> &[Bytes] {
        &self.sends
    }

    pub fn into_machine(self) -> M {
        self.machine
    }
}

impl<M: Machine> ArbCore<M> {
    /// Replay the machine from the newest checkpoint at or below `total_gas_used` up to that
    /// much gas, stopping early if the machine blocks on the inbox. `None` if there is no such
    /// checkpoint.
    pub fn get_execution_cursor(
        &self, total_gas_used: &U256, cache: &ValueCache,
    ) -> Result<Option<ExecutionCursor<M>>, CoreError> {
        let rtx = self.make_const_transaction();
        let cp = match self.get_checkpoint_using_gas(&rtx, total_gas_used, false)? {
            Some(cp) => cp,
            None => return Ok(None),
        };
        let machine = self.load_machine(&rtx, &cp.machine_hash, cache)?;
        let mut cursor = ExecutionCursor::new(machine, cp);
        let remaining = *total_gas_used - cursor.position.total_gas;
        self.replay(&rtx, &mut cursor, &remaining)?;
        Ok(Some(cursor))
    }

    /// Move `cursor` forward by up to `max_gas`.
    pub fn advance_execution_cursor(
        &self, cursor: &mut ExecutionCursor<M>, max_gas: &U256,
    ) -> Result<(), CoreError> {
        let rtx = self.make_const_transaction();
        self.replay(&rtx, cursor, max_gas)
    }

    fn replay(
        &self, view: &dyn StoreView, cursor: &mut ExecutionCursor<M>,
        max_gas: &U256,
    ) -> Result<(), CoreError> {
        let target = cursor.position.total_gas.saturating_add(*max_gas);
        let inserted = self.message_entry_inserted_count(view)?;
        while cursor.position.total_gas < target {
            let start = cursor.position.messages_read;
            let end = inserted
                .min(start.saturating_add(self.config.max_messages_per_run.into()))
                .max(start);
            let entries = read_entries(view, &start, &end)?;
            let inbox: Vec<_> = entries.iter().map(|e| e.message()).collect();
            let assertion = cursor
                .machine
                .run(target - cursor.position.total_gas, &inbox);
            if assertion.is_empty() {
                break
            }
            let consumed = assertion.inbox_messages_consumed as usize;
            if consumed > entries.len() {
                return Err(CoreError::Corrupt(format!(
                    "machine consumed {} of {} messages",
                    consumed,
                    entries.len()
                )))
            }
            let inbox_hash = consumed.checked_sub(1).map(|i| entries[i].inbox_hash);
            cursor.position.advance(&assertion, inbox_hash);
            cursor.logs.extend(assertion.logs);
            cursor.sends.extend(assertion.sends);
        }
        Ok(())
    }
}
