use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::common::U256;
use crate::machine::{Assertion, Machine};
use crate::store::Transaction;

use super::checkpoint::save_checkpoint_tx;
use super::inbox::read_entries;
use super::{ArbCore, CoreError, CoreState, MessagesStatus};

/// Outcome of one machine run recorded in a transaction.
pub(super) struct Executed {
    pub progressed: bool,
    /// Set if a checkpoint was written; to be passed to `Code::mark_saved` after commit.
    pub code_watermark: Option<u64>,
}

impl<M: Machine> ArbCore<M> {
    /// Record the output of a run that started at message `first_message_sequence_number`.
    pub fn save_assertion(
        &self, tx: &mut Transaction, first_message_sequence_number: &U256,
        assertion: &Assertion,
    ) -> Result<(), CoreError> {
        self.save_logs(tx, &assertion.logs)?;
        self.save_sends(tx, &assertion.sends)?;
        self.update_message_entry_processed_count(
            tx,
            &(*first_message_sequence_number +
                U256::from(assertion.inbox_messages_consumed)),
        );
        Ok(())
    }

    /// Run the live machine once over the unread messages and record the result in `tx`,
    /// checkpointing if the policy says so or `force_checkpoint` is set. `state` is advanced
    /// in place.
    pub(super) fn execute(
        &self, tx: &mut Transaction, state: &mut CoreState<M>,
        force_checkpoint: bool,
    ) -> Result<Executed, CoreError> {
        let inserted = self.message_entry_inserted_count(&*tx)?;
        let start = state.position.messages_read;
        let end = inserted
            .min(start.saturating_add(self.config.max_messages_per_run.into()))
            .max(start);
        let entries = read_entries(&*tx, &start, &end)?;
        let inbox: Vec<_> = entries.iter().map(|e| e.message()).collect();
        let assertion = match state.machine.as_mut() {
            Some(m) => m.run(self.config.max_gas_per_run.into(), &inbox),
            None => return Err(CoreError::NotInitialized),
        };
        let progressed = !assertion.is_empty();
        if progressed {
            let consumed = assertion.inbox_messages_consumed as usize;
            if consumed > entries.len() {
                return Err(CoreError::Corrupt(format!(
                    "machine consumed {} of {} messages",
                    consumed,
                    entries.len()
                )))
            }
            self.save_assertion(tx, &start, &assertion)?;
            let inbox_hash =
                consumed.checked_sub(1).map(|i| entries[i].inbox_hash);
            state.position.advance(&assertion, inbox_hash);
        }

        let mut code_watermark = None;
        if force_checkpoint || state.checkpoint_due(&self.config) {
            if let Some((cp, value)) = state.pending() {
                code_watermark = Some(self.code.save(tx));
                if save_checkpoint_tx(tx, &cp, &value)? {
                    debug!(
                        "checkpoint at {} messages, {} gas",
                        cp.messages_read, cp.total_gas
                    );
                }
                state.last_checkpoint = cp;
            }
        }
        Ok(Executed {
            progressed,
            code_watermark,
        })
    }

    /// One iteration of the execution thread: take care of a delivered inbox batch, or else
    /// run the machine once; then serve the logs cursor. Returns whether anything happened.
    pub fn run_once(&self) -> Result<bool, CoreError> {
        if self.abort.load(Ordering::Acquire) {
            return Ok(false)
        }
        let mut progressed = false;
        let mut state = self.state.lock();
        if state.machine.is_some() {
            if let Some(batch) = self.mailbox.take_ready() {
                let saved = state.clone();
                match self.add_messages(&mut state, batch, &self.cache) {
                    Ok(status) => {
                        debug!("inbox batch classified as {:?}", status);
                        self.mailbox.finish(status, None)
                    }
                    Err(e) => {
                        *state = saved;
                        error!("failed to add inbox batch: {}", e);
                        self.mailbox
                            .finish(MessagesStatus::Error, Some(e.to_string()))
                    }
                }
                progressed = true
            } else {
                let saved = state.clone();
                let mut tx = self.make_transaction();
                let result = self
                    .execute(&mut tx, &mut state, false)
                    .and_then(|executed| {
                        tx.commit()?;
                        Ok(executed)
                    });
                match result {
                    Ok(executed) => {
                        if let Some(watermark) = executed.code_watermark {
                            self.code.mark_saved(watermark)
                        }
                        progressed = executed.progressed
                    }
                    Err(e) => {
                        *state = saved;
                        return Err(e)
                    }
                }
            }
        } else if self.mailbox.take_ready().is_some() {
            self.mailbox.finish(
                MessagesStatus::Error,
                Some(CoreError::NotInitialized.to_string()),
            );
            progressed = true
        }
        drop(state);
        Ok(self.service_logs_cursor()? || progressed)
    }

    fn run_thread(&self) {
        info!("execution thread started");
        while !self.abort.load(Ordering::Acquire) {
            match self.run_once() {
                Ok(true) => continue,
                Ok(false) => self.mailbox.wait_for_work(self.config.idle_wait()),
                Err(e) => {
                    warn!("execution step failed, will retry: {}", e);
                    self.mailbox.wait_for_work(self.config.idle_wait())
                }
            }
        }
        info!("execution thread stopped");
    }

    /// Spawn the execution thread. Returns false if it is already running or could not be
    /// spawned.
    pub fn start_thread(self: &Arc<Self>) -> bool {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return false
        }
        self.abort.store(false, Ordering::Release);
        let core = self.clone();
        match std::thread::Builder::new()
            .name("arbcore".into())
            .spawn(move || core.run_thread())
        {
            Ok(handle) => {
                *thread = Some(handle);
                true
            }
            Err(e) => {
                error!("failed to spawn execution thread: {}", e);
                false
            }
        }
    }

    /// Stop the execution thread and wait for it to exit.
    pub fn abort_thread(&self) {
        self.abort.store(true, Ordering::Release);
        self.mailbox.notify();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("execution thread panicked")
            }
        }
    }
}
