//! Pull-based delivery of logs to a single consumer.
//!
//! The consumer requests up to N logs ([ArbCore::logs_cursor_request]); the execution thread
//! fills the request from the first unprocessed log as soon as there is at least one
//! ([ArbCore::handle_logs_cursor_requested]). The consumer reads them
//! ([ArbCore::logs_cursor_get_logs]) and confirms how many it processed
//! ([ArbCore::logs_cursor_confirmed_count]); the execution thread then durably moves the
//! processed count ([ArbCore::handle_logs_cursor_processed]) and the cursor is free again.
//!
//! A reorg that removes logs the consumer was given or had processed puts the cursor into the
//! error state: the consumer sees [LogsCursorRead::Rewind] and must clear it
//! ([ArbCore::logs_cursor_clear_error]) before requesting again.

use log::{debug, warn};

use crate::common::U256;
use crate::machine::Machine;
use crate::store::{StoreView, Transaction};
use crate::value::{Value, ValueCache};

use super::{ArbCore, CoreError};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataCursorStatus {
    Empty,
    Requested,
    Ready,
    Confirmed,
    Error,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LogsCursorRead {
    /// Nothing was delivered (yet).
    NotReady,
    Ready { first_index: U256, logs: Vec<Value> },
    /// A reorg removed logs that were delivered or processed; the consumer must go back to the
    /// processed count and clear the error.
    Rewind { message: String },
}

#[derive(Clone)]
pub(super) struct DataCursor {
    status: DataCursorStatus,
    number_requested: U256,
    first_index: U256,
    data: Vec<Value>,
    confirmed: U256,
    error: Option<String>,
}

impl DataCursor {
    pub(super) fn new() -> Self {
        Self {
            status: DataCursorStatus::Empty,
            number_requested: U256::zero(),
            first_index: U256::zero(),
            data: Vec::new(),
            confirmed: U256::zero(),
            error: None,
        }
    }

    fn rewind(&mut self, message: String) {
        warn!("logs cursor rewind: {}", message);
        self.data.clear();
        self.confirmed = U256::zero();
        self.error = Some(message);
        self.status = DataCursorStatus::Error;
    }
}

impl<M: Machine> ArbCore<M> {
    pub fn logs_cursor_status(&self) -> DataCursorStatus {
        self.logs_cursor.lock().status
    }

    /// Ask for up to `count` logs. Returns false unless the cursor is idle.
    pub fn logs_cursor_request(&self, count: &U256) -> bool {
        let mut cursor = self.logs_cursor.lock();
        if cursor.status != DataCursorStatus::Empty || count.is_zero() {
            return false
        }
        cursor.number_requested = *count;
        cursor.status = DataCursorStatus::Requested;
        true
    }

    pub fn logs_cursor_get_logs(&self) -> LogsCursorRead {
        let cursor = self.logs_cursor.lock();
        match cursor.status {
            DataCursorStatus::Ready => LogsCursorRead::Ready {
                first_index: cursor.first_index,
                logs: cursor.data.clone(),
            },
            DataCursorStatus::Error => LogsCursorRead::Rewind {
                message: cursor.error.clone().unwrap_or_default(),
            },
            _ => LogsCursorRead::NotReady,
        }
    }

    /// Confirm that the first `count` delivered logs were processed. Returns false if nothing is
    /// delivered or `count` exceeds what was delivered.
    pub fn logs_cursor_confirmed_count(&self, count: &U256) -> bool {
        let mut cursor = self.logs_cursor.lock();
        if cursor.status != DataCursorStatus::Ready ||
            *count > U256::from(cursor.data.len())
        {
            return false
        }
        cursor.confirmed = *count;
        cursor.data.clear();
        cursor.status = DataCursorStatus::Confirmed;
        true
    }

    /// Leave the error state; returns the error description, or `None` if there was no error.
    pub fn logs_cursor_clear_error(&self) -> Option<String> {
        let mut cursor = self.logs_cursor.lock();
        if cursor.status != DataCursorStatus::Error {
            return None
        }
        cursor.status = DataCursorStatus::Empty;
        Some(cursor.error.take().unwrap_or_default())
    }

    /// Fill a pending request. Returns true if logs were delivered.
    pub fn handle_logs_cursor_requested(
        &self, view: &dyn StoreView, cache: &ValueCache,
    ) -> Result<bool, CoreError> {
        let mut cursor = self.logs_cursor.lock();
        if cursor.status != DataCursorStatus::Requested {
            return Ok(false)
        }
        let processed = self.log_processed_count(view)?;
        let inserted = self.log_inserted_count(view)?;
        if inserted <= processed {
            return Ok(false)
        }
        let count = cursor.number_requested.min(inserted - processed);
        let logs = match self.get_logs_no_lock(view, &processed, &count, cache)? {
            Some(logs) => logs,
            None => return Ok(false),
        };
        debug!("logs cursor: delivering {} logs at {}", logs.len(), processed);
        cursor.first_index = processed;
        cursor.data = logs;
        cursor.status = DataCursorStatus::Ready;
        Ok(true)
    }

    /// Record confirmed logs as processed in `tx`. Returns true if there was a confirmation.
    pub fn handle_logs_cursor_processed(
        &self, tx: &mut Transaction,
    ) -> Result<bool, CoreError> {
        let mut cursor = self.logs_cursor.lock();
        if cursor.status != DataCursorStatus::Confirmed {
            return Ok(false)
        }
        let processed = self.log_processed_count(&*tx)?;
        if processed != cursor.first_index {
            let message = format!(
                "confirmed logs start at {} but {} are processed",
                cursor.first_index, processed
            );
            cursor.rewind(message);
            return Ok(true)
        }
        self.update_log_processed_count(tx, &(processed + cursor.confirmed));
        cursor.confirmed = U256::zero();
        cursor.status = DataCursorStatus::Empty;
        Ok(true)
    }

    /// The log table is being truncated to `log_count` logs in `tx`: move the processed count
    /// back if needed. Returns whether processed logs are lost. The in-memory cursor is left
    /// alone until `tx` commits, see [ArbCore::rewind_logs_cursor].
    pub fn handle_logs_cursor_reorg(
        &self, tx: &mut Transaction, log_count: &U256,
    ) -> Result<bool, CoreError> {
        let processed = self.log_processed_count(&*tx)?;
        if processed > *log_count {
            self.update_log_processed_count(tx, log_count);
            return Ok(true)
        }
        Ok(false)
    }

    /// Put the cursor into the error state if it handed out logs at or past `log_count`, or if
    /// `processed_lost`. Called once the truncation has committed.
    pub(super) fn rewind_logs_cursor(&self, log_count: &U256, processed_lost: bool) {
        let mut cursor = self.logs_cursor.lock();
        let delivered_end = match cursor.status {
            DataCursorStatus::Ready => {
                cursor.first_index + U256::from(cursor.data.len())
            }
            DataCursorStatus::Confirmed => cursor.first_index + cursor.confirmed,
            _ => U256::zero(),
        };
        if (processed_lost || delivered_end > *log_count) &&
            cursor.status != DataCursorStatus::Error
        {
            let message = format!(
                "reorg truncated logs to {} (delivered up to {})",
                log_count, delivered_end
            );
            cursor.rewind(message);
        }
    }

    /// Serve the logs cursor from the execution thread.
    pub(super) fn service_logs_cursor(&self) -> Result<bool, CoreError> {
        // a reorg must not truncate the logs between the read and the update
        let _guard = self.reorg_lock.lock();
        match self.logs_cursor_status() {
            DataCursorStatus::Requested => {
                let rtx = self.make_const_transaction();
                self.handle_logs_cursor_requested(&rtx, &self.cache)
            }
            DataCursorStatus::Confirmed => {
                let saved = self.logs_cursor.lock().clone();
                let mut tx = self.make_transaction();
                let handled = self.handle_logs_cursor_processed(&mut tx)?;
                if let Err(e) = tx.commit() {
                    *self.logs_cursor.lock() = saved;
                    return Err(e.into())
                }
                Ok(handled)
            }
            _ => Ok(false),
        }
    }
}
