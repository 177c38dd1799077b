//! Single-slot handoff of inbox batches from a producer to the execution thread.
//!
//! ```notrust
//!   EMPTY --deliver--> READY --execution thread--> SUCCESS | NEED_OLDER | ERROR
//!     ^                                                       |
//!     '------------------- producer clears -------------------'
//! ```
//!
//! The status is an atomic so that the producer can poll it without taking the lock; the batch
//! and the error string are only touched under the lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use num_traits::FromPrimitive;
use parking_lot::{Condvar, Mutex};

use crate::common::{Bytes, Hash, U256};
use crate::machine::Machine;

use super::ArbCore;

#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessagesStatus {
    Empty = 0x0,
    Ready = 0x1,
    NeedOlder = 0x2,
    Success = 0x3,
    Error = 0x4,
}

/// A contiguous run of inbox messages as delivered by the producer.
#[derive(Clone, Debug)]
pub struct InboxBatch {
    pub first_sequence_number: U256,
    pub block_height: u64,
    pub messages: Vec<Bytes>,
    /// Inbox accumulator before the first message of the batch; zero if the batch starts at
    /// sequence number zero.
    pub previous_inbox_hash: Hash,
}

#[derive(Default)]
struct Slot {
    batch: Option<InboxBatch>,
    error: Option<String>,
}

pub(super) struct Mailbox {
    status: AtomicU8,
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl Mailbox {
    pub(super) fn new() -> Self {
        Self {
            status: AtomicU8::new(MessagesStatus::Empty as u8),
            slot: Mutex::new(Slot::default()),
            signal: Condvar::new(),
        }
    }

    pub(super) fn status(&self) -> MessagesStatus {
        FromPrimitive::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(MessagesStatus::Error)
    }

    fn set_status(&self, status: MessagesStatus) {
        self.status.store(status as u8, Ordering::Release)
    }

    fn deliver(&self, batch: InboxBatch) -> bool {
        let mut slot = self.slot.lock();
        if self.status() != MessagesStatus::Empty {
            return false
        }
        slot.batch = Some(batch);
        self.set_status(MessagesStatus::Ready);
        self.signal.notify_all();
        true
    }

    /// Take the batch of a READY mailbox. The status stays READY until [Mailbox::finish].
    pub(super) fn take_ready(&self) -> Option<InboxBatch> {
        if self.status() != MessagesStatus::Ready {
            return None
        }
        self.slot.lock().batch.take()
    }

    pub(super) fn finish(&self, status: MessagesStatus, error: Option<String>) {
        let mut slot = self.slot.lock();
        slot.batch = None;
        match status {
            MessagesStatus::Error => slot.error = error,
            MessagesStatus::Success => slot.error = None,
            _ => (),
        }
        self.set_status(status);
        self.signal.notify_all();
    }

    fn clear_status(&self) -> MessagesStatus {
        let _slot = self.slot.lock();
        let status = self.status();
        match status {
            MessagesStatus::Success | MessagesStatus::NeedOlder => {
                self.set_status(MessagesStatus::Empty)
            }
            _ => (),
        }
        status
    }

    fn clear_error(&self) -> Option<String> {
        let mut slot = self.slot.lock();
        if self.status() != MessagesStatus::Error {
            return None
        }
        self.set_status(MessagesStatus::Empty);
        Some(slot.error.take().unwrap_or_default())
    }

    /// Block until the mailbox is not READY, or `timeout` passed.
    fn wait_processed(&self, timeout: Duration) -> MessagesStatus {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while self.status() == MessagesStatus::Ready {
            if self.signal.wait_until(&mut slot, deadline).timed_out() {
                break
            }
        }
        self.status()
    }

    /// Park the idle execution thread until a batch arrives, [Mailbox::notify] is called, or
    /// `timeout` passed.
    pub(super) fn wait_for_work(&self, timeout: Duration) {
        let mut slot = self.slot.lock();
        if self.status() != MessagesStatus::Ready {
            self.signal.wait_for(&mut slot, timeout);
        }
    }

    pub(super) fn notify(&self) {
        let _slot = self.slot.lock();
        self.signal.notify_all();
    }
}

impl<M: Machine> ArbCore<M> {
    /// Hand a batch of inbox messages to the execution thread. Returns false, and leaves the
    /// mailbox untouched, unless it is EMPTY.
    pub fn deliver_messages(
        &self, first_sequence_number: U256, block_height: u64,
        messages: Vec<Bytes>, previous_inbox_hash: Hash,
    ) -> bool {
        self.mailbox.deliver(InboxBatch {
            first_sequence_number,
            block_height,
            messages,
            previous_inbox_hash,
        })
    }

    pub fn messages_status(&self) -> MessagesStatus {
        self.mailbox.status()
    }

    /// Acknowledge SUCCESS or NEED_OLDER, resetting the mailbox to EMPTY. Returns the status
    /// observed; other statuses are left as they are.
    pub fn messages_clear_status(&self) -> MessagesStatus {
        self.mailbox.clear_status()
    }

    /// Acknowledge ERROR, resetting the mailbox to EMPTY, and return the error description.
    pub fn messages_clear_error(&self) -> Option<String> {
        self.mailbox.clear_error()
    }

    /// Wait for the execution thread to classify the delivered batch.
    pub fn wait_messages_status(&self, timeout: Duration) -> MessagesStatus {
        self.mailbox.wait_processed(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> InboxBatch {
        InboxBatch {
            first_sequence_number: U256::zero(),
            block_height: 1,
            messages: vec![vec![1].into()],
            previous_inbox_hash: *Hash::zero(),
        }
    }

    #[test]
    fn test_single_slot() {
        let mb = Mailbox::new();
        assert!(mb.deliver(batch()));
        assert!(!mb.deliver(batch()));
        assert_eq!(mb.status(), MessagesStatus::Ready);
        // still READY, a producer cannot clear it
        assert_eq!(mb.clear_status(), MessagesStatus::Ready);
        assert!(mb.take_ready().is_some());
        assert!(mb.take_ready().is_none());
        mb.finish(MessagesStatus::NeedOlder, None);
        assert!(!mb.deliver(batch()));
        assert_eq!(mb.clear_status(), MessagesStatus::NeedOlder);
        assert_eq!(mb.status(), MessagesStatus::Empty);
        assert!(mb.deliver(batch()));
    }

    #[test]
    fn test_error_side_channel() {
        let mb = Mailbox::new();
        assert!(mb.deliver(batch()));
        mb.take_ready();
        mb.finish(MessagesStatus::Error, Some("disk full".into()));
        assert_eq!(mb.clear_status(), MessagesStatus::Error);
        assert_eq!(mb.clear_error(), Some("disk full".to_string()));
        assert_eq!(mb.status(), MessagesStatus::Empty);
        assert_eq!(mb.clear_error(), None);
    }

    #[test]
    fn test_wait_times_out_while_ready() {
        let mb = Mailbox::new();
        assert!(mb.deliver(batch()));
        let status = mb.wait_processed(Duration::from_millis(10));
        assert_eq!(status, MessagesStatus::Ready);
    }
}
