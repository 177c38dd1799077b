//! The boundary between the persistence core and the virtual machine it drives.
//!
//! The core never interprets machine state. It only needs to clone a machine, hash it, persist
//! its state as a [Value] and rebuild a machine from that value, and run it against a slice of
//! inbox messages with a gas limit.

use crate::code::Code;
use crate::common::{u256_to_bytes, Bytes, Hash, U256};
use crate::value::Value;

/// A message of the inbox, as handed to the machine.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InboxMessage {
    pub sequence_number: U256,
    pub block_height: u64,
    pub data: Bytes,
}

impl InboxMessage {
    pub fn new(sequence_number: U256, block_height: u64, data: Bytes) -> Self {
        Self {
            sequence_number,
            block_height,
            data,
        }
    }

    /// The item this message contributes to the inbox accumulator.
    pub fn hash(&self) -> Hash {
        let mut buff = Vec::with_capacity(40 + self.data.len());
        buff.extend_from_slice(&u256_to_bytes(&self.sequence_number));
        buff.extend_from_slice(&self.block_height.to_be_bytes());
        buff.extend_from_slice(&self.data);
        Hash::hash(&buff)
    }

    /// Inbox accumulator after this message, given the accumulator before it.
    pub fn accumulate(&self, prev: &Hash) -> Hash {
        Hash::chain(prev, &self.hash())
    }
}

/// What a run of the machine produced.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Assertion {
    pub gas_used: U256,
    pub inbox_messages_consumed: u64,
    pub logs: Vec<Value>,
    pub sends: Vec<Bytes>,
}

impl Assertion {
    /// True if the run neither used gas nor consumed or produced anything.
    pub fn is_empty(&self) -> bool {
        self.gas_used.is_zero() &&
            self.inbox_messages_consumed == 0 &&
            self.logs.is_empty() &&
            self.sends.is_empty()
    }
}

/// The program a machine is created from.
#[derive(Clone, Debug)]
pub struct Executable {
    pub code: Bytes,
    pub static_val: Value,
}

pub trait Machine: Clone + Send + Sized + 'static {
    /// A fresh machine for `executable`; its code goes into the shared code table.
    fn new(executable: &Executable, code: &Code) -> Self;
    /// Rebuild a machine from a state produced by [Machine::state]. `None` if the value is not
    /// a machine state this implementation understands.
    fn from_state(state: &Value, code: &Code) -> Option<Self>;
    fn state(&self) -> Value;
    fn hash(&self) -> Hash {
        self.state().hash()
    }
    /// Execute until `max_gas` is used up or the machine blocks waiting for a message beyond
    /// `inbox`. Messages are consumed in order from the front of `inbox`.
    fn run(&mut self, max_gas: U256, inbox: &[InboxMessage]) -> Assertion;
}
