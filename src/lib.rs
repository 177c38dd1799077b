//! # avmcore: persistence and execution core of an AVM node
//!
//! - In short, avmcore keeps a deterministic virtual machine running over an ordered inbox of
//!   messages, and remembers enough about it to answer questions about the past and to rewind
//!   when the inbox turns out to be different from what we thought.
//!
//! # Overview
//! The crate consists of a few modules that can also be used on their own:
//!
//! - [store]: the storage contract (snapshots, atomic write batches) and the transactions built
//!   on top of it, plus an in-memory implementation. A RocksDB-backed store lives in the
//!   `avmcore-tools` crate.
//! - [value]: content-addressed machine values, the shared value cache and the reference-counted
//!   value table.
//! - [code]: the append-only table of code segments shared by machines.
//! - [machine]: the contract the core expects from the VM ([machine::Machine]).
//! - [core]: [ArbCore](core/struct.ArbCore.html) itself.
//! - [config], [common]: tunables and basic types.
//!
//! # On the Data Flow
//!
//! ```notrust
//!     producer                         consumers
//!        |                             |        ^
//!   deliver_messages()          queries, cursors |
//!        v                             v        |
//!   [  mailbox  ] ---> [ execution thread ] ---> [ store ]
//!                        |    ^      |            ^   |
//!                        v    |      '-- logs, sends, checkpoints
//!                      [ live machine ]                |
//!                                                 reorg (truncate)
//! ```
//!
//! The execution thread is the only writer of machine output. It validates a delivered batch
//! against the stored inbox accumulator; a batch that does not extend the known inbox is
//! answered with `NeedOlder`, a batch that disagrees with stored messages first rolls the core
//! back to the newest checkpoint before the disagreement. Every step (new messages, machine
//! output, counters, checkpoint) is recorded in one transaction, so readers always see a
//! consistent prefix of history and a crash loses at most the step in flight.
//!
//! Checkpoints are taken periodically (see [config::CoreConfig]) and are what execution
//! cursors replay from: to look at the machine after some amount of gas, the core loads the
//! newest checkpoint at or below it and re-runs the stored inbox from there.

#[macro_use] extern crate num_derive;

pub mod code;
pub mod common;
pub mod config;
pub mod core;
pub mod machine;
pub mod store;
pub mod value;

pub use crate::core::{ArbCore, Checkpoint, CoreError};
