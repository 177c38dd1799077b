use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::info;
use parking_lot::Mutex;

mod checkpoint;
mod counters;
mod execution_cursor;
mod inbox;
pub mod keys;
mod logs_cursor;
mod mailbox;
mod output;
mod thread;

use crate::code::Code;
use crate::common::{Hash, U256};
use crate::config::CoreConfig;
use crate::machine::{Executable, Machine};
use crate::store::{ReadTransaction, Store, StoreError, StoreView, Transaction};
use crate::value::{get_value, Value, ValueCache};

pub use checkpoint::Checkpoint;
pub use execution_cursor::ExecutionCursor;
pub use inbox::MessageEntry;
pub use logs_cursor::{DataCursorStatus, LogsCursorRead};
pub use mailbox::{InboxBatch, MessagesStatus};

#[derive(Debug)]
pub enum CoreError {
    Store(StoreError),
    Corrupt(String),
    NotInitialized,
    AlreadyInitialized,
    InvalidMachineState(Hash),
    UnknownCodeSegment(u64),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Store(e) => write!(f, "store error: {}", e),
            CoreError::Corrupt(s) => write!(f, "corrupted storage: {}", s),
            CoreError::NotInitialized => write!(f, "core is not initialized"),
            CoreError::AlreadyInitialized => {
                write!(f, "core is already initialized")
            }
            CoreError::InvalidMachineState(h) => {
                write!(f, "invalid machine state {}", h)
            }
            CoreError::UnknownCodeSegment(id) => {
                write!(f, "unknown code segment {}", id)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Store(e)
    }
}

/// The live machine and where it stands. Only advanced after the transaction recording the
/// advance has committed; callers keep a clone to roll back to otherwise.
#[derive(Clone)]
struct CoreState<M> {
    machine: Option<M>,
    position: Checkpoint,
    last_checkpoint: Checkpoint,
}

impl<M: Machine> CoreState<M> {
    fn new() -> Self {
        Self {
            machine: None,
            position: Checkpoint::default(),
            last_checkpoint: Checkpoint::default(),
        }
    }

    fn reset(&mut self, machine: M, checkpoint: Checkpoint) {
        self.machine = Some(machine);
        self.position = checkpoint.clone();
        self.last_checkpoint = checkpoint;
    }

    fn checkpoint_due(&self, config: &CoreConfig) -> bool {
        let gas = self
            .position
            .total_gas
            .saturating_sub(self.last_checkpoint.total_gas);
        let messages = self
            .position
            .messages_read
            .saturating_sub(self.last_checkpoint.messages_read);
        gas >= U256::from(config.checkpoint_gas_interval) ||
            messages >= U256::from(config.checkpoint_message_interval)
    }

    /// The checkpoint that would be taken now, with the machine state it refers to.
    fn pending(&self) -> Option<(Checkpoint, Value)> {
        self.machine.as_ref().map(|m| {
            let state = m.state();
            let mut cp = self.position.clone();
            cp.machine_hash = state.hash();
            (cp, state)
        })
    }
}

/// The persistence and execution core of a VM node.
///
/// `ArbCore` owns the live machine and drives it over the inbox on a dedicated execution thread
/// ([ArbCore::start_thread]). Inbox batches come in through a single-slot mailbox
/// ([ArbCore::deliver_messages]); the execution thread validates them, handles reorgs, runs the
/// machine and records its output (logs and sends) and periodic checkpoints in the store, one
/// atomic transaction per step. All read queries go against store snapshots and may be issued
/// from any thread.
pub struct ArbCore<M: Machine> {
    store: Arc<dyn Store>,
    config: CoreConfig,
    code: Arc<Code>,
    /// Value cache of the execution thread.
    cache: ValueCache,
    reorg_lock: Mutex<()>,
    state: Mutex<CoreState<M>>,
    mailbox: mailbox::Mailbox,
    logs_cursor: Mutex<logs_cursor::DataCursor>,
    abort: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Machine> ArbCore<M> {
    /// Open the core on top of `store`. If the store holds an initialized core, the live machine
    /// is restored from the latest checkpoint and any output recorded after it is discarded; the
    /// execution thread recomputes it.
    pub fn open(
        store: Arc<dyn Store>, config: CoreConfig,
    ) -> Result<Arc<Self>, CoreError> {
        let code = Arc::new(Code::load(&*store.snapshot())?);
        let core = Self {
            store,
            config,
            code,
            cache: ValueCache::new(),
            reorg_lock: Mutex::new(()),
            state: Mutex::new(CoreState::new()),
            mailbox: mailbox::Mailbox::new(),
            logs_cursor: Mutex::new(logs_cursor::DataCursor::new()),
            abort: AtomicBool::new(false),
            thread: Mutex::new(None),
        };
        if core.initialized()? {
            core.restore()?
        }
        Ok(Arc::new(core))
    }

    fn restore(&self) -> Result<(), CoreError> {
        let inserted =
            self.message_entry_inserted_count(&self.make_const_transaction())?;
        let cp = self.reorg_keeping(inserted, &self.cache)?;
        info!(
            "restored machine at {} messages, {} gas",
            cp.messages_read, cp.total_gas
        );
        Ok(())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    pub fn make_transaction(&self) -> Transaction<'_> {
        Transaction::new(&*self.store)
    }

    pub fn make_const_transaction(&self) -> ReadTransaction<'_> {
        ReadTransaction::new(&*self.store)
    }

    pub fn initialized(&self) -> Result<bool, CoreError> {
        Ok(self.make_const_transaction().get(&keys::INITIAL_MACHINE)?.is_some())
    }

    /// Create the initial machine from `executable` and persist it together with its code and
    /// the initial checkpoint.
    pub fn initialize(&self, executable: &Executable) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if self.initialized()? {
            return Err(CoreError::AlreadyInitialized)
        }
        let machine = M::new(executable, &self.code);
        let value = machine.state();
        let cp = Checkpoint {
            machine_hash: value.hash(),
            ..Default::default()
        };
        let mut tx = self.make_transaction();
        let watermark = self.code.save(&mut tx);
        checkpoint::save_checkpoint_tx(&mut tx, &cp, &value)?;
        tx.put(
            keys::INITIAL_MACHINE.to_vec(),
            cp.machine_hash.as_bytes().to_vec(),
        );
        tx.commit()?;
        self.code.mark_saved(watermark);
        info!("initialized machine {}", cp.machine_hash);
        state.reset(machine, cp);
        Ok(())
    }

    pub fn get_initial_machine(
        &self, cache: &ValueCache,
    ) -> Result<Option<M>, CoreError> {
        let rtx = self.make_const_transaction();
        match rtx.get(&keys::INITIAL_MACHINE)? {
            Some(raw) => {
                let hash = keys::decode_hash(&raw)?;
                self.get_machine_using_state_keys(&rtx, &hash, cache)
            }
            None => Ok(None),
        }
    }

    pub fn get_machine(
        &self, machine_hash: &Hash, cache: &ValueCache,
    ) -> Result<Option<M>, CoreError> {
        let rtx = self.make_const_transaction();
        self.get_machine_using_state_keys(&rtx, machine_hash, cache)
    }

    /// Materialize the machine whose persisted state is `machine_hash`. `None` if no such state
    /// is stored.
    pub fn get_machine_using_state_keys(
        &self, view: &dyn StoreView, machine_hash: &Hash, cache: &ValueCache,
    ) -> Result<Option<M>, CoreError> {
        let value = match get_value(view, machine_hash, cache)? {
            Some(v) => v,
            None => return Ok(None),
        };
        self.check_code_points(&value)?;
        match M::from_state(&value, &self.code) {
            Some(m) => Ok(Some(m)),
            None => Err(CoreError::InvalidMachineState(*machine_hash)),
        }
    }

    /// Like [ArbCore::get_machine_using_state_keys], but a missing state is corruption.
    fn load_machine(
        &self, view: &dyn StoreView, machine_hash: &Hash, cache: &ValueCache,
    ) -> Result<M, CoreError> {
        self.get_machine_using_state_keys(view, machine_hash, cache)?
            .ok_or_else(|| {
                CoreError::Corrupt(format!(
                    "missing machine state {}",
                    machine_hash
                ))
            })
    }

    fn check_code_points(&self, value: &Value) -> Result<(), CoreError> {
        let mut todo = vec![value];
        while let Some(v) = todo.pop() {
            match v {
                Value::CodePoint(cp) => {
                    if self.code.get_segment(cp.segment).is_none() {
                        return Err(CoreError::UnknownCodeSegment(cp.segment))
                    }
                }
                Value::Tuple(t) => todo.extend(t.items().iter()),
                _ => (),
            }
        }
        Ok(())
    }

    /// The checkpoint of the live machine as it stands now (not necessarily persisted).
    pub fn pending_checkpoint(&self) -> Option<Checkpoint> {
        self.state.lock().pending().map(|(cp, _)| cp)
    }
}
