use std::sync::Arc;

use avmcore::common::{Bytes, Hash, U256};
use avmcore::config::CoreConfig;
use avmcore::core::MessagesStatus;
use avmcore::machine::InboxMessage;
use avmcore::store::MemStore;
use avmcore::value::{value_refcount, ValueCache};
use avmcore::{ArbCore, CoreError};
use avmcore_tools::dummy::{executable, CounterMachine, MESSAGE_GAS};

type Core = Arc<ArbCore<CounterMachine>>;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open(config: CoreConfig) -> (Arc<MemStore>, Core) {
    init();
    let store = Arc::new(MemStore::new());
    let core: Core = ArbCore::open(store.clone(), config).unwrap();
    core.initialize(&executable()).unwrap();
    (store, core)
}

fn every(messages: u64) -> CoreConfig {
    CoreConfig {
        checkpoint_message_interval: messages,
        ..Default::default()
    }
}

fn payload(i: u64) -> Bytes {
    vec![(i % 256) as u8, (i / 256) as u8].into()
}

fn prev_hash(core: &Core, first: u64) -> Hash {
    if first == 0 {
        *Hash::zero()
    } else {
        core.get_inbox_acc(&(first - 1).into()).unwrap().unwrap()
    }
}

fn deliver_with(
    core: &Core, first: u64, msgs: Vec<Bytes>, prev: Hash,
) -> MessagesStatus {
    assert!(core.deliver_messages(first.into(), 1, msgs, prev));
    assert!(core.run_once().unwrap());
    core.messages_clear_status()
}

fn deliver(core: &Core, first: u64, count: u64) -> MessagesStatus {
    let prev = prev_hash(core, first);
    let msgs = (first..first + count).map(payload).collect();
    deliver_with(core, first, msgs, prev)
}

/// Deliver `0..total` in batches of `batch`.
fn fill(core: &Core, total: u64, batch: u64) {
    for first in (0..total).step_by(batch as usize) {
        assert_eq!(deliver(core, first, batch), MessagesStatus::Success);
    }
}

fn u(x: u64) -> U256 {
    x.into()
}

#[test]
fn test_initialize() {
    let (store, core) = open(CoreConfig::default());
    assert!(core.initialized().unwrap());
    assert!(matches!(
        core.initialize(&executable()),
        Err(CoreError::AlreadyInitialized)
    ));
    assert!(!core.is_checkpoints_empty().unwrap());
    assert_eq!(core.max_checkpoint_gas().unwrap(), U256::zero());
    let cache = ValueCache::new();
    let m = core.get_initial_machine(&cache).unwrap().unwrap();
    assert_eq!(m.steps(), 0);
    let cp = core.get_checkpoint(&u(0)).unwrap().unwrap();
    assert_eq!(cp.machine_hash, avmcore::machine::Machine::hash(&m));
    assert!(core.messages_empty().unwrap());

    let fresh: Core =
        ArbCore::open(Arc::new(MemStore::new()), CoreConfig::default())
            .unwrap();
    assert!(!fresh.initialized().unwrap());
    assert!(fresh.get_initial_machine(&cache).unwrap().is_none());
    assert!(fresh.is_checkpoints_empty().unwrap());
    assert!(!store.is_empty());
}

#[test]
fn test_deliver_stale_and_reorg() {
    let (_store, core) = open(every(10));
    fill(&core, 100, 10);
    let rtx = core.make_const_transaction();
    assert_eq!(core.message_entry_inserted_count(&rtx).unwrap(), u(100));
    assert_eq!(core.message_entry_processed_count(&rtx).unwrap(), u(100));
    assert_eq!(core.log_inserted_count(&rtx).unwrap(), u(100));
    assert_eq!(core.send_inserted_count(&rtx).unwrap(), u(50));
    let hashes = core.get_inbox_hashes(&u(0), &u(100)).unwrap().unwrap();

    // a batch that does not extend the stored inbox
    let msgs = (50..150).map(payload).collect();
    let stale = Hash::hash(b"stale");
    assert_eq!(deliver_with(&core, 50, msgs, stale), MessagesStatus::NeedOlder);
    // a gap
    let msgs = (101..106).map(payload).collect();
    assert_eq!(
        deliver_with(&core, 101, msgs, *Hash::zero()),
        MessagesStatus::NeedOlder
    );
    let rtx = core.make_const_transaction();
    assert_eq!(core.message_entry_inserted_count(&rtx).unwrap(), u(100));

    let cache = ValueCache::new();
    let cp = core.reorg_to_message_or_before(&u(40), &cache).unwrap();
    assert_eq!(cp.messages_read, u(40));
    assert_eq!(cp.total_gas, u(40 * MESSAGE_GAS));

    let check = |core: &Core| {
        let rtx = core.make_const_transaction();
        assert_eq!(core.message_entry_inserted_count(&rtx).unwrap(), u(41));
        assert_eq!(core.message_entry_processed_count(&rtx).unwrap(), u(40));
        assert_eq!(core.log_inserted_count(&rtx).unwrap(), u(40));
        assert_eq!(core.send_inserted_count(&rtx).unwrap(), u(20));
        let latest = core.get_checkpoint(&U256::max_value()).unwrap().unwrap();
        assert_eq!(latest.messages_read, u(40));
        assert_eq!(core.max_checkpoint_gas().unwrap(), u(40 * MESSAGE_GAS));
        // reads stop at the end of the inbox
        let tail = core.get_messages(&u(40), &u(2)).unwrap().unwrap();
        assert_eq!(tail, vec![payload(40)]);
        assert!(core.get_messages(&u(42), &u(1)).unwrap().is_none());
        assert_eq!(core.pending_checkpoint().unwrap(), latest);
    };
    check(&core);

    // reorging again changes nothing
    let again = core.reorg_to_message_or_before(&u(40), &cache).unwrap();
    assert_eq!(again, cp);
    check(&core);

    // the retained message is replayed, then the inbox is extended again
    assert!(core.run_once().unwrap());
    assert!(core.messages_empty().unwrap());
    assert_eq!(deliver(&core, 41, 59), MessagesStatus::Success);
    assert_eq!(core.get_inbox_hashes(&u(0), &u(100)).unwrap().unwrap(), hashes);
    let rtx = core.make_const_transaction();
    assert_eq!(core.log_inserted_count(&rtx).unwrap(), u(100));
}

#[test]
fn test_divergent_batch_reorgs() {
    let (_store, core) = open(every(10));
    fill(&core, 30, 10);
    let old = core.get_inbox_hashes(&u(0), &u(30)).unwrap().unwrap();

    // an identical resend is accepted and changes nothing
    assert_eq!(deliver(&core, 10, 10), MessagesStatus::Success);
    assert_eq!(core.get_inbox_hashes(&u(0), &u(30)).unwrap().unwrap(), old);

    let other: Vec<Bytes> =
        (15..25).map(|i| vec![0xaa, i as u8].into()).collect();
    let prev = prev_hash(&core, 15);
    assert_eq!(
        deliver_with(&core, 15, other.clone(), prev),
        MessagesStatus::Success
    );
    let rtx = core.make_const_transaction();
    assert_eq!(core.message_entry_inserted_count(&rtx).unwrap(), u(25));
    assert_eq!(core.log_inserted_count(&rtx).unwrap(), u(25));
    assert_eq!(core.get_messages(&u(15), &u(10)).unwrap().unwrap(), other);
    let hashes = core.get_inbox_hashes(&u(0), &u(25)).unwrap().unwrap();
    assert_eq!(hashes[..15], old[..15]);
    assert_ne!(hashes[15], old[15]);

    // checkpoints past the divergence are gone
    let cp = core.get_checkpoint(&u(20)).unwrap().unwrap();
    assert_eq!(cp.messages_read, u(10));
    let latest = core.get_checkpoint(&U256::max_value()).unwrap().unwrap();
    assert_eq!(latest.messages_read, u(25));
    assert_eq!(latest.inbox_hash, hashes[24]);

    let cache = ValueCache::new();
    let logs = core.get_logs(&u(15), &u(1), &cache).unwrap().unwrap();
    let item = logs[0].as_tuple().unwrap();
    assert_eq!(item.get(1).unwrap().as_buffer().unwrap(), &other[0]);
}

#[test]
fn test_checkpoint_lookup_by_gas() {
    let (_store, core) = open(every(10));
    fill(&core, 50, 10);
    let rtx = core.make_const_transaction();
    let at = |gas: u64, after: bool| {
        core.get_checkpoint_using_gas(&rtx, &u(gas), after)
            .unwrap()
            .map(|cp| cp.total_gas.as_u64())
    };
    assert_eq!(at(450, false), Some(300));
    assert_eq!(at(450, true), Some(600));
    assert_eq!(at(600, false), Some(600));
    assert_eq!(at(600, true), Some(600));
    assert_eq!(at(0, false), Some(0));
    assert_eq!(at(1, true), Some(300));
    assert_eq!(at(10_000, false), Some(1500));
    assert_eq!(at(1501, true), None);
    assert_eq!(core.max_checkpoint_gas().unwrap(), u(1500));

    let cp = core.get_checkpoint(&u(25)).unwrap().unwrap();
    assert_eq!(cp.messages_read, u(20));
    assert_eq!(cp.log_count, u(20));
    assert_eq!(cp.send_count, u(10));
    assert_eq!(cp.inbox_hash, core.get_inbox_acc(&u(19)).unwrap().unwrap());
}

#[test]
fn test_execution_cursor() {
    let (_store, core) = open(every(10));
    fill(&core, 50, 10);
    let cache = ValueCache::new();

    let cursor = core.get_execution_cursor(&u(450), &cache).unwrap().unwrap();
    assert_eq!(cursor.checkpoint().total_gas, u(300));
    assert_eq!(cursor.total_gas_used(), &u(450));
    assert_eq!(cursor.messages_read(), &u(15));
    assert_eq!(cursor.log_count(), &u(15));
    assert_eq!(cursor.logs().len(), 5);
    assert_eq!(cursor.sends().len(), 2);
    let stored = core.get_logs(&u(10), &u(5), &cache).unwrap().unwrap();
    assert_eq!(cursor.logs(), &stored[..]);

    // replays are deterministic
    let again = core.get_execution_cursor(&u(450), &cache).unwrap().unwrap();
    assert_eq!(again.machine_hash(), cursor.machine_hash());
    assert_eq!(again.logs(), cursor.logs());
    assert_eq!(again.sends(), cursor.sends());

    let mut advanced = cursor.clone();
    core.advance_execution_cursor(&mut advanced, &u(95)).unwrap();
    assert_eq!(advanced.total_gas_used(), &u(540));
    assert_eq!(advanced.log_count(), &u(18));
    let direct = core.get_execution_cursor(&u(540), &cache).unwrap().unwrap();
    assert_eq!(direct.machine_hash(), advanced.machine_hash());
    assert_eq!(direct.inbox_hash(), advanced.inbox_hash());

    // a cursor at a checkpoint is the checkpointed machine
    let exact = core.get_execution_cursor(&u(600), &cache).unwrap().unwrap();
    let cp = core.get_checkpoint(&u(19)).unwrap().unwrap();
    assert_eq!(exact.machine_hash(), cp.machine_hash);
    assert!(exact.logs().is_empty());

    // past the end of the inbox the replay blocks
    let end = core.get_execution_cursor(&u(100_000), &cache).unwrap().unwrap();
    assert_eq!(end.total_gas_used(), &u(50 * MESSAGE_GAS));
    assert_eq!(end.messages_read(), &u(50));
    assert_eq!(end.machine_hash(), core.pending_checkpoint().unwrap().machine_hash);
}

#[test]
fn test_accumulators() {
    let (_store, core) = open(every(10));
    fill(&core, 40, 20);
    let msgs = core.get_messages(&u(0), &u(40)).unwrap().unwrap();
    let mut acc = *Hash::zero();
    for (i, data) in msgs.into_iter().enumerate() {
        acc = InboxMessage::new(u(i as u64), 1, data).accumulate(&acc);
    }
    assert_eq!(core.get_inbox_acc(&u(39)).unwrap(), Some(acc));
    assert_eq!(core.get_inbox_delta(&u(0), &u(40)).unwrap(), Some(acc));
    assert!(core.get_inbox_acc(&u(40)).unwrap().is_none());
    assert!(core.get_inbox_delta(&u(30), &u(11)).unwrap().is_none());

    let sends = core.get_sends(&u(0), &u(20)).unwrap().unwrap();
    assert_eq!(sends[0], payload(1));
    let send_acc = sends
        .iter()
        .fold(*Hash::zero(), |acc, s| Hash::chain(&acc, &Hash::hash(s)));
    assert_eq!(
        core.get_send_acc(Hash::zero(), &u(0), &u(20)).unwrap(),
        Some(send_acc)
    );
    let half = core.get_send_acc(Hash::zero(), &u(0), &u(7)).unwrap().unwrap();
    assert_eq!(
        core.get_send_acc(&half, &u(7), &u(13)).unwrap(),
        Some(send_acc)
    );
    assert!(core.get_send_acc(Hash::zero(), &u(0), &u(21)).unwrap().is_none());

    let cache = ValueCache::new();
    let logs = core.get_logs(&u(0), &u(40), &cache).unwrap().unwrap();
    let log_acc = logs
        .iter()
        .fold(*Hash::zero(), |acc, l| Hash::chain(&acc, &l.hash()));
    assert_eq!(
        core.get_log_acc(Hash::zero(), &u(0), &u(40)).unwrap(),
        Some(log_acc)
    );
    assert!(core.get_logs(&u(41), &u(0), &cache).unwrap().is_none());
    assert_eq!(core.get_logs(&u(40), &u(0), &cache).unwrap(), Some(vec![]));
    assert!(core.get_log_acc(Hash::zero(), &u(30), &u(11)).unwrap().is_none());
}

#[test]
fn test_range_reads_stop_at_end() {
    let (_store, core) = open(every(10));
    fill(&core, 3, 3);
    let cache = ValueCache::new();
    let all = core.get_logs(&u(0), &u(3), &cache).unwrap().unwrap();
    assert_eq!(core.get_logs(&u(1), &u(5), &cache).unwrap().unwrap(), all[1..]);
    assert_eq!(
        core.get_messages(&u(1), &u(5)).unwrap().unwrap(),
        vec![payload(1), payload(2)]
    );
    let hashes = core.get_inbox_hashes(&u(0), &u(3)).unwrap().unwrap();
    assert_eq!(
        core.get_inbox_hashes(&u(2), &u(10)).unwrap().unwrap(),
        hashes[2..]
    );
    // one send, for message 1
    assert_eq!(
        core.get_sends(&u(0), &u(4)).unwrap().unwrap(),
        vec![payload(1)]
    );

    // at the end: empty, past the end: not found
    assert_eq!(core.get_messages(&u(3), &u(1)).unwrap(), Some(vec![]));
    assert!(core.get_messages(&u(4), &u(1)).unwrap().is_none());
    assert!(core.get_logs(&u(4), &u(1), &cache).unwrap().is_none());
    assert!(core.get_sends(&u(2), &u(1)).unwrap().is_none());
    assert!(core.get_inbox_delta(&u(1), &u(5)).unwrap().is_none());
}

#[test]
fn test_reorg_frees_values() {
    let (_store, core) = open(every(10));
    fill(&core, 50, 10);
    let cache = ValueCache::new();
    let dropped = core.get_checkpoint(&u(49)).unwrap().unwrap();
    let kept = core.get_checkpoint(&u(19)).unwrap().unwrap();
    let log = core.get_logs(&u(30), &u(1), &cache).unwrap().unwrap().remove(0);
    let rtx = core.make_const_transaction();
    assert_eq!(value_refcount(&rtx, &log.hash()).unwrap(), Some(1));
    assert!(value_refcount(&rtx, &dropped.machine_hash).unwrap().is_some());

    core.reorg_to_message_or_before(&u(20), &cache).unwrap();

    let rtx = core.make_const_transaction();
    assert!(value_refcount(&rtx, &log.hash()).unwrap().is_none());
    assert!(value_refcount(&rtx, &dropped.machine_hash).unwrap().is_none());
    assert!(core.get_machine(&dropped.machine_hash, &cache).unwrap().is_none());
    let m = core.get_machine(&kept.machine_hash, &cache).unwrap().unwrap();
    assert_eq!(m.steps(), 20 * 3);
}

#[test]
fn test_restart_discards_unchecked_output() {
    init();
    let store = Arc::new(MemStore::new());
    let config = CoreConfig {
        checkpoint_message_interval: 100,
        max_messages_per_run: 5,
        ..Default::default()
    };
    let logs_before;
    {
        let core: Core = ArbCore::open(store.clone(), config.clone()).unwrap();
        core.initialize(&executable()).unwrap();
        // the batch run stops after five messages and checkpoints there
        assert_eq!(deliver(&core, 0, 10), MessagesStatus::Success);
        assert_eq!(core.max_checkpoint_gas().unwrap(), u(5 * MESSAGE_GAS));
        assert!(core.run_once().unwrap());
        assert!(!core.run_once().unwrap());
        let rtx = core.make_const_transaction();
        assert_eq!(core.log_inserted_count(&rtx).unwrap(), u(10));
        let cache = ValueCache::new();
        logs_before = core.get_logs(&u(0), &u(10), &cache).unwrap().unwrap();
    }

    let core: Core = ArbCore::open(store, config).unwrap();
    assert!(core.initialized().unwrap());
    assert_eq!(core.code().next_segment_id(), 1);
    let rtx = core.make_const_transaction();
    assert_eq!(core.log_inserted_count(&rtx).unwrap(), u(5));
    assert_eq!(core.message_entry_processed_count(&rtx).unwrap(), u(5));
    assert_eq!(core.message_entry_inserted_count(&rtx).unwrap(), u(10));
    assert_eq!(core.pending_checkpoint().unwrap().messages_read, u(5));

    assert!(core.run_once().unwrap());
    let cache = ValueCache::new();
    let logs_after = core.get_logs(&u(0), &u(10), &cache).unwrap().unwrap();
    assert_eq!(logs_after, logs_before);
}

#[test]
fn test_save_checkpoint_on_demand() {
    let (_store, core) = open(CoreConfig {
        checkpoint_message_interval: 100,
        max_messages_per_run: 4,
        ..Default::default()
    });
    assert_eq!(deliver(&core, 0, 8), MessagesStatus::Success);
    assert!(core.run_once().unwrap());
    assert_eq!(core.max_checkpoint_gas().unwrap(), u(4 * MESSAGE_GAS));
    core.save_checkpoint().unwrap();
    assert_eq!(core.max_checkpoint_gas().unwrap(), u(8 * MESSAGE_GAS));
    // saving the same position twice does not add a reference
    core.save_checkpoint().unwrap();
    let cp = core.get_checkpoint(&u(7)).unwrap().unwrap();
    let rtx = core.make_const_transaction();
    assert_eq!(value_refcount(&rtx, &cp.machine_hash).unwrap(), Some(1));
}
