use log::debug;

use avmcore::code::Code;
use avmcore::common::{Bytes, Hash, U256};
use avmcore::machine::{Assertion, Executable, InboxMessage, Machine};
use avmcore::value::{CodePointRef, Value};

/// Gas charged per step.
pub const STEP_GAS: u64 = 10;
/// Steps needed to digest one message.
pub const MESSAGE_STEPS: u64 = 3;
/// Gas needed to digest one message.
pub const MESSAGE_GAS: u64 = STEP_GAS * MESSAGE_STEPS;

/// A deterministic toy machine. It digests inbox messages one at a time, in
/// [MESSAGE_STEPS] steps of [STEP_GAS] gas each, and blocks when it runs out
/// of messages. Each digested message yields a log
/// `[sequence number, payload, steps so far]`; a message whose first byte is
/// odd is also echoed as a send.
#[derive(Clone, Debug)]
pub struct CounterMachine {
    segment: u64,
    static_val: Value,
    steps: u64,
    pending_steps: u64,
    current: Option<(U256, Bytes)>,
    acc: Hash,
}

impl CounterMachine {
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Running hash over every payload digested so far.
    pub fn acc(&self) -> &Hash {
        &self.acc
    }

    fn finish_message(
        &mut self, seq: U256, data: Bytes, logs: &mut Vec<Value>,
        sends: &mut Vec<Bytes>,
    ) {
        self.acc = Hash::chain(&self.acc, &Hash::hash(&data));
        if data.first().map(|b| b % 2 == 1).unwrap_or(false) {
            sends.push(data.clone())
        }
        logs.push(Value::tuple(vec![
            Value::Int(seq),
            Value::buffer(data),
            self.steps.into(),
        ]));
    }
}

pub fn executable() -> Executable {
    Executable {
        code: vec![0xc0, 0xde].into(),
        static_val: Value::tuple(vec![Value::buffer(b"counter"[..].into())]),
    }
}

impl Machine for CounterMachine {
    fn new(executable: &Executable, code: &Code) -> Self {
        let segment = code.add_segment(executable.code.clone());
        Self {
            segment: segment.id(),
            static_val: executable.static_val.clone(),
            steps: 0,
            pending_steps: 0,
            current: None,
            acc: *Hash::zero(),
        }
    }

    fn from_state(state: &Value, code: &Code) -> Option<Self> {
        let t = state.as_tuple()?;
        if t.len() != 5 {
            return None
        }
        let pc = t.get(0)?.as_code_point()?;
        code.get_segment(pc.segment)?;
        let pending_steps = t.get(2)?.as_int()?.low_u64();
        let current = match t.get(3)? {
            Value::Tuple(cur) => Some((
                *cur.get(0)?.as_int()?,
                cur.get(1)?.as_buffer()?.clone(),
            )),
            _ => None,
        };
        Some(Self {
            segment: pc.segment,
            static_val: t.get(1)?.clone(),
            steps: pc.pc,
            pending_steps,
            current,
            acc: (*t.get(4)?.as_int()?).into(),
        })
    }

    fn state(&self) -> Value {
        let current = match &self.current {
            Some((seq, data)) => Value::tuple(vec![
                Value::Int(*seq),
                Value::buffer(data.clone()),
            ]),
            None => Value::Int(U256::zero()),
        };
        Value::tuple(vec![
            Value::CodePoint(CodePointRef {
                segment: self.segment,
                pc: self.steps,
            }),
            self.static_val.clone(),
            self.pending_steps.into(),
            current,
            Value::Int(self.acc.into()),
        ])
    }

    fn run(&mut self, max_gas: U256, inbox: &[InboxMessage]) -> Assertion {
        let mut gas = U256::zero();
        let mut consumed = 0;
        let mut logs = Vec::new();
        let mut sends = Vec::new();
        let step_gas = U256::from(STEP_GAS);
        while gas + step_gas <= max_gas {
            if self.pending_steps == 0 {
                match inbox.get(consumed) {
                    Some(msg) => {
                        self.current =
                            Some((msg.sequence_number, msg.data.clone()));
                        self.pending_steps = MESSAGE_STEPS;
                        consumed += 1;
                    }
                    None => break,
                }
            }
            self.steps += 1;
            self.pending_steps -= 1;
            gas += step_gas;
            if self.pending_steps == 0 {
                if let Some((seq, data)) = self.current.take() {
                    self.finish_message(seq, data, &mut logs, &mut sends)
                }
            }
        }
        debug!(
            "counter machine: {} gas, {} messages, {} logs",
            gas,
            consumed,
            logs.len()
        );
        Assertion {
            gas_used: gas,
            inbox_messages_consumed: consumed as u64,
            logs,
            sends,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: u64, data: &[u8]) -> InboxMessage {
        InboxMessage::new(seq.into(), 1, data.into())
    }

    #[test]
    fn test_run_and_block() {
        let code = Code::new(0);
        let mut m = CounterMachine::new(&executable(), &code);
        let inbox = vec![msg(0, &[1]), msg(1, &[2])];
        let a = m.run(U256::from(1000u64), &inbox);
        assert_eq!(a.gas_used, U256::from(2 * MESSAGE_GAS));
        assert_eq!(a.inbox_messages_consumed, 2);
        assert_eq!(a.logs.len(), 2);
        assert_eq!(a.sends, vec![Bytes::from(vec![1])]);
        // blocked on an empty inbox
        assert!(m.run(U256::from(1000u64), &[]).is_empty());
    }

    #[test]
    fn test_split_runs_match_single_run() {
        let inbox: Vec<_> = (0..5u64).map(|i| msg(i, &[i as u8])).collect();
        let mut whole = CounterMachine::new(&executable(), &Code::new(0));
        let a = whole.run(U256::from(1000u64), &inbox);

        // each machine loads its code as segment 0 of its own table
        let code = Code::new(0);
        let mut split = CounterMachine::new(&executable(), &code);
        let mut logs = Vec::new();
        let mut read = 0;
        while read < inbox.len() || split.pending_steps > 0 {
            let b = split.run(U256::from(25u64), &inbox[read..]);
            read += b.inbox_messages_consumed as usize;
            logs.extend(b.logs);
        }
        assert_eq!(logs, a.logs);
        assert_eq!(split.state(), whole.state());

        let restored = CounterMachine::from_state(&split.state(), &code).unwrap();
        assert_eq!(restored.state().hash(), split.state().hash());
    }
}
