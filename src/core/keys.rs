//! Key layout of the store. Every key starts with a one-byte namespace; integers inside keys are
//! fixed-width big-endian so that key order equals numeric order.

use crate::common::{u256_to_bytes, Hash, U256};

use super::CoreError;

/// Counters and single-valued markers.
pub const STATE: u8 = 0x00;
/// Checkpoints, keyed by (messages read, total gas).
pub const CHECKPOINT: u8 = 0x01;
/// Secondary index of checkpoints, keyed by (total gas, messages read).
pub const CHECKPOINT_GAS: u8 = 0x02;
pub const MESSAGE: u8 = 0x03;
pub const LOG: u8 = 0x04;
pub const SEND: u8 = 0x05;
pub const VALUE: u8 = 0x06;
pub const CODE: u8 = 0x07;

pub const LOG_INSERTED: [u8; 2] = [STATE, 0x00];
pub const LOG_PROCESSED: [u8; 2] = [STATE, 0x01];
pub const SEND_INSERTED: [u8; 2] = [STATE, 0x02];
pub const SEND_PROCESSED: [u8; 2] = [STATE, 0x03];
pub const MESSAGE_INSERTED: [u8; 2] = [STATE, 0x04];
pub const MESSAGE_PROCESSED: [u8; 2] = [STATE, 0x05];
pub const INITIAL_MACHINE: [u8; 2] = [STATE, 0x06];
pub const NEXT_SEGMENT_ID: [u8; 2] = [STATE, 0x07];

pub fn indexed(prefix: u8, index: &U256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(prefix);
    key.extend_from_slice(&u256_to_bytes(index));
    key
}

pub fn pair(prefix: u8, a: &U256, b: &U256) -> Vec<u8> {
    let mut key = indexed(prefix, a);
    key.extend_from_slice(&u256_to_bytes(b));
    key
}

/// The largest two-integer key whose first integer is `a`.
pub fn pair_upper(prefix: u8, a: &U256) -> Vec<u8> {
    pair(prefix, a, &U256::max_value())
}

pub fn checkpoint(messages_read: &U256, total_gas: &U256) -> Vec<u8> {
    pair(CHECKPOINT, messages_read, total_gas)
}

pub fn checkpoint_gas(total_gas: &U256, messages_read: &U256) -> Vec<u8> {
    pair(CHECKPOINT_GAS, total_gas, messages_read)
}

pub fn message(index: &U256) -> Vec<u8> {
    indexed(MESSAGE, index)
}

pub fn log(index: &U256) -> Vec<u8> {
    indexed(LOG, index)
}

pub fn send(index: &U256) -> Vec<u8> {
    indexed(SEND, index)
}

pub fn value(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(VALUE);
    key.extend_from_slice(hash.as_bytes());
    key
}

pub fn code_segment(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(CODE);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub fn namespace(prefix: u8) -> &'static str {
    match prefix {
        STATE => "state",
        CHECKPOINT => "checkpoint",
        CHECKPOINT_GAS => "checkpoint-gas",
        MESSAGE => "message",
        LOG => "log",
        SEND => "send",
        VALUE => "value",
        CODE => "code",
        _ => "unknown",
    }
}

/// Exclusive upper bound of a namespace.
pub fn end(prefix: u8) -> Vec<u8> {
    vec![prefix + 1]
}

/// Split a two-integer key back into its parts.
pub fn decode_pair(key: &[u8]) -> Result<(U256, U256), CoreError> {
    if key.len() != 65 {
        return Err(CoreError::Corrupt(format!(
            "bad key length {}",
            key.len()
        )))
    }
    Ok((
        U256::from_big_endian(&key[1..33]),
        U256::from_big_endian(&key[33..]),
    ))
}

pub fn decode_index(key: &[u8]) -> Result<U256, CoreError> {
    if key.len() != 33 {
        return Err(CoreError::Corrupt(format!(
            "bad key length {}",
            key.len()
        )))
    }
    Ok(U256::from_big_endian(&key[1..]))
}

pub fn decode_u64(raw: &[u8]) -> Result<u64, CoreError> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| {
        CoreError::Corrupt(format!("bad u64 length {}", raw.len()))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn decode_u256(raw: &[u8]) -> Result<U256, CoreError> {
    if raw.len() != 32 {
        return Err(CoreError::Corrupt(format!(
            "bad u256 length {}",
            raw.len()
        )))
    }
    Ok(U256::from_big_endian(raw))
}

pub fn decode_hash(raw: &[u8]) -> Result<Hash, CoreError> {
    if raw.len() != 32 {
        return Err(CoreError::Corrupt(format!(
            "bad hash length {}",
            raw.len()
        )))
    }
    Ok(Hash::from_slice(raw))
}

#[test]
fn test_pair_keys_sort_numerically() {
    let a = checkpoint(&1u64.into(), &500u64.into());
    let b = checkpoint(&2u64.into(), &10u64.into());
    assert!(a < b);
    assert!(b < pair_upper(CHECKPOINT, &2u64.into()));
    assert_eq!(decode_pair(&b).unwrap(), (2u64.into(), 10u64.into()));
}
