use hex::ToHex;
use once_cell::sync::OnceCell;
pub use primitive_types::U256;
use primitive_types::H256;
use sha3::Digest;

use std::fmt;
use std::ops::Deref;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Hash(H256);

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bytes(Vec<u8>);

// Hash

impl Hash {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(sha3::Keccak256::digest(slice).as_slice())
    }

    /// Extend a rolling accumulator by one item: `keccak(acc || item)`.
    #[inline]
    pub fn chain(acc: &Hash, item: &Hash) -> Self {
        let mut hasher = sha3::Keccak256::new();
        hasher.update(acc.as_bytes());
        hasher.update(item.as_bytes());
        Self::from_slice(hasher.finalize().as_slice())
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| Self(H256::zero()))
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H256::from_slice(s))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(u: [u8; 32]) -> Self {
        Self(u.into())
    }
}

impl From<U256> for Hash {
    fn from(u: U256) -> Self {
        Self::from(u256_to_bytes(&u))
    }
}

impl From<Hash> for U256 {
    fn from(hash: Hash) -> Self {
        U256::from_big_endian(hash.as_bytes())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Bytes

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl rlp::Encodable for Bytes {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self)
    }
}

impl rlp::Decodable for Bytes {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(Self(bytes.to_vec())))
    }
}

struct BytesRef<'a>(&'a [u8]);

impl<'a> fmt::LowerHex for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.encode_hex::<String>())
    }
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_uint_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                let leading_empty_bytes = $size * 8 - (self.0.bits() + 7) / 8;
                let mut buffer = [0u8; $size * 8];
                self.0.to_big_endian(&mut buffer);
                s.encoder().encode_value(&buffer[leading_empty_bytes..]);
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    if !bytes.is_empty() && bytes[0] == 0 {
                        Err(rlp::DecoderError::RlpInvalidIndirection)
                    } else if bytes.len() <= $size * 8 {
                        Ok($wrapper_name($name::from(bytes)))
                    } else {
                        Err(rlp::DecoderError::RlpIsTooBig)
                    }
                })
            }
        }
    };
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_fixed_hash_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                s.encoder().encode_value(self.0.as_ref());
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    match bytes.len().cmp(&$size) {
                        core::cmp::Ordering::Less => {
                            Err(rlp::DecoderError::RlpIsTooShort)
                        }
                        core::cmp::Ordering::Greater => {
                            Err(rlp::DecoderError::RlpIsTooBig)
                        }
                        core::cmp::Ordering::Equal => {
                            let mut t = [0u8; $size];
                            t.copy_from_slice(bytes);
                            Ok($wrapper_name($name(t)))
                        }
                    }
                })
            }
        }
    };
}

impl_wrapped_fixed_hash_rlp!(H256, Hash, 32);

#[derive(Clone, Copy, Debug)]
pub struct U256RLP(pub U256);
impl_wrapped_uint_rlp!(U256, U256RLP, 4);

impl From<U256> for U256RLP {
    fn from(u: U256) -> Self {
        Self(u)
    }
}

/// Big-endian, fixed-width encoding; byte order equals numeric order so it can be used inside
/// store keys.
#[inline]
pub fn u256_to_bytes(u: &U256) -> [u8; 32] {
    let mut bytes: [u8; 32] = Default::default();
    u.to_big_endian(&mut bytes);
    bytes
}

#[test]
fn test_chain_is_order_sensitive() {
    let a = Hash::hash(b"a");
    let b = Hash::hash(b"b");
    let ab = Hash::chain(&Hash::chain(Hash::zero(), &a), &b);
    let ba = Hash::chain(&Hash::chain(Hash::zero(), &b), &a);
    assert_ne!(ab, ba);
    assert_eq!(ab, Hash::chain(&Hash::chain(Hash::zero(), &a), &b));
}

#[test]
fn test_u256_key_order() {
    let small = u256_to_bytes(&U256::from(255u64));
    let large = u256_to_bytes(&U256::from(256u64));
    assert!(small < large);
    assert_eq!(U256::from_big_endian(&large), U256::from(256u64));
}
