pub mod dummy;
pub mod faulty;
pub mod rocks;

use avmcore::core::keys;

/// Human-readable form of a store key, e.g. `log:00..07`.
pub fn describe_key(key: &[u8]) -> String {
    match key.split_first() {
        Some((ns, rest)) => {
            format!("{}:{}", keys::namespace(*ns), hex::encode(rest))
        }
        None => "<empty>".into(),
    }
}
