use serde::Deserialize;
use std::time::Duration;

/// Tunables of the execution thread. Every field has a default, so a partial (or empty) JSON
/// object is a valid configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// Take a checkpoint once this much gas was used since the last one.
    pub checkpoint_gas_interval: u64,
    /// Take a checkpoint once this many messages were read since the last one.
    pub checkpoint_message_interval: u64,
    /// Gas limit of a single machine run.
    pub max_gas_per_run: u64,
    /// Number of unread messages handed to a single machine run.
    pub max_messages_per_run: u64,
    /// How long the idle execution thread sleeps before polling again.
    pub idle_wait_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_gas_interval: 1_000_000,
            checkpoint_message_interval: 100,
            max_gas_per_run: 10_000_000,
            max_messages_per_run: 1000,
            idle_wait_ms: 50,
        }
    }
}

impl CoreConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}
