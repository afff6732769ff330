//! Time sources.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over wall-clock time for testability.
///
/// Production code injects [`SystemClock`]; tests inject fixed clocks so
/// round and ledger timestamps are deterministic.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(second >= first);
        // Sanity: timestamps are in the right epoch (after 2020-01-01).
        assert!(first > 1_577_836_800_000);
    }
}
