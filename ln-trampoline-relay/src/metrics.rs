use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Best-effort counters for relay outcomes. Failures are keyed by the failure class reported
/// upstream so that operators can tell fee problems from liquidity problems.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    payments_relayed: AtomicU64,
    relay_failures: Mutex<HashMap<&'static str, u64>>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_payment_relayed(&self) {
        self.payments_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payment_relay_failed(&self, failure_class: &'static str) {
        if let Ok(mut failures) = self.relay_failures.lock() {
            *failures.entry(failure_class).or_insert(0) += 1;
        }
    }

    pub fn payments_relayed(&self) -> u64 {
        self.payments_relayed.load(Ordering::Relaxed)
    }

    pub fn relay_failures(&self, failure_class: &str) -> u64 {
        self.relay_failures
            .lock()
            .map(|failures| failures.get(failure_class).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}
