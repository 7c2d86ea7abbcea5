use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time source in milliseconds since the Unix epoch.
///
/// A single injected clock drives the ballot lifecycle, admission windows and
/// gossip pruning. Tests drive it explicitly; production uses system time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System time clock for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("prestige: system clock is before the unix epoch")
            .as_millis() as u64
    }
}

/// Manually driven clock. Phase transitions in tests advance it explicitly
/// instead of sleeping.
#[derive(Debug, Default)]
pub struct TestClock(AtomicU64);

impl TestClock {
    pub fn new(now_ms: u64) -> Self {
        TestClock(AtomicU64::new(now_ms))
    }

    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
