use std::sync::atomic::{AtomicU64, Ordering};

/// Source of millisecond timestamps for sibling creation and tombstone
/// garbage collection. Deadlines and timers use `tokio::time` instead so
/// paused-clock tests stay deterministic.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }
}

/// Manually advanced clock for tests.
pub struct MockClock {
    now: AtomicU64,
}

impl MockClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub async fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
