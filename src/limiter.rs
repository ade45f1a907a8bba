//! Admission-control limiter: a per-second call budget consulted before
//! any network activity. Shedding happens at the door, never by
//! queueing unboundedly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossfire::MTx;

/// Token-bucket style limiter refilled once per second by a background
/// tick task. Dropping the limiter stops the task.
pub struct Limiter {
    inner: Arc<LimiterInner>,
    close_tx: Option<MTx<()>>,
}

struct LimiterInner {
    max: AtomicI64,
    count: AtomicI64,
}

impl Limiter {
    /// Must be created inside an async runtime (spawns the refill
    /// ticker).
    pub fn new(max: i64) -> Self {
        let inner = Arc::new(LimiterInner {
            max: AtomicI64::new(max),
            count: AtomicI64::new(max),
        });
        let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
        let refill = inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        refill.count.store(refill.max.load(Ordering::Relaxed), Ordering::Relaxed);
                    }
                    _ = close_rx.recv() => {
                        return;
                    }
                }
            }
        });
        Self { inner, close_tx: Some(close_tx) }
    }

    pub fn set_limit(&self, max: i64) {
        self.inner.max.store(max, Ordering::Relaxed);
    }

    /// Take one token. True means the caller is over budget and must be
    /// rejected.
    #[inline]
    pub fn is_limit(&self) -> bool {
        self.inner.count.fetch_sub(1, Ordering::SeqCst) <= 0
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        self.close_tx.take();
    }
}
