//! Statistical circuit breaker ("fusing"). Per (destination key,
//! method) it keeps attempt/error counters for the current window; a
//! tick task judges every window and moves pairs in or out of the
//! automatic open set. Operators can force a pair open or closed
//! independently of the statistics.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crossfire::MTx;

use crate::config::BreakerConfig;
use crate::error::CallError;

/// Error rate (percent) above which a pair is fused automatically.
pub const FUSE_THRESHOLD_PCT: i64 = 30;

struct MethodStat {
    total: i64,
    errnum: i64,
}

struct BreakerState {
    methods: HashMap<String, MethodStat>,
    auto: HashSet<String>,
    forced: HashSet<String>,
}

struct BreakerInner {
    min_volume: i64,
    state: RwLock<BreakerState>,
}

pub struct Breaker {
    inner: Arc<BreakerInner>,
    close_tx: Option<MTx<()>>,
}

#[inline]
fn pair_key(key: &str, method: &str) -> String {
    format!("{}@{}", key, method)
}

impl Breaker {
    /// Must be created inside an async runtime (spawns the window
    /// ticker).
    pub fn new(config: BreakerConfig) -> Self {
        let inner = Arc::new(BreakerInner {
            min_volume: config.min_volume,
            state: RwLock::new(BreakerState {
                methods: HashMap::new(),
                auto: HashSet::new(),
                forced: HashSet::new(),
            }),
        });
        let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
        let sweeper = inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.tick);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        sweeper.sweep();
                    }
                    _ = close_rx.recv() => {
                        return;
                    }
                }
            }
        });
        Self { inner, close_tx: Some(close_tx) }
    }

    /// Count one attempted call, creating the stat on first sight.
    pub fn add_method(&self, key: &str, method: &str) {
        let mut state = self.inner.state.write().unwrap();
        let stat = state
            .methods
            .entry(pair_key(key, method))
            .or_insert(MethodStat { total: 0, errnum: 0 });
        stat.total += 1;
    }

    /// Count one failed call. Only system errors move the counter;
    /// application and param errors never fuse a destination.
    pub fn add_error_method(&self, key: &str, method: &str, err: &CallError) {
        if !err.is_system() {
            return;
        }
        let mut state = self.inner.state.write().unwrap();
        if let Some(stat) = state.methods.get_mut(&pair_key(key, method)) {
            stat.errnum += 1;
        }
    }

    /// True when the pair must not be routed to, forced or automatic.
    pub fn is_fusing(&self, key: &str, method: &str) -> bool {
        let pair = pair_key(key, method);
        let state = self.inner.state.read().unwrap();
        state.forced.contains(&pair) || state.auto.contains(&pair)
    }

    /// Operator override, independent of statistics.
    pub fn force_open(&self, key: &str, method: &str) {
        let pair = pair_key(key, method);
        trace!("breaker: force open {}", pair);
        self.inner.state.write().unwrap().forced.insert(pair);
    }

    pub fn force_close(&self, key: &str, method: &str) {
        let pair = pair_key(key, method);
        trace!("breaker: force close {}", pair);
        self.inner.state.write().unwrap().forced.remove(&pair);
    }

    /// Judge the current window and reset its counters. Normally driven
    /// by the ticker; exposed for deterministic tests.
    pub fn sweep(&self) {
        self.inner.sweep();
    }
}

impl BreakerInner {
    fn sweep(&self) {
        let mut state = self.state.write().unwrap();
        let min_volume = self.min_volume;
        // Decide on this window's counts only, then clear them; a
        // sliding discrete window, not a continuous rate.
        let mut fused: Vec<(String, bool)> = Vec::new();
        for (pair, stat) in state.methods.iter_mut() {
            let fuse = stat.total > min_volume
                && stat.errnum > 0
                && stat.errnum * 100 / stat.total > FUSE_THRESHOLD_PCT;
            fused.push((pair.clone(), fuse));
            stat.total = 0;
            stat.errnum = 0;
        }
        for (pair, fuse) in fused {
            if fuse {
                if state.auto.insert(pair.clone()) {
                    warn!("breaker: auto fuse opened for {}", pair);
                }
            } else if state.auto.remove(&pair) {
                debug!("breaker: auto fuse cleared for {}", pair);
            }
        }
    }
}

impl Drop for Breaker {
    fn drop(&mut self) {
        self.close_tx.take();
    }
}
