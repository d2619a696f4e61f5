//! Profiling data collection for JIT compilation decisions
//!
//! Every bytecode function has a call counter. When a counter reaches the
//! configured threshold the VM notifies the installed [`JitHook`] once.
//! Interpretation never changes because of a hook.

use std::sync::atomic::{AtomicU64, Ordering};

/// A function that just became hot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotFunction<'a> {
    /// Owning module
    pub module: &'a str,
    /// Function name
    pub function: &'a str,
    /// Function index within the module
    pub index: u32,
    /// Calls so far
    pub calls: u64,
}

/// Receiver of hot-function notifications.
pub trait JitHook: Send + Sync {
    /// Called once per function when it crosses the threshold
    fn function_hot(&self, function: &HotFunction<'_>);
}

/// Call counters for the functions of one module.
#[derive(Debug)]
pub struct ProfileData {
    calls: Vec<AtomicU64>,
    threshold: u64,
}

impl ProfileData {
    /// Counters for `functions` functions
    pub fn new(functions: usize, threshold: u64) -> Self {
        Self {
            calls: (0..functions).map(|_| AtomicU64::new(0)).collect(),
            threshold,
        }
    }

    /// Record one call; returns the count when it has just reached the
    /// threshold
    pub fn record_call(&self, index: u32) -> Option<u64> {
        let counter = self.calls.get(index as usize)?;
        let calls = counter.fetch_add(1, Ordering::Relaxed) + 1;
        (calls == self.threshold).then_some(calls)
    }

    /// Calls recorded for a function
    pub fn call_count(&self, index: u32) -> u64 {
        self.calls
            .get(index as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Whether a function has reached the threshold
    pub fn is_hot(&self, index: u32) -> bool {
        self.call_count(index) >= self.threshold
    }
}
