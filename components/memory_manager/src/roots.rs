//! GC root tracking
//!
//! Values held outside the tracked heap already keep their cells alive
//! through their counts. The root set names additional values the collector
//! must treat as reachable, such as VM globals and host-pinned handles.

use core_types::Value;

/// Root set for cycle collection
#[derive(Debug, Default)]
pub struct RootSet {
    /// Values on interpreter stacks
    stack_roots: Vec<Value>,

    /// Globals and host-pinned values
    global_roots: Vec<Value>,
}

impl RootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stack root; immediates are ignored
    pub fn add_stack_root(&mut self, value: Value) {
        if value.as_gc().is_some() {
            self.stack_roots.push(value);
        }
    }

    /// Add a global root; immediates are ignored
    pub fn add_global_root(&mut self, value: Value) {
        if value.as_gc().is_some() {
            self.global_roots.push(value);
        }
    }

    /// Drop all stack roots
    pub fn clear_stack_roots(&mut self) {
        self.stack_roots.clear();
    }

    /// Drop every root
    pub fn clear(&mut self) {
        self.stack_roots.clear();
        self.global_roots.clear();
    }

    /// Iterate over all roots
    pub fn iter(&self) -> impl Iterator<Item = &Value> + '_ {
        self.stack_roots.iter().chain(self.global_roots.iter())
    }

    /// Total number of roots
    pub fn len(&self) -> usize {
        self.stack_roots.len() + self.global_roots.len()
    }

    /// Whether no roots are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Extend<Value> for RootSet {
    fn extend<I: IntoIterator<Item = Value>>(&mut self, iter: I) {
        iter.into_iter().for_each(|value| self.add_global_root(value));
    }
}
