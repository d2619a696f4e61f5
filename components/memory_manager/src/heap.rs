//! Heap allocation with a byte ceiling.
//!
//! Every cell the interpreter creates goes through [`Heap`], which charges
//! its footprint to a shared [`HeapAccount`] and refuses allocations past the
//! configured ceiling. Container cells are tracked weakly so the cycle
//! collector can find them later; freeing stays with reference counting.

use std::sync::Arc;

use core_types::{
    Closure, CustomObject, Destructor, Fault, Gc, HeapAccount, MapObject, Object, Text, TypeId,
    Upvalue, Value, WeakGc,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::gc::{collect_cycles, CollectionStats};
use crate::pool::ValuePool;
use crate::roots::RootSet;

/// Allocations between two automatic collections
const MIN_ALLOCATIONS_BETWEEN_COLLECTIONS: u64 = 128;

/// Headroom above the ceiling usable only for exception values
pub const EMERGENCY_RESERVE: usize = 4096;

/// Heap tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Maximum bytes charged at once
    pub ceiling: usize,
    /// Usage, as a percentage of the ceiling, that requests a collection
    pub gc_threshold_percent: u8,
    /// Whether the cycle collector runs at all
    pub cycle_collection: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            ceiling: 256 * 1024 * 1024,
            gc_threshold_percent: 75,
            cycle_collection: true,
        }
    }
}

/// Allocation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The ceiling would be exceeded
    #[error("out of memory: requested {requested} bytes with {in_use} of {ceiling} in use")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes in use at the time
        in_use: usize,
        /// Configured ceiling
        ceiling: usize,
    },
}

impl From<AllocError> for Fault {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory {
                requested,
                in_use,
                ceiling,
            } => Fault::OutOfMemory {
                requested,
                in_use,
                ceiling,
            },
        }
    }
}

/// Snapshot of heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently charged
    pub allocated: usize,
    /// Configured ceiling
    pub ceiling: usize,
    /// Cells and texts currently alive
    pub live: usize,
    /// Allocations since creation
    pub allocations: u64,
    /// Frees since creation
    pub frees: u64,
    /// Cycle collections run
    pub collections: u64,
    /// Cells reclaimed by the cycle collector
    pub reclaimed: u64,
}

/// Allocator and owner of the collector's bookkeeping.
///
/// # Examples
///
/// ```
/// use core_types::Value;
/// use memory_manager::{Heap, HeapConfig};
///
/// let mut heap = Heap::new(HeapConfig::default());
/// let list = heap.alloc_list(vec![Value::Integer(1)]).unwrap();
///
/// assert_eq!(heap.stats().live, 1);
/// drop(list);
/// assert_eq!(heap.stats().live, 0);
/// ```
#[derive(Debug)]
pub struct Heap {
    account: Arc<HeapAccount>,
    config: HeapConfig,
    tracked: Vec<WeakGc>,
    prune_at: usize,
    collections: u64,
    reclaimed: u64,
    allocations_at_last_collection: u64,
}

impl Heap {
    /// Heap without buffer recycling
    pub fn new(config: HeapConfig) -> Self {
        Self::with_account(config, Arc::new(HeapAccount::new()))
    }

    /// Heap whose list buffers are recycled through `pool`
    pub fn with_pool(config: HeapConfig, pool: Arc<ValuePool>) -> Self {
        Self::with_account(config, Arc::new(HeapAccount::with_recycler(pool)))
    }

    fn with_account(config: HeapConfig, account: Arc<HeapAccount>) -> Self {
        Self {
            account,
            config,
            tracked: Vec::new(),
            prune_at: 1024,
            collections: 0,
            reclaimed: 0,
            allocations_at_last_collection: 0,
        }
    }

    /// Current configuration
    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Change the ceiling; cells already allocated stay charged
    pub fn set_ceiling(&mut self, ceiling: usize) {
        self.config.ceiling = ceiling;
    }

    fn charge(&self, size: usize) -> Result<(), AllocError> {
        self.charge_within(size, self.config.ceiling)
    }

    fn charge_within(&self, size: usize, ceiling: usize) -> Result<(), AllocError> {
        self.account.try_charge(size, ceiling).map_err(|in_use| {
            warn!(requested = size, in_use, ceiling, "heap ceiling reached");
            AllocError::OutOfMemory {
                requested: size,
                in_use,
                ceiling,
            }
        })
    }

    fn alloc(&mut self, object: Object, tracked: bool) -> Result<Gc, AllocError> {
        let size = object.footprint();
        self.charge(size)?;
        Ok(self.place(object, size, tracked))
    }

    fn place(&mut self, object: Object, size: usize, tracked: bool) -> Gc {
        let cell = Gc::new_accounted(object, size, self.account.clone());
        if tracked {
            self.track(&cell);
        }
        cell
    }

    fn track(&mut self, cell: &Gc) {
        self.tracked.push(cell.downgrade());
        if self.tracked.len() >= self.prune_at {
            self.tracked.retain(|weak| !weak.is_dead());
            self.prune_at = (self.tracked.len() * 2).max(1024);
        }
    }

    /// Allocate a list cell
    pub fn alloc_list(&mut self, items: Vec<Value>) -> Result<Gc, AllocError> {
        self.alloc(Object::List(items), true)
    }

    /// Allocate an empty list with room for `capacity` items, reusing a
    /// pooled buffer when one is available
    pub fn alloc_list_with_capacity(&mut self, capacity: usize) -> Result<Gc, AllocError> {
        let mut items = self.account.take_buffer().unwrap_or_default();
        items.reserve(capacity);
        self.alloc_list(items)
    }

    /// Allocate a map or struct cell
    pub fn alloc_map(&mut self, map: MapObject) -> Result<Gc, AllocError> {
        self.alloc(Object::Map(map), true)
    }

    /// Allocate a closure cell
    pub fn alloc_closure(&mut self, closure: Closure) -> Result<Gc, AllocError> {
        self.alloc(Object::Closure(closure), true)
    }

    /// Allocate an upvalue cell
    pub fn alloc_upvalue(&mut self, upvalue: Upvalue) -> Result<Gc, AllocError> {
        self.alloc(Object::Upvalue(upvalue), true)
    }

    /// Allocate a host-defined cell
    ///
    /// Custom payloads hold no values, so they never join a cycle and are
    /// not tracked.
    pub fn alloc_custom(
        &mut self,
        type_id: TypeId,
        data: Box<dyn std::any::Any + Send + Sync>,
        destructor: Option<Destructor>,
    ) -> Result<Gc, AllocError> {
        self.alloc(
            Object::Custom(CustomObject::new(type_id, data, destructor)),
            false,
        )
    }

    /// Allocate text
    pub fn alloc_text(&mut self, s: &str) -> Result<Text, AllocError> {
        let size = s.len() + std::mem::size_of::<usize>() * 4;
        self.charge(size)?;
        Ok(Text::new_accounted(s, size, self.account.clone()))
    }

    /// Allocate an exception map, drawing on [`EMERGENCY_RESERVE`] when the
    /// ceiling is already reached
    pub fn alloc_reserved_map(&mut self, map: MapObject) -> Result<Gc, AllocError> {
        let object = Object::Map(map);
        let size = object.footprint();
        self.charge_within(size, self.config.ceiling.saturating_add(EMERGENCY_RESERVE))?;
        Ok(self.place(object, size, true))
    }

    /// Allocate exception text, drawing on [`EMERGENCY_RESERVE`]
    pub fn alloc_reserved_text(&mut self, s: &str) -> Result<Text, AllocError> {
        let size = s.len() + std::mem::size_of::<usize>() * 4;
        self.charge_within(size, self.config.ceiling.saturating_add(EMERGENCY_RESERVE))?;
        Ok(Text::new_accounted(s, size, self.account.clone()))
    }

    /// Take another reference to a value
    pub fn retain(value: &Value) -> Value {
        value.clone()
    }

    /// Give up a reference; the last release frees the cell
    pub fn release(value: Value) {
        drop(value)
    }

    /// Reference count of a heap value, `None` for immediates
    pub fn refcount(value: &Value) -> Option<usize> {
        value.as_gc().map(Gc::strong_count)
    }

    /// Whether usage has crossed the collection threshold
    pub fn should_collect(&self) -> bool {
        if !self.config.cycle_collection {
            return false;
        }
        let threshold =
            self.config.ceiling / 100 * usize::from(self.config.gc_threshold_percent);
        self.account.allocated() >= threshold
            && self.account.allocations() - self.allocations_at_last_collection
                >= MIN_ALLOCATIONS_BETWEEN_COLLECTIONS
    }

    /// Reclaim unreachable cycles
    ///
    /// Does nothing when cycle collection is disabled.
    pub fn collect(&mut self, roots: &RootSet) -> CollectionStats {
        if !self.config.cycle_collection {
            return CollectionStats::default();
        }
        let stats = collect_cycles(&self.tracked, roots);
        self.tracked.retain(|weak| !weak.is_dead());
        self.prune_at = (self.tracked.len() * 2).max(1024);
        self.collections += 1;
        self.reclaimed += stats.reclaimed as u64;
        self.allocations_at_last_collection = self.account.allocations();
        debug!(
            examined = stats.examined,
            reclaimed = stats.reclaimed,
            bytes = stats.bytes_freed,
            "cycle collection finished"
        );
        stats
    }

    /// Current counters
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocated: self.account.allocated(),
            ceiling: self.config.ceiling,
            live: self.account.live(),
            allocations: self.account.allocations(),
            frees: self.account.frees(),
            collections: self.collections,
            reclaimed: self.reclaimed,
        }
    }
}
