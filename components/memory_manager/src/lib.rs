//! Memory Manager - heap accounting and cycle collection
//!
//! This component provides:
//! - Allocation of heap cells charged against a configurable ceiling
//! - Explicit retain/release over atomically counted cells
//! - A stop-the-world trial-deletion collector for reference cycles
//! - Root sets for values the collector must keep alive
//! - An optional pool that recycles list buffers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gc;
pub mod heap;
pub mod pool;
pub mod roots;

pub use gc::{collect_cycles, CollectionStats};
pub use heap::{AllocError, Heap, HeapConfig, HeapStats, EMERGENCY_RESERVE};
pub use pool::ValuePool;
pub use roots::RootSet;
