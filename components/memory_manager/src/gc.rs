//! Cycle collection by trial deletion.
//!
//! Reference counting frees everything except cycles. The collector finds
//! them without knowing where the interpreter keeps its values:
//!
//! 1. Upgrade every tracked cell and count the references each receives from
//!    other tracked cells.
//! 2. A cell whose strong count exceeds those internal references is held
//!    from outside (a frame, a global, a host handle) and is a root.
//! 3. Mark everything reachable from those roots and from the [`RootSet`].
//! 4. Whatever is left is only referenced by other unreachable cells; its
//!    payload is replaced with [`Object::Cleared`], which breaks the cycles so
//!    the counts fall to zero.

use std::collections::{HashMap, HashSet};

use core_types::{Gc, Object, WeakGc};
use tracing::trace;

use crate::roots::RootSet;

/// Result of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Tracked cells still alive at the start
    pub examined: usize,
    /// Cells whose payload was cleared
    pub reclaimed: usize,
    /// Bytes charged to the reclaimed cells
    pub bytes_freed: usize,
}

/// Reclaim every cycle among `tracked` that is unreachable from outside.
///
/// The caller must have exclusive use of the values involved; cells are
/// locked one at a time and payloads are dropped after every lock has been
/// released.
pub fn collect_cycles(tracked: &[WeakGc], roots: &RootSet) -> CollectionStats {
    let cells: Vec<Gc> = tracked.iter().filter_map(WeakGc::upgrade).collect();
    let index: HashMap<usize, usize> = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| (cell.addr(), i))
        .collect();

    let mut internal = vec![0usize; cells.len()];
    for cell in &cells {
        cell.read().children(&mut |child| {
            if let Some(&i) = index.get(&child.addr()) {
                internal[i] += 1;
            }
        });
    }

    let mut marked = vec![false; cells.len()];
    let mut pending: Vec<usize> = Vec::new();
    for (i, cell) in cells.iter().enumerate() {
        // One reference belongs to `cells` itself.
        let external = cell.strong_count().saturating_sub(1 + internal[i]);
        if external > 0 {
            marked[i] = true;
            pending.push(i);
        }
    }

    let mut untracked: Vec<Gc> = Vec::new();
    for value in roots.iter() {
        if let Some(cell) = value.as_gc() {
            match index.get(&cell.addr()) {
                Some(&i) if !marked[i] => {
                    marked[i] = true;
                    pending.push(i);
                }
                Some(_) => {}
                None => untracked.push(cell.clone()),
            }
        }
    }
    // Roots outside the tracked set can still lead into it.
    let mut seen: HashSet<usize> = untracked.iter().map(Gc::addr).collect();
    while let Some(cell) = untracked.pop() {
        let mut next = Vec::new();
        cell.read().children(&mut |child| match index.get(&child.addr()) {
            Some(&i) if !marked[i] => {
                marked[i] = true;
                pending.push(i);
            }
            Some(_) => {}
            None => {
                if seen.insert(child.addr()) {
                    next.push(child.clone());
                }
            }
        });
        untracked.extend(next);
    }

    while let Some(i) = pending.pop() {
        cells[i].read().children(&mut |child| {
            if let Some(&j) = index.get(&child.addr()) {
                if !marked[j] {
                    marked[j] = true;
                    pending.push(j);
                }
            }
        });
    }

    let mut stats = CollectionStats {
        examined: cells.len(),
        ..CollectionStats::default()
    };
    let mut garbage: Vec<Object> = Vec::new();
    for (i, cell) in cells.iter().enumerate() {
        if !marked[i] {
            let payload = std::mem::replace(&mut *cell.write(), Object::Cleared);
            if !matches!(payload, Object::Cleared) {
                stats.reclaimed += 1;
                stats.bytes_freed += cell.size();
            }
            garbage.push(payload);
        }
    }
    trace!(
        examined = stats.examined,
        garbage = garbage.len(),
        "cycle collection swept"
    );
    drop(garbage);
    drop(cells);
    stats
}
