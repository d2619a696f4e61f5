//! Suspended generator and async frames
//!
//! Calling a resumable function parks its frame in a [`ContinuationArena`]
//! and hands the caller a continuation value: a custom cell holding a
//! [`ContinuationRef`]. Slots are generational, so a handle that outlives its
//! frame is detected instead of resuming someone else's frame. Dropping the
//! last handle queues the key; the VM frees the slot at its next checkpoint
//! or host call, which may happen on another thread than the drop.

use std::sync::Arc;

use core_types::{Fault, FrameId};
use crossbeam::queue::SegQueue;
use tracing::trace;

use crate::call_frame::{CallFrame, FrameState};

/// Generational index of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationKey {
    slot: u32,
    generation: u32,
}

/// Payload of a continuation value.
#[derive(Debug)]
pub struct ContinuationRef {
    key: ContinuationKey,
    released: Arc<SegQueue<ContinuationKey>>,
}

impl ContinuationRef {
    pub(crate) fn new(key: ContinuationKey, released: Arc<SegQueue<ContinuationKey>>) -> Self {
        Self { key, released }
    }

    /// Arena key this handle refers to
    pub fn key(&self) -> ContinuationKey {
        self.key
    }
}

impl Drop for ContinuationRef {
    fn drop(&mut self) {
        self.released.push(self.key);
    }
}

#[derive(Debug)]
enum Slot {
    Vacant,
    Parked(Box<CallFrame>),
    Running,
    Finished,
}

#[derive(Debug)]
struct Entry {
    generation: u32,
    slot: Slot,
}

/// Storage for frames between suspension and resumption.
#[derive(Debug, Default)]
pub(crate) struct ContinuationArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl ContinuationArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park a fresh frame and return its key
    pub(crate) fn insert(&mut self, mut frame: CallFrame) -> ContinuationKey {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    slot: Slot::Vacant,
                });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[slot as usize];
        let key = ContinuationKey {
            slot,
            generation: entry.generation,
        };
        frame.continuation = Some(key);
        entry.slot = Slot::Parked(Box::new(frame));
        key
    }

    fn entry_mut(&mut self, key: ContinuationKey) -> Option<&mut Entry> {
        self.entries
            .get_mut(key.slot as usize)
            .filter(|e| e.generation == key.generation)
    }

    /// Take a parked frame out to run it
    pub(crate) fn take(&mut self, key: ContinuationKey) -> Result<CallFrame, Fault> {
        let entry = self
            .entry_mut(key)
            .ok_or_else(|| Fault::runtime("stale continuation"))?;
        match std::mem::replace(&mut entry.slot, Slot::Running) {
            Slot::Parked(frame) => Ok(*frame),
            Slot::Running => Err(Fault::runtime("continuation is already running")),
            Slot::Finished => {
                entry.slot = Slot::Finished;
                Err(Fault::runtime("continuation has finished"))
            }
            Slot::Vacant => {
                entry.slot = Slot::Vacant;
                Err(Fault::runtime("stale continuation"))
            }
        }
    }

    /// Put a suspended frame back; a released slot hands the frame back
    pub(crate) fn park(&mut self, key: ContinuationKey, frame: CallFrame) -> Result<(), CallFrame> {
        match self.entry_mut(key) {
            Some(entry) if matches!(entry.slot, Slot::Running) => {
                entry.slot = Slot::Parked(Box::new(frame));
                Ok(())
            }
            _ => Err(frame),
        }
    }

    /// Record that the frame returned or threw
    pub(crate) fn finish(&mut self, key: ContinuationKey) {
        if let Some(entry) = self.entry_mut(key) {
            entry.slot = Slot::Finished;
        }
    }

    /// Free a slot whose last handle was dropped
    pub(crate) fn release(&mut self, key: ContinuationKey) {
        let Some(entry) = self.entry_mut(key) else {
            return;
        };
        let previous = std::mem::replace(&mut entry.slot, Slot::Vacant);
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(key.slot);
        if let Slot::Parked(mut frame) = previous {
            frame.close_upvalues();
            frame.state = FrameState::Returned;
        }
        trace!(slot = key.slot, "continuation released");
    }

    /// Release every key queued by dropped handles
    pub(crate) fn drain(&mut self, released: &SegQueue<ContinuationKey>) {
        while let Some(key) = released.pop() {
            self.release(key);
        }
    }

    /// Parked frame with the given identity
    pub(crate) fn frame(&self, id: FrameId) -> Option<&CallFrame> {
        self.entries.iter().find_map(|e| match &e.slot {
            Slot::Parked(frame) if frame.id == id => Some(frame.as_ref()),
            _ => None,
        })
    }

    /// Mutable access to a parked frame
    pub(crate) fn frame_mut(&mut self, id: FrameId) -> Option<&mut CallFrame> {
        self.entries.iter_mut().find_map(|e| match &mut e.slot {
            Slot::Parked(frame) if frame.id == id => Some(frame.as_mut()),
            _ => None,
        })
    }

    /// Slots currently holding a frame or a finished marker
    pub(crate) fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !matches!(e.slot, Slot::Vacant))
            .count()
    }
}
