//! Upvalue support for closures
//!
//! A captured variable is a heap cell. While the frame that owns the variable
//! is alive the cell is `Open` and aliases the frame's local slot; when the
//! frame is popped (or `CloseUpvalue` runs) the current value moves into the
//! cell. Frames may be on the dispatcher's stack or parked in the
//! continuation arena, so reads and writes of open cells search both.

use core_types::{FrameId, Gc, Object, Upvalue, Value};
use memory_manager::{AllocError, Heap};

use crate::call_frame::CallFrame;
use crate::continuation::ContinuationArena;

/// Find or create the open cell for `slot` of `frame`
pub(crate) fn capture(frame: &mut CallFrame, slot: u16, heap: &mut Heap) -> Result<Gc, AllocError> {
    if let Some((_, cell)) = frame.open_upvalues.iter().find(|(s, _)| *s == slot) {
        return Ok(cell.clone());
    }
    let cell = heap.alloc_upvalue(Upvalue::Open {
        frame: frame.id,
        slot,
    })?;
    frame.open_upvalues.push((slot, cell.clone()));
    Ok(cell)
}

fn open_target(cell: &Gc) -> Option<(FrameId, u16)> {
    match &*cell.read() {
        Object::Upvalue(Upvalue::Open { frame, slot }) => Some((*frame, *slot)),
        _ => None,
    }
}

/// Current value of a captured variable
pub(crate) fn read(cell: &Gc, frames: &[CallFrame], arena: &ContinuationArena) -> Value {
    match open_target(cell) {
        Some((id, slot)) => {
            let frame = frames
                .iter()
                .rev()
                .find(|f| f.id == id)
                .or_else(|| arena.frame(id));
            frame
                .and_then(|f| f.locals.get(slot as usize).cloned())
                .unwrap_or(Value::Null)
        }
        None => match &*cell.read() {
            Object::Upvalue(Upvalue::Closed(value)) => value.clone(),
            _ => Value::Null,
        },
    }
}

/// Assign a captured variable
pub(crate) fn write(
    cell: &Gc,
    value: Value,
    frames: &mut [CallFrame],
    arena: &mut ContinuationArena,
) {
    match open_target(cell) {
        Some((id, slot)) => {
            let frame = match frames.iter_mut().rev().find(|f| f.id == id) {
                Some(frame) => Some(frame),
                None => arena.frame_mut(id),
            };
            if let Some(local) = frame.and_then(|f| f.locals.get_mut(slot as usize)) {
                *local = value;
            }
        }
        None => *cell.write() = Object::Upvalue(Upvalue::Closed(value)),
    }
}
