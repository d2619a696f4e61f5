//! Call frame for function call stack management

use std::sync::Arc;

use core_types::{FrameId, Gc, Object, Upvalue, Value};

use crate::continuation::ContinuationKey;
use crate::handler::{HandlerEntry, PendingFinally};
use crate::loader::LoadedModule;

/// Lifecycle of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Arguments bound, not started
    Ready,
    /// On the dispatcher's stack
    Running,
    /// Parked in the continuation arena
    Suspended,
    /// Finished normally
    Returned,
    /// Being popped by a propagating exception
    Unwinding,
}

/// Where a frame's result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLink {
    /// Back to the embedding host
    Host,
    /// Pushed onto the calling frame's stack
    Call,
    /// Pushed with a `done` flag onto the frame that executed `Resume`
    Resume,
}

/// Activation of one bytecode function
///
/// Owned by the dispatcher while running and moved into the continuation
/// arena while suspended.
#[derive(Debug)]
pub struct CallFrame {
    pub(crate) id: FrameId,
    pub(crate) module: Arc<LoadedModule>,
    pub(crate) function: u32,
    /// Offset of the next instruction, relative to the function start
    pub(crate) ip: usize,
    /// Offset of the instruction being executed
    pub(crate) current: usize,
    pub(crate) stack: Vec<Value>,
    pub(crate) locals: Vec<Value>,
    pub(crate) upvalues: Vec<Gc>,
    /// Upvalue cells still aliasing this frame's locals
    pub(crate) open_upvalues: Vec<(u16, Gc)>,
    pub(crate) handlers: Vec<HandlerEntry>,
    pub(crate) pending: Vec<PendingFinally>,
    pub(crate) state: FrameState,
    pub(crate) link: FrameLink,
    pub(crate) continuation: Option<ContinuationKey>,
    /// Keeps the continuation handle alive while the frame runs
    pub(crate) handle: Option<Value>,
}

impl CallFrame {
    pub(crate) fn new(
        id: FrameId,
        module: Arc<LoadedModule>,
        function: u32,
        locals: Vec<Value>,
        upvalues: Vec<Gc>,
    ) -> Self {
        Self {
            id,
            module,
            function,
            ip: 0,
            current: 0,
            stack: Vec::with_capacity(8),
            locals,
            upvalues,
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            pending: Vec::new(),
            state: FrameState::Ready,
            link: FrameLink::Call,
            continuation: None,
            handle: None,
        }
    }

    /// Frame identity
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Index of the executing function in its module
    pub fn function(&self) -> u32 {
        self.function
    }

    /// Name of the executing function
    pub fn function_name(&self) -> &str {
        self.module
            .module
            .functions
            .get(self.function as usize)
            .map_or("?", |f| f.name.as_str())
    }

    /// Offset of the next instruction
    pub fn ip(&self) -> usize {
        self.ip
    }

    /// Lifecycle state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Evaluation-stack depth
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Pop the evaluation stack; the verifier rules out underflow
    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        debug_assert!(!self.stack.is_empty(), "evaluation stack underflow");
        self.stack.pop().unwrap_or(Value::Null)
    }

    /// Pop the top `n` values in push order
    pub(crate) fn pop_n(&mut self, n: usize) -> Vec<Value> {
        debug_assert!(self.stack.len() >= n, "evaluation stack underflow");
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Close every upvalue that still aliases this frame
    pub(crate) fn close_upvalues(&mut self) {
        for (slot, cell) in self.open_upvalues.drain(..) {
            let value = self.locals.get(slot as usize).cloned().unwrap_or(Value::Null);
            *cell.write() = Object::Upvalue(Upvalue::Closed(value));
        }
    }

    /// Close the upvalue aliasing `slot`, if any
    pub(crate) fn close_upvalue(&mut self, slot: u16) {
        if let Some(at) = self.open_upvalues.iter().position(|(s, _)| *s == slot) {
            let (_, cell) = self.open_upvalues.swap_remove(at);
            let value = self.locals.get(slot as usize).cloned().unwrap_or(Value::Null);
            *cell.write() = Object::Upvalue(Upvalue::Closed(value));
        }
    }
}
