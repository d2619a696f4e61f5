//! Exception handler and finally bookkeeping
//!
//! `TryBegin` pushes a [`HandlerEntry`] onto the frame's handler stack. A
//! thrown value walks that stack innermost-first; a region with a `finally`
//! runs it before control leaves, recording the interrupted control flow as a
//! [`Completion`] that `EndFinally` resumes.
//!
//! A finally region is entered only by `TryEnd`, `CatchEnd`, a propagating
//! throw or a `Return`, each of which records a completion. `EndFinally` with
//! nothing recorded falls through.

use bytecode_system::NO_TARGET;
use core_types::Value;

/// Where a protected region stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    /// Executing the protected body
    Try,
    /// Executing the catch body; only the finally is still pending
    Catch,
}

/// An active protected region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerEntry {
    /// Catch entry offset
    pub catch: Option<u32>,
    /// Finally entry offset
    pub finally: Option<u32>,
    /// Catch filter as a module-local type id
    pub filter: Option<u32>,
    /// Evaluation-stack depth at `TryBegin`
    pub stack_depth: usize,
    /// Current phase
    pub phase: HandlerPhase,
}

impl HandlerEntry {
    /// Entry from `TryBegin` operands
    pub fn new(catch: u32, finally: u32, filter: u32, stack_depth: usize) -> Self {
        let target = |t: u32| (t != NO_TARGET).then_some(t);
        Self {
            catch: target(catch),
            finally: target(finally),
            filter: target(filter),
            stack_depth,
            phase: HandlerPhase::Try,
        }
    }

    /// Whether a throw here may enter the catch body
    pub fn can_catch(&self) -> bool {
        self.phase == HandlerPhase::Try && self.catch.is_some()
    }
}

/// Control flow interrupted by a finally region.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Continue at an offset after the protected region
    Jump(u32),
    /// Keep propagating an exception
    Rethrow(Value),
    /// Keep returning a value
    Return(Value),
}

/// A finally region currently executing.
#[derive(Debug, Clone)]
pub struct PendingFinally {
    /// What to do at `EndFinally`
    pub completion: Completion,
    /// Handler-stack height when the region was entered
    pub handlers_len: usize,
}

/// Drop the completions of finally regions that a transfer to a handler at
/// height `handlers_len` leaves.
pub fn abandon_finally(pending: &mut Vec<PendingFinally>, handlers_len: usize) {
    pending.retain(|p| p.handlers_len <= handlers_len);
}
