//! Bytecode dispatch loop
//!
//! A [`Dispatcher`] borrows the runtime for the duration of one host call and
//! runs frames until the host-linked frame returns or suspends. Faults raised
//! by an instruction become exception values and unwind through the frames'
//! handler stacks; only uncaught exceptions and fatal conditions reach the
//! host as a [`VmError`].

use std::cmp::Ordering;
use std::sync::Arc;

use bytecode_system::{param_flags, Capture, FunctionDescriptor, Opcode};
use core_types::{
    arithmetic, compare_values, negate, values_equal, ArithOp, Closure, ErrorKind, FieldLayout,
    Fault, FunctionRef, Gc, MapKey, MapObject, Object, SourceLocation, StackFrame, TypeId,
    TypeRegistry, TypeShape, Value, VmError,
};
use memory_manager::{AllocError, Heap};
use tracing::{debug, trace};

use crate::call_frame::{CallFrame, FrameLink, FrameState};
use crate::handler::{abandon_finally, Completion, HandlerEntry, HandlerPhase, PendingFinally};
use crate::loader::LoadedModule;
use crate::native::{length_of, NativeContext, NativeError};
use crate::profile::HotFunction;
use crate::runtime::Runtime;
use crate::upvalue;

/// Why an instruction did not complete.
#[derive(Debug)]
pub(crate) enum Throw {
    /// Converted to an exception value, then unwound
    Fault(Fault),
    /// A value thrown by bytecode or a native
    Value(Value),
    /// Aborts every frame and goes straight to the host
    Fatal(VmError),
}

impl From<Fault> for Throw {
    fn from(fault: Fault) -> Self {
        Throw::Fault(fault)
    }
}

impl From<AllocError> for Throw {
    fn from(err: AllocError) -> Self {
        Throw::Fault(err.into())
    }
}

/// How control left the host-linked frame.
#[derive(Debug)]
pub(crate) enum Exit {
    Returned(Value),
    Yielded(Value),
}

type Step = Result<Option<Exit>, Throw>;

pub(crate) struct Dispatcher<'rt> {
    rt: &'rt mut Runtime,
    frames: Vec<CallFrame>,
    /// Frames popped by the exception currently unwinding
    trace: Vec<StackFrame>,
}

fn current(frames: &mut [CallFrame]) -> Result<&mut CallFrame, Throw> {
    frames.last_mut().ok_or_else(|| {
        Throw::Fatal(VmError::new(
            ErrorKind::MalformedModule,
            "instruction executed with no active frame",
        ))
    })
}

impl<'rt> Dispatcher<'rt> {
    pub(crate) fn new(rt: &'rt mut Runtime) -> Self {
        Self {
            rt,
            frames: Vec::new(),
            trace: Vec::new(),
        }
    }

    /// Call `callee` on behalf of the host and run it to completion
    pub(crate) fn call(mut self, callee: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        let exit = match self.invoke(callee.clone(), args, FrameLink::Host) {
            Ok(Some(exit)) => exit,
            Ok(None) => self.run()?,
            Err(throw) => {
                self.unwind(throw)?;
                self.run()?
            }
        };
        match exit {
            Exit::Returned(value) | Exit::Yielded(value) => Ok(value),
        }
    }

    /// Resume a continuation on behalf of the host
    ///
    /// Returns the yielded or returned value and whether the continuation
    /// finished.
    pub(crate) fn resume(
        mut self,
        continuation: &Value,
        sent: Value,
    ) -> Result<(Value, bool), VmError> {
        let exit = match self.enter_continuation(continuation, sent, FrameLink::Host) {
            Ok(()) => self.run()?,
            Err(throw) => {
                self.unwind(throw)?;
                self.run()?
            }
        };
        Ok(match exit {
            Exit::Returned(value) => (value, true),
            Exit::Yielded(value) => (value, false),
        })
    }

    fn run(&mut self) -> Result<Exit, VmError> {
        loop {
            match self.step() {
                Ok(None) => {}
                Ok(Some(exit)) => return Ok(exit),
                Err(throw) => self.unwind(throw)?,
            }
        }
    }

    fn step(&mut self) -> Step {
        if self.rt.meter.tick() {
            self.rt.checkpoint()?;
        }
        let frame = current(&mut self.frames)?;
        let (op, next) = {
            let module = &frame.module.module;
            let code = module
                .functions
                .get(frame.function as usize)
                .map_or(&[][..], |f| module.function_code(f));
            Opcode::decode_at(code, frame.ip).map_err(|err| {
                Throw::Fatal(VmError::new(ErrorKind::MalformedModule, err.to_string()))
            })?
        };
        frame.current = frame.ip;
        frame.ip = next;
        self.execute(op)
    }

    fn execute(&mut self, op: Opcode) -> Step {
        trace!(?op, "execute");
        let frame = current(&mut self.frames)?;
        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                frame.pop();
            }
            Opcode::Dup => {
                let top = frame.stack.last().cloned().unwrap_or(Value::Null);
                frame.push(top);
            }
            Opcode::Swap => {
                let len = frame.stack.len();
                if len >= 2 {
                    frame.stack.swap(len - 1, len - 2);
                }
            }
            Opcode::PushNull => frame.push(Value::Null),
            Opcode::PushTrue => frame.push(Value::Boolean(true)),
            Opcode::PushFalse => frame.push(Value::Boolean(false)),
            Opcode::LoadConst(index) => {
                let value = frame.module.constant(index, &mut self.rt.heap)?;
                frame.push(value);
            }

            Opcode::Add => {
                let right = frame.pop();
                let left = frame.pop();
                let value = add(&mut self.rt.heap, &left, &right)?;
                frame.push(value);
            }
            Opcode::Sub => binary(frame, ArithOp::Sub)?,
            Opcode::Mul => binary(frame, ArithOp::Mul)?,
            Opcode::Div => binary(frame, ArithOp::Div)?,
            Opcode::Mod => binary(frame, ArithOp::Mod)?,
            Opcode::Neg => {
                let value = frame.pop();
                frame.push(negate(&value)?);
            }
            Opcode::Eq => {
                let right = frame.pop();
                let left = frame.pop();
                let equal = values_equal(&left, &right, &self.rt.types);
                frame.push(Value::Boolean(equal));
            }
            Opcode::Ne => {
                let right = frame.pop();
                let left = frame.pop();
                let equal = values_equal(&left, &right, &self.rt.types);
                frame.push(Value::Boolean(!equal));
            }
            Opcode::Lt => compare(frame, &self.rt.types, |o| o == Ordering::Less)?,
            Opcode::Le => compare(frame, &self.rt.types, |o| o != Ordering::Greater)?,
            Opcode::Gt => compare(frame, &self.rt.types, |o| o == Ordering::Greater)?,
            Opcode::Ge => compare(frame, &self.rt.types, |o| o != Ordering::Less)?,
            Opcode::Not => {
                let value = frame.pop();
                frame.push(Value::Boolean(!value.is_truthy()));
            }
            Opcode::And => {
                let right = frame.pop();
                let left = frame.pop();
                frame.push(Value::Boolean(left.is_truthy() && right.is_truthy()));
            }
            Opcode::Or => {
                let right = frame.pop();
                let left = frame.pop();
                frame.push(Value::Boolean(left.is_truthy() || right.is_truthy()));
            }

            Opcode::LoadLocal(slot) => {
                let value = frame
                    .locals
                    .get(usize::from(slot))
                    .cloned()
                    .unwrap_or(Value::Null);
                frame.push(value);
            }
            Opcode::StoreLocal(slot) => {
                let value = frame.pop();
                if let Some(local) = frame.locals.get_mut(usize::from(slot)) {
                    *local = value;
                }
            }
            Opcode::LoadUpvalue(index) => {
                let cell = frame.upvalues.get(usize::from(index)).cloned();
                let value = cell.map_or(Value::Null, |cell| {
                    upvalue::read(&cell, &self.frames, &self.rt.arena)
                });
                current(&mut self.frames)?.push(value);
            }
            Opcode::StoreUpvalue(index) => {
                let value = frame.pop();
                let cell = frame.upvalues.get(usize::from(index)).cloned();
                if let Some(cell) = cell {
                    upvalue::write(&cell, value, &mut self.frames, &mut self.rt.arena);
                }
            }
            Opcode::CloseUpvalue(slot) => frame.close_upvalue(slot),
            Opcode::LoadGlobal(name) => {
                let name = frame.module.text(name);
                let value = self
                    .rt
                    .globals
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Fault::runtime(format!("undefined global `{}`", name)))?;
                frame.push(value);
            }
            Opcode::StoreGlobal(name) => {
                let value = frame.pop();
                let name = frame.module.text(name).to_string();
                self.rt.globals.insert(name, value);
            }

            Opcode::GetField(name) => {
                let target = frame.pop();
                let value = get_field(&target, frame.module.text(name))?;
                frame.push(value);
            }
            Opcode::SetField(name) => {
                let value = frame.pop();
                let target = frame.pop();
                set_field(&self.rt.types, &target, frame.module.text(name), value)?;
            }
            Opcode::NewList(count) => {
                let items = frame.pop_n(usize::from(count));
                let cell = self.rt.heap.alloc_list_with_capacity(items.len())?;
                if let Object::List(list) = &mut *cell.write() {
                    list.extend(items);
                }
                frame.push(Value::List(cell));
            }
            Opcode::NewMap(count) => {
                let flat = frame.pop_n(usize::from(count) * 2);
                let mut map = MapObject::new();
                let mut values = flat.into_iter();
                while let (Some(key), Some(value)) = (values.next(), values.next()) {
                    map.insert(MapKey::from_value(&key)?, value);
                }
                let cell = self.rt.heap.alloc_map(map)?;
                frame.push(Value::Map(cell));
            }
            Opcode::GetIndex => {
                let index = frame.pop();
                let target = frame.pop();
                let value = get_index(&mut self.rt.heap, &target, &index)?;
                frame.push(value);
            }
            Opcode::SetIndex => {
                let value = frame.pop();
                let index = frame.pop();
                let target = frame.pop();
                set_index(&target, &index, value)?;
            }
            Opcode::Len => {
                let value = frame.pop();
                frame.push(Value::Integer(length_of(&value)?));
            }
            Opcode::NewStruct(local) => {
                let type_id = frame.module.type_id(local);
                let types = &self.rt.types;
                let fields = match types.get(type_id).map(|e| &e.shape) {
                    Some(TypeShape::Struct { fields, .. }) => fields,
                    _ => {
                        return Err(Fault::runtime(format!(
                            "`{}` is not a struct type",
                            types.name(type_id)
                        ))
                        .into())
                    }
                };
                let values = frame.pop_n(fields.len());
                let mut map = MapObject::tagged(type_id);
                for (field, value) in fields.iter().zip(values) {
                    check_field_value(types, field, &value)?;
                    map.insert(MapKey::from(field.name.as_str()), value);
                }
                let cell = self.rt.heap.alloc_map(map)?;
                frame.push(Value::Map(cell));
            }

            Opcode::Call(argc) => {
                let args = frame.pop_n(usize::from(argc));
                let callee = frame.pop();
                return self.invoke(callee, args, FrameLink::Call);
            }
            Opcode::CallFunction { function, argc } => {
                let args = frame.pop_n(usize::from(argc));
                let callee = Value::Function(FunctionRef::Bytecode {
                    module: frame.module.id,
                    index: function,
                });
                return self.invoke(callee, args, FrameLink::Call);
            }
            Opcode::CallMethod { name, argc } => {
                let args = frame.pop_n(usize::from(argc));
                let receiver = frame.pop();
                let name = frame.module.text(name).to_string();
                let (callee, args) = self.resolve_method(receiver, &name, args)?;
                return self.invoke(callee, args, FrameLink::Call);
            }
            Opcode::Return => {
                let value = frame.pop();
                return self.return_value(value);
            }

            Opcode::Jump(target) => frame.ip = target as usize,
            Opcode::JumpIfFalse(target) => {
                if !frame.pop().is_truthy() {
                    frame.ip = target as usize;
                }
            }
            Opcode::JumpIfTrue(target) => {
                if frame.pop().is_truthy() {
                    frame.ip = target as usize;
                }
            }

            Opcode::TryBegin {
                catch,
                finally,
                filter,
            } => {
                let depth = frame.stack.len();
                frame
                    .handlers
                    .push(HandlerEntry::new(catch, finally, filter, depth));
            }
            Opcode::TryEnd(exit) | Opcode::CatchEnd(exit) => leave_region(frame, exit),
            Opcode::EndFinally => match frame.pending.pop() {
                None => {}
                Some(pending) => match pending.completion {
                    Completion::Jump(target) => frame.ip = target as usize,
                    Completion::Rethrow(exception) => return Err(Throw::Value(exception)),
                    Completion::Return(value) => return self.return_value(value),
                },
            },
            Opcode::Throw => {
                let exception = frame.pop();
                return Err(Throw::Value(exception));
            }

            Opcode::MakeClosure { function, captures } => {
                let mut cells = Vec::with_capacity(captures.len());
                for capture in captures {
                    let cell = match capture {
                        Capture::Local(slot) => upvalue::capture(frame, slot, &mut self.rt.heap)?,
                        Capture::Upvalue(index) => frame
                            .upvalues
                            .get(usize::from(index))
                            .cloned()
                            .ok_or_else(|| Fault::runtime("closure captures a missing upvalue"))?,
                    };
                    cells.push(cell);
                }
                let closure = Closure {
                    function: FunctionRef::Bytecode {
                        module: frame.module.id,
                        index: function,
                    },
                    upvalues: cells,
                };
                let cell = self.rt.heap.alloc_closure(closure)?;
                frame.push(Value::Closure(cell));
            }
            Opcode::TypeCheck(local) => {
                let value = frame.pop();
                let type_id = frame.module.type_id(local);
                frame.push(Value::Boolean(self.rt.types.is_instance(&value, type_id)));
            }
            Opcode::Cast(local) => {
                let value = frame.pop();
                let type_id = frame.module.type_id(local);
                frame.push(cast(&self.rt.types, value, type_id)?);
            }
            Opcode::Import(name) => {
                let name = frame.module.text(name);
                let target = self
                    .rt
                    .module_named(name)
                    .cloned()
                    .ok_or_else(|| Fault::runtime(format!("module `{}` is not loaded", name)))?;
                let cell = self.rt.heap.alloc_map(exports(&target))?;
                frame.push(Value::Map(cell));
            }

            Opcode::Yield | Opcode::Await => {
                let value = frame.pop();
                return self.suspend(value);
            }
            Opcode::Resume => {
                let sent = frame.pop();
                let continuation = frame.pop();
                self.enter_continuation(&continuation, sent, FrameLink::Resume)?;
            }
        }
        Ok(None)
    }

    /// Call any callable value
    fn invoke(&mut self, callee: Value, args: Vec<Value>, link: FrameLink) -> Step {
        let (function, upvalues) = match &callee {
            Value::Function(function) => (*function, Vec::new()),
            Value::Closure(cell) => match &*cell.read() {
                Object::Closure(closure) => (closure.function, closure.upvalues.clone()),
                _ => return Err(Fault::runtime("closure was reclaimed").into()),
            },
            other => {
                return Err(Fault::TypeMismatch {
                    expected: TypeId::FUNCTION,
                    actual: other.type_id(),
                }
                .into())
            }
        };
        match function {
            FunctionRef::Native(id) => {
                let value = self.call_native(id, &args)?;
                Ok(self.deliver(value, link, true))
            }
            FunctionRef::Bytecode { module, index } => {
                let module = self.rt.module(module)?;
                if let Some(native) = module.natives.get(&index).copied() {
                    let value = self.call_native(native, &args)?;
                    return Ok(self.deliver(value, link, true));
                }
                self.enter(module, index, args, upvalues, link)
            }
        }
    }

    fn call_native(&mut self, id: core_types::NativeId, args: &[Value]) -> Result<Value, Throw> {
        let rt = &mut *self.rt;
        let entry = rt
            .natives
            .get(id)
            .ok_or_else(|| Fault::runtime(format!("native {} is not registered", id.0)))?;
        if let Some(privilege) = entry.privilege {
            rt.sandbox.authorize(privilege, args)?;
        }
        debug!(native = %entry.name, args = args.len(), "host call");
        let mut ctx = NativeContext::new(&mut rt.heap, &rt.types, entry.data.as_deref());
        (entry.func)(&mut ctx, args).map_err(|err| match err {
            NativeError::Failed(message) => {
                Throw::Fault(Fault::HostCallback(format!("{}: {}", entry.name, message)))
            }
            NativeError::Fault(fault) => Throw::Fault(fault),
            NativeError::Thrown(value) => Throw::Value(value),
        })
    }

    /// Push a frame for a bytecode function, or park it if resumable
    fn enter(
        &mut self,
        module: Arc<LoadedModule>,
        index: u32,
        args: Vec<Value>,
        upvalues: Vec<Gc>,
        link: FrameLink,
    ) -> Step {
        if self.frames.len() >= self.rt.config.max_call_depth {
            return Err(Fault::runtime("call stack overflow").into());
        }
        self.rt.checkpoint()?;
        let descriptor = module
            .module
            .functions
            .get(index as usize)
            .ok_or_else(|| Fault::runtime(format!("function {} does not exist", index)))?;
        let locals = self.bind_arguments(&module, descriptor, args)?;

        if let Some(calls) = module.profile.record_call(index) {
            if let Some(jit) = &self.rt.jit {
                jit.function_hot(&HotFunction {
                    module: module.name(),
                    function: &descriptor.name,
                    index,
                    calls,
                });
            }
        }

        let resumable = descriptor.is_resumable();
        let id = self.rt.next_frame_id();
        let mut frame = CallFrame::new(id, module.clone(), index, locals, upvalues);
        frame.link = link;
        if resumable {
            let key = self.rt.arena.insert(frame);
            let handle = match self.rt.continuation_value(key) {
                Ok(handle) => handle,
                Err(err) => {
                    self.rt.arena.release(key);
                    return Err(err.into());
                }
            };
            return Ok(self.deliver(handle, link, true));
        }
        frame.state = FrameState::Running;
        self.frames.push(frame);
        Ok(None)
    }

    fn bind_arguments(
        &mut self,
        module: &LoadedModule,
        function: &FunctionDescriptor,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, Throw> {
        let params = &function.params;
        let variadic = params
            .last()
            .map_or(false, |p| p.flags & param_flags::VARIADIC != 0);
        let fixed = params.len() - usize::from(variadic);
        let required = params[..fixed]
            .iter()
            .rposition(|p| p.flags & param_flags::OPTIONAL == 0)
            .map_or(0, |i| i + 1);
        if args.len() < required || (!variadic && args.len() > fixed) {
            let expected = if variadic {
                format!("at least {}", required)
            } else if required == fixed {
                fixed.to_string()
            } else {
                format!("{} to {}", required, fixed)
            };
            return Err(Fault::runtime(format!(
                "`{}` expects {} arguments, got {}",
                function.name,
                expected,
                args.len()
            ))
            .into());
        }

        let mut locals = vec![Value::Null; usize::from(function.local_count).max(params.len())];
        let mut args = args.into_iter();
        for (slot, param) in params[..fixed].iter().enumerate() {
            let value = args.next().unwrap_or(Value::Null);
            let type_id = module.type_id(param.type_id);
            let optional_null =
                param.flags & param_flags::OPTIONAL != 0 && matches!(value, Value::Null);
            if type_id != TypeId::ANY
                && !optional_null
                && !self.rt.types.is_instance(&value, type_id)
            {
                return Err(Fault::TypeMismatch {
                    expected: type_id,
                    actual: self.rt.types.type_of(&value),
                }
                .into());
            }
            locals[slot] = value;
        }
        if variadic {
            let rest: Vec<Value> = args.collect();
            locals[fixed] = Value::List(self.rt.heap.alloc_list(rest)?);
        }
        Ok(locals)
    }

    /// Hand a result to whoever is waiting for it
    fn deliver(&mut self, value: Value, link: FrameLink, done: bool) -> Option<Exit> {
        match link {
            FrameLink::Host if done => Some(Exit::Returned(value)),
            FrameLink::Host => Some(Exit::Yielded(value)),
            FrameLink::Call => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.push(value);
                }
                None
            }
            FrameLink::Resume => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.push(value);
                    frame.push(Value::Boolean(done));
                }
                None
            }
        }
    }

    fn return_value(&mut self, value: Value) -> Step {
        let frame = current(&mut self.frames)?;
        while let Some(handler) = frame.handlers.pop() {
            if let Some(finally) = handler.finally {
                abandon_finally(&mut frame.pending, frame.handlers.len());
                frame.stack.truncate(handler.stack_depth);
                frame.pending.push(PendingFinally {
                    completion: Completion::Return(value),
                    handlers_len: frame.handlers.len(),
                });
                frame.ip = finally as usize;
                return Ok(None);
            }
        }
        let Some(mut frame) = self.frames.pop() else {
            return Ok(None);
        };
        frame.pending.clear();
        frame.close_upvalues();
        frame.state = FrameState::Returned;
        if let Some(key) = frame.continuation {
            self.rt.arena.finish(key);
        }
        let link = frame.link;
        drop(frame);
        Ok(self.deliver(value, link, true))
    }

    fn suspend(&mut self, value: Value) -> Step {
        let key = current(&mut self.frames)?
            .continuation
            .ok_or_else(|| Fault::runtime("only generator and async functions can suspend"))?;
        let Some(mut frame) = self.frames.pop() else {
            return Ok(None);
        };
        frame.state = FrameState::Suspended;
        let link = frame.link;
        let handle = frame.handle.take();
        if let Err(mut orphan) = self.rt.arena.park(key, frame) {
            orphan.close_upvalues();
        }
        drop(handle);
        Ok(self.deliver(value, link, false))
    }

    fn enter_continuation(
        &mut self,
        continuation: &Value,
        sent: Value,
        link: FrameLink,
    ) -> Result<(), Throw> {
        let key = Runtime::continuation_key(continuation).ok_or_else(|| Fault::TypeMismatch {
            expected: TypeId::CONTINUATION,
            actual: continuation.type_id(),
        })?;
        if self.frames.len() >= self.rt.config.max_call_depth {
            return Err(Fault::runtime("call stack overflow").into());
        }
        self.rt.checkpoint()?;
        let mut frame = self.rt.arena.take(key)?;
        if frame.state == FrameState::Suspended {
            frame.push(sent);
        }
        frame.state = FrameState::Running;
        frame.link = link;
        frame.handle = Some(continuation.clone());
        self.frames.push(frame);
        Ok(())
    }

    /// Find a method for `receiver`, walking its type's ancestors
    ///
    /// A map field holding a callable is the fallback; it is called without
    /// the receiver.
    fn resolve_method(
        &self,
        receiver: Value,
        name: &str,
        mut args: Vec<Value>,
    ) -> Result<(Value, Vec<Value>), Throw> {
        let mut key = (receiver.type_id(), name.to_string());
        for _ in 0..=self.rt.types.len() {
            if let Some(method) = self.rt.methods.get(&key) {
                args.insert(0, receiver);
                return Ok((method.clone(), args));
            }
            match self.rt.types.get(key.0).and_then(|e| e.parent) {
                Some(parent) => key.0 = parent,
                None => break,
            }
        }
        if let Value::Map(_) = receiver {
            let field = get_field(&receiver, name)?;
            if matches!(field, Value::Function(_) | Value::Closure(_)) {
                return Ok((field, args));
            }
        }
        Err(Fault::runtime(format!(
            "no method `{}` on `{}`",
            name,
            self.rt.types.name(receiver.type_id())
        ))
        .into())
    }

    /// Propagate a throw to the nearest handler
    ///
    /// `Ok` means a handler took over and execution continues; `Err` is the
    /// error for the host.
    fn unwind(&mut self, throw: Throw) -> Result<(), VmError> {
        let exception = match throw {
            Throw::Value(value) => value,
            Throw::Fault(fault) => match self.rt.exception_value(&fault) {
                Some(value) => value,
                None => {
                    let trace = self.frames.iter().rev().map(describe).collect();
                    self.abandon();
                    return Err(VmError::from(fault).with_stack_trace(trace));
                }
            },
            Throw::Fatal(err) => {
                self.abandon();
                return Err(err);
            }
        };
        self.trace.clear();
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Err(self.uncaught(&exception));
            };
            let types = &self.rt.types;
            while let Some(handler) = frame.handlers.pop() {
                let matches = handler.filter.map_or(true, |filter| {
                    types.is_instance(&exception, frame.module.type_id(filter))
                });
                if let (true, Some(catch)) = (handler.can_catch() && matches, handler.catch) {
                    enter_catch(frame, handler, catch);
                    frame.push(exception);
                    frame.state = FrameState::Running;
                    return Ok(());
                }
                if let Some(finally) = handler.finally {
                    abandon_finally(&mut frame.pending, frame.handlers.len());
                    frame.stack.truncate(handler.stack_depth);
                    release_scope(frame, finally);
                    frame.pending.push(PendingFinally {
                        completion: Completion::Rethrow(exception),
                        handlers_len: frame.handlers.len(),
                    });
                    frame.ip = finally as usize;
                    frame.state = FrameState::Running;
                    return Ok(());
                }
            }

            let Some(mut frame) = self.frames.pop() else {
                return Err(self.uncaught(&exception));
            };
            frame.state = FrameState::Unwinding;
            self.trace.push(describe(&frame));
            frame.close_upvalues();
            if let Some(key) = frame.continuation {
                self.rt.arena.finish(key);
            }
            if frame.link == FrameLink::Host {
                drop(frame);
                return Err(self.uncaught(&exception));
            }
        }
    }

    fn uncaught(&mut self, exception: &Value) -> VmError {
        let trace = std::mem::take(&mut self.trace);
        let location = trace.first().and_then(|f| f.location.clone());
        debug!(frames = trace.len(), "uncaught exception");
        self.rt
            .uncaught(exception)
            .with_location(location)
            .with_stack_trace(trace)
    }

    /// Drop every frame after a fatal error
    fn abandon(&mut self) {
        while let Some(mut frame) = self.frames.pop() {
            frame.close_upvalues();
            if let Some(key) = frame.continuation {
                self.rt.arena.finish(key);
            }
        }
    }
}

/// Stack-trace entry for a frame at its current instruction
fn describe(frame: &CallFrame) -> StackFrame {
    let module = &frame.module.module;
    let offset = frame.current as u32;
    let location = module
        .debug
        .as_ref()
        .and_then(|d| d.location(frame.function, offset))
        .map(|(file, line, column)| SourceLocation {
            file: file.to_string(),
            line,
            column,
        });
    StackFrame {
        function_name: frame.function_name().to_string(),
        module_name: module.name().to_string(),
        offset,
        location,
    }
}

/// Move control into a catch body
fn enter_catch(frame: &mut CallFrame, handler: HandlerEntry, catch: u32) {
    abandon_finally(&mut frame.pending, frame.handlers.len());
    frame.stack.truncate(handler.stack_depth);
    release_scope(frame, catch);

    frame.handlers.push(HandlerEntry {
        phase: HandlerPhase::Catch,
        ..handler
    });
    frame.ip = catch as usize;
}

/// Close and clear locals live at the throwing instruction but not at
/// `target`
fn release_scope(frame: &mut CallFrame, target: u32) {
    let from = frame.current as u32;
    let live = |start: u32, end: u32, at: u32| start <= at && at < end;
    let leaving: Vec<u16> = frame
        .module
        .module
        .functions
        .get(frame.function as usize)
        .map(|f| {
            f.locals
                .iter()
                .filter(|l| {
                    live(l.scope_start, l.scope_end, from) && !live(l.scope_start, l.scope_end, target)
                })
                .map(|l| l.slot)
                .collect()
        })
        .unwrap_or_default();
    for slot in leaving {
        frame.close_upvalue(slot);
        if let Some(local) = frame.locals.get_mut(usize::from(slot)) {
            *local = Value::Null;
        }
    }
}

/// `TryEnd` and `CatchEnd`: leave a protected region, through its finally
fn leave_region(frame: &mut CallFrame, exit: u32) {
    if let Some(handler) = frame.handlers.pop() {
        if let Some(finally) = handler.finally {
            frame.stack.truncate(handler.stack_depth);
            frame.pending.push(PendingFinally {
                completion: Completion::Jump(exit),
                handlers_len: frame.handlers.len(),
            });
            frame.ip = finally as usize;
            return;
        }
    }
    frame.ip = exit as usize;
}

fn binary(frame: &mut CallFrame, op: ArithOp) -> Result<(), Throw> {
    let right = frame.pop();
    let left = frame.pop();
    frame.push(arithmetic(op, &left, &right)?);
    Ok(())
}

fn compare(
    frame: &mut CallFrame,
    types: &TypeRegistry,
    test: impl Fn(Ordering) -> bool,
) -> Result<(), Throw> {
    let right = frame.pop();
    let left = frame.pop();
    let ordering = compare_values(&left, &right, types)?;
    frame.push(Value::Boolean(ordering.map_or(false, test)));
    Ok(())
}

/// `Add`: text and list concatenation, numeric addition otherwise
fn add(heap: &mut Heap, left: &Value, right: &Value) -> Result<Value, Throw> {
    match (left, right) {
        (Value::Text(a), Value::Text(b)) => {
            let mut joined = String::with_capacity(a.as_str().len() + b.as_str().len());
            joined.push_str(a.as_str());
            joined.push_str(b.as_str());
            Ok(Value::Text(heap.alloc_text(&joined)?))
        }
        (Value::List(a), Value::List(b)) => {
            let mut items = list_items(a);
            items.extend(list_items(b));
            Ok(Value::List(heap.alloc_list(items)?))
        }
        _ => Ok(arithmetic(ArithOp::Add, left, right)?),
    }
}

fn list_items(cell: &Gc) -> Vec<Value> {
    match &*cell.read() {
        Object::List(items) => items.clone(),
        _ => Vec::new(),
    }
}

fn get_field(target: &Value, name: &str) -> Result<Value, Fault> {
    match target {
        Value::Map(cell) => match &*cell.read() {
            Object::Map(map) => Ok(map.get(&MapKey::from(name)).cloned().unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        },
        other => Err(Fault::TypeMismatch {
            expected: TypeId::MAP,
            actual: other.type_id(),
        }),
    }
}

fn set_field(types: &TypeRegistry, target: &Value, name: &str, value: Value) -> Result<(), Fault> {
    let Value::Map(cell) = target else {
        return Err(Fault::TypeMismatch {
            expected: TypeId::MAP,
            actual: target.type_id(),
        });
    };
    // Checked before the write lock: `value` may be the target itself.
    let tag = match &*cell.read() {
        Object::Map(map) => map.type_tag,
        _ => return Ok(()),
    };
    if let Some(tag) = tag {
        if let Some(TypeShape::Struct { fields, .. }) = types.get(tag).map(|e| &e.shape) {
            let field = fields.iter().find(|f| f.name == name).ok_or_else(|| {
                Fault::runtime(format!("struct `{}` has no field `{}`", types.name(tag), name))
            })?;
            check_field_value(types, field, &value)?;
        }
    }
    let mut guard = cell.write();
    let previous = match &mut *guard {
        Object::Map(map) => map.insert(MapKey::from(name), value),
        _ => None,
    };
    drop(guard);
    drop(previous);
    Ok(())
}

fn check_field_value(types: &TypeRegistry, field: &FieldLayout, value: &Value) -> Result<(), Fault> {
    if field.type_id == TypeId::ANY
        || types.is_instance(value, field.type_id)
        || (field.indirect && matches!(value, Value::Null))
    {
        Ok(())
    } else {
        Err(Fault::TypeMismatch {
            expected: field.type_id,
            actual: types.type_of(value),
        })
    }
}

/// Bounds-checked list or text position
fn position(index: &Value, len: usize) -> Result<usize, Fault> {
    let raw = match index {
        Value::Integer(i) => *i,
        Value::Decimal(d) if d.fract() == 0.0 => *d as i64,
        other => {
            return Err(Fault::TypeMismatch {
                expected: TypeId::INTEGER,
                actual: other.type_id(),
            })
        }
    };
    usize::try_from(raw)
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| Fault::runtime(format!("index {} out of range for length {}", raw, len)))
}

fn get_index(heap: &mut Heap, target: &Value, index: &Value) -> Result<Value, Throw> {
    match target {
        Value::List(cell) => {
            let guard = cell.read();
            let Object::List(items) = &*guard else {
                return Ok(Value::Null);
            };
            let at = position(index, items.len())?;
            Ok(items[at].clone())
        }
        Value::Map(cell) => {
            let key = MapKey::from_value(index)?;
            match &*cell.read() {
                Object::Map(map) => Ok(map.get(&key).cloned().unwrap_or(Value::Null)),
                _ => Ok(Value::Null),
            }
        }
        Value::Text(text) => {
            let at = position(index, text.char_len())?;
            let ch = text.char_at(at).unwrap_or_default();
            let mut buf = [0u8; 4];
            Ok(Value::Text(heap.alloc_text(ch.encode_utf8(&mut buf))?))
        }
        other => Err(Fault::TypeMismatch {
            expected: TypeId::LIST,
            actual: other.type_id(),
        }
        .into()),
    }
}

fn set_index(target: &Value, index: &Value, value: Value) -> Result<(), Fault> {
    match target {
        Value::List(cell) => {
            let mut guard = cell.write();
            let Object::List(items) = &mut *guard else {
                return Ok(());
            };
            let at = position(index, items.len())?;
            let previous = std::mem::replace(&mut items[at], value);
            drop(guard);
            drop(previous);
            Ok(())
        }
        Value::Map(cell) => {
            let key = MapKey::from_value(index)?;
            let mut guard = cell.write();
            let previous = match &mut *guard {
                Object::Map(map) => map.insert(key, value),
                _ => None,
            };
            drop(guard);
            drop(previous);
            Ok(())
        }
        other => Err(Fault::TypeMismatch {
            expected: TypeId::LIST,
            actual: other.type_id(),
        }),
    }
}

/// `Cast`: numeric conversion between integer and decimal, a checked
/// reinterpretation otherwise
fn cast(types: &TypeRegistry, value: Value, type_id: TypeId) -> Result<Value, Fault> {
    match (type_id, &value) {
        (TypeId::INTEGER, Value::Decimal(d))
            if d.fract() == 0.0 && *d >= i64::MIN as f64 && *d < i64::MAX as f64 =>
        {
            Ok(Value::Integer(*d as i64))
        }
        (TypeId::DECIMAL, Value::Integer(i)) => Ok(Value::Decimal(*i as f64)),
        _ if types.is_instance(&value, type_id) => Ok(value),
        _ => Err(Fault::TypeMismatch {
            expected: type_id,
            actual: types.type_of(&value),
        }),
    }
}

/// Map of a module's named functions, the result of `Import`
fn exports(module: &LoadedModule) -> MapObject {
    let mut map = MapObject::new();
    for (index, function) in module.module.functions.iter().enumerate() {
        if function.has_flag(bytecode_system::function_flags::ANONYMOUS) {
            continue;
        }
        map.insert(
            MapKey::from(function.name.as_str()),
            Value::Function(FunctionRef::Bytecode {
                module: module.id,
                index: index as u32,
            }),
        );
    }
    map
}
