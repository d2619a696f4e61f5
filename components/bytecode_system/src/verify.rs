//! Module verification.
//!
//! The interpreter only runs verified modules, so everything it relies on
//! without checking is established here: references resolve, jump targets
//! land on instruction boundaries and the evaluation stack has one depth at
//! every instruction, never underflows and holds exactly the return value at
//! each `Return`.
//!
//! Protected regions are tracked along every path. Leaving a region through
//! its finally continues at the depth the region was entered with, and a
//! finally body must end at that same depth.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::LoadError;
use crate::module::{function_flags, param_flags, Constant, FunctionDescriptor, Module, TypeKind};
use crate::opcode::{decode_all, Capture, Opcode, NO_TARGET};

/// Deepest evaluation stack a function may use.
pub const MAX_STACK_DEPTH: usize = u16::MAX as usize;

/// Verify a decoded module.
pub fn verify_module(module: &Module) -> Result<(), LoadError> {
    verify_constants(module)?;
    verify_types(module)?;
    verify_function_names(module)?;
    for (index, function) in module.functions.iter().enumerate() {
        verify_function(module, index as u32, function)?;
    }
    verify_debug(module)?;
    debug!(
        module = module.name(),
        functions = module.functions.len(),
        "module verified"
    );
    Ok(())
}

fn verify_constants(module: &Module) -> Result<(), LoadError> {
    let earlier = |owner: usize, child: u32| -> Result<(), LoadError> {
        if (child as usize) < owner {
            Ok(())
        } else {
            Err(LoadError::unresolved(format!(
                "constant {} refers to constant {} which is not defined before it",
                owner, child
            )))
        }
    };
    for (index, constant) in module.constants.iter().enumerate() {
        match constant {
            Constant::List(items) => {
                for item in items {
                    earlier(index, *item)?;
                }
            }
            Constant::Map(pairs) => {
                for (key, value) in pairs {
                    earlier(index, *key)?;
                    earlier(index, *value)?;
                    match &module.constants[*key as usize] {
                        Constant::Null
                        | Constant::Boolean(_)
                        | Constant::Integer(_)
                        | Constant::Text(_) => {}
                        Constant::Decimal(d) if d.fract() == 0.0 => {}
                        _ => {
                            return Err(LoadError::malformed(format!(
                                "map constant {} has a key that cannot be hashed",
                                index
                            )))
                        }
                    }
                }
            }
            Constant::Function(f) if *f as usize >= module.functions.len() => {
                return Err(LoadError::unresolved(format!(
                    "constant {} refers to missing function {}",
                    index, f
                )))
            }
            Constant::Type(t) if *t as usize >= module.types.len() => {
                return Err(LoadError::unresolved(format!(
                    "constant {} refers to missing type {}",
                    index, t
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

fn verify_types(module: &Module) -> Result<(), LoadError> {
    let count = module.types.len();
    for (position, ty) in module.types.iter().enumerate() {
        if ty.id as usize != position {
            return Err(LoadError::malformed(format!(
                "type at position {} declares id {}",
                position, ty.id
            )));
        }
        for referenced in ty.kind.references() {
            if referenced as usize >= count {
                return Err(LoadError::unresolved(format!(
                    "type {} refers to missing type {}",
                    ty.id, referenced
                )));
            }
        }
        if let TypeKind::Struct { size, fields } = &ty.kind {
            for field in fields {
                if field.offset >= *size {
                    return Err(LoadError::malformed(format!(
                        "field `{}` of type {} has offset {} outside size {}",
                        field.name, ty.id, field.offset, size
                    )));
                }
            }
        }
    }

    // Structs may only contain themselves through indirect fields.
    let mut state = vec![0u8; count];
    for start in 0..count {
        check_inline_cycle(module, start, &mut state)?;
    }
    Ok(())
}

fn check_inline_cycle(module: &Module, index: usize, state: &mut [u8]) -> Result<(), LoadError> {
    match state[index] {
        1 => {
            return Err(LoadError::unresolved(format!(
                "struct type {} contains itself without an indirect field",
                index
            )))
        }
        2 => return Ok(()),
        _ => {}
    }
    state[index] = 1;
    if let TypeKind::Struct { fields, .. } = &module.types[index].kind {
        for field in fields.iter().filter(|f| !f.is_indirect()) {
            let target = field.type_id as usize;
            if matches!(module.types[target].kind, TypeKind::Struct { .. }) {
                check_inline_cycle(module, target, state)?;
            }
        }
    }
    state[index] = 2;
    Ok(())
}

fn verify_function_names(module: &Module) -> Result<(), LoadError> {
    let mut seen = HashSet::new();
    for function in &module.functions {
        if function.has_flag(function_flags::ANONYMOUS) {
            continue;
        }
        if !seen.insert(function.name.as_str()) {
            return Err(LoadError::malformed(format!(
                "duplicate function name `{}`",
                function.name
            )));
        }
    }
    Ok(())
}

fn verify_debug(module: &Module) -> Result<(), LoadError> {
    let Some(debug) = &module.debug else {
        return Ok(());
    };
    for entry in &debug.lines {
        if entry.function as usize >= module.functions.len()
            || entry.file as usize >= debug.files.len()
        {
            return Err(LoadError::malformed(format!(
                "line table entry refers to function {} file {} which do not exist",
                entry.function, entry.file
            )));
        }
    }
    for local in &debug.local_names {
        if local.function as usize >= module.functions.len() {
            return Err(LoadError::malformed(format!(
                "local name `{}` refers to missing function {}",
                local.name, local.function
            )));
        }
    }
    Ok(())
}

/// Whether calls to this function are bound to a host native instead of code
pub fn is_host_bound(function: &FunctionDescriptor) -> bool {
    function.has_flag(function_flags::NATIVE) || function.has_flag(function_flags::EXTERNAL)
}

fn verify_function(module: &Module, index: u32, f: &FunctionDescriptor) -> Result<(), LoadError> {
    let fail = |message: String| LoadError::malformed(format!("function `{}`: {}", f.name, message));
    let unresolved =
        |message: String| LoadError::unresolved(format!("function `{}`: {}", f.name, message));

    if f.id != index {
        return Err(fail(format!("declares id {} at position {}", f.id, index)));
    }
    match module.types.get(f.signature as usize).map(|t| &t.kind) {
        Some(TypeKind::Function { .. }) => {}
        Some(_) => return Err(unresolved(format!("signature {} is not a function type", f.signature))),
        None => return Err(unresolved(format!("signature {} does not exist", f.signature))),
    }
    if f.params.len() > f.local_count as usize {
        return Err(fail(format!(
            "{} parameters exceed {} local slots",
            f.params.len(),
            f.local_count
        )));
    }
    for (i, param) in f.params.iter().enumerate() {
        if param.type_id as usize >= module.types.len() {
            return Err(unresolved(format!("parameter `{}` has missing type {}", param.name, param.type_id)));
        }
        if param.flags & param_flags::VARIADIC != 0 && i + 1 != f.params.len() {
            return Err(fail(format!("variadic parameter `{}` is not last", param.name)));
        }
    }
    for local in &f.locals {
        if local.slot >= f.local_count {
            return Err(fail(format!("local `{}` uses slot {} of {}", local.name, local.slot, f.local_count)));
        }
        if local.type_id as usize >= module.types.len() {
            return Err(unresolved(format!("local `{}` has missing type {}", local.name, local.type_id)));
        }
        if local.scope_start > local.scope_end || local.scope_end > f.code_length {
            return Err(fail(format!(
                "local `{}` scope {}..{} outside code length {}",
                local.name, local.scope_start, local.scope_end, f.code_length
            )));
        }
    }
    let end = (f.code_offset as usize).checked_add(f.code_length as usize);
    if end.map_or(true, |end| end > module.code.len()) {
        return Err(fail(format!(
            "code range {}+{} outside code section of {} bytes",
            f.code_offset,
            f.code_length,
            module.code.len()
        )));
    }
    if is_host_bound(f) {
        return Ok(());
    }
    if f.code_length == 0 {
        return Err(fail("has an empty body".to_string()));
    }

    let code = module.function_code(f);
    let ops = decode_all(code).map_err(|e| fail(e.to_string()))?;
    verify_stack(module, f, &ops)
}

fn verify_operands(
    module: &Module,
    f: &FunctionDescriptor,
    offset: u32,
    op: &Opcode,
) -> Result<usize, LoadError> {
    let at = |what: String| format!("function `{}` at offset {}: {}", f.name, offset, what);
    let constant = |i: u32| -> Result<(), LoadError> {
        if (i as usize) < module.constants.len() {
            Ok(())
        } else {
            Err(LoadError::unresolved(at(format!("constant {} does not exist", i))))
        }
    };
    let text = |i: u32| -> Result<(), LoadError> {
        module
            .text_constant(i)
            .map(|_| ())
            .ok_or_else(|| LoadError::unresolved(at(format!("constant {} is not text", i))))
    };
    let ty = |i: u32| -> Result<(), LoadError> {
        if (i as usize) < module.types.len() {
            Ok(())
        } else {
            Err(LoadError::unresolved(at(format!("type {} does not exist", i))))
        }
    };
    let function = |i: u32| {
        module
            .functions
            .get(i as usize)
            .ok_or_else(|| LoadError::unresolved(at(format!("function {} does not exist", i))))
    };
    let local = |slot: u16| -> Result<(), LoadError> {
        if slot < f.local_count {
            Ok(())
        } else {
            Err(LoadError::malformed(at(format!("local slot {} of {}", slot, f.local_count))))
        }
    };
    let upvalue = |index: u16| -> Result<(), LoadError> {
        if index < f.upvalue_count {
            Ok(())
        } else {
            Err(LoadError::malformed(at(format!("upvalue {} of {}", index, f.upvalue_count))))
        }
    };

    let mut struct_fields = 0;
    match op {
        Opcode::LoadConst(i) => constant(*i)?,
        Opcode::LoadLocal(s) | Opcode::StoreLocal(s) | Opcode::CloseUpvalue(s) => local(*s)?,
        Opcode::LoadUpvalue(i) | Opcode::StoreUpvalue(i) => upvalue(*i)?,
        Opcode::LoadGlobal(i)
        | Opcode::StoreGlobal(i)
        | Opcode::GetField(i)
        | Opcode::SetField(i)
        | Opcode::Import(i)
        | Opcode::CallMethod { name: i, .. } => text(*i)?,
        Opcode::TypeCheck(t) | Opcode::Cast(t) => ty(*t)?,
        Opcode::NewStruct(t) => match module.types.get(*t as usize).map(|d| &d.kind) {
            Some(TypeKind::Struct { fields, .. }) => struct_fields = fields.len(),
            _ => return Err(LoadError::unresolved(at(format!("type {} is not a struct", t)))),
        },
        Opcode::CallFunction { function: i, .. } => {
            function(*i)?;
        }
        Opcode::MakeClosure {
            function: i,
            captures,
        } => {
            let callee = function(*i)?;
            if captures.len() != callee.upvalue_count as usize {
                return Err(LoadError::malformed(at(format!(
                    "closure captures {} values but `{}` declares {} upvalues",
                    captures.len(),
                    callee.name,
                    callee.upvalue_count
                ))));
            }
            for capture in captures {
                match capture {
                    Capture::Local(slot) => local(*slot)?,
                    Capture::Upvalue(index) => upvalue(*index)?,
                }
            }
        }
        Opcode::TryBegin {
            catch,
            finally,
            filter,
        } => {
            if *catch == NO_TARGET && *finally == NO_TARGET {
                return Err(LoadError::malformed(at("try region has neither catch nor finally".to_string())));
            }
            if *filter != NO_TARGET {
                ty(*filter)?;
            }
        }
        Opcode::Yield if !f.has_flag(function_flags::GENERATOR) => {
            return Err(LoadError::malformed(at("yield outside a generator".to_string())))
        }
        Opcode::Await if !f.has_flag(function_flags::ASYNC) => {
            return Err(LoadError::malformed(at("await outside an async function".to_string())))
        }
        _ => {}
    }
    Ok(struct_fields)
}

/// Abstract machine state before an instruction
///
/// Regions are named by the index of their `TryBegin`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FlowState {
    depth: usize,
    /// Open protected regions, innermost last
    regions: Vec<usize>,
    /// Finally bodies being executed, innermost last
    finally_bodies: Vec<usize>,
}

fn verify_stack(
    module: &Module,
    f: &FunctionDescriptor,
    ops: &[(u32, Opcode)],
) -> Result<(), LoadError> {
    let fail = |offset: u32, message: String| {
        LoadError::malformed(format!("function `{}` at offset {}: {}", f.name, offset, message))
    };
    let index_of: HashMap<u32, usize> = ops
        .iter()
        .enumerate()
        .map(|(i, (offset, _))| (*offset, i))
        .collect();

    let mut states: Vec<Option<FlowState>> = vec![None; ops.len()];
    let mut worklist = vec![(
        0usize,
        FlowState {
            depth: 0,
            regions: Vec::new(),
            finally_bodies: Vec::new(),
        },
    )];

    while let Some((index, state)) = worklist.pop() {
        if let Some(existing) = &states[index] {
            if *existing == state {
                continue;
            }
            let message = if existing.depth != state.depth {
                format!("inconsistent stack depth {} and {}", existing.depth, state.depth)
            } else {
                "reached inside different protected regions".to_string()
            };
            return Err(fail(ops[index].0, message));
        }
        states[index] = Some(state.clone());

        let d = state.depth;
        let (offset, op) = &ops[index];
        let struct_fields = verify_operands(module, f, *offset, op)?;
        let (pop, push) = match op {
            Opcode::NewStruct(_) => (struct_fields, 1),
            other => other.stack_effect(),
        };
        if d < pop {
            return Err(fail(*offset, format!("stack underflow: depth {} needs {}", d, pop)));
        }
        if matches!(op, Opcode::Return) && d != 1 {
            return Err(fail(*offset, format!("return with stack depth {}", d)));
        }
        let after = d - pop + push;
        if after > MAX_STACK_DEPTH {
            return Err(fail(*offset, format!("stack depth {} exceeds limit", after)));
        }
        let next_state = FlowState {
            depth: after,
            ..state.clone()
        };

        let mut successors: Vec<(u32, FlowState)> = Vec::with_capacity(3);
        let next = ops.get(index + 1).map(|(o, _)| *o);
        let fallthrough =
            |successors: &mut Vec<(u32, FlowState)>, state: FlowState| -> Result<(), LoadError> {
                match next {
                    Some(n) => {
                        successors.push((n, state));
                        Ok(())
                    }
                    None => Err(fail(*offset, "execution falls off the end of the function".to_string())),
                }
            };
        match op {
            Opcode::Return | Opcode::Throw => {}
            Opcode::Jump(t) => successors.push((*t, next_state)),
            Opcode::JumpIfFalse(t) | Opcode::JumpIfTrue(t) => {
                successors.push((*t, next_state.clone()));
                fallthrough(&mut successors, next_state)?;
            }
            Opcode::TryBegin { catch, finally, .. } => {
                let mut inside = next_state.clone();
                inside.regions.push(index);
                if *catch != NO_TARGET {
                    successors.push((
                        *catch,
                        FlowState {
                            depth: d + 1,
                            ..inside.clone()
                        },
                    ));
                }
                if *finally != NO_TARGET {
                    let mut body = state.clone();
                    body.finally_bodies.push(index);
                    successors.push((*finally, body));
                }
                fallthrough(&mut successors, inside)?;
            }
            Opcode::TryEnd(exit) | Opcode::CatchEnd(exit) => {
                let mut outside = next_state;
                let Some(region) = outside.regions.pop() else {
                    return Err(fail(*offset, "leaves a protected region that is not open".to_string()));
                };
                match region_finally(ops, region) {
                    Some(finally) => {
                        // The interpreter drops back to the region's entry depth
                        // and runs the finally before continuing at `exit`.
                        let entry = region_state(&states, region)?;
                        outside.depth = entry.depth;
                        let mut body = outside.clone();
                        body.finally_bodies.push(region);
                        successors.push((finally, body));
                        successors.push((*exit, outside));
                    }
                    None => successors.push((*exit, outside)),
                }
            }
            Opcode::EndFinally => {
                let mut resumed = next_state;
                if let Some(region) = resumed.finally_bodies.pop() {
                    let entry = region_state(&states, region)?;
                    if d != entry.depth || resumed.regions != entry.regions {
                        return Err(fail(
                            *offset,
                            format!(
                                "finally ends with stack depth {} but was entered at {}",
                                d, entry.depth
                            ),
                        ));
                    }
                }
                fallthrough(&mut successors, resumed)?;
            }
            _ => fallthrough(&mut successors, next_state)?,
        }

        for (target, target_state) in successors {
            let Some(&target_index) = index_of.get(&target) else {
                return Err(fail(
                    *offset,
                    format!("jump target {} is not an instruction boundary", target),
                ));
            };
            worklist.push((target_index, target_state));
        }
    }
    Ok(())
}

fn region_finally(ops: &[(u32, Opcode)], region: usize) -> Option<u32> {
    match ops.get(region) {
        Some((_, Opcode::TryBegin { finally, .. })) if *finally != NO_TARGET => Some(*finally),
        _ => None,
    }
}

fn region_state(states: &[Option<FlowState>], region: usize) -> Result<&FlowState, LoadError> {
    states
        .get(region)
        .and_then(Option::as_ref)
        .ok_or_else(|| LoadError::malformed(format!("protected region at {} was never entered", region)))
}
