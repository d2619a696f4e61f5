//! In-memory assembler for modules.
//!
//! Hosts and tests use [`ModuleBuilder`] and [`FunctionBuilder`] to produce
//! modules without a compiler. Jumps and handler targets are written against
//! [`Label`]s and patched when the function is added.

use std::collections::HashMap;

use core_types::PrimitiveKind;

use crate::error::LoadError;
use crate::module::{
    function_flags, param_flags, Constant, DebugInfo, FunctionDescriptor, Header, LineEntry,
    LocalDescriptor, Metadata, Module, ParamDescriptor, TypeDescriptor, TypeKind, HAS_DEBUG_INFO,
};
use crate::opcode::{Opcode, NO_TARGET};
use crate::writer::ByteWriter;

/// A position in a function body that may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembler for one function.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    name: String,
    flags: u16,
    params: Vec<(String, Option<u32>, u8)>,
    locals: Vec<(String, Option<u32>, u16)>,
    local_count: u16,
    upvalue_count: u16,
    code: ByteWriter,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    lines: Vec<(u32, u32, u32)>,
}

impl FunctionBuilder {
    /// Empty function named `name`
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: 0,
            params: Vec::new(),
            locals: Vec::new(),
            local_count: 0,
            upvalue_count: 0,
            code: ByteWriter::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Set function flags
    pub fn flags(&mut self, flags: u16) -> &mut Self {
        self.flags |= flags;
        self
    }

    /// Declare the number of captured variables
    pub fn upvalues(&mut self, count: u16) -> &mut Self {
        self.upvalue_count = count;
        self
    }

    fn add_param(&mut self, name: &str, type_id: Option<u32>, flags: u8) -> u16 {
        let slot = self.local_count;
        self.params.push((name.to_string(), type_id, flags));
        self.local_count += 1;
        slot
    }

    /// Declare a required parameter of any type; returns its slot
    pub fn param(&mut self, name: &str) -> u16 {
        self.add_param(name, None, 0)
    }

    /// Declare a required parameter with a module type
    pub fn typed_param(&mut self, name: &str, type_id: u32) -> u16 {
        self.add_param(name, Some(type_id), 0)
    }

    /// Declare an optional parameter
    pub fn optional_param(&mut self, name: &str) -> u16 {
        self.add_param(name, None, param_flags::OPTIONAL)
    }

    /// Declare a trailing variadic parameter
    pub fn variadic_param(&mut self, name: &str) -> u16 {
        self.flags |= function_flags::VARIADIC;
        self.add_param(name, None, param_flags::VARIADIC)
    }

    /// Declare a local slot live for the whole body
    pub fn local(&mut self, name: &str) -> u16 {
        let slot = self.local_count;
        self.locals.push((name.to_string(), None, slot));
        self.local_count += 1;
        slot
    }

    /// Current offset in the body
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Append an instruction and return its offset
    pub fn emit(&mut self, op: &Opcode) -> u32 {
        let at = self.offset();
        op.encode(&mut self.code);
        at
    }

    /// Record a source position for the next instruction
    pub fn line(&mut self, line: u32, column: u32) -> &mut Self {
        self.lines.push((self.offset(), line, column));
        self
    }

    /// Allocate an unbound label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.offset());
    }

    fn emit_with_target(&mut self, op: Opcode, targets: &[(usize, Label)]) {
        let at = self.code.len();
        op.encode(&mut self.code);
        for (operand, label) in targets {
            self.fixups.push((at + operand, *label));
        }
    }

    /// `Jump` to a label
    pub fn jump(&mut self, label: Label) {
        self.emit_with_target(Opcode::Jump(0), &[(1, label)]);
    }

    /// `JumpIfFalse` to a label
    pub fn jump_if_false(&mut self, label: Label) {
        self.emit_with_target(Opcode::JumpIfFalse(0), &[(1, label)]);
    }

    /// `JumpIfTrue` to a label
    pub fn jump_if_true(&mut self, label: Label) {
        self.emit_with_target(Opcode::JumpIfTrue(0), &[(1, label)]);
    }

    /// `TryBegin` with optional catch and finally labels and catch filter
    pub fn try_begin(&mut self, catch: Option<Label>, finally: Option<Label>, filter: Option<u32>) {
        let mut targets = Vec::new();
        if let Some(label) = catch {
            targets.push((1, label));
        }
        if let Some(label) = finally {
            targets.push((5, label));
        }
        self.emit_with_target(
            Opcode::TryBegin {
                catch: NO_TARGET,
                finally: NO_TARGET,
                filter: filter.unwrap_or(NO_TARGET),
            },
            &targets,
        );
    }

    /// `TryEnd` continuing at `exit`
    pub fn try_end(&mut self, exit: Label) {
        self.emit_with_target(Opcode::TryEnd(0), &[(1, exit)]);
    }

    /// `CatchEnd` continuing at `exit`
    pub fn catch_end(&mut self, exit: Label) {
        self.emit_with_target(Opcode::CatchEnd(0), &[(1, exit)]);
    }

    fn finish(mut self) -> Result<(FunctionParts, Vec<u8>), LoadError> {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or_else(|| {
                LoadError::malformed(format!("function `{}` uses an unbound label", self.name))
            })?;
            self.code.patch_u32(at, target);
        }
        let code = std::mem::take(&mut self.code).into_bytes();
        Ok((
            FunctionParts {
                name: self.name,
                flags: self.flags,
                params: self.params,
                locals: self.locals,
                local_count: self.local_count,
                upvalue_count: self.upvalue_count,
                lines: self.lines,
            },
            code,
        ))
    }
}

struct FunctionParts {
    name: String,
    flags: u16,
    params: Vec<(String, Option<u32>, u8)>,
    locals: Vec<(String, Option<u32>, u16)>,
    local_count: u16,
    upvalue_count: u16,
    lines: Vec<(u32, u32, u32)>,
}

/// Assembler for a whole module.
///
/// # Examples
///
/// ```
/// use bytecode_system::{verify_module, FunctionBuilder, ModuleBuilder, Opcode};
///
/// let mut m = ModuleBuilder::new("math");
/// let mut add = FunctionBuilder::new("add");
/// let a = add.param("a");
/// let b = add.param("b");
/// add.emit(&Opcode::LoadLocal(a));
/// add.emit(&Opcode::LoadLocal(b));
/// add.emit(&Opcode::Add);
/// add.emit(&Opcode::Return);
/// m.add_function(add).unwrap();
///
/// let module = m.build();
/// assert!(verify_module(&module).is_ok());
/// assert_eq!(module.function_index("add"), Some(0));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ModuleBuilder {
    header: Header,
    metadata: Metadata,
    constants: Vec<Constant>,
    text_constants: HashMap<String, u32>,
    types: Vec<TypeDescriptor>,
    primitives: HashMap<PrimitiveKind, u32>,
    functions: Vec<Option<FunctionDescriptor>>,
    code: Vec<u8>,
    debug: DebugInfo,
    source_file: Option<u32>,
}

impl ModuleBuilder {
    /// Empty module named `name`
    pub fn new(name: &str) -> Self {
        Self {
            metadata: Metadata {
                name: name.to_string(),
                compiler_version: concat!("runa-builder ", env!("CARGO_PKG_VERSION")).to_string(),
                ..Metadata::default()
            },
            ..Self::default()
        }
    }

    /// Mutable access to the header
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Mutable access to metadata
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Require a host native library at load
    pub fn require_native(&mut self, library: &str) -> &mut Self {
        self.header.native_libraries.push(library.to_string());
        self
    }

    /// Record the source file used for line information
    pub fn source_file(&mut self, path: &str) -> &mut Self {
        self.source_file = Some(self.debug.files.len() as u32);
        self.debug.files.push(path.to_string());
        self.metadata.source_path = path.to_string();
        self
    }

    /// Append a constant and return its index
    pub fn constant(&mut self, constant: Constant) -> u32 {
        if let Constant::Text(text) = &constant {
            if let Some(index) = self.text_constants.get(text) {
                return *index;
            }
            self.text_constants
                .insert(text.clone(), self.constants.len() as u32);
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Text constant, deduplicated
    pub fn text(&mut self, text: &str) -> u32 {
        self.constant(Constant::Text(text.to_string()))
    }

    /// Integer constant
    pub fn integer(&mut self, value: i64) -> u32 {
        self.constant(Constant::Integer(value))
    }

    /// Append a type and return its id
    pub fn add_type(&mut self, name: &str, kind: TypeKind) -> u32 {
        let id = self.types.len() as u32;
        self.types.push(TypeDescriptor {
            id,
            name: name.to_string(),
            kind,
        });
        id
    }

    /// Module type for a primitive, deduplicated
    pub fn primitive(&mut self, kind: PrimitiveKind) -> u32 {
        if let Some(id) = self.primitives.get(&kind) {
            return *id;
        }
        let id = self.add_type("", TypeKind::Primitive(kind));
        self.primitives.insert(kind, id);
        id
    }

    /// Reserve a function index so bodies can call functions added later
    pub fn reserve_function(&mut self) -> u32 {
        self.functions.push(None);
        (self.functions.len() - 1) as u32
    }

    /// Add a function at the next index
    pub fn add_function(&mut self, function: FunctionBuilder) -> Result<u32, LoadError> {
        let index = self.reserve_function();
        self.define_function(index, function)?;
        Ok(index)
    }

    /// Fill a reserved function index
    pub fn define_function(&mut self, index: u32, function: FunctionBuilder) -> Result<(), LoadError> {
        let (parts, body) = function.finish()?;
        let any = self.primitive(PrimitiveKind::Any);
        let params: Vec<ParamDescriptor> = parts
            .params
            .into_iter()
            .map(|(name, type_id, flags)| ParamDescriptor {
                name,
                type_id: type_id.unwrap_or(any),
                flags,
            })
            .collect();
        let signature = self.add_type(
            "",
            TypeKind::Function {
                params: params.iter().map(|p| p.type_id).collect(),
                ret: any,
            },
        );
        let code_length = body.len() as u32;
        let locals = parts
            .locals
            .into_iter()
            .map(|(name, type_id, slot)| LocalDescriptor {
                name,
                type_id: type_id.unwrap_or(any),
                slot,
                scope_start: 0,
                scope_end: code_length,
            })
            .collect();
        if let Some(file) = self.source_file {
            for (offset, line, column) in parts.lines {
                self.debug.lines.push(LineEntry {
                    function: index,
                    offset,
                    file,
                    line,
                    column,
                });
            }
        }
        let descriptor = FunctionDescriptor {
            id: index,
            name: parts.name,
            signature,
            flags: parts.flags,
            params,
            locals,
            local_count: parts.local_count,
            upvalue_count: parts.upvalue_count,
            code_offset: self.code.len() as u32,
            code_length,
        };
        self.code.extend_from_slice(&body);
        let slot = self
            .functions
            .get_mut(index as usize)
            .ok_or_else(|| LoadError::malformed(format!("function index {} was not reserved", index)))?;
        *slot = Some(descriptor);
        Ok(())
    }

    /// Declare a function implemented by the host native `qualified_name`
    pub fn add_native_function(&mut self, qualified_name: &str, params: usize) -> u32 {
        let any = self.primitive(PrimitiveKind::Any);
        let signature = self.add_type(
            "",
            TypeKind::Function {
                params: vec![any; params],
                ret: any,
            },
        );
        let index = self.functions.len() as u32;
        self.functions.push(Some(FunctionDescriptor {
            id: index,
            name: qualified_name.to_string(),
            signature,
            flags: function_flags::NATIVE,
            params: (0..params)
                .map(|i| ParamDescriptor {
                    name: format!("arg{}", i),
                    type_id: any,
                    flags: 0,
                })
                .collect(),
            locals: Vec::new(),
            local_count: params as u16,
            upvalue_count: 0,
            code_offset: self.code.len() as u32,
            code_length: 0,
        }));
        index
    }

    /// Finish the module
    ///
    /// Reserved but never defined function slots become empty-bodied
    /// functions, which the verifier rejects.
    pub fn build(self) -> Module {
        let mut header = self.header;
        let debug = if self.debug.lines.is_empty() && self.debug.files.is_empty() {
            None
        } else {
            header.features |= HAS_DEBUG_INFO;
            Some(self.debug)
        };
        let code_len = self.code.len() as u32;
        let functions = self
            .functions
            .into_iter()
            .enumerate()
            .map(|(i, f)| {
                f.unwrap_or_else(|| FunctionDescriptor {
                    id: i as u32,
                    name: format!("<undefined {}>", i),
                    signature: 0,
                    flags: 0,
                    params: Vec::new(),
                    locals: Vec::new(),
                    local_count: 0,
                    upvalue_count: 0,
                    code_offset: code_len,
                    code_length: 0,
                })
            })
            .collect();
        Module {
            header,
            constants: self.constants,
            types: self.types,
            functions,
            code: self.code,
            metadata: self.metadata,
            debug,
        }
    }
}
