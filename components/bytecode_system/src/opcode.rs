//! Instruction set of the stack-based interpreter.
//!
//! Every instruction is a one-byte tag followed by fixed-width little-endian
//! operands. The only variable-length instruction is [`Opcode::MakeClosure`],
//! whose capture list is count-prefixed. Jump and handler targets are byte
//! offsets relative to the start of the owning function.

use crate::error::LoadError;
use crate::reader::ByteReader;
use crate::writer::ByteWriter;

/// Operand value meaning "no target" in [`Opcode::TryBegin`].
pub const NO_TARGET: u32 = u32::MAX;

/// Source of one captured variable in [`Opcode::MakeClosure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capture {
    /// A local slot of the creating frame
    Local(u16),
    /// An upvalue of the creating closure
    Upvalue(u16),
}

/// Bytecode instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    // Stack
    /// Do nothing
    Nop,
    /// Discard the top value
    Pop,
    /// Duplicate the top value
    Dup,
    /// Swap the two top values
    Swap,
    /// Push `null`
    PushNull,
    /// Push `true`
    PushTrue,
    /// Push `false`
    PushFalse,
    /// Push a constant-pool entry
    LoadConst(u32),

    // Arithmetic and logic
    /// Add numbers, concatenate text or lists
    Add,
    /// Subtract
    Sub,
    /// Multiply
    Mul,
    /// Divide
    Div,
    /// Remainder
    Mod,
    /// Negate
    Neg,
    /// Structural equality
    Eq,
    /// Structural inequality
    Ne,
    /// Less than
    Lt,
    /// Less or equal
    Le,
    /// Greater than
    Gt,
    /// Greater or equal
    Ge,
    /// Logical not of truthiness
    Not,
    /// Logical and of truthiness
    And,
    /// Logical or of truthiness
    Or,

    // Variables
    /// Push a local slot
    LoadLocal(u16),
    /// Pop into a local slot
    StoreLocal(u16),
    /// Push a captured variable
    LoadUpvalue(u16),
    /// Pop into a captured variable
    StoreUpvalue(u16),
    /// Close any upvalue aliasing a local slot
    CloseUpvalue(u16),
    /// Push a global named by a text constant
    LoadGlobal(u32),
    /// Pop into a global named by a text constant
    StoreGlobal(u32),

    // Containers
    /// Replace a map with one of its fields
    GetField(u32),
    /// Pop a value and a map; set the field
    SetField(u32),
    /// Build a list from the top `n` values
    NewList(u16),
    /// Build a map from the top `n` key/value pairs
    NewMap(u16),
    /// Pop index and container; push the element
    GetIndex,
    /// Pop value, index and container; store the element
    SetIndex,
    /// Replace text, list or map with its length
    Len,
    /// Build a struct instance from one value per field
    NewStruct(u32),

    // Calls
    /// Call the callee below `argc` arguments
    Call(u8),
    /// Call a function of this module directly
    CallFunction {
        /// Function index
        function: u32,
        /// Argument count
        argc: u8,
    },
    /// Call a method on the receiver below `argc` arguments
    CallMethod {
        /// Text constant naming the method
        name: u32,
        /// Argument count, receiver excluded
        argc: u8,
    },
    /// Return the single value on the stack
    Return,

    // Control flow
    /// Unconditional jump
    Jump(u32),
    /// Pop; jump when falsy
    JumpIfFalse(u32),
    /// Pop; jump when truthy
    JumpIfTrue(u32),

    // Exceptions
    /// Enter a protected region
    TryBegin {
        /// Catch entry, or [`NO_TARGET`]
        catch: u32,
        /// Finally entry, or [`NO_TARGET`]
        finally: u32,
        /// Type filter for the catch, or [`NO_TARGET`] to catch everything
        filter: u32,
    },
    /// Leave the protected region normally
    TryEnd(u32),
    /// Leave the catch region normally
    CatchEnd(u32),
    /// End of a finally region; resume the pending completion
    EndFinally,
    /// Throw the top value
    Throw,

    // Closures and types
    /// Create a closure over the given captures
    MakeClosure {
        /// Function index
        function: u32,
        /// Captured variables in upvalue order
        captures: Vec<Capture>,
    },
    /// Replace a value with whether it is an instance of a type
    TypeCheck(u32),
    /// Fail unless the value is an instance of a type, converting numbers
    Cast(u32),
    /// Push the export map of a loaded module
    Import(u32),

    // Suspension
    /// Suspend a generator, yielding the top value
    Yield,
    /// Suspend an async function until the host supplies a result
    Await,
    /// Resume a continuation with a sent value
    Resume,
}

impl Opcode {
    /// Tag byte of this instruction
    pub fn tag(&self) -> u8 {
        match self {
            Opcode::Nop => 0x00,
            Opcode::Pop => 0x01,
            Opcode::Dup => 0x02,
            Opcode::Swap => 0x03,
            Opcode::PushNull => 0x04,
            Opcode::PushTrue => 0x05,
            Opcode::PushFalse => 0x06,
            Opcode::LoadConst(_) => 0x07,
            Opcode::Add => 0x10,
            Opcode::Sub => 0x11,
            Opcode::Mul => 0x12,
            Opcode::Div => 0x13,
            Opcode::Mod => 0x14,
            Opcode::Neg => 0x15,
            Opcode::Eq => 0x18,
            Opcode::Ne => 0x19,
            Opcode::Lt => 0x1A,
            Opcode::Le => 0x1B,
            Opcode::Gt => 0x1C,
            Opcode::Ge => 0x1D,
            Opcode::Not => 0x20,
            Opcode::And => 0x21,
            Opcode::Or => 0x22,
            Opcode::LoadLocal(_) => 0x28,
            Opcode::StoreLocal(_) => 0x29,
            Opcode::LoadUpvalue(_) => 0x2A,
            Opcode::StoreUpvalue(_) => 0x2B,
            Opcode::CloseUpvalue(_) => 0x2C,
            Opcode::LoadGlobal(_) => 0x2D,
            Opcode::StoreGlobal(_) => 0x2E,
            Opcode::GetField(_) => 0x30,
            Opcode::SetField(_) => 0x31,
            Opcode::NewList(_) => 0x32,
            Opcode::NewMap(_) => 0x33,
            Opcode::GetIndex => 0x34,
            Opcode::SetIndex => 0x35,
            Opcode::Len => 0x36,
            Opcode::NewStruct(_) => 0x37,
            Opcode::Call(_) => 0x40,
            Opcode::CallFunction { .. } => 0x41,
            Opcode::CallMethod { .. } => 0x42,
            Opcode::Return => 0x43,
            Opcode::Jump(_) => 0x48,
            Opcode::JumpIfFalse(_) => 0x49,
            Opcode::JumpIfTrue(_) => 0x4A,
            Opcode::TryBegin { .. } => 0x50,
            Opcode::TryEnd(_) => 0x51,
            Opcode::CatchEnd(_) => 0x52,
            Opcode::EndFinally => 0x53,
            Opcode::Throw => 0x54,
            Opcode::MakeClosure { .. } => 0x58,
            Opcode::TypeCheck(_) => 0x60,
            Opcode::Cast(_) => 0x61,
            Opcode::Import(_) => 0x68,
            Opcode::Yield => 0x70,
            Opcode::Await => 0x71,
            Opcode::Resume => 0x72,
        }
    }

    /// Append the encoded instruction to `w`
    pub fn encode(&self, w: &mut ByteWriter) {
        w.write_u8(self.tag());
        match self {
            Opcode::LoadConst(i)
            | Opcode::LoadGlobal(i)
            | Opcode::StoreGlobal(i)
            | Opcode::GetField(i)
            | Opcode::SetField(i)
            | Opcode::NewStruct(i)
            | Opcode::Jump(i)
            | Opcode::JumpIfFalse(i)
            | Opcode::JumpIfTrue(i)
            | Opcode::TryEnd(i)
            | Opcode::CatchEnd(i)
            | Opcode::TypeCheck(i)
            | Opcode::Cast(i)
            | Opcode::Import(i) => w.write_u32(*i),
            Opcode::LoadLocal(s)
            | Opcode::StoreLocal(s)
            | Opcode::LoadUpvalue(s)
            | Opcode::StoreUpvalue(s)
            | Opcode::CloseUpvalue(s)
            | Opcode::NewList(s)
            | Opcode::NewMap(s) => w.write_u16(*s),
            Opcode::Call(argc) => w.write_u8(*argc),
            Opcode::CallFunction { function, argc } => {
                w.write_u32(*function);
                w.write_u8(*argc);
            }
            Opcode::CallMethod { name, argc } => {
                w.write_u32(*name);
                w.write_u8(*argc);
            }
            Opcode::TryBegin {
                catch,
                finally,
                filter,
            } => {
                w.write_u32(*catch);
                w.write_u32(*finally);
                w.write_u32(*filter);
            }
            Opcode::MakeClosure { function, captures } => {
                w.write_u32(*function);
                w.write_u8(captures.len() as u8);
                for capture in captures {
                    match capture {
                        Capture::Local(slot) => {
                            w.write_u8(0);
                            w.write_u16(*slot);
                        }
                        Capture::Upvalue(index) => {
                            w.write_u8(1);
                            w.write_u16(*index);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Decode the instruction at the reader's position
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Opcode, LoadError> {
        let at = r.position();
        let tag = r.read_u8()?;
        let op = match tag {
            0x00 => Opcode::Nop,
            0x01 => Opcode::Pop,
            0x02 => Opcode::Dup,
            0x03 => Opcode::Swap,
            0x04 => Opcode::PushNull,
            0x05 => Opcode::PushTrue,
            0x06 => Opcode::PushFalse,
            0x07 => Opcode::LoadConst(r.read_u32()?),
            0x10 => Opcode::Add,
            0x11 => Opcode::Sub,
            0x12 => Opcode::Mul,
            0x13 => Opcode::Div,
            0x14 => Opcode::Mod,
            0x15 => Opcode::Neg,
            0x18 => Opcode::Eq,
            0x19 => Opcode::Ne,
            0x1A => Opcode::Lt,
            0x1B => Opcode::Le,
            0x1C => Opcode::Gt,
            0x1D => Opcode::Ge,
            0x20 => Opcode::Not,
            0x21 => Opcode::And,
            0x22 => Opcode::Or,
            0x28 => Opcode::LoadLocal(r.read_u16()?),
            0x29 => Opcode::StoreLocal(r.read_u16()?),
            0x2A => Opcode::LoadUpvalue(r.read_u16()?),
            0x2B => Opcode::StoreUpvalue(r.read_u16()?),
            0x2C => Opcode::CloseUpvalue(r.read_u16()?),
            0x2D => Opcode::LoadGlobal(r.read_u32()?),
            0x2E => Opcode::StoreGlobal(r.read_u32()?),
            0x30 => Opcode::GetField(r.read_u32()?),
            0x31 => Opcode::SetField(r.read_u32()?),
            0x32 => Opcode::NewList(r.read_u16()?),
            0x33 => Opcode::NewMap(r.read_u16()?),
            0x34 => Opcode::GetIndex,
            0x35 => Opcode::SetIndex,
            0x36 => Opcode::Len,
            0x37 => Opcode::NewStruct(r.read_u32()?),
            0x40 => Opcode::Call(r.read_u8()?),
            0x41 => Opcode::CallFunction {
                function: r.read_u32()?,
                argc: r.read_u8()?,
            },
            0x42 => Opcode::CallMethod {
                name: r.read_u32()?,
                argc: r.read_u8()?,
            },
            0x43 => Opcode::Return,
            0x48 => Opcode::Jump(r.read_u32()?),
            0x49 => Opcode::JumpIfFalse(r.read_u32()?),
            0x4A => Opcode::JumpIfTrue(r.read_u32()?),
            0x50 => Opcode::TryBegin {
                catch: r.read_u32()?,
                finally: r.read_u32()?,
                filter: r.read_u32()?,
            },
            0x51 => Opcode::TryEnd(r.read_u32()?),
            0x52 => Opcode::CatchEnd(r.read_u32()?),
            0x53 => Opcode::EndFinally,
            0x54 => Opcode::Throw,
            0x58 => {
                let function = r.read_u32()?;
                let count = r.read_u8()?;
                let mut captures = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let kind = r.read_u8()?;
                    let index = r.read_u16()?;
                    captures.push(match kind {
                        0 => Capture::Local(index),
                        1 => Capture::Upvalue(index),
                        other => {
                            return Err(LoadError::malformed(format!(
                                "invalid capture kind {} at offset {}",
                                other, at
                            )))
                        }
                    });
                }
                Opcode::MakeClosure { function, captures }
            }
            0x60 => Opcode::TypeCheck(r.read_u32()?),
            0x61 => Opcode::Cast(r.read_u32()?),
            0x68 => Opcode::Import(r.read_u32()?),
            0x70 => Opcode::Yield,
            0x71 => Opcode::Await,
            0x72 => Opcode::Resume,
            other => {
                return Err(LoadError::malformed(format!(
                    "invalid opcode {:#04x} at offset {}",
                    other, at
                )))
            }
        };
        Ok(op)
    }

    /// Decode the instruction at `offset` of `code`, returning it and the
    /// offset of the next instruction
    pub fn decode_at(code: &[u8], offset: usize) -> Result<(Opcode, usize), LoadError> {
        let tail = code
            .get(offset..)
            .ok_or_else(|| LoadError::malformed(format!("offset {} outside code", offset)))?;
        let mut r = ByteReader::new(tail);
        let op = Opcode::decode(&mut r)?;
        Ok((op, offset + r.position()))
    }

    /// Values popped and pushed, for opcodes whose effect is fixed
    ///
    /// `NewStruct` depends on the struct's field count and is resolved by the
    /// verifier.
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Opcode::Nop
            | Opcode::TryBegin { .. }
            | Opcode::TryEnd(_)
            | Opcode::CatchEnd(_)
            | Opcode::EndFinally
            | Opcode::Jump(_)
            | Opcode::CloseUpvalue(_) => (0, 0),
            Opcode::Pop | Opcode::StoreLocal(_) | Opcode::StoreUpvalue(_) | Opcode::StoreGlobal(_) => {
                (1, 0)
            }
            Opcode::JumpIfFalse(_) | Opcode::JumpIfTrue(_) | Opcode::Throw | Opcode::Return => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::Swap => (2, 2),
            Opcode::PushNull
            | Opcode::PushTrue
            | Opcode::PushFalse
            | Opcode::LoadConst(_)
            | Opcode::LoadLocal(_)
            | Opcode::LoadUpvalue(_)
            | Opcode::LoadGlobal(_)
            | Opcode::MakeClosure { .. }
            | Opcode::Import(_) => (0, 1),
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::And
            | Opcode::Or
            | Opcode::GetIndex => (2, 1),
            Opcode::Neg
            | Opcode::Not
            | Opcode::GetField(_)
            | Opcode::Len
            | Opcode::TypeCheck(_)
            | Opcode::Cast(_)
            | Opcode::Yield
            | Opcode::Await => (1, 1),
            Opcode::SetField(_) => (2, 0),
            Opcode::SetIndex => (3, 0),
            Opcode::NewList(n) => (*n as usize, 1),
            Opcode::NewMap(n) => (*n as usize * 2, 1),
            Opcode::NewStruct(_) => (0, 1),
            Opcode::Call(argc) => (*argc as usize + 1, 1),
            Opcode::CallFunction { argc, .. } => (*argc as usize, 1),
            Opcode::CallMethod { argc, .. } => (*argc as usize + 1, 1),
            Opcode::Resume => (2, 2),
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Return
                | Opcode::Throw
                | Opcode::Jump(_)
                | Opcode::TryEnd(_)
                | Opcode::CatchEnd(_)
        )
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        let mut w = ByteWriter::new();
        self.encode(&mut w);
        w.len()
    }
}

/// Decode a whole function body into `(offset, opcode)` pairs.
pub fn decode_all(code: &[u8]) -> Result<Vec<(u32, Opcode)>, LoadError> {
    let mut r = ByteReader::new(code);
    let mut out = Vec::new();
    while !r.is_at_end() {
        let offset = r.position() as u32;
        out.push((offset, Opcode::decode(&mut r)?));
    }
    Ok(out)
}
