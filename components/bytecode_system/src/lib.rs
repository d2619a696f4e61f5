//! Bytecode format for the Runa VM
//!
//! This crate owns everything about modules before they are loaded into a
//! VM: the instruction set, the binary module format, the verifier that
//! establishes the invariants the interpreter relies on, and an assembler
//! for building modules in memory.
//!
//! # Features
//!
//! - Stack-based instruction set with fixed-width operands
//! - Sectioned binary modules with byte-identical re-encoding
//! - Verification of references, jump targets and stack balance
//! - Label-based assembler
//!
//! # Example
//!
//! ```
//! use bytecode_system::{verify_module, FunctionBuilder, Module, ModuleBuilder, Opcode};
//!
//! let mut builder = ModuleBuilder::new("hello");
//! let answer = builder.integer(42);
//!
//! let mut main = FunctionBuilder::new("main");
//! main.emit(&Opcode::LoadConst(answer));
//! main.emit(&Opcode::Return);
//! builder.add_function(main).unwrap();
//!
//! let bytes = builder.build().encode();
//! let module = Module::decode(&bytes).unwrap();
//! verify_module(&module).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod error;
pub mod module;
pub mod opcode;
pub mod reader;
pub mod verify;
pub mod writer;

// Re-export main types at crate root
pub use builder::{FunctionBuilder, Label, ModuleBuilder};
pub use error::LoadError;
pub use module::{
    function_flags, param_flags, Constant, DebugInfo, FieldDescriptor, FunctionDescriptor, Header,
    LineEntry, LocalDescriptor, LocalName, Metadata, Module, ParamDescriptor, TypeDescriptor,
    TypeKind, Version, FIELD_INDIRECT, FORMAT_VERSION, HAS_DEBUG_INFO, MAGIC, VM_VERSION,
};
pub use opcode::{decode_all, Capture, Opcode, NO_TARGET};
pub use reader::ByteReader;
pub use verify::{is_host_bound, verify_module};
pub use writer::ByteWriter;
