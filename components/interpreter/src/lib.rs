//! Bytecode interpreter and embedding API for the Runa VM
//!
//! This crate provides:
//! - Module loading: decode, verify and link against registered types and
//!   natives
//! - A stack-based dispatch loop with closures, methods and exceptions
//! - Generators and async functions as resumable continuations
//! - A capability sandbox with instruction, time and memory limits
//! - Profiling counters that notify an optional JIT hook
//!
//! # Example
//!
//! ```
//! use bytecode_system::{FunctionBuilder, ModuleBuilder, Opcode};
//! use core_types::Value;
//! use interpreter::{Vm, VmConfig};
//!
//! let mut module = ModuleBuilder::new("math");
//! let mut add = FunctionBuilder::new("add");
//! let a = add.param("a");
//! let b = add.param("b");
//! add.emit(&Opcode::LoadLocal(a));
//! add.emit(&Opcode::LoadLocal(b));
//! add.emit(&Opcode::Add);
//! add.emit(&Opcode::Return);
//! module.add_function(add).unwrap();
//!
//! let mut vm = Vm::new(VmConfig::default()).unwrap();
//! vm.load_module(&module.build().encode()).unwrap();
//! let sum = vm.call("add", &[Value::Integer(2), Value::Integer(3)]).unwrap();
//! assert_eq!(sum, Value::Integer(5));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod call_frame;
pub mod config;
pub mod continuation;
mod dispatch;
pub mod handler;
pub mod loader;
pub mod native;
pub mod profile;
mod runtime;
pub mod sandbox;
pub mod shared;
mod upvalue;
pub mod vm;

// Re-export main types at crate root
pub use call_frame::{FrameLink, FrameState};
pub use config::{ConfigError, VmConfig};
pub use continuation::ContinuationKey;
pub use handler::{Completion, HandlerEntry, HandlerPhase};
pub use loader::LoadedModule;
pub use native::{NativeContext, NativeEntry, NativeError, NativeFn};
pub use profile::{HotFunction, JitHook, ProfileData};
pub use sandbox::{
    CancelHandle, ExecutionMeter, FsGrant, NetRule, Privilege, ResourceLimits, SecurityPolicy,
};
pub use shared::SharedVm;
pub use vm::Vm;
