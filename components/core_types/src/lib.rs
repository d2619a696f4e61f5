//! Core value and type system for the Runa VM.
//!
//! This crate provides the data every other component shares: tagged values,
//! reference-counted heap cells, the type registry, numeric semantics and the
//! error types reported at the embedding boundary.
//!
//! # Overview
//!
//! - [`Value`] - Tagged representation of VM values
//! - [`Gc`] / [`Object`] - Counted heap cells and their payloads
//! - [`TypeRegistry`] - Builtin, module and host-registered types
//! - [`VmError`] / [`StatusCode`] - Boundary errors
//! - [`Fault`] - Errors raised inside running code
//!
//! # Examples
//!
//! ```
//! use core_types::{ErrorKind, TypeId, TypeRegistry, Value, VmError};
//!
//! let types = TypeRegistry::new();
//! let v = Value::Integer(7);
//! assert_eq!(types.type_of(&v), TypeId::INTEGER);
//!
//! let err = VmError::new(ErrorKind::TypeMismatch, "expected Text");
//! assert_eq!(err.status().code(), 4);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;
mod object;
mod ops;
mod source;
mod types;
mod value;

pub use error::{ErrorKind, Fault, StatusCode, VmError};
pub use object::{
    Closure, CustomObject, Destructor, FrameId, Gc, GcBox, HeapAccount, MapKey, MapObject,
    Object, Recycler, Text, Upvalue, WeakGc,
};
pub use ops::{arithmetic, negate, ArithOp};
pub use source::{SourceLocation, StackFrame};
pub use types::{
    CompareHook, CustomTypeInfo, FieldLayout, PrimitiveKind, RegistryError, TypeEntry, TypeId,
    TypeRegistry, TypeShape,
};
pub use value::{
    compare_values, values_equal, CompareHooks, FunctionRef, ModuleId, NativeId, NoHooks, Value,
};
