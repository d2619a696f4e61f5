//! VM error types and status codes.
//!
//! Two layers live here:
//!
//! - [`Fault`] is raised inside the running VM. The interpreter turns it
//!   into a catchable exception value of a builtin error type.
//! - [`VmError`] is what the embedding boundary reports. Its [`ErrorKind`]
//!   maps onto the closed [`StatusCode`] set.

use std::fmt;

use thiserror::Error;

use crate::source::{SourceLocation, StackFrame};
use crate::types::TypeId;
use crate::value::Value;

/// The kind of a boundary error.
///
/// Every variant has a matching [`StatusCode`]; `Success` has no error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad magic, truncated data, or a structurally invalid module
    MalformedModule,
    /// Module format or minimum VM version is newer than this VM
    UnsupportedVersion,
    /// A type, constant, function or native reference does not resolve
    TypeResolutionError,
    /// A value did not have the type an operation required
    TypeMismatch,
    /// An allocation would exceed the configured heap ceiling
    OutOfMemory,
    /// The security policy denied a privileged operation
    PermissionDenied,
    /// The instruction-count ceiling was exceeded
    ExecutionLimitExceeded,
    /// The wall-clock ceiling was exceeded
    TimeoutExceeded,
    /// The host cancelled the in-flight call
    Cancelled,
    /// A thrown value reached the entry call without being caught
    UncaughtException,
    /// A host callback reported failure
    HostCallbackError,
}

impl ErrorKind {
    /// Status code reported at the embedding boundary
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::MalformedModule => StatusCode::MalformedModule,
            ErrorKind::UnsupportedVersion => StatusCode::UnsupportedVersion,
            ErrorKind::TypeResolutionError => StatusCode::TypeResolutionError,
            ErrorKind::TypeMismatch => StatusCode::TypeMismatch,
            ErrorKind::OutOfMemory => StatusCode::OutOfMemory,
            ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            ErrorKind::ExecutionLimitExceeded => StatusCode::ExecutionLimitExceeded,
            ErrorKind::TimeoutExceeded => StatusCode::TimeoutExceeded,
            ErrorKind::Cancelled => StatusCode::Cancelled,
            ErrorKind::UncaughtException => StatusCode::UncaughtException,
            ErrorKind::HostCallbackError => StatusCode::HostCallbackError,
        }
    }

    /// Whether this kind is raised while loading a module
    pub fn is_load_error(self) -> bool {
        matches!(
            self,
            ErrorKind::MalformedModule
                | ErrorKind::UnsupportedVersion
                | ErrorKind::TypeResolutionError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MalformedModule => "MalformedModule",
            ErrorKind::UnsupportedVersion => "UnsupportedVersion",
            ErrorKind::TypeResolutionError => "TypeResolutionError",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::ExecutionLimitExceeded => "ExecutionLimitExceeded",
            ErrorKind::TimeoutExceeded => "TimeoutExceeded",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::UncaughtException => "UncaughtException",
            ErrorKind::HostCallbackError => "HostCallbackError",
        };
        f.write_str(name)
    }
}

/// Closed set of status codes returned across the embedding boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    /// The operation completed
    Success = 0,
    /// See [`ErrorKind::MalformedModule`]
    MalformedModule = 1,
    /// See [`ErrorKind::UnsupportedVersion`]
    UnsupportedVersion = 2,
    /// See [`ErrorKind::TypeResolutionError`]
    TypeResolutionError = 3,
    /// See [`ErrorKind::TypeMismatch`]
    TypeMismatch = 4,
    /// See [`ErrorKind::OutOfMemory`]
    OutOfMemory = 5,
    /// See [`ErrorKind::PermissionDenied`]
    PermissionDenied = 6,
    /// See [`ErrorKind::ExecutionLimitExceeded`]
    ExecutionLimitExceeded = 7,
    /// See [`ErrorKind::TimeoutExceeded`]
    TimeoutExceeded = 8,
    /// See [`ErrorKind::Cancelled`]
    Cancelled = 9,
    /// See [`ErrorKind::UncaughtException`]
    UncaughtException = 10,
    /// See [`ErrorKind::HostCallbackError`]
    HostCallbackError = 11,
}

impl StatusCode {
    /// Numeric value of the code
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Status of a boundary result
    pub fn of<T>(result: &Result<T, VmError>) -> StatusCode {
        match result {
            Ok(_) => StatusCode::Success,
            Err(err) => err.status(),
        }
    }
}

/// Structured error reported at the embedding boundary.
///
/// # Examples
///
/// ```
/// use core_types::{ErrorKind, StatusCode, VmError};
///
/// let err = VmError::new(ErrorKind::PermissionDenied, "read of /etc/passwd denied");
/// assert_eq!(err.status(), StatusCode::PermissionDenied);
/// assert!(err.to_string().contains("PermissionDenied"));
/// ```
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct VmError {
    /// What went wrong
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Source location of the faulting instruction, when debug info is loaded
    pub location: Option<SourceLocation>,
    /// Call stack at the time of the error, innermost first
    pub stack_trace: Vec<StackFrame>,
    /// The thrown value, for errors raised by running code
    pub exception: Option<Value>,
}

impl VmError {
    /// Create an error without location, trace or exception value
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            stack_trace: Vec::new(),
            exception: None,
        }
    }

    /// Attach a source location
    pub fn with_location(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location;
        self
    }

    /// Attach a stack trace
    pub fn with_stack_trace(mut self, stack_trace: Vec<StackFrame>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    /// Attach the thrown value
    pub fn with_exception(mut self, exception: Value) -> Self {
        self.exception = Some(exception);
        self
    }

    /// Status code for this error
    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl From<Fault> for VmError {
    fn from(fault: Fault) -> Self {
        VmError::new(fault.kind(), fault.to_string())
    }
}

/// A fault raised inside the running VM.
///
/// Faults are delivered to bytecode as exception values whose type is
/// [`Fault::error_type`], so they can be caught by `try` regions like any
/// other thrown value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    /// Operand or cast target had the wrong type
    #[error("type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        /// The type the operation required
        expected: TypeId,
        /// The type that was supplied
        actual: TypeId,
    },

    /// Allocation past the heap ceiling
    #[error("out of memory: {requested} bytes requested with {in_use} of {ceiling} in use")]
    OutOfMemory {
        /// Size of the failed allocation
        requested: usize,
        /// Bytes in use when the allocation failed
        in_use: usize,
        /// Configured ceiling
        ceiling: usize,
    },

    /// Privileged operation denied by the security policy
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Instruction ceiling reached
    #[error("execution limit of {limit} instructions exceeded")]
    ExecutionLimitExceeded {
        /// Configured instruction ceiling
        limit: u64,
    },

    /// Wall-clock ceiling reached
    #[error("wall-clock limit of {limit_ms} ms exceeded")]
    TimeoutExceeded {
        /// Configured ceiling in milliseconds
        limit_ms: u64,
    },

    /// Host requested cancellation
    #[error("call cancelled by host")]
    Cancelled,

    /// A native callback failed
    #[error("host callback failed: {0}")]
    HostCallback(String),

    /// Any other runtime error (bad index, division by zero, arity, ...)
    #[error("{0}")]
    Runtime(String),
}

impl Fault {
    /// Shorthand for a runtime fault
    pub fn runtime(message: impl Into<String>) -> Self {
        Fault::Runtime(message.into())
    }

    /// Boundary error kind used when this fault is not caught
    pub fn kind(&self) -> ErrorKind {
        match self {
            Fault::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Fault::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Fault::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Fault::ExecutionLimitExceeded { .. } => ErrorKind::ExecutionLimitExceeded,
            Fault::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            Fault::Cancelled => ErrorKind::Cancelled,
            Fault::HostCallback(_) => ErrorKind::HostCallbackError,
            Fault::Runtime(_) => ErrorKind::UncaughtException,
        }
    }

    /// Builtin error type of the exception value that carries this fault
    pub fn error_type(&self) -> TypeId {
        match self {
            Fault::TypeMismatch { .. } => TypeId::TYPE_MISMATCH_ERROR,
            Fault::OutOfMemory { .. } => TypeId::OUT_OF_MEMORY_ERROR,
            Fault::PermissionDenied(_) => TypeId::PERMISSION_DENIED_ERROR,
            Fault::ExecutionLimitExceeded { .. } => TypeId::EXECUTION_LIMIT_ERROR,
            Fault::TimeoutExceeded { .. } => TypeId::TIMEOUT_ERROR,
            Fault::Cancelled => TypeId::CANCELLED_ERROR,
            Fault::HostCallback(_) => TypeId::HOST_CALLBACK_ERROR,
            Fault::Runtime(_) => TypeId::RUNTIME_ERROR,
        }
    }

    /// Map a builtin error type back to the boundary kind, if it is one
    pub fn kind_for_error_type(type_id: TypeId) -> Option<ErrorKind> {
        let kind = match type_id {
            TypeId::TYPE_MISMATCH_ERROR => ErrorKind::TypeMismatch,
            TypeId::OUT_OF_MEMORY_ERROR => ErrorKind::OutOfMemory,
            TypeId::PERMISSION_DENIED_ERROR => ErrorKind::PermissionDenied,
            TypeId::EXECUTION_LIMIT_ERROR => ErrorKind::ExecutionLimitExceeded,
            TypeId::TIMEOUT_ERROR => ErrorKind::TimeoutExceeded,
            TypeId::CANCELLED_ERROR => ErrorKind::Cancelled,
            TypeId::HOST_CALLBACK_ERROR => ErrorKind::HostCallbackError,
            _ => return None,
        };
        Some(kind)
    }
}
