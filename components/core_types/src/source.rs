//! Source locations and stack frames for error reporting.
//!
//! Both types are only populated when the loaded module carried debug info;
//! without it errors still carry a function name and bytecode offset.

use std::fmt;

/// A position in a source file, resolved from a module's debug info.
///
/// # Examples
///
/// ```
/// use core_types::SourceLocation;
///
/// let loc = SourceLocation {
///     file: "main.runa".to_string(),
///     line: 10,
///     column: 5,
/// };
///
/// assert_eq!(loc.to_string(), "main.runa:10:5");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source file path as recorded in the debug file table
    pub file: String,
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// One entry of a VM stack trace, innermost frame first.
///
/// # Examples
///
/// ```
/// use core_types::StackFrame;
///
/// let frame = StackFrame {
///     function_name: "add".to_string(),
///     module_name: "math".to_string(),
///     offset: 12,
///     location: None,
/// };
///
/// assert_eq!(frame.to_string(), "at math::add (+12)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Name of the executing function
    pub function_name: String,
    /// Name of the module that owns the function
    pub module_name: String,
    /// Bytecode offset within the function
    pub offset: u32,
    /// Source location, when debug info is available
    pub location: Option<SourceLocation>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "at {}::{} ({})", self.module_name, self.function_name, loc),
            None => write!(
                f,
                "at {}::{} (+{})",
                self.module_name, self.function_name, self.offset
            ),
        }
    }
}
