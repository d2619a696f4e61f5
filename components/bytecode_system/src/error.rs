//! Errors raised while decoding or verifying a module.

use thiserror::Error;

use crate::module::Version;

/// Load-time failure.
///
/// A module that fails with any of these is never partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Bad magic, truncated data, unknown tags or inconsistent code
    #[error("malformed module: {0}")]
    Malformed(String),

    /// Format or minimum VM version newer than supported
    #[error("unsupported version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version found in the module
        found: Version,
        /// Highest version this build accepts
        supported: Version,
    },

    /// A type, constant, function or native reference does not resolve
    #[error("unresolved reference: {0}")]
    TypeResolution(String),
}

impl LoadError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        LoadError::Malformed(message.into())
    }

    pub(crate) fn unresolved(message: impl Into<String>) -> Self {
        LoadError::TypeResolution(message.into())
    }
}
