use thiserror::Error;

use crate::Instance;

/// Recoverable failures reported by the script runtime.
///
/// Runtime faults inside entry points are not errors at this level; they come back as
/// [`crate::instance::ScriptResult::Failed`] and are collected by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("{filename}: {message}")]
    Compile { filename: String, message: String },
    #[error("script reference table exhausted ({capacity} references live)")]
    ResourceExhaustion { capacity: usize },
    #[error("no script instance registered for entity {target:?}")]
    Routing { target: Instance },
    #[error("script '{filename}' is still used by {users} instance(s)")]
    ScriptInUse { filename: String, users: usize },
    #[error("unknown script handle")]
    UnknownScript,
    #[error("script '{0}' is already loaded")]
    AlreadyLoaded(String),
    #[error("entity {0:?} already carries a script instance")]
    DuplicateInstance(Instance),
}

impl ScriptError {
    pub fn compile(filename: impl Into<String>, message: impl Into<String>) -> Self {
        ScriptError::Compile { filename: filename.into(), message: message.into() }
    }

    pub fn is_compile(&self) -> bool {
        matches!(self, ScriptError::Compile { .. })
    }
}
