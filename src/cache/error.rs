//! Load failure taxonomy.

use std::any::Any;

use thiserror::Error;

/// Why a key ended up with its error flag set.
///
/// Never returned from `require`; recorded on the key's slot instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The backing collaborator rejected the request.
    #[error("load failed: {0}")]
    Failed(String),

    /// The backing collaborator reported that the resource does not exist.
    #[error("resource not found")]
    NotFound,

    /// The key cannot be mapped onto the backing collaborator's identifiers.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A batch load finished without recording an outcome for this key.
    #[error("batch load finished without reporting this key")]
    Unreported,

    /// The loader panicked while this key was pending.
    #[error("loader panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Human-readable payload of a caught panic.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
