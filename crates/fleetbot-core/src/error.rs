use fleetbot_backend::BackendError;
use std::time::Duration;
use thiserror::Error;

/// Everything that can end a command before or during execution. Rendered to
/// the caller by the dispatcher; never escapes it.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command")]
    UnknownCommand,

    #[error("No arguments provided for command '{command}'.")]
    MissingArguments { command: String },

    #[error("You are not authorized to run '{command}'.")]
    PermissionDenied { command: String },

    #[error("Could not resolve your backend account: {0}")]
    IdentityLookupFailed(String),

    #[error("{0}")]
    BackendUnavailable(String),

    #[error("{0}")]
    EntityNotFound(String),

    #[error("Usage: `{usage}`{}", fmt_detail(.detail))]
    InvalidArguments {
        usage: String,
        detail: Option<String>,
    },

    #[error("{0}")]
    Handler(String),
}

fn fmt_detail(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(" ({})", d))
        .unwrap_or_default()
}

impl CommandError {
    pub fn invalid(usage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidArguments {
            usage: usage.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn usage(usage: impl Into<String>) -> Self {
        Self::InvalidArguments {
            usage: usage.into(),
            detail: None,
        }
    }
}

impl From<BackendError> for CommandError {
    fn from(err: BackendError) -> Self {
        if err.is_unavailable() {
            Self::BackendUnavailable(err.to_string())
        } else if err.is_not_found() {
            Self::EntityNotFound(err.to_string())
        } else {
            Self::Handler(err.to_string())
        }
    }
}

/// Failure of one entity's work inside a fan-out.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Why one fan-out task did not produce a result.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command key cannot be empty")]
    EmptyKey,

    #[error("command key '{0}' contains whitespace")]
    WhitespaceInKey(String),

    #[error("command key '{0}' is registered twice")]
    DuplicateKey(String),

    #[error("command '{0}' has no required permissions")]
    NoPermissions(String),

    #[error("command key '{shorter}' is a prefix of '{longer}'")]
    PrefixCollision { shorter: String, longer: String },

    #[error("no handler registered for command '{0}'")]
    MissingHandler(String),

    #[error("handler '{0}' has no registry entry")]
    UnknownHandler(String),
}
