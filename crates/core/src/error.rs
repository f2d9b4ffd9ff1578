use thiserror::Error;

/// Why a single step could not be carried out. Any of these halts the run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("no previous position to move relative to")]
    MissingPosition,

    #[error("missing parameter '{0}'")]
    MissingParam(String),

    #[error("invalid value for '{name}': {value}")]
    InvalidParam { name: String, value: String },

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("no window title contains '{0}'")]
    WindowNotFound(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Platform(#[from] anyhow::Error),
}

impl StepError {
    pub fn invalid(name: &str, value: impl std::fmt::Display) -> Self {
        StepError::InvalidParam { name: name.to_string(), value: value.to_string() }
    }
}
