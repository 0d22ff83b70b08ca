use thiserror::Error;

/// Reasons a call was refused before a run could begin
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Another execution or a context load is in flight
    #[error("Sandbox is busy")]
    Busy,

    /// The isolated context could not initialize
    #[error("Sandbox failed to load: {0}")]
    LoadFailure(String),

    /// The submission does not fit in one execution-channel frame
    #[error("Code is too large: request of {len} bytes exceeds the {max} byte frame limit")]
    CodeTooLarge { len: usize, max: usize },

    /// The request could not be encoded for the execution channel
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The controller was torn down; call `recreate` first
    #[error("Sandbox has been torn down")]
    Terminated,

    /// The driver task is gone (every handle dropped or it panicked)
    #[error("Sandbox controller is no longer running")]
    ControllerGone,
}

/// Configuration problems
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
