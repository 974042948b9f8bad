use thiserror::Error;

/// Failure of a public dispatcher operation.
///
/// Every variant renders a human-readable reason; [`DispatchError::kind`]
/// gives a stable code for callers that map errors to responses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker initialization failed: {0}")]
    Initialization(String),

    #[error("Processing is already in progress")]
    AlreadyRunning,

    #[error("No processing to pause")]
    NotRunning,

    #[error("Processing is not paused")]
    NotPaused,

    #[error("No available workers: {0}")]
    NoAvailableWorkers(String),

    #[error("Dispatcher has shut down")]
    DispatcherGone,
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Config(_) => "configuration",
            DispatchError::Initialization(_) => "initialization",
            DispatchError::AlreadyRunning => "already_running",
            DispatchError::NotRunning => "not_running",
            DispatchError::NotPaused => "not_paused",
            DispatchError::NoAvailableWorkers(_) => "no_available_workers",
            DispatchError::DispatcherGone => "dispatcher_gone",
        }
    }
}

impl From<bulk_config::ConfigError> for DispatchError {
    fn from(err: bulk_config::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}

impl From<bulk_common::DestinationError> for DispatchError {
    fn from(err: bulk_common::DestinationError) -> Self {
        DispatchError::Config(err.to_string())
    }
}
