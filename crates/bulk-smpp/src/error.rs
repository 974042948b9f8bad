use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SmppError>;

#[derive(Error, Debug)]
pub enum SmppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Bind rejected with status {0:#010x}")]
    BindRejected(u32),

    #[error("No response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("Session closed")]
    SessionClosed,

    #[error("Peer answered generic_nack with status {0:#010x}")]
    GenericNack(u32),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl SmppError {
    /// True when the underlying transport is gone and the session must be re-established.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SmppError::Io(_)
                | SmppError::Framing(_)
                | SmppError::ConnectTimeout { .. }
                | SmppError::SessionClosed
                | SmppError::ResponseTimeout(_)
        )
    }
}
