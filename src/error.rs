use thiserror::Error;

use crate::model::Expect;

#[derive(Debug, Error)]
pub enum NntpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("unexpected response {got} (want {want}): {message}")]
    UnexpectedResponse {
        got: u16,
        want: Expect,
        message: String,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,
}
