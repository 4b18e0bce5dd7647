use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("unknown request type: '{0}'")]
    UnknownRequestType(String),

    #[error("invalid password")]
    InvalidPassword,

    /// Request payload failed validation. The message is returned to the
    /// client verbatim in the response's `error` field.
    #[error("{0}")]
    Invalid(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("socket closed")]
    SocketClosed,

    /// Error reported by the peer in a response's `error` field.
    #[error("{0}")]
    Remote(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("launcher error: {0}")]
    Launcher(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FabricError>;
