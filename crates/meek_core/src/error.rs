use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeekError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Broker or cache unreachable, publish failed while disconnected, and
    /// similar transient transport conditions. Retried by the caller; only
    /// surfaced to users when every retry is exhausted.
    #[error("transport: {0}")]
    Transport(String),

    /// The operation needs a subsystem that is not currently available
    /// (e.g. no marketplace API key configured).
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MeekError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            Self::Conflict(_) => 409,
            Self::Transport(_) => 502,
            Self::Unavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }
}
