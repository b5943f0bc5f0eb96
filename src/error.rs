use thiserror::Error;

/// Failure taxonomy shared by the session client, feed fetcher, dedup store
/// and dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Credential rejected or expired, after one re-authentication attempt
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure, timeout or 5xx after the retry budget was spent
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Non-auth 4xx or an explicit rejection; never retried
    #[error("request rejected: {0}")]
    Request(String),

    /// Feed unreachable or malformed
    #[error("feed fetch failed: {0}")]
    Fetch(String),

    /// Dedup persistence unavailable
    #[error("dedup store unavailable: {0}")]
    Store(String),

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Auth(_) => "auth",
            Error::Transient(_) => "transient",
            Error::Request(_) => "request",
            Error::Fetch(_) => "fetch",
            Error::Store(_) => "store",
            Error::Cancelled => "cancelled",
        }
    }

    /// Whether the rest of a feed cycle should be abandoned after this error.
    ///
    /// Request errors only concern one (rule, item) pair; everything else means
    /// the remote or the store is unusable for now.
    pub fn ends_cycle(&self) -> bool {
        !matches!(self, Error::Request(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
