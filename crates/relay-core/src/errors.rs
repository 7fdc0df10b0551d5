use std::io;

/// Core error type for the relay.
///
/// Adapter crates map their specific errors into this type so modules can tell
/// configuration mistakes apart from credential problems and transient I/O.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("module {module} failed to start: {reason}")]
    ModuleStart { module: String, reason: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// True for the "resource busy" condition the state store retries internally.
    pub fn is_resource_busy(&self) -> bool {
        matches!(self, Error::Io(e) if is_busy(e))
    }
}

fn is_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ResourceBusy
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
