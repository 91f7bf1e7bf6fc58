pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("remote service error (code {code}): {message}")]
    Protocol { code: i64, message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("{what} still pending after {attempts} attempts")]
    Timeout { what: &'static str, attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload cancelled")]
    Cancelled,
}
