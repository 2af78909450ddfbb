use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Input errors: surfaced to the caller, not retryable here.
    #[error("Media unreadable: {0}")]
    MediaUnreadable(String),

    #[error("Invalid device profile: {0}")]
    ProfileInvalid(String),

    #[error("Invalid field {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Transcoding capacity exhausted, try again later")]
    AdmissionFull,

    // Selection errors: the caller may relax preferences and retry.
    #[error("No provider can produce {0}")]
    NoCapableProvider(String),

    #[error("Provider busy: {0}")]
    ProviderBusy(String),

    // Execution errors: recorded on the session, no automatic retry.
    #[error("Encoder failed with exit code {exit_code}: {stderr_tail}")]
    EncoderFailed { exit_code: i32, stderr_tail: String },

    #[error("Packager failed with exit code {exit_code}: {stderr_tail}")]
    PackagerFailed { exit_code: i32, stderr_tail: String },

    #[error("Process lost: {0}")]
    ProcessLost(String),

    // Storage errors.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            // Map "no rows" to NotFound
            sqlx::Error::RowNotFound => Error::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().unwrap_or_default();
                match code.as_ref() {
                    // SQLite constraint violations (2067 unique, 1555 primary key)
                    "2067" | "1555" => Error::AlreadyExists("Resource already exists".to_string()),
                    // SQLite NOT NULL violation
                    "1299" => Error::Validation {
                        field: String::new(),
                        message: "Required field is missing".to_string(),
                    },
                    _ => Error::Database(err),
                }
            }
            _ => Error::Database(err),
        }
    }
}

impl Error {
    /// Validation error constructor used by request checks
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the error is a transient storage failure worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Database(sqlx::Error::Database(db_err)) => {
                // SQLITE_BUSY / SQLITE_LOCKED
                let code = db_err.code().unwrap_or_default();
                code.as_ref() == "5" || code.as_ref() == "6"
            }
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
