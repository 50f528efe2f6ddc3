use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Archive failed: {0}")]
    Archive(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Retention scan failed: {0}")]
    Retention(String),

    #[error("Job already in flight: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command execution failed ({status}): {stderr}")]
    Command { status: String, stderr: String },

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl From<sqlx::Error> for BackupError {
    fn from(err: sqlx::Error) -> Self {
        BackupError::Connection(err.to_string())
    }
}

impl From<mongodb::error::Error> for BackupError {
    fn from(err: mongodb::error::Error) -> Self {
        BackupError::Export(err.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(err: reqwest::Error) -> Self {
        BackupError::Delivery(err.to_string())
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        BackupError::Archive(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
