use thiserror::Error;

/// Centralized error types for the offline subsystem
///
/// All errors in the library are converted to this enum for consistent error handling.
/// Uses `thiserror` for automatic error conversion and display formatting.
///
/// Propagation policy: `Validation`, `Transport` and `Cancelled` errors that occur
/// while a download runs are captured on the task (surfaced via `DownloadTask::error`),
/// never returned to the caller. `NotFound` and `Capacity` are returned as explicit
/// failure results from `resolve`/`enqueue`. `Integrity` is handled inside the catalog
/// by degrading the entry to unavailable.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// HTTP/Fetch errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// Anyhow errors (for general error handling)
    #[error("Application error: {0}")]
    Anyhow(#[from] anyhow::Error),

    /// Bad path or format
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote fetch/extraction failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// User-initiated cancellation
    #[error("cancelled by user")]
    Cancelled,

    /// No content or entry to serve
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage policy rejected due to size/quota
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Catalog entry present but file missing on verification
    #[error("Integrity error: {0}")]
    Integrity(String),
}

impl AppError {
    /// Whether this error represents a user-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;
