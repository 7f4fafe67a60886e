use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Configuration constants for the offline subsystem

/// Root folder for locally stored media files
/// Read from VIBEFLOW_LIBRARY_FOLDER environment variable
/// Supports tilde (~) expansion for home directory
pub static LIBRARY_FOLDER: Lazy<String> = Lazy::new(|| {
    env::var("VIBEFLOW_LIBRARY_FOLDER").unwrap_or_else(|_| "~/vibeflow/library".to_string())
});

/// Path to the SQLite database file (catalog entries + download history)
/// Read from VIBEFLOW_DATABASE_PATH environment variable
pub static DATABASE_PATH: Lazy<String> = Lazy::new(|| {
    env::var("VIBEFLOW_DATABASE_PATH").unwrap_or_else(|_| "vibeflow.sqlite".to_string())
});

/// Base URL of the remote extraction service
/// Read from VIBEFLOW_EXTRACTOR_URL environment variable
pub static EXTRACTOR_URL: Lazy<String> = Lazy::new(|| {
    env::var("VIBEFLOW_EXTRACTOR_URL").unwrap_or_else(|_| "http://localhost:8090".to_string())
});

/// Queue processing configuration
pub mod queue {
    use super::Duration;

    /// Maximum number of concurrent downloads
    pub const MAX_CONCURRENT_DOWNLOADS: usize = 3;

    /// Maximum number of tasks allowed in the queue to prevent unbounded memory growth
    pub const MAX_QUEUE_SIZE: usize = 1000;

    /// A processing task that receives no bytes for this long is failed
    pub const STALL_TIMEOUT_SECS: u64 = 60;

    /// Stall timeout duration
    pub fn stall_timeout() -> Duration {
        Duration::from_secs(STALL_TIMEOUT_SECS)
    }
}

/// Storage configuration
pub mod storage {
    /// Minimum free space required before a new download is accepted (200 MB)
    pub const MIN_FREE_SPACE_BYTES: u64 = 200 * 1024 * 1024;

    /// File extensions the storage policy accepts
    pub const ALLOWED_EXTENSIONS: [&str; 2] = ["mp3", "mp4"];
}

/// Eviction configuration
pub mod eviction {
    /// Entries never drop below this count unless explicitly removed
    pub const DEFAULT_KEEP_MINIMUM: usize = 10;
}

/// Network configuration
pub mod network {
    use super::Duration;

    /// Request timeout for HTTP requests (in seconds)
    pub const REQUEST_TIMEOUT_SECS: u64 = 300;

    /// Request timeout duration
    pub fn timeout() -> Duration {
        Duration::from_secs(REQUEST_TIMEOUT_SECS)
    }
}
