//! Vibeflow offline core - local library and download engine for mood-based
//! music discovery
//!
//! This library provides the offline subsystem of the Vibeflow client:
//! downloading tracks with bounded concurrency, cataloging the local copies,
//! and resolving playback sources local-first.
//!
//! # Module Structure
//!
//! - `core`: Configuration, errors, and logging
//! - `storage`: SQLite persistence and the on-disk storage policy
//! - `catalog`: Durable index of locally retrieved media
//! - `download`: Download tasks, remote media access, and the bounded queue
//! - `resolver`: Local-first playback source resolution

pub mod catalog;
pub mod core;
pub mod download;
pub mod resolver;
pub mod storage;

// Re-export commonly used types for convenience
pub use crate::core::{config, AppError, AppResult};
pub use catalog::{CatalogEntry, CatalogStats, ContentCatalog, EvictCriteria, NewEntry};
pub use download::{
    DownloadEvent, DownloadEventKind, DownloadQueue, DownloadTask, HttpMediaSource, MediaFormat,
    MediaSource, ProgressUpdate, TaskStatus, TrackMeta,
};
pub use resolver::{HandleKind, PlaybackHandle, ResolveOptions, SourceResolver};
pub use storage::{
    create_pool, get_connection, DbConnection, DbPool, LocalStoragePolicy, PathOptions,
    StoragePolicy, StorageStats,
};
