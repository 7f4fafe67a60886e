//! Download pipeline: tasks, remote media access, and the bounded queue

pub mod fetch;
pub mod queue;
pub mod task;

pub use fetch::{HttpMediaSource, MediaSource, ProgressFn, ProgressUpdate};
pub use queue::DownloadQueue;
pub use task::{
    DownloadEvent, DownloadEventKind, DownloadTask, MediaFormat, TaskStatus, TrackMeta,
};
