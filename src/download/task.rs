use crate::core::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Requested media format, a small closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaFormat {
    /// Audio (primary format for playback resolution)
    Mp3,
    /// Video
    Mp4,
}

impl MediaFormat {
    /// String form used in the database and file extensions.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "mp3",
            MediaFormat::Mp4 => "mp4",
        }
    }

    /// Parses the database/file-extension form.
    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "mp3" => Ok(MediaFormat::Mp3),
            "mp4" => Ok(MediaFormat::Mp4),
            other => Err(AppError::Validation(format!("unknown format: {}", other))),
        }
    }

    /// The preferred-entry rule favors the audio-primary format.
    pub fn is_audio_primary(&self) -> bool {
        matches!(self, MediaFormat::Mp3)
    }
}

impl std::fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download task status.
///
/// State machine: `Queued → Processing → {Completed | Failed}`.
/// `Failed → Queued` via explicit retry. Cancellation is modeled as a
/// failure with a distinguished "cancelled by user" error, not a separate
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal states stay put until cleared or retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Denormalized display metadata carried on tasks and catalog entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackMeta {
    /// Track title
    pub title: String,
    /// Contributor (artist/channel)
    pub artist: String,
    /// Duration in seconds, if known
    pub duration_secs: Option<u32>,
    /// Free-form tags (moods, genres)
    pub tags: Vec<String>,
}

/// One in-flight or historical fetch request.
///
/// Created when a fetch is requested, mutated only by the download queue,
/// retained after reaching a terminal state until explicitly cleared.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Unique task identifier (UUID)
    pub id: String,
    /// Stable identifier of the media, independent of format or location
    pub content_id: String,
    /// Requested format
    pub format: MediaFormat,
    /// Current status
    pub status: TaskStatus,
    /// Progress 0-100, monotonic within a single run
    pub progress: u8,
    /// Observed transfer rate in bytes/second, while processing
    pub bytes_per_sec: Option<u64>,
    /// Estimated seconds remaining, while processing
    pub eta_secs: Option<u64>,
    /// Human-readable error, present iff status is `Failed`
    pub error: Option<String>,
    /// Final file path, set when the task completes
    pub file_path: Option<String>,
    /// Bytes written to disk, set on completion
    pub size_bytes: Option<u64>,
    /// Display metadata for the content
    pub meta: TrackMeta,
    /// Caller-visible retry counter; the queue itself enforces no cap
    pub retries: u32,
    /// Task creation timestamp
    pub created_at: DateTime<Utc>,
    /// Set when the task reaches a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    /// Creates a new queued task with an auto-generated UUID.
    pub fn new(content_id: String, format: MediaFormat, meta: TrackMeta) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content_id,
            format,
            status: TaskStatus::Queued,
            progress: 0,
            bytes_per_sec: None,
            eta_secs: None,
            error: None,
            file_path: None,
            size_bytes: None,
            meta,
            retries: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Lifecycle event kind emitted by the download queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEventKind {
    Added,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

/// A typed lifecycle notification.
///
/// Payloads carry exactly the task fields relevant to the transition, so a
/// UI layer can react without re-querying the queue.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub task_id: String,
    pub kind: DownloadEventKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
}

impl DownloadEvent {
    pub(crate) fn from_task(task: &DownloadTask, kind: DownloadEventKind) -> Self {
        Self {
            task_id: task.id.clone(),
            kind,
            status: task.status,
            progress: task.progress,
            error: task.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== MediaFormat Tests ====================

    #[test]
    fn test_media_format_roundtrip() {
        assert_eq!(MediaFormat::parse("mp3").unwrap(), MediaFormat::Mp3);
        assert_eq!(MediaFormat::parse("mp4").unwrap(), MediaFormat::Mp4);
        assert_eq!(MediaFormat::Mp3.as_str(), "mp3");
        assert_eq!(MediaFormat::Mp4.as_str(), "mp4");
    }

    #[test]
    fn test_media_format_rejects_unknown() {
        assert!(MediaFormat::parse("flac").is_err());
        assert!(MediaFormat::parse("").is_err());
    }

    #[test]
    fn test_audio_primary() {
        assert!(MediaFormat::Mp3.is_audio_primary());
        assert!(!MediaFormat::Mp4.is_audio_primary());
    }

    // ==================== TaskStatus Tests ====================

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    // ==================== DownloadTask Tests ====================

    #[test]
    fn test_download_task_new() {
        let task = DownloadTask::new(
            "yt:abc123".to_string(),
            MediaFormat::Mp3,
            TrackMeta {
                title: "Night Drive".to_string(),
                artist: "Neon Tide".to_string(),
                duration_secs: Some(215),
                tags: vec!["chill".to_string()],
            },
        );
        assert!(!task.id.is_empty());
        assert_eq!(task.content_id, "yt:abc123");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retries, 0);
        assert!(task.error.is_none());
        assert!(task.file_path.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_event_from_task_carries_transition_fields() {
        let mut task = DownloadTask::new("c1".to_string(), MediaFormat::Mp3, TrackMeta::default());
        task.status = TaskStatus::Failed;
        task.error = Some("cancelled by user".to_string());

        let event = DownloadEvent::from_task(&task, DownloadEventKind::Cancelled);
        assert_eq!(event.task_id, task.id);
        assert_eq!(event.kind, DownloadEventKind::Cancelled);
        assert_eq!(event.status, TaskStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("cancelled by user"));
    }
}
