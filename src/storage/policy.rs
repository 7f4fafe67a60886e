//! Storage policy: sanitized on-disk paths and capacity queries
//!
//! The download queue and catalog depend only on the `StoragePolicy`
//! signatures, not on how paths are laid out. Path generation is pure and
//! stateless; it may be called concurrently without coordination.

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::download::task::MediaFormat;
use std::path::{Component, Path, PathBuf};

/// Options for path generation.
#[derive(Debug, Clone, Default)]
pub struct PathOptions {
    /// Optional subdirectory under the library root (e.g. a playlist name)
    pub subdir: Option<String>,
}

/// Capacity and usage figures for the storage medium.
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Bytes occupied by files under the library root
    pub total_size: u64,
    /// Free bytes on the underlying filesystem
    pub available_space: u64,
    /// Number of files under the library root
    pub file_count: u64,
}

impl StorageStats {
    /// Whether a new download should be accepted.
    pub fn has_enough_space(&self) -> bool {
        self.available_space >= config::storage::MIN_FREE_SPACE_BYTES
    }
}

/// Generates sanitized, validated on-disk paths and answers capacity queries.
pub trait StoragePolicy: Send + Sync {
    /// Builds a safe target path for a piece of content.
    fn generate_path(
        &self,
        content_id: &str,
        format: MediaFormat,
        options: &PathOptions,
    ) -> AppResult<PathBuf>;

    /// Safety check: inside the allowed root, allowed extension, no traversal.
    fn validate_path(&self, path: &Path) -> bool;

    /// Capacity and usage of the storage medium.
    fn stats(&self) -> AppResult<StorageStats>;

    /// Whether the file at `path` currently exists.
    fn exists(&self, path: &Path) -> bool;

    /// Removes the file at `path`. Returns false if nothing was removed.
    fn delete(&self, path: &Path) -> bool;
}

/// Sanitizes a filename by removing filesystem-unsafe characters.
///
/// Removes path separators (`/`, `\`), reserved characters
/// (`:`, `*`, `?`, `"`, `<`, `>`, `|`) and ASCII control characters.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !['/', '\\', ':', '*', '?', '"', '<', '>', '|'].contains(c))
        .filter(|c| !c.is_control())
        .collect()
}

/// Filesystem-backed policy rooted at a single library directory.
pub struct LocalStoragePolicy {
    root: PathBuf,
}

impl LocalStoragePolicy {
    /// Creates a policy rooted at `root`, expanding a leading tilde.
    ///
    /// The directory is created if it does not exist.
    pub fn new(root: &str) -> AppResult<Self> {
        let expanded = shellexpand::tilde(root).into_owned();
        let root = PathBuf::from(expanded);
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Policy rooted at the configured library folder.
    pub fn from_config() -> AppResult<Self> {
        Self::new(&config::LIBRARY_FOLDER)
    }

    /// The library root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn extension_allowed(ext: &str) -> bool {
        config::storage::ALLOWED_EXTENSIONS.contains(&ext)
    }
}

impl StoragePolicy for LocalStoragePolicy {
    fn generate_path(
        &self,
        content_id: &str,
        format: MediaFormat,
        options: &PathOptions,
    ) -> AppResult<PathBuf> {
        let stem = sanitize_filename(content_id);
        if stem.is_empty() {
            return Err(AppError::Validation(format!(
                "content id '{}' is empty after sanitization",
                content_id
            )));
        }

        let mut path = self.root.clone();
        if let Some(ref subdir) = options.subdir {
            let safe = sanitize_filename(subdir);
            if !safe.is_empty() {
                path.push(safe);
            }
        }
        path.push(format!("{}.{}", stem, format.as_str()));
        Ok(path)
    }

    fn validate_path(&self, path: &Path) -> bool {
        // Traversal components are rejected outright rather than stripped;
        // generate_path never produces them.
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return false;
        }

        if !path.starts_with(&self.root) {
            return false;
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => Self::extension_allowed(ext),
            None => false,
        }
    }

    fn stats(&self) -> AppResult<StorageStats> {
        let mut total_size = 0u64;
        let mut file_count = 0u64;

        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    dirs.push(entry.path());
                } else {
                    total_size += meta.len();
                    file_count += 1;
                }
            }
        }

        Ok(StorageStats {
            total_size,
            available_space: available_space(&self.root)?,
            file_count,
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn delete(&self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to delete {}: {}", path.display(), e);
                false
            }
        }
    }
}

/// Free space on the filesystem holding `path`, via `df`.
///
/// Works on Linux and macOS; the `df -k` output format is stable enough.
fn available_space(path: &Path) -> AppResult<u64> {
    let output = std::process::Command::new("df")
        .args(["-k"])
        .arg(path)
        .output()
        .map_err(|e| AppError::Transport(format!("Failed to run df command: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::Transport(format!(
            "df command failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| AppError::Transport("Unexpected df output format".to_string()))?;

    // df output: Filesystem 1K-blocks Used Available Use% Mounted
    let available_kb: u64 = line
        .split_whitespace()
        .nth(3)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AppError::Transport("Failed to parse available blocks".to_string()))?;

    Ok(available_kb * 1024)
}
