//! Playback source resolution: local copy first, remote stream as fallback
//!
//! The resolver turns a content id into something a player can open. It
//! consults the content catalog before touching the network and keeps a
//! cache of resolved local handles so repeat resolutions of the same track
//! stay off the catalog's write path.

use crate::catalog::ContentCatalog;
use crate::core::error::{AppError, AppResult};
use crate::download::fetch::MediaSource;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where a playback handle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A file on the local storage medium
    Local,
    /// A remote stream address from the extraction service
    Remote,
}

/// An address a player can open, local path or remote stream URL.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    pub kind: HandleKind,
    /// File path for `Local`, stream URL for `Remote`
    pub address: String,
    /// Backing catalog entry, present for `Local`
    pub entry_id: Option<String>,
    /// Quality hint the handle was resolved with, for `Remote`
    pub quality: Option<String>,
}

/// Knobs for one resolution.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Consult the catalog before the network
    pub prefer_local: bool,
    /// Fall back to a remote stream when no local copy serves
    pub fallback_to_remote: bool,
    /// Quality hint passed through to the extraction service
    pub quality: Option<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            prefer_local: true,
            fallback_to_remote: true,
            quality: None,
        }
    }
}

/// Resolves content ids to playback handles, local-first.
pub struct SourceResolver {
    catalog: Arc<ContentCatalog>,
    source: Arc<dyn MediaSource>,
    /// Resolved local handles keyed by catalog entry id. Remote handles are
    /// not cached; stream addresses from the extractor can expire.
    handles: Mutex<HashMap<String, PlaybackHandle>>,
}

impl SourceResolver {
    pub fn new(catalog: Arc<ContentCatalog>, source: Arc<dyn MediaSource>) -> Self {
        Self {
            catalog,
            source,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a content id to a playback handle.
    ///
    /// Local resolution wins whenever the catalog holds a verified copy;
    /// the network is never touched in that case. With no usable local
    /// copy and fallback enabled, the extraction service provides a remote
    /// stream address. Otherwise the resolution fails with `NotFound`.
    pub async fn resolve(
        &self,
        content_id: &str,
        options: &ResolveOptions,
    ) -> AppResult<PlaybackHandle> {
        if options.prefer_local {
            if let Some(handle) = self.resolve_local(content_id).await {
                return Ok(handle);
            }
        }

        if options.fallback_to_remote {
            let address = self
                .source
                .stream_handle(content_id, options.quality.as_deref())
                .await?;
            log::debug!("Resolved {} to remote stream", content_id);
            return Ok(PlaybackHandle {
                kind: HandleKind::Remote,
                address,
                entry_id: None,
                quality: options.quality.clone(),
            });
        }

        Err(AppError::NotFound(format!(
            "no playback source available for {}",
            content_id
        )))
    }

    /// Local path of the resolution: the catalog's preferred entry,
    /// re-verified against the filesystem, served from the handle cache on
    /// repeated plays of the same entry.
    async fn resolve_local(&self, content_id: &str) -> Option<PlaybackHandle> {
        let entry = self.catalog.preferred_entry(content_id).await?;
        if !self.catalog.verify_availability(&entry.id).await {
            // The file vanished; a stale handle must not outlive it
            self.handles.lock().await.remove(&entry.id);
            return None;
        }
        if let Err(e) = self.catalog.touch(&entry.id).await {
            log::warn!("Failed to touch entry {}: {}", entry.id, e);
        }

        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&entry.id) {
            return Some(handle.clone());
        }

        let handle = PlaybackHandle {
            kind: HandleKind::Local,
            address: entry.file_path.clone(),
            entry_id: Some(entry.id.clone()),
            quality: None,
        };
        handles.insert(entry.id.clone(), handle.clone());
        log::debug!("Resolved {} to local entry {}", content_id, entry.id);
        Some(handle)
    }

    /// Whether a verified local copy exists for the content id.
    pub async fn can_serve_locally(&self, content_id: &str) -> bool {
        match self.catalog.preferred_entry(content_id).await {
            Some(entry) => self.catalog.verify_availability(&entry.id).await,
            None => false,
        }
    }

    /// Warms the handle cache for a content id without handing a handle
    /// to the caller.
    ///
    /// Local-only and best-effort: returns whether a handle was cached,
    /// and nothing here ever fails the caller.
    pub async fn preload(&self, content_id: &str) -> bool {
        let warmed = self.resolve_local(content_id).await.is_some();
        log::debug!("Preload {}: {}", content_id, warmed);
        warmed
    }

    /// Drops the cached handle for a catalog entry.
    ///
    /// Called when the entry is removed or evicted.
    pub async fn invalidate(&self, entry_id: &str) {
        self.handles.lock().await.remove(entry_id);
    }

    /// Drops all cached handles.
    pub async fn clear_cache(&self) {
        self.handles.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NewEntry;
    use crate::core::error::AppResult;
    use crate::download::fetch::ProgressFn;
    use crate::download::task::{MediaFormat, TrackMeta};
    use crate::storage::db::{self, DbPool};
    use crate::storage::policy::{LocalStoragePolicy, StoragePolicy};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Counts remote calls; resolution tests assert the network stays cold.
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaSource for CountingSource {
        async fn stream_handle(
            &self,
            content_id: &str,
            quality: Option<&str>,
        ) -> AppResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match quality {
                Some(q) => format!("https://stream.example/{}?quality={}", content_id, q),
                None => format!("https://stream.example/{}", content_id),
            })
        }

        async fn fetch(
            &self,
            _handle: &str,
            _dest: &Path,
            _cancel: &CancellationToken,
            _progress: ProgressFn<'_>,
        ) -> AppResult<u64> {
            unreachable!("resolution never transfers bytes")
        }
    }

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<ContentCatalog>,
        source: Arc<CountingSource>,
        resolver: SourceResolver,
        library: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("resolver.sqlite");
        let pool = Arc::new(db::create_pool(db_path.to_str().unwrap()).unwrap());
        let library = dir.path().join("library");
        let policy = Arc::new(LocalStoragePolicy::new(library.to_str().unwrap()).unwrap());
        let catalog = Arc::new(
            ContentCatalog::open(Arc::clone(&pool), policy as Arc<dyn StoragePolicy>)
                .await
                .unwrap(),
        );
        let source = Arc::new(CountingSource::new());
        let resolver = SourceResolver::new(
            Arc::clone(&catalog),
            Arc::clone(&source) as Arc<dyn MediaSource>,
        );
        Fixture {
            _dir: dir,
            catalog,
            source,
            resolver,
            library,
        }
    }

    async fn register_local(fx: &Fixture, content_id: &str, name: &str) -> String {
        let path = fx.library.join(name);
        std::fs::write(&path, b"bytes").unwrap();
        let entry = fx
            .catalog
            .register(NewEntry {
                content_id: content_id.to_string(),
                file_path: path.to_string_lossy().to_string(),
                format: MediaFormat::Mp3,
                size_bytes: 5,
                meta: TrackMeta::default(),
            })
            .await
            .unwrap();
        entry.id
    }

    // ==================== Local-first Tests ====================

    #[tokio::test]
    async fn test_resolve_local_never_calls_remote() {
        let fx = fixture().await;
        register_local(&fx, "c1", "c1.mp3").await;

        let handle = fx
            .resolver
            .resolve("c1", &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.kind, HandleKind::Local);
        assert!(handle.address.ends_with("c1.mp3"));
        assert!(handle.entry_id.is_some());
        assert_eq!(fx.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_touches_entry() {
        let fx = fixture().await;
        let entry_id = register_local(&fx, "c1", "c1.mp3").await;
        let before = fx
            .catalog
            .entries_for("c1")
            .await
            .into_iter()
            .find(|e| e.id == entry_id)
            .unwrap()
            .last_accessed;

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        fx.resolver
            .resolve("c1", &ResolveOptions::default())
            .await
            .unwrap();

        let after = fx
            .catalog
            .entries_for("c1")
            .await
            .into_iter()
            .find(|e| e.id == entry_id)
            .unwrap()
            .last_accessed;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_repeat_resolution_uses_cached_handle() {
        let fx = fixture().await;
        register_local(&fx, "c1", "c1.mp3").await;

        let first = fx
            .resolver
            .resolve("c1", &ResolveOptions::default())
            .await
            .unwrap();
        let second = fx
            .resolver
            .resolve("c1", &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(first.address, second.address);
        assert_eq!(fx.source.calls(), 0);
    }

    // ==================== Fallback Tests ====================

    #[tokio::test]
    async fn test_resolve_falls_back_to_remote() {
        let fx = fixture().await;

        let handle = fx
            .resolver
            .resolve("c-remote", &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.kind, HandleKind::Remote);
        assert!(handle.address.contains("c-remote"));
        assert!(handle.entry_id.is_none());
        assert_eq!(fx.source.calls(), 1);
    }

    #[tokio::test]
    async fn test_resolve_passes_quality_hint() {
        let fx = fixture().await;

        let handle = fx
            .resolver
            .resolve(
                "c-remote",
                &ResolveOptions {
                    quality: Some("high".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(handle.address.contains("quality=high"));
        assert_eq!(handle.quality.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn test_no_local_no_fallback_is_not_found() {
        let fx = fixture().await;

        let result = fx
            .resolver
            .resolve(
                "c-missing",
                &ResolveOptions {
                    fallback_to_remote: false,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        // The network was never consulted
        assert_eq!(fx.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_prefer_local_false_goes_remote() {
        let fx = fixture().await;
        register_local(&fx, "c1", "c1.mp3").await;

        let handle = fx
            .resolver
            .resolve(
                "c1",
                &ResolveOptions {
                    prefer_local: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(handle.kind, HandleKind::Remote);
        assert_eq!(fx.source.calls(), 1);
    }

    // ==================== Degradation Tests ====================

    #[tokio::test]
    async fn test_missing_file_degrades_to_remote() {
        let fx = fixture().await;
        register_local(&fx, "c1", "c1.mp3").await;

        // Resolve once to populate the cache, then pull the file out
        fx.resolver
            .resolve("c1", &ResolveOptions::default())
            .await
            .unwrap();
        std::fs::remove_file(fx.library.join("c1.mp3")).unwrap();

        let handle = fx
            .resolver
            .resolve("c1", &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.kind, HandleKind::Remote);
        assert_eq!(fx.source.calls(), 1);
    }

    #[tokio::test]
    async fn test_can_serve_locally() {
        let fx = fixture().await;
        assert!(!fx.resolver.can_serve_locally("c1").await);

        register_local(&fx, "c1", "c1.mp3").await;
        assert!(fx.resolver.can_serve_locally("c1").await);

        std::fs::remove_file(fx.library.join("c1.mp3")).unwrap();
        assert!(!fx.resolver.can_serve_locally("c1").await);
    }

    // ==================== Cache-management Tests ====================

    #[tokio::test]
    async fn test_preload_warms_cache_without_remote_calls() {
        let fx = fixture().await;
        let e1 = register_local(&fx, "c1", "c1.mp3").await;
        let e2 = register_local(&fx, "c2", "c2.mp3").await;

        assert!(fx.resolver.preload("c1").await);
        assert!(fx.resolver.preload("c2").await);
        assert!(!fx.resolver.preload("c-absent").await);
        assert_eq!(fx.source.calls(), 0);

        let handles = fx.resolver.handles.lock().await;
        assert!(handles.contains_key(&e1));
        assert!(handles.contains_key(&e2));
        assert_eq!(handles.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_verification_drops_cached_handle() {
        let fx = fixture().await;
        let entry_id = register_local(&fx, "c1", "c1.mp3").await;
        assert!(fx.resolver.preload("c1").await);
        assert!(fx.resolver.handles.lock().await.contains_key(&entry_id));

        std::fs::remove_file(fx.library.join("c1.mp3")).unwrap();

        let handle = fx
            .resolver
            .resolve("c1", &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.kind, HandleKind::Remote);
        // The stale local handle went with the file
        assert!(!fx.resolver.handles.lock().await.contains_key(&entry_id));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let fx = fixture().await;
        let e1 = register_local(&fx, "c1", "c1.mp3").await;
        let e2 = register_local(&fx, "c2", "c2.mp3").await;
        fx.resolver.preload("c1").await;
        fx.resolver.preload("c2").await;

        fx.resolver.invalidate(&e1).await;
        {
            let handles = fx.resolver.handles.lock().await;
            assert!(!handles.contains_key(&e1));
            assert!(handles.contains_key(&e2));
        }

        fx.resolver.clear_cache().await;
        assert!(fx.resolver.handles.lock().await.is_empty());
    }
}
