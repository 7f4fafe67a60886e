//! Remote media access: stream-handle resolution and byte transfer
//!
//! `MediaSource` is the crate's view of the external extraction service.
//! The resolver uses `stream_handle` on cache miss; the download queue uses
//! both calls to obtain bytes to persist. Progress is reported from genuine
//! byte counts, never simulated.

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A genuine progress sample taken from the transfer.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    /// Percent complete (0-100); stays at 0 when the total size is unknown
    pub percent: u8,
    /// Observed transfer rate in bytes/second
    pub bytes_per_sec: u64,
    /// Estimated seconds remaining, when the total size is known
    pub eta_secs: Option<u64>,
}

/// Callback invoked as bytes arrive.
pub type ProgressFn<'a> = &'a (dyn Fn(ProgressUpdate) + Send + Sync);

/// Access to remote media: handle resolution plus byte transfer.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Asks the extraction service for a dereferenceable stream address.
    async fn stream_handle(&self, content_id: &str, quality: Option<&str>) -> AppResult<String>;

    /// Streams the handle's bytes to `dest`, reporting progress per chunk.
    ///
    /// Honors `cancel` between chunks; a transfer that receives no bytes
    /// for the configured stall timeout fails with a transport error.
    async fn fetch(
        &self,
        handle: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> AppResult<u64>;
}

/// Production source backed by the HTTP extraction service.
pub struct HttpMediaSource {
    client: reqwest::Client,
    api_base: Url,
    stall_timeout: Duration,
}

impl HttpMediaSource {
    /// Creates a source talking to the extraction service at `api_base`.
    pub fn new(api_base: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config::network::timeout())
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base,
            stall_timeout: config::queue::stall_timeout(),
        }
    }

    /// Overrides the per-chunk stall timeout.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Source pointed at the configured extractor endpoint.
    pub fn from_config() -> AppResult<Self> {
        let base = Url::parse(&config::EXTRACTOR_URL)?;
        Ok(Self::new(base))
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn stream_handle(&self, content_id: &str, quality: Option<&str>) -> AppResult<String> {
        let mut url = self.api_base.join(&format!("stream/{}", content_id))?;
        if let Some(q) = quality {
            url.query_pairs_mut().append_pair("quality", q);
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("extractor request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Transport(format!(
                "extractor returned {} for {}",
                response.status(),
                content_id
            )));
        }

        let handle = response
            .text()
            .await
            .map_err(|e| AppError::Transport(format!("extractor response unreadable: {}", e)))?;
        let handle = handle.trim().to_string();
        if handle.is_empty() {
            return Err(AppError::Transport(format!(
                "extractor returned empty handle for {}",
                content_id
            )));
        }
        Ok(handle)
    }

    async fn fetch(
        &self,
        handle: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> AppResult<u64> {
        let response = self
            .client
            .get(handle)
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Transport(format!(
                "fetch returned {} for {}",
                response.status(),
                handle
            )));
        }

        let total = response.content_length();
        let mut stream = response.bytes_stream();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;

        let started = Instant::now();
        let mut written: u64 = 0;
        // Any failure past this point must also remove the partial file,
        // so errors funnel through one exit below instead of returning early
        let mut failure: Option<AppError> = None;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    failure = Some(AppError::Cancelled);
                    break;
                }
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => match next {
                    Err(_) => {
                        failure = Some(AppError::Transport(format!(
                            "no progress for {:?}",
                            self.stall_timeout
                        )));
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        failure = Some(AppError::Transport(format!("stream error: {}", e)));
                        break;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                },
            };

            if let Err(e) = file.write_all(&chunk).await {
                failure = Some(e.into());
                break;
            }
            written += chunk.len() as u64;

            let elapsed = started.elapsed().as_secs_f64().max(0.001);
            let rate = (written as f64 / elapsed) as u64;
            let (percent, eta) = match total {
                Some(total) if total > 0 => {
                    let pct = ((written * 100) / total).min(100) as u8;
                    let eta = if rate > 0 {
                        Some(total.saturating_sub(written) / rate.max(1))
                    } else {
                        None
                    };
                    (pct, eta)
                }
                _ => (0, None),
            };
            progress(ProgressUpdate {
                percent,
                bytes_per_sec: rate,
                eta_secs: eta,
            });
        }

        if failure.is_none() {
            if let Err(e) = file.flush().await {
                failure = Some(e.into());
            }
        }
        drop(file);

        if let Some(e) = failure {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e);
        }

        log::debug!("Fetched {} bytes to {}", written, dest.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum ServeMode {
        /// Content-Length matches the body
        Complete,
        /// Body is advertised longer; the socket then goes silent
        Stall,
        /// Body is advertised longer; the socket then closes
        Truncate,
    }

    /// One-shot HTTP responder on a local port; returns the media URL.
    async fn serve(chunks: Vec<Vec<u8>>, mode: ServeMode) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;

            let sent: usize = chunks.iter().map(|c| c.len()).sum();
            let advertised = match mode {
                ServeMode::Complete => sent,
                ServeMode::Stall | ServeMode::Truncate => sent + 4096,
            };
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                advertised
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            for chunk in &chunks {
                socket.write_all(chunk).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            match mode {
                ServeMode::Complete | ServeMode::Truncate => {}
                ServeMode::Stall => tokio::time::sleep(Duration::from_secs(300)).await,
            }
        });
        format!("http://{}/media", addr)
    }

    fn source() -> HttpMediaSource {
        HttpMediaSource::new(Url::parse("http://127.0.0.1:1/").unwrap())
    }

    // ==================== HttpMediaSource Tests ====================

    #[test]
    fn test_http_media_source_builds_from_config() {
        // EXTRACTOR_URL defaults to a parseable localhost address
        assert!(HttpMediaSource::from_config().is_ok());
    }

    #[test]
    fn test_progress_update_fields() {
        let update = ProgressUpdate {
            percent: 40,
            bytes_per_sec: 2048,
            eta_secs: Some(12),
        };
        assert_eq!(update.percent, 40);
        assert_eq!(update.eta_secs, Some(12));
    }

    #[tokio::test]
    async fn test_fetch_streams_to_disk_with_real_progress() {
        let url = serve(vec![vec![1u8; 4096], vec![2u8; 4096]], ServeMode::Complete).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("track.mp3");

        let last_percent = Arc::new(AtomicU8::new(0));
        let seen = Arc::clone(&last_percent);
        let cancel = CancellationToken::new();
        let written = source()
            .fetch(&url, &dest, &cancel, &move |u: ProgressUpdate| {
                seen.store(u.percent, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(written, 8192);
        assert_eq!(last_percent.load(Ordering::SeqCst), 100);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 8192);
    }

    #[tokio::test]
    async fn test_fetch_stall_fails_and_removes_partial_file() {
        let url = serve(vec![vec![1u8; 2048]], ServeMode::Stall).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("stalled.mp3");

        let cancel = CancellationToken::new();
        let result = source()
            .with_stall_timeout(Duration::from_millis(200))
            .fetch(&url, &dest, &cancel, &|_| {})
            .await;

        match result {
            Err(AppError::Transport(msg)) => assert!(msg.contains("no progress")),
            other => panic!("expected stall transport error, got {:?}", other),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_stream_error_removes_partial_file() {
        let url = serve(vec![vec![1u8; 2048]], ServeMode::Truncate).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("truncated.mp3");

        let cancel = CancellationToken::new();
        let result = source().fetch(&url, &dest, &cancel, &|_| {}).await;

        assert!(matches!(result, Err(AppError::Transport(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_cancel_removes_partial_file() {
        let url = serve(vec![vec![1u8; 2048]], ServeMode::Stall).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("cancelled.mp3");

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = source().fetch(&url, &dest, &cancel, &|_| {}).await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(!dest.exists());
    }
}
