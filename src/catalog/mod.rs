//! Content catalog: durable index of locally retrieved media
//!
//! The catalog exclusively owns `CatalogEntry` values and is the only
//! writer of their availability and last-accessed fields. Lookups never
//! fail because a file went missing; availability is degraded instead and
//! verified lazily.

use crate::core::config;
use crate::core::error::AppResult;
use crate::download::task::{MediaFormat, TrackMeta};
use crate::storage::db::{self, DbPool};
use crate::storage::policy::StoragePolicy;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One durably stored local copy of a piece of content.
///
/// A content id may have multiple entries across formats; at most one entry
/// exists per (content id, format, file path) triple.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Unique entry identifier (UUID)
    pub id: String,
    /// Stable content identifier, independent of format or storage location
    pub content_id: String,
    /// Absolute path of the local file
    pub file_path: String,
    /// Stored format
    pub format: MediaFormat,
    /// File size in bytes
    pub size_bytes: u64,
    /// When the file was retrieved
    pub retrieved_at: DateTime<Utc>,
    /// Updated on every playback resolution
    pub last_accessed: DateTime<Utc>,
    /// Display title
    pub title: String,
    /// Contributor (artist/channel)
    pub artist: String,
    /// Duration in seconds, if known
    pub duration_secs: Option<u32>,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Eventually consistent with actual file presence
    pub available: bool,
}

/// Input for registering a freshly downloaded file.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub content_id: String,
    pub file_path: String,
    pub format: MediaFormat,
    pub size_bytes: u64,
    pub meta: TrackMeta,
}

/// Criteria for the eviction routine. All parts are optional and combine.
#[derive(Debug, Clone, Default)]
pub struct EvictCriteria {
    /// Remove entries whose last access predates now minus this age
    pub max_age: Option<Duration>,
    /// Total-bytes budget; oldest-accessed entries are removed until met
    pub max_total_bytes: Option<u64>,
    /// Never let the remaining count drop below this floor
    pub keep_minimum: Option<usize>,
}

impl EvictCriteria {
    /// Applies the configured keep-minimum floor unless one is already set.
    pub fn with_default_floor(mut self) -> Self {
        self.keep_minimum
            .get_or_insert(config::eviction::DEFAULT_KEEP_MINIMUM);
        self
    }
}

/// Aggregate catalog statistics.
#[derive(Debug, Clone)]
pub struct CatalogStats {
    pub count: usize,
    pub total_bytes: u64,
    pub by_format: HashMap<MediaFormat, usize>,
    pub by_tag: HashMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CatalogIndex {
    entries: HashMap<String, CatalogEntry>,
    by_content: HashMap<String, Vec<String>>,
}

impl CatalogIndex {
    fn insert(&mut self, entry: CatalogEntry) {
        self.by_content
            .entry(entry.content_id.clone())
            .or_default()
            .push(entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, entry_id: &str) -> Option<CatalogEntry> {
        let entry = self.entries.remove(entry_id)?;
        if let Some(ids) = self.by_content.get_mut(&entry.content_id) {
            ids.retain(|id| id != entry_id);
            if ids.is_empty() {
                self.by_content.remove(&entry.content_id);
            }
        }
        Some(entry)
    }
}

/// Durable index of every successfully retrieved file.
pub struct ContentCatalog {
    index: RwLock<CatalogIndex>,
    pool: Arc<DbPool>,
    policy: Arc<dyn StoragePolicy>,
}

impl ContentCatalog {
    /// Opens the catalog: loads persisted entries and reconciles them with
    /// the download-history record.
    ///
    /// Two-way reconciliation: completed downloads missing from the entry
    /// set are added; entries whose file no longer exists are pruned. The
    /// persisted state and the history log can diverge after an
    /// interrupted process.
    pub async fn open(pool: Arc<DbPool>, policy: Arc<dyn StoragePolicy>) -> AppResult<Self> {
        let catalog = Self {
            index: RwLock::new(CatalogIndex::default()),
            pool,
            policy,
        };
        catalog.rebuild().await?;
        Ok(catalog)
    }

    /// Reloads the in-memory index from the database and re-runs
    /// reconciliation against the download history.
    pub async fn rebuild(&self) -> AppResult<()> {
        let conn = db::get_connection(&self.pool)?;
        let persisted = db::load_catalog_entries(&conn)?;

        let mut index = CatalogIndex::default();
        let mut pruned = 0usize;

        for entry in persisted {
            if self.policy.exists(Path::new(&entry.file_path)) {
                index.insert(entry);
            } else {
                // Stale row: the file vanished while we were not looking
                if let Err(e) = db::delete_catalog_entry(&conn, &entry.id) {
                    log::warn!("Failed to prune stale entry {}: {}", entry.id, e);
                }
                pruned += 1;
            }
        }

        // Completed downloads that never made it into the entry set
        let mut recovered = 0usize;
        for record in db::completed_history(&conn)? {
            let Some(file_path) = record.file_path else {
                continue;
            };
            if !self.policy.exists(Path::new(&file_path)) {
                continue;
            }
            let already_known = index.entries.values().any(|e| {
                e.content_id == record.content_id
                    && e.format == record.format
                    && e.file_path == file_path
            });
            if already_known {
                continue;
            }
            let entry = CatalogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                content_id: record.content_id,
                file_path,
                format: record.format,
                size_bytes: record.size_bytes.unwrap_or(0),
                // The history row's timestamp keeps recency and eviction
                // honest across a recovery
                retrieved_at: record.recorded_at,
                last_accessed: record.recorded_at,
                title: record.title,
                artist: record.artist,
                duration_secs: None,
                tags: Vec::new(),
                available: true,
            };
            db::upsert_catalog_entry(&conn, &entry)?;
            index.insert(entry);
            recovered += 1;
        }

        log::info!(
            "Catalog loaded: {} entries ({} pruned, {} recovered from history)",
            index.entries.len(),
            pruned,
            recovered
        );

        *self.index.write().await = index;
        Ok(())
    }

    /// Registers a downloaded file.
    ///
    /// Idempotent per (content id, format, file path): re-registering the
    /// same triple refreshes size, metadata and availability instead of
    /// creating a duplicate.
    pub async fn register(&self, new: NewEntry) -> AppResult<CatalogEntry> {
        let mut index = self.index.write().await;
        let now = Utc::now();

        let existing = index.entries.values_mut().find(|e| {
            e.content_id == new.content_id
                && e.format == new.format
                && e.file_path == new.file_path
        });

        let entry = if let Some(entry) = existing {
            entry.size_bytes = new.size_bytes;
            entry.retrieved_at = now;
            entry.title = new.meta.title;
            entry.artist = new.meta.artist;
            entry.duration_secs = new.meta.duration_secs;
            entry.tags = new.meta.tags;
            entry.available = true;
            entry.clone()
        } else {
            let entry = CatalogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                content_id: new.content_id,
                file_path: new.file_path,
                format: new.format,
                size_bytes: new.size_bytes,
                retrieved_at: now,
                last_accessed: now,
                title: new.meta.title,
                artist: new.meta.artist,
                duration_secs: new.meta.duration_secs,
                tags: new.meta.tags,
                available: true,
            };
            index.insert(entry.clone());
            entry
        };

        let conn = db::get_connection(&self.pool)?;
        db::upsert_catalog_entry(&conn, &entry)?;
        log::info!(
            "Registered catalog entry {} for content {} ({})",
            entry.id,
            entry.content_id,
            entry.format
        );
        Ok(entry)
    }

    /// Removes an entry and its file.
    ///
    /// The entry is marked unavailable before the file is physically
    /// removed, so a concurrent reader observes a consistent state.
    pub async fn remove(&self, entry_id: &str) -> AppResult<bool> {
        let mut index = self.index.write().await;

        let Some(entry) = index.entries.get_mut(entry_id) else {
            return Ok(false);
        };
        entry.available = false;
        let file_path = entry.file_path.clone();

        let conn = db::get_connection(&self.pool)?;
        db::set_entry_availability(&conn, entry_id, false)?;

        self.policy.delete(Path::new(&file_path));

        index.remove(entry_id);
        db::delete_catalog_entry(&conn, entry_id)?;
        log::info!("Removed catalog entry {}", entry_id);
        Ok(true)
    }

    /// All entries for a content id, any availability.
    pub async fn entries_for(&self, content_id: &str) -> Vec<CatalogEntry> {
        let index = self.index.read().await;
        index
            .by_content
            .get(content_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.entries.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The single best local copy for a content id.
    ///
    /// Among available entries: audio-primary format wins regardless of
    /// recency; ties go to the most recently retrieved. `None` is a cache
    /// miss, not an error.
    pub async fn preferred_entry(&self, content_id: &str) -> Option<CatalogEntry> {
        let candidates: Vec<CatalogEntry> = self
            .entries_for(content_id)
            .await
            .into_iter()
            .filter(|e| e.available)
            .collect();

        let primary = candidates
            .iter()
            .filter(|e| e.format.is_audio_primary())
            .max_by_key(|e| e.retrieved_at);
        if let Some(entry) = primary {
            return Some(entry.clone());
        }
        candidates
            .into_iter()
            .max_by_key(|e| e.retrieved_at)
    }

    /// Case-insensitive search across title, artist, tags and content id.
    pub async fn search(&self, query: &str) -> Vec<CatalogEntry> {
        let needle = query.to_lowercase();
        let index = self.index.read().await;
        let mut hits: Vec<CatalogEntry> = index
            .entries
            .values()
            .filter(|e| {
                e.title.to_lowercase().contains(&needle)
                    || e.artist.to_lowercase().contains(&needle)
                    || e.content_id.to_lowercase().contains(&needle)
                    || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.retrieved_at.cmp(&a.retrieved_at));
        hits
    }

    /// All entries of a given format.
    pub async fn by_format(&self, format: MediaFormat) -> Vec<CatalogEntry> {
        let index = self.index.read().await;
        index
            .entries
            .values()
            .filter(|e| e.format == format)
            .cloned()
            .collect()
    }

    /// All entries carrying a tag (case-insensitive).
    pub async fn by_tag(&self, tag: &str) -> Vec<CatalogEntry> {
        let needle = tag.to_lowercase();
        let index = self.index.read().await;
        index
            .entries
            .values()
            .filter(|e| e.tags.iter().any(|t| t.to_lowercase() == needle))
            .cloned()
            .collect()
    }

    /// Updates the last-accessed timestamp; called on playback resolution.
    pub async fn touch(&self, entry_id: &str) -> AppResult<()> {
        let now = Utc::now();
        let mut index = self.index.write().await;
        if let Some(entry) = index.entries.get_mut(entry_id) {
            entry.last_accessed = now;
            let conn = db::get_connection(&self.pool)?;
            db::set_entry_last_accessed(&conn, entry_id, now)?;
        }
        Ok(())
    }

    /// Aggregate statistics over all entries.
    pub async fn stats(&self) -> CatalogStats {
        let index = self.index.read().await;
        let mut by_format: HashMap<MediaFormat, usize> = HashMap::new();
        let mut by_tag: HashMap<String, usize> = HashMap::new();
        let mut total_bytes = 0u64;
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for entry in index.entries.values() {
            total_bytes += entry.size_bytes;
            *by_format.entry(entry.format).or_default() += 1;
            for tag in &entry.tags {
                *by_tag.entry(tag.clone()).or_default() += 1;
            }
            oldest = Some(oldest.map_or(entry.retrieved_at, |o| o.min(entry.retrieved_at)));
            newest = Some(newest.map_or(entry.retrieved_at, |n| n.max(entry.retrieved_at)));
        }

        CatalogStats {
            count: index.entries.len(),
            total_bytes,
            by_format,
            by_tag,
            oldest,
            newest,
        }
    }

    /// Lazily verifies that an entry's file still exists.
    ///
    /// A failed check degrades the entry to unavailable; it never raises.
    pub async fn verify_availability(&self, entry_id: &str) -> bool {
        let mut index = self.index.write().await;
        let Some(entry) = index.entries.get_mut(entry_id) else {
            return false;
        };

        let present = self.policy.exists(Path::new(&entry.file_path));
        if entry.available != present {
            entry.available = present;
            match db::get_connection(&self.pool) {
                Ok(conn) => {
                    if let Err(e) = db::set_entry_availability(&conn, entry_id, present) {
                        log::warn!("Failed to persist availability for {}: {}", entry_id, e);
                    }
                }
                Err(e) => log::warn!("Failed to get DB connection: {}", e),
            }
            if !present {
                log::warn!(
                    "Integrity: file missing for entry {} ({})",
                    entry_id,
                    entry.file_path
                );
            }
        }
        present
    }

    /// Removes entries to satisfy age/size constraints.
    ///
    /// Candidates are considered oldest-accessed-first. The keep-minimum
    /// floor always wins: excess candidates beyond it are left in place.
    ///
    /// Returns the number of entries removed.
    pub async fn evict(&self, criteria: EvictCriteria) -> AppResult<usize> {
        let (mut victims, total_count) = {
            let index = self.index.read().await;
            let mut entries: Vec<&CatalogEntry> = index.entries.values().collect();
            entries.sort_by_key(|e| e.last_accessed);

            let now = Utc::now();
            let mut victims: Vec<String> = Vec::new();

            if let Some(max_age) = criteria.max_age {
                let cutoff = now - max_age;
                for entry in &entries {
                    if entry.last_accessed < cutoff {
                        victims.push(entry.id.clone());
                    }
                }
            }

            if let Some(budget) = criteria.max_total_bytes {
                let mut remaining: u64 = entries
                    .iter()
                    .filter(|e| !victims.contains(&e.id))
                    .map(|e| e.size_bytes)
                    .sum();
                for entry in &entries {
                    if remaining <= budget {
                        break;
                    }
                    if victims.contains(&entry.id) {
                        continue;
                    }
                    victims.push(entry.id.clone());
                    remaining -= entry.size_bytes;
                }
            }

            (victims, index.entries.len())
        };

        if let Some(floor) = criteria.keep_minimum {
            let max_removals = total_count.saturating_sub(floor);
            victims.truncate(max_removals);
        }

        let mut removed = 0usize;
        for id in victims {
            if self.remove(&id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("Evicted {} catalog entries", removed);
        }
        Ok(removed)
    }
}
