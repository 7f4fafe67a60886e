use crate::catalog::CatalogEntry;
use crate::download::task::{DownloadTask, MediaFormat, TaskStatus};
use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Result;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// SQLite timestamp format used throughout the schema.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats a UTC timestamp for storage.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parses a stored timestamp; falls back to now for unparseable rows.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Create a new database connection pool
///
/// Initializes a connection pool with up to 10 connections and runs schema migrations.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
///
/// # Returns
///
/// Returns a `DbPool` on success or an `r2d2::Error` if pool creation fails.
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path);
    let pool = Pool::builder().max_size(10).build(manager)?;

    // Ensure schema is up to date on first connection
    let conn = pool.get()?;
    if let Err(e) = migrate_schema(&conn) {
        log::warn!("Failed to migrate schema: {}", e);
    }

    Ok(pool)
}

/// Get a connection from the pool
///
/// The connection is automatically returned to the pool when dropped.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

/// Migrate database schema to ensure all required tables exist
///
/// Safe to call repeatedly; every statement is idempotent.
fn migrate_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS catalog_entries (
            id TEXT PRIMARY KEY,
            content_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            format TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            retrieved_at DATETIME NOT NULL,
            last_accessed DATETIME NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            artist TEXT NOT NULL DEFAULT '',
            duration_secs INTEGER,
            tags TEXT NOT NULL DEFAULT '[]',
            available INTEGER NOT NULL DEFAULT 1,
            UNIQUE(content_id, format, file_path)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_catalog_entries_content_id
         ON catalog_entries(content_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS download_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            content_id TEXT NOT NULL,
            format TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            file_path TEXT,
            size_bytes INTEGER,
            title TEXT NOT NULL DEFAULT '',
            artist TEXT NOT NULL DEFAULT '',
            recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_download_history_status
         ON download_history(status)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// Catalog entries
// ============================================================================

/// Inserts or replaces a catalog entry row.
pub fn upsert_catalog_entry(conn: &DbConnection, entry: &CatalogEntry) -> Result<()> {
    let tags = serde_json::to_string(&entry.tags).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT OR REPLACE INTO catalog_entries
         (id, content_id, file_path, format, size_bytes, retrieved_at, last_accessed,
          title, artist, duration_secs, tags, available)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            entry.id,
            entry.content_id,
            entry.file_path,
            entry.format.as_str(),
            entry.size_bytes as i64,
            format_ts(entry.retrieved_at),
            format_ts(entry.last_accessed),
            entry.title,
            entry.artist,
            entry.duration_secs,
            tags,
            entry.available as i32,
        ],
    )?;
    Ok(())
}

/// Deletes a catalog entry row.
///
/// Returns `Ok(true)` if a row was deleted, `Ok(false)` if no such entry exists.
pub fn delete_catalog_entry(conn: &DbConnection, entry_id: &str) -> Result<bool> {
    let rows_affected = conn.execute(
        "DELETE FROM catalog_entries WHERE id = ?1",
        rusqlite::params![entry_id],
    )?;
    Ok(rows_affected > 0)
}

/// Updates the availability flag of an entry.
pub fn set_entry_availability(conn: &DbConnection, entry_id: &str, available: bool) -> Result<()> {
    conn.execute(
        "UPDATE catalog_entries SET available = ?1 WHERE id = ?2",
        rusqlite::params![available as i32, entry_id],
    )?;
    Ok(())
}

/// Updates the last-accessed timestamp of an entry.
pub fn set_entry_last_accessed(
    conn: &DbConnection,
    entry_id: &str,
    ts: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE catalog_entries SET last_accessed = ?1 WHERE id = ?2",
        rusqlite::params![format_ts(ts), entry_id],
    )?;
    Ok(())
}

/// Loads every catalog entry row.
pub fn load_catalog_entries(conn: &DbConnection) -> Result<Vec<CatalogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, content_id, file_path, format, size_bytes, retrieved_at, last_accessed,
                title, artist, duration_secs, tags, available
         FROM catalog_entries",
    )?;
    let rows = stmt.query_map([], |row| {
        let format_str: String = row.get(3)?;
        let retrieved_at: String = row.get(5)?;
        let last_accessed: String = row.get(6)?;
        let tags_json: String = row.get(10)?;
        Ok(CatalogEntry {
            id: row.get(0)?,
            content_id: row.get(1)?,
            file_path: row.get(2)?,
            format: MediaFormat::parse(&format_str).unwrap_or(MediaFormat::Mp3),
            size_bytes: row.get::<_, i64>(4)? as u64,
            retrieved_at: parse_ts(&retrieved_at),
            last_accessed: parse_ts(&last_accessed),
            title: row.get(7)?,
            artist: row.get(8)?,
            duration_secs: row.get(9)?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            available: row.get::<_, i32>(11)? != 0,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

// ============================================================================
// Download history
// ============================================================================

/// One row of the append-style download-history log.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub task_id: String,
    pub content_id: String,
    pub format: MediaFormat,
    pub status: String,
    pub error: Option<String>,
    pub file_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub title: String,
    pub artist: String,
    pub recorded_at: DateTime<Utc>,
}

/// Appends a history row reflecting the task's current status.
///
/// Called by the download queue on every status transition.
pub fn append_history(conn: &DbConnection, task: &DownloadTask) -> Result<()> {
    conn.execute(
        "INSERT INTO download_history
         (task_id, content_id, format, status, progress, error, file_path, size_bytes, title, artist)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            task.id,
            task.content_id,
            task.format.as_str(),
            task.status.as_str(),
            task.progress as i32,
            task.error,
            task.file_path,
            task.size_bytes.map(|b| b as i64),
            task.meta.title,
            task.meta.artist,
        ],
    )?;
    Ok(())
}

/// Returns the latest completed-history row per task.
///
/// Used by the catalog for startup reconciliation: a completed download that
/// never made it into `catalog_entries` (e.g. a prior interrupted process)
/// can be re-registered from these rows.
pub fn completed_history(conn: &DbConnection) -> Result<Vec<HistoryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, content_id, format, status, error, file_path, size_bytes, title, artist,
                recorded_at
         FROM download_history
         WHERE status = ?1 AND id IN
               (SELECT MAX(id) FROM download_history GROUP BY task_id)",
    )?;
    let rows = stmt.query_map(rusqlite::params![TaskStatus::Completed.as_str()], |row| {
        let format_str: String = row.get(2)?;
        let recorded_at: Option<String> = row.get(9)?;
        Ok(HistoryRecord {
            task_id: row.get(0)?,
            content_id: row.get(1)?,
            format: MediaFormat::parse(&format_str).unwrap_or(MediaFormat::Mp3),
            status: row.get(3)?,
            error: row.get(4)?,
            file_path: row.get(5)?,
            size_bytes: row.get::<_, Option<i64>>(6)?.map(|b| b as u64),
            title: row.get(7)?,
            artist: row.get(8)?,
            recorded_at: recorded_at.as_deref().map(parse_ts).unwrap_or_else(Utc::now),
        })
    })?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}
