//! SQLite-backed checkpoint store.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use super::parse_datetime;
use crate::error::{CrawlError, Result};
use crate::models::{CheckpointRecord, KeywordStatus, Outcome, StoreStats};
use crate::utils::append_jsonl;

/// How long to wait on a lock held by another process before reporting the store busy.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable record of per-keyword status and result payloads.
///
/// The connection runs in exclusive locking mode with a rollback journal, so
/// the first instance to open a database keeps it until it is dropped; a
/// second instance fails with [`CrawlError::StoreBusy`].
pub struct CheckpointStore {
    conn: Connection,
    db_path: PathBuf,
    result_log: Option<PathBuf>,
}

fn is_lock_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

impl CheckpointStore {
    /// Open (or create) the store at `db_path`, mirroring results to `result_log` if given.
    pub fn open(db_path: &Path, result_log: Option<&Path>) -> Result<Self> {
        Self::open_with_busy_timeout(db_path, result_log, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(
        db_path: &Path,
        result_log: Option<&Path>,
        busy_timeout: Duration,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let busy = |e: rusqlite::Error| {
            if is_lock_error(&e) {
                CrawlError::StoreBusy {
                    path: db_path.to_path_buf(),
                }
            } else {
                CrawlError::Database(e)
            }
        };

        let conn = Connection::open(db_path).map_err(busy)?;
        conn.busy_timeout(busy_timeout).map_err(busy)?;
        conn.execute_batch(
            r#"
            PRAGMA locking_mode = EXCLUSIVE;
            PRAGMA journal_mode = DELETE;
            PRAGMA synchronous = NORMAL;
            BEGIN EXCLUSIVE;
            COMMIT;
        "#,
        )
        .map_err(busy)?;

        let store = Self {
            conn,
            db_path: db_path.to_path_buf(),
            result_log: result_log.map(Path::to_path_buf),
        };
        store.init_schema().map_err(|e| match e {
            CrawlError::Database(inner) => busy(inner),
            other => other,
        })?;
        debug!("Opened checkpoint store {}", store.db_path.display());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS task_state (
                keyword TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS result_store (
                keyword TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_state_status
                ON task_state(status);
        "#,
        )?;
        Ok(())
    }

    /// Get the database path.
    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    /// Whether `keyword` has a `success` checkpoint.
    pub fn is_done(&self, keyword: &str) -> Result<bool> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM task_state WHERE keyword = ?",
                params![keyword],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref() == Some(KeywordStatus::Success.as_str()))
    }

    /// Every keyword with a `success` checkpoint.
    pub fn list_done(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT keyword FROM task_state WHERE status = ?")?;
        let done = stmt
            .query_map(params![KeywordStatus::Success.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;
        Ok(done)
    }

    /// Persist an outcome: upsert status and result rows in one transaction,
    /// then append the public payload to the result log.
    pub fn upsert(&self, outcome: &Outcome) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status = outcome.status();
        let failed_attempt = i64::from(status == KeywordStatus::Failed);
        let public = outcome.public_payload();
        let payload = serde_json::to_string(&public)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
            INSERT INTO result_store (keyword, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(keyword) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
            params![outcome.keyword, payload, now],
        )?;
        tx.execute(
            r#"
            INSERT INTO task_state (keyword, status, retries, error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(keyword) DO UPDATE SET
                status = excluded.status,
                retries = task_state.retries + excluded.retries,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
            params![
                outcome.keyword,
                status.as_str(),
                failed_attempt,
                outcome.error.as_deref().unwrap_or_default(),
                now,
            ],
        )?;
        tx.commit()?;

        if let Some(path) = &self.result_log {
            append_jsonl(path, &public)?;
        }
        Ok(())
    }

    /// Get the status row for a keyword.
    pub fn get_record(&self, keyword: &str) -> Result<Option<CheckpointRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT keyword, status, retries, error, updated_at FROM task_state WHERE keyword = ?",
                params![keyword],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Get the stored public payload for a keyword.
    pub fn get_payload(&self, keyword: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM result_store WHERE keyword = ?",
                params![keyword],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(CrawlError::from))
            .transpose()
    }

    /// Counts by status plus the number of stored results.
    pub fn status_counts(&self) -> Result<StoreStats> {
        let mut by_status = HashMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT status, COUNT(*) FROM task_state GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (status, count) = row?;
                if let Some(status) = KeywordStatus::from_str(&status) {
                    by_status.insert(status, count);
                }
            }
        }
        let results: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM result_store", [], |row| row.get(0))?;
        Ok(StoreStats {
            by_status,
            results: results as u64,
        })
    }

    /// Most recently updated failed keywords.
    pub fn recent_failures(&self, limit: usize) -> Result<Vec<CheckpointRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT keyword, status, retries, error, updated_at FROM task_state
            WHERE status = ?
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )?;
        let records = stmt
            .query_map(
                params![KeywordStatus::Failed.as_str(), limit as i64],
                Self::row_to_record,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRecord> {
        Ok(CheckpointRecord {
            keyword: row.get(0)?,
            status: KeywordStatus::from_str(&row.get::<_, String>(1)?)
                .unwrap_or(KeywordStatus::Failed),
            retries: row.get::<_, i64>(2)?.max(0) as u32,
            error: row.get(3)?,
            updated_at: parse_datetime(&row.get::<_, String>(4)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::default_payload;
    use serde_json::json;
    use tempfile::tempdir;

    fn found(keyword: &str) -> Outcome {
        let mut payload = default_payload();
        payload.insert("publish_media_list".into(), json!([{"uid": "1"}]));
        Outcome::accepted(keyword, true, payload, "acc1")
    }

    fn count_rows(store: &CheckpointStore, table: &str, keyword: &str) -> i64 {
        store
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE keyword = ?", table),
                params![keyword],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent_but_log_grows() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("out/results.jsonl");
        let store = CheckpointStore::open(&dir.path().join("state.db"), Some(&log)).unwrap();

        let outcome = found("coffee");
        store.upsert(&outcome).unwrap();
        store.upsert(&outcome).unwrap();

        assert_eq!(count_rows(&store, "task_state", "coffee"), 1);
        assert_eq!(count_rows(&store, "result_store", "coffee"), 1);
        let lines = fs::read_to_string(&log).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn test_done_tracks_latest_status() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("state.db"), None).unwrap();

        store
            .upsert(&Outcome::failure("tea", Some("acc1"), "TransportError: timeout"))
            .unwrap();
        assert!(!store.is_done("tea").unwrap());
        assert!(store.list_done().unwrap().is_empty());

        let record = store.get_record("tea").unwrap().unwrap();
        assert_eq!(record.status, KeywordStatus::Failed);
        assert_eq!(record.retries, 1);
        assert_eq!(record.error, "TransportError: timeout");

        store.upsert(&found("tea")).unwrap();
        assert!(store.is_done("tea").unwrap());
        let record = store.get_record("tea").unwrap().unwrap();
        assert_eq!(record.retries, 1);
        assert_eq!(record.error, "");
        assert_eq!(store.list_done().unwrap(), HashSet::from(["tea".to_string()]));
    }

    #[test]
    fn test_failed_payload_is_still_recorded() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("state.db"), None).unwrap();
        store.upsert(&Outcome::failure("tea", None, "x")).unwrap();

        let payload = store.get_payload("tea").unwrap().unwrap();
        assert_eq!(payload["found"], json!(false));
        assert_eq!(payload["publish_media_list"], json!([]));
    }

    #[test]
    fn test_stats_and_recent_failures() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("state.db"), None).unwrap();
        store.upsert(&found("a")).unwrap();
        store.upsert(&Outcome::failure("b", None, "ApiError: x")).unwrap();
        store.upsert(&Outcome::failure("c", None, "ApiError: y")).unwrap();

        let stats = store.status_counts().unwrap();
        assert_eq!(stats.count(KeywordStatus::Success), 1);
        assert_eq!(stats.count(KeywordStatus::Failed), 2);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.results, 3);

        let failures = store.recent_failures(10).unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|r| r.status == KeywordStatus::Failed));
    }

    #[test]
    fn test_second_instance_reports_busy() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("state.db");
        let _owner = CheckpointStore::open(&db, None).unwrap();

        let second = CheckpointStore::open_with_busy_timeout(&db, None, Duration::from_millis(50));
        assert!(matches!(second, Err(CrawlError::StoreBusy { .. })));
    }

    #[test]
    fn test_reopen_after_release_resumes() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("state.db");
        {
            let store = CheckpointStore::open(&db, None).unwrap();
            store.upsert(&found("a")).unwrap();
        }
        let store = CheckpointStore::open(&db, None).unwrap();
        assert!(store.is_done("a").unwrap());
    }
}
