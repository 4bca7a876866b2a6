//! Program guide persistence. Out of scope as a *feature* (callers are free
//! to swap in their own store), but the crate ships a concrete SQLite
//! default so it runs standalone, following the `Database` wrapper pattern
//! used elsewhere in the pack for schema init and migrations.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

#[derive(Error, Debug)]
pub enum EpgStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EpgStoreError>;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProgramEntry {
    pub channel_number: String,
    pub source_id: u16,
    pub event_id: u16,
    pub start_unix_ms: i64,
    pub end_unix_ms: i64,
    pub title: String,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS programs (
    frequency       TEXT    NOT NULL,
    channel_number  TEXT    NOT NULL,
    source_id       INTEGER NOT NULL,
    event_id        INTEGER NOT NULL,
    start_unix_ms   INTEGER NOT NULL,
    end_unix_ms     INTEGER NOT NULL,
    title           TEXT    NOT NULL,
    PRIMARY KEY (frequency, source_id, event_id)
);
CREATE INDEX IF NOT EXISTS idx_programs_channel ON programs(channel_number, start_unix_ms);
";

/// SQLite-backed EPG store. Blocking `rusqlite` calls run on the tokio
/// blocking pool via `spawn_blocking` so the guide scanner's async task
/// never stalls on disk I/O.
#[derive(Clone)]
pub struct EpgStore {
    conn: Arc<Mutex<Connection>>,
}

impl EpgStore {
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> Result<Self> {
        let conn = spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(path)?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace one event, keyed by `(frequency, source_id, event_id)`
    /// so re-scanning the same mux doesn't duplicate rows.
    pub async fn upsert_program(
        &self,
        frequency: &str,
        channel_number: &str,
        source_id: u16,
        event_id: u16,
        start_unix_ms: i64,
        end_unix_ms: i64,
        title: &str,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let (frequency, channel_number, title) =
            (frequency.to_string(), channel_number.to_string(), title.to_string());

        spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO programs (frequency, channel_number, source_id, event_id, start_unix_ms, end_unix_ms, title)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(frequency, source_id, event_id) DO UPDATE SET
                    channel_number = excluded.channel_number,
                    start_unix_ms = excluded.start_unix_ms,
                    end_unix_ms = excluded.end_unix_ms,
                    title = excluded.title",
                params![frequency, channel_number, source_id, event_id, start_unix_ms, end_unix_ms, title],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn programs_for_channel(&self, channel_number: &str) -> Result<Vec<ProgramEntry>> {
        let conn = self.conn.clone();
        let channel_number = channel_number.to_string();

        spawn_blocking(move || -> Result<Vec<ProgramEntry>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT channel_number, source_id, event_id, start_unix_ms, end_unix_ms, title
                 FROM programs WHERE channel_number = ?1 ORDER BY start_unix_ms ASC",
            )?;
            let rows = stmt
                .query_map(params![channel_number], |row| {
                    Ok(ProgramEntry {
                        channel_number: row.get(0)?,
                        source_id: row.get(1)?,
                        event_id: row.get(2)?,
                        start_unix_ms: row.get(3)?,
                        end_unix_ms: row.get(4)?,
                        title: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    pub async fn all_programs(&self) -> Result<Vec<ProgramEntry>> {
        let conn = self.conn.clone();

        spawn_blocking(move || -> Result<Vec<ProgramEntry>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT channel_number, source_id, event_id, start_unix_ms, end_unix_ms, title
                 FROM programs ORDER BY channel_number, start_unix_ms ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ProgramEntry {
                        channel_number: row.get(0)?,
                        source_id: row.get(1)?,
                        event_id: row.get(2)?,
                        start_unix_ms: row.get(3)?,
                        end_unix_ms: row.get(4)?,
                        title: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Every program whose window overlaps `[start_unix_ms, end_unix_ms)`,
    /// across all channels, for the XMLTV/JSON guide endpoints.
    pub async fn query_window(&self, start_unix_ms: i64, end_unix_ms: i64) -> Result<Vec<ProgramEntry>> {
        let conn = self.conn.clone();

        spawn_blocking(move || -> Result<Vec<ProgramEntry>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT channel_number, source_id, event_id, start_unix_ms, end_unix_ms, title
                 FROM programs
                 WHERE end_unix_ms > ?1 AND start_unix_ms < ?2
                 ORDER BY channel_number, start_unix_ms ASC",
            )?;
            let rows = stmt
                .query_map(params![start_unix_ms, end_unix_ms], |row| {
                    Ok(ProgramEntry {
                        channel_number: row.get(0)?,
                        source_id: row.get(1)?,
                        event_id: row.get(2)?,
                        start_unix_ms: row.get(3)?,
                        end_unix_ms: row.get(4)?,
                        title: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Drop programs that ended before `older_than_unix_ms`, so the catalog
    /// doesn't grow without bound as muxes are rescanned.
    pub async fn expire(&self, older_than_unix_ms: i64) -> Result<usize> {
        let conn = self.conn.clone();

        spawn_blocking(move || -> Result<usize> {
            let conn = conn.blocking_lock();
            let n = conn.execute(
                "DELETE FROM programs WHERE end_unix_ms < ?1",
                params![older_than_unix_ms],
            )?;
            Ok(n)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_read_back() {
        let store = EpgStore::open_in_memory().await.unwrap();
        store
            .upsert_program("563000000", "5.1", 7, 100, 1_700_000_000_000, 1_700_003_600_000, "News Hour")
            .await
            .unwrap();

        let programs = store.programs_for_channel("5.1").await.unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].title, "News Hour");
    }

    #[tokio::test]
    async fn upsert_same_event_replaces_not_duplicates() {
        let store = EpgStore::open_in_memory().await.unwrap();
        store
            .upsert_program("563000000", "5.1", 7, 100, 1_700_000_000_000, 1_700_003_600_000, "News Hour")
            .await
            .unwrap();
        store
            .upsert_program("563000000", "5.1", 7, 100, 1_700_000_000_000, 1_700_003_600_000, "News Hour (Updated)")
            .await
            .unwrap();

        let programs = store.programs_for_channel("5.1").await.unwrap();
        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].title, "News Hour (Updated)");
    }

    #[tokio::test]
    async fn query_window_excludes_non_overlapping_programs() {
        let store = EpgStore::open_in_memory().await.unwrap();
        store.upsert_program("563000000", "5.1", 7, 1, 1_000, 2_000, "Early").await.unwrap();
        store.upsert_program("563000000", "5.1", 7, 2, 5_000, 6_000, "Late").await.unwrap();

        let window = store.query_window(1_500, 5_500).await.unwrap();
        assert_eq!(window.len(), 2);

        let window = store.query_window(3_000, 4_000).await.unwrap();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn expire_drops_only_programs_ended_before_cutoff() {
        let store = EpgStore::open_in_memory().await.unwrap();
        store.upsert_program("563000000", "5.1", 7, 1, 1_000, 2_000, "Old").await.unwrap();
        store.upsert_program("563000000", "5.1", 7, 2, 10_000, 20_000, "New").await.unwrap();

        let removed = store.expire(5_000).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.all_programs().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "New");
    }
}
