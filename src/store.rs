//! Metrics source
//!
//! Scalar counters queried by periodic producers. The shipped SQLite
//! implementation reads a `sessions` table maintained by the rest of the
//! platform; when no database is configured every counter is zero.

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::websocket::Payload;

/// Session counters published on the metrics stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub total: i64,
    pub running: i64,
    pub hibernated: i64,
}

impl SessionCounts {
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("total".to_string(), json!(self.total));
        payload.insert("running".to_string(), json!(self.running));
        payload.insert("hibernated".to_string(), json!(self.hibernated));
        payload
    }
}

/// Query interface used by periodic producers
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn session_counts(&self) -> Result<SessionCounts, StoreError>;
}

/// Source used when no store is configured
#[derive(Debug, Default)]
pub struct NullMetricsSource;

#[async_trait]
impl MetricsSource for NullMetricsSource {
    async fn session_counts(&self) -> Result<SessionCounts, StoreError> {
        Ok(SessionCounts::default())
    }
}

/// Reads session counters from a SQLite database
pub struct SqliteMetricsSource {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteMetricsSource {
    /// Open (or create) the database and ensure the `sessions` table exists
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                state TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn count(conn: &Connection, state: Option<&str>) -> Result<i64, rusqlite::Error> {
        match state {
            Some(state) => conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE state = ?1",
                [state],
                |row| row.get(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0)),
        }
    }
}

#[async_trait]
impl MetricsSource for SqliteMetricsSource {
    async fn session_counts(&self) -> Result<SessionCounts, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| StoreError::Lock(e.to_string()))?;
            Ok::<_, StoreError>(SessionCounts {
                total: Self::count(&conn, None)?,
                running: Self::count(&conn, Some("running"))?,
                hibernated: Self::count(&conn, Some("hibernated"))?,
            })
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Errors from the metrics store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Query task failed: {0}")]
    Task(String),
}
