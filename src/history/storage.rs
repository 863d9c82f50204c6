use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use super::export;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One persisted analysis. `id` is the opaque lookup key; `timestamp` is
/// RFC 3339 UTC with microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: String,
    pub analysis_text: String,
    pub prompt: String,
}

impl HistoryEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            analysis_text: row.get(2)?,
            prompt: row.get(3)?,
        })
    }
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Append-only log of analysis results in SQLite.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "SELECT id, timestamp, analysis_text, prompt FROM analysis_history";

impl HistoryStore {
    pub fn new(db_path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            log::warn!("[HISTORY] Could not enable WAL: {}", e);
        }
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS analysis_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                analysis_text TEXT NOT NULL,
                prompt TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_history_timestamp
                ON analysis_history (timestamp);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn add(&self, analysis_text: &str, prompt: &str) -> Result<HistoryEntry, HistoryError> {
        self.add_at(&now_timestamp(), analysis_text, prompt)
    }

    /// Appends with an explicit timestamp. A repeated timestamp is allowed;
    /// lookups by timestamp then see the newest row.
    pub fn add_at(
        &self,
        timestamp: &str,
        analysis_text: &str,
        prompt: &str,
    ) -> Result<HistoryEntry, HistoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO analysis_history (timestamp, analysis_text, prompt) VALUES (?1, ?2, ?3)",
            params![timestamp, analysis_text, prompt],
        )?;
        Ok(HistoryEntry {
            id: conn.last_insert_rowid(),
            timestamp: timestamp.to_string(),
            analysis_text: analysis_text.to_string(),
            prompt: prompt.to_string(),
        })
    }

    /// Newest first. `None` returns everything.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>, HistoryError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY timestamp DESC, id DESC LIMIT ?1",
            SELECT_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![limit], HistoryEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Entries whose analysis text or prompt contains `query`, newest first.
    ///
    /// Matching uses SQLite `LIKE`, so it ignores case for ASCII letters only.
    /// `%`, `_` and `\` in the query are matched literally.
    pub fn search(&self, query: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
        let pattern = format!("%{}%", escape_like(query));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE analysis_text LIKE ?1 ESCAPE '\\' OR prompt LIKE ?1 ESCAPE '\\' \
             ORDER BY timestamp DESC, id DESC",
            SELECT_COLUMNS
        ))?;
        let entries = stmt
            .query_map(params![pattern], HistoryEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn get_by_timestamp(&self, timestamp: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!("{} WHERE timestamp = ?1 ORDER BY id DESC LIMIT 1", SELECT_COLUMNS),
                params![timestamp],
                HistoryEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn get(&self, id: i64) -> Result<Option<HistoryEntry>, HistoryError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                HistoryEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn count(&self) -> Result<usize, HistoryError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM analysis_history", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Writes the full history as a JSON array. Returns the record count.
    pub fn export_json(&self, path: &Path) -> Result<usize, HistoryError> {
        let entries = self.list(None)?;
        let mut out = BufWriter::new(File::create(path)?);
        export::write_json(&entries, &mut out)?;
        log::info!("[HISTORY] Exported {} entries to {}", entries.len(), path.display());
        Ok(entries.len())
    }

    /// Writes the full history as CSV with a header row. Returns the record count.
    pub fn export_csv(&self, path: &Path) -> Result<usize, HistoryError> {
        let entries = self.list(None)?;
        let mut out = BufWriter::new(File::create(path)?);
        export::write_csv(&entries, &mut out)?;
        log::info!("[HISTORY] Exported {} entries to {}", entries.len(), path.display());
        Ok(entries.len())
    }
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
