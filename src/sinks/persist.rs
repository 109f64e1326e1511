//! SQLite-backed banlist persistence.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::BanlistStore;
use crate::models::BanlistRecord;

/// Thread-safe wrapper around one SQLite connection holding the single
/// `banlist` relation, keyed by email.
#[derive(Clone)]
pub struct SqliteBanlist {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBanlist {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open banlist db: {}", path.as_ref().display()))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS banlist (
                email TEXT PRIMARY KEY,
                first_banlisted_at TEXT NOT NULL,
                last_seen_banlisted_at TEXT NOT NULL,
                reason TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl BanlistStore for SqliteBanlist {
    fn load_all(&self) -> Result<Vec<BanlistRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT email, first_banlisted_at, last_seen_banlisted_at, reason FROM banlist",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        records
            .into_iter()
            .map(|(email, first, last, reason)| {
                Ok(BanlistRecord {
                    email,
                    first_banlisted_at: parse_ts(&first)?,
                    last_seen_banlisted_at: parse_ts(&last)?,
                    reason,
                })
            })
            .collect()
    }

    fn upsert(&self, email: &str, now: DateTime<Utc>, reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let existing: Option<String> = conn
            .query_row(
                "SELECT email FROM banlist WHERE email = ?",
                [email],
                |row| row.get(0),
            )
            .optional()?;

        if existing.is_some() {
            conn.execute(
                "UPDATE banlist SET last_seen_banlisted_at = ?, reason = ? WHERE email = ?",
                params![now.to_rfc3339(), reason, email],
            )?;
        } else {
            conn.execute(
                "INSERT INTO banlist (email, first_banlisted_at, last_seen_banlisted_at, reason)
                 VALUES (?, ?, ?, ?)",
                params![email, now.to_rfc3339(), now.to_rfc3339(), reason],
            )?;
        }
        Ok(())
    }

    fn delete(&self, email: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM banlist WHERE email = ?", [email])?;
        Ok(())
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM banlist", [])?;
        Ok(rows)
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp in banlist row: {raw}"))
}
