use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result};
use serde::{Deserialize, Serialize};

/// One durable access-log row, written after every decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: i64,
    pub fingerprint: String,
    pub ip: String,
    pub user_agent: String,
    pub path: String,
    pub method: String,
    pub score: i32,
    pub action: String,
    pub timestamp: String,
}

/// Filter for the admin log query. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AccessLogQuery {
    pub fingerprint: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

/// Append-only durable log of every firewall decision, for offline
/// queries through the admin API. Rows never expire via TTL; an hourly
/// background task prunes them by age.
pub struct AccessLogStore {
    conn: Mutex<Connection>,
}

impl AccessLogStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS access_logs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL,
                ip          TEXT NOT NULL,
                user_agent  TEXT,
                path        TEXT,
                method      TEXT,
                score       INTEGER NOT NULL DEFAULT 100,
                action      TEXT NOT NULL DEFAULT 'allow',
                timestamp   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_access_logs_fingerprint ON access_logs(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_access_logs_timestamp   ON access_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_access_logs_ip          ON access_logs(ip);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn append(
        &self,
        fingerprint: &str,
        ip: &str,
        user_agent: &str,
        path: &str,
        method: &str,
        score: i32,
        action: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO access_logs (fingerprint, ip, user_agent, path, method, score, action, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fingerprint,
                ip,
                user_agent,
                path,
                method,
                score,
                action,
                timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Filtered, newest-first page of access records.
    pub fn query(&self, q: &AccessLogQuery) -> Result<Vec<AccessRecord>> {
        let mut sql = String::from(
            "SELECT id, fingerprint, ip, user_agent, path, method, score, action, timestamp
             FROM access_logs WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref fp) = q.fingerprint {
            sql.push_str(" AND fingerprint = ?");
            args.push(Box::new(fp.clone()));
        }
        if let Some(since) = q.since {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(since.to_rfc3339()));
        }
        if let Some(until) = q.until {
            sql.push_str(" AND timestamp <= ?");
            args.push(Box::new(until.to_rfc3339()));
        }

        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
        let limit = if q.limit == 0 { 100 } else { q.limit };
        args.push(Box::new(limit));
        args.push(Box::new(q.offset));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));

        let rows = stmt.query_map(params, |row| {
            Ok(AccessRecord {
                id: row.get(0)?,
                fingerprint: row.get(1)?,
                ip: row.get(2)?,
                user_agent: row.get(3)?,
                path: row.get(4)?,
                method: row.get(5)?,
                score: row.get(6)?,
                action: row.get(7)?,
                timestamp: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    /// Delete rows older than the cutoff. Returns the number removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM access_logs WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )
    }
}
