//! SQLite-backed ledger.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CommitKey, CommitRecord, CommitStatus, Ledger, LedgerError};
use crate::storage::{self, Pool};

const DEFAULT_CLAIM_LEASE_SECS: i64 = 2 * 60 * 60;

/// Ledger stored in a local SQLite file.
///
/// Every write takes `writer` before touching the database, so claims and
/// status changes from concurrent passes are applied one at a time.
pub struct SqliteLedger {
    pool: Pool,
    writer: Mutex<()>,
    lease: chrono::Duration,
}

impl SqliteLedger {
    /// Open the ledger, failing if the file exists but is unreadable or corrupt.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let pool = storage::open_pool(path)?;
        info!(path = %path.display(), "ledger opened");
        Ok(Self {
            pool,
            writer: Mutex::new(()),
            lease: chrono::Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        })
    }

    /// Claims older than `lease` may be taken over by another pass. The
    /// scheduler sets this to its unit timeout, after which the holder has
    /// been aborted.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease = chrono::Duration::from_std(lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_CLAIM_LEASE_SECS));
        self
    }

    /// Connection pool of the ledger file, shared with the template catalog.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Reset every in-progress claim to pending.
    ///
    /// Called by the scheduler at startup, before any unit runs. Standalone
    /// passes never call it; a running scheduler may hold those claims.
    pub async fn release_stale_claims(&self) -> Result<usize, LedgerError> {
        let _guard = self.writer.lock().await;
        let released = self.blocking(release_claims).await?;
        if released > 0 {
            warn!(released, "released commit claims left by a previous process");
        }
        Ok(released)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait::async_trait]
impl Ledger for SqliteLedger {
    async fn has_processed(&self, key: &CommitKey) -> Result<bool, LedgerError> {
        let key = key.clone();
        self.blocking(move |conn| {
            let status = current_status(conn, &key)?;
            Ok(status == Some(CommitStatus::Done))
        })
        .await
    }

    async fn mark_processed(&self, key: &CommitKey, status: CommitStatus) -> Result<(), LedgerError> {
        let _guard = self.writer.lock().await;
        let key = key.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            set_status(&tx, &key, status, Utc::now())?;
            tx.commit()?;
            debug!(commit = %key, %status, "ledger updated");
            Ok(())
        })
        .await
    }

    async fn observe(&self, keys: &[CommitKey]) -> Result<usize, LedgerError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let _guard = self.writer.lock().await;
        let keys = keys.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut fresh = 0;
            for key in &keys {
                if insert_pending(&tx, key, now)? {
                    fresh += 1;
                }
            }
            tx.commit()?;
            Ok(fresh)
        })
        .await
    }

    async fn pending_commits(&self, known: &BTreeSet<CommitKey>) -> Result<Vec<CommitKey>, LedgerError> {
        if known.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.writer.lock().await;
        let known: Vec<CommitKey> = known.iter().cloned().collect();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut pending = Vec::new();
            for key in known {
                insert_pending(&tx, &key, now)?;
                let (id, discovered, status): (i64, String, String) = tx.query_row(
                    "SELECT id, discovered_at, status FROM commits WHERE sha = ?1 AND suite = ?2",
                    params![key.sha, key.suite],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                if status.parse::<CommitStatus>()? != CommitStatus::Done {
                    pending.push((discovered, id, key));
                }
            }
            tx.commit()?;

            // RFC 3339 with fixed precision sorts lexicographically.
            pending.sort();
            Ok(pending.into_iter().map(|(_, _, key)| key).collect())
        })
        .await
    }

    async fn try_claim(&self, key: &CommitKey) -> Result<bool, LedgerError> {
        let _guard = self.writer.lock().await;
        let key = key.clone();
        let lease = self.lease;
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let current = tx
                .query_row(
                    "SELECT status, updated_at FROM commits WHERE sha = ?1 AND suite = ?2",
                    params![key.sha, key.suite],
                    |row| Ok((row.get::<_, String>(0)?, timestamp(row, 1)?)),
                )
                .optional()?;

            let claimable = match current {
                None => true,
                Some((status, updated_at)) => match status.parse::<CommitStatus>()? {
                    CommitStatus::Done => false,
                    CommitStatus::InProgress => now - updated_at > lease,
                    CommitStatus::Pending | CommitStatus::Failed => true,
                },
            };

            if claimable {
                set_status(&tx, &key, CommitStatus::InProgress, now)?;
            }
            tx.commit()?;
            Ok(claimable)
        })
        .await
    }

    async fn record(&self, key: &CommitKey) -> Result<Option<CommitRecord>, LedgerError> {
        let key = key.clone();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, discovered_at, updated_at FROM commits WHERE sha = ?1 AND suite = ?2",
                    params![key.sha, key.suite],
                    |row| Ok((row.get::<_, String>(0)?, timestamp(row, 1)?, timestamp(row, 2)?)),
                )
                .optional()?;

            match row {
                None => Ok(None),
                Some((status, discovered_at, updated_at)) => Ok(Some(CommitRecord {
                    key,
                    discovered_at,
                    status: status.parse()?,
                    updated_at,
                })),
            }
        })
        .await
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn current_status(conn: &Connection, key: &CommitKey) -> Result<Option<CommitStatus>, LedgerError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM commits WHERE sha = ?1 AND suite = ?2",
            params![key.sha, key.suite],
            |row| row.get(0),
        )
        .optional()?;
    status.map(|s| s.parse()).transpose()
}

/// Insert `key` as pending if it has never been seen. Returns true when inserted.
fn insert_pending(tx: &Transaction<'_>, key: &CommitKey, now: DateTime<Utc>) -> rusqlite::Result<bool> {
    let ts = format_ts(now);
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO commits (sha, suite, status, discovered_at, updated_at)
         VALUES (?1, ?2, 'pending', ?3, ?3)",
        params![key.sha, key.suite, ts],
    )?;
    if inserted == 1 {
        append_event(tx, key, CommitStatus::Pending, &ts)?;
    }
    Ok(inserted == 1)
}

fn set_status(tx: &Transaction<'_>, key: &CommitKey, status: CommitStatus, now: DateTime<Utc>) -> rusqlite::Result<()> {
    let ts = format_ts(now);
    tx.execute(
        "INSERT INTO commits (sha, suite, status, discovered_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (sha, suite) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
        params![key.sha, key.suite, status.as_str(), ts],
    )?;
    append_event(tx, key, status, &ts)
}

fn append_event(tx: &Transaction<'_>, key: &CommitKey, status: CommitStatus, ts: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO commit_events (sha, suite, status, recorded_at) VALUES (?1, ?2, ?3, ?4)",
        params![key.sha, key.suite, status.as_str(), ts],
    )?;
    Ok(())
}

fn release_claims(conn: &mut Connection) -> Result<usize, LedgerError> {
    let tx = conn.transaction()?;
    let stale: Vec<CommitKey> = {
        let mut stmt = tx.prepare("SELECT sha, suite FROM commits WHERE status = 'in_progress'")?;
        let rows = stmt.query_map([], |row| Ok(CommitKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };
    let now = Utc::now();
    for key in &stale {
        set_status(&tx, key, CommitStatus::Pending, now)?;
    }
    tx.commit()?;
    Ok(stale.len())
}
