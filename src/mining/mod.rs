//! Failure-template mining.
//!
//! Task failure reasons are masked, then clustered so that reasons which
//! differ only in hosts, counts or paths share one template id. Clusters are
//! kept in the ledger database and reloaded on start, so ids stay stable
//! across passes and restarts.

pub mod drain;
pub mod mask;

use chrono::{SecondsFormat, Utc};
use rusqlite::params;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use self::drain::{Change, Cluster, Drain};
use self::mask::Masker;
use crate::config::MiningConfig;
use crate::storage::Pool;
use crate::transform::{FailureTemplate, IndexedDocument};

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("invalid masking pattern {pattern}: {source}")]
    Pattern {
        pattern: &'static str,
        source: regex::Error,
    },

    #[error("template store query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("template store connection unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("template store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Templates mined during one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiningTally {
    pub mined: usize,
    pub created: usize,
}

/// Persistent set of failure templates.
pub struct TemplateCatalog {
    pool: Pool,
    masker: Masker,
    drain: Mutex<Drain>,
}

impl TemplateCatalog {
    /// Load every stored template from `pool`.
    pub async fn open(pool: Pool, config: &MiningConfig) -> Result<Self, MiningError> {
        let masker = Masker::new()?;
        let mut drain = Drain::new(config.similarity, config.depth, config.max_children);

        let reader = pool.clone();
        let stored = tokio::task::spawn_blocking(move || load(&reader)).await??;
        let count = stored.len();
        for cluster in stored {
            drain.restore(cluster);
        }
        info!(templates = count, "failure templates loaded");

        Ok(Self {
            pool,
            masker,
            drain: Mutex::new(drain),
        })
    }

    /// Template for a single reason.
    pub async fn mine(&self, reason: &str) -> Result<FailureTemplate, MiningError> {
        let mut drain = self.drain.lock().await;
        let (cluster, _) = drain.add(&self.masker.mask(reason));
        let template = FailureTemplate {
            id: cluster.id,
            template: cluster.template(),
        };
        self.flush(&mut drain).await?;
        Ok(template)
    }

    /// Attach a template to every task of `docs` that has a failure reason.
    ///
    /// Documents are only changed once the touched clusters are stored; on
    /// error they are left without templates.
    pub async fn mine_documents(&self, docs: &mut [IndexedDocument]) -> Result<MiningTally, MiningError> {
        let mut drain = self.drain.lock().await;
        let mut tally = MiningTally::default();
        let mut assigned = Vec::new();

        for (d, doc) in docs.iter().enumerate() {
            for (t, task) in doc.tasks.iter().enumerate() {
                let Some(reason) = task.failure_reason.as_deref().filter(|r| !r.trim().is_empty()) else {
                    continue;
                };
                if task.failure_template.is_some() {
                    continue;
                }
                let (cluster, change) = drain.add(&self.masker.mask(reason));
                if change == Change::Created {
                    tally.created += 1;
                }
                assigned.push((d, t, cluster.id));
            }
        }
        if assigned.is_empty() {
            return Ok(tally);
        }

        self.flush(&mut drain).await?;

        // templates may have widened after an earlier task was assigned
        for (d, t, id) in assigned {
            let template = drain.template(id).unwrap_or_default();
            docs[d].tasks[t].failure_template = Some(FailureTemplate { id, template });
            tally.mined += 1;
        }
        debug!(mined = tally.mined, created = tally.created, templates = drain.len(), "failure reasons mined");
        Ok(tally)
    }

    /// Every stored template, by id.
    pub async fn templates(&self) -> Vec<FailureTemplate> {
        let drain = self.drain.lock().await;
        drain
            .clusters()
            .into_iter()
            .map(|c| FailureTemplate {
                id: c.id,
                template: c.template(),
            })
            .collect()
    }

    async fn flush(&self, drain: &mut Drain) -> Result<(), MiningError> {
        let touched = drain.dirty();
        if touched.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || store(&pool, &touched)).await??;
        drain.clear_dirty();
        Ok(())
    }
}

fn load(pool: &Pool) -> Result<Vec<Cluster>, MiningError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT id, template, size FROM failure_templates ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        let id: i64 = row.get(0)?;
        let template: String = row.get(1)?;
        let size: i64 = row.get(2)?;
        Ok(Cluster {
            id: id as u64,
            tokens: template.split_whitespace().map(str::to_string).collect(),
            size: size.max(0) as u64,
        })
    })?;
    let clusters = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(clusters)
}

fn store(pool: &Pool, clusters: &[Cluster]) -> Result<(), MiningError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    for cluster in clusters {
        tx.execute(
            "INSERT INTO failure_templates (id, token_count, template, size, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id) DO UPDATE SET template = excluded.template, size = excluded.size,
                 updated_at = excluded.updated_at",
            params![
                cluster.id as i64,
                cluster.tokens.len() as i64,
                cluster.template(),
                cluster.size as i64,
                now
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}
