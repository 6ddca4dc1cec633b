//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS commits (
            id INTEGER PRIMARY KEY,
            sha TEXT NOT NULL,
            suite TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            discovered_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (sha, suite)
        );

        CREATE TABLE IF NOT EXISTS commit_events (
            id INTEGER PRIMARY KEY,
            sha TEXT NOT NULL,
            suite TEXT NOT NULL,
            status TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_commits_status ON commits(status);
        CREATE INDEX IF NOT EXISTS idx_commit_events_key ON commit_events(sha, suite);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS failure_templates (
            id INTEGER PRIMARY KEY,
            token_count INTEGER NOT NULL,
            template TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (2);",
    )?;

    Ok(())
}
