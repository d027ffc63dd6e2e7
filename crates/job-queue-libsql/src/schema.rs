//! Connection tuning and schema versioning for the job table.
//!
//! The schema version lives in SQLite's `user_version` header field.
//! <https://sqlite.org/pragma.html#pragma_user_version>

use anyhow::Context as _;
use libsql::Connection;

const CONNECTION_TUNING: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA busy_timeout = 15000;
    PRAGMA cache_size = -3000;
    PRAGMA auto_vacuum = INCREMENTAL;
    PRAGMA temp_store = MEMORY;
";

/// Schema scripts, indexed by the version they upgrade from. Append only.
const UPGRADES: &[&str] = &["
    CREATE TABLE job_queue (
        id TEXT NOT NULL PRIMARY KEY,
        created_at INT NOT NULL DEFAULT (unixepoch()),
        updated_at INT NOT NULL DEFAULT (unixepoch()),
        scheduled_for INT NOT NULL,
        failed_attempts INT NOT NULL,
        max_attempts INT NOT NULL,
        backoff_ms INT NOT NULL,
        status INT NOT NULL,
        name TEXT NOT NULL,
        def BLOB NOT NULL
    ) STRICT;

    CREATE TRIGGER job_queue_touch AFTER UPDATE ON job_queue
    BEGIN
        UPDATE job_queue SET updated_at = unixepoch() WHERE id == NEW.id;
    END;

    CREATE INDEX job_queue_scheduled_for ON job_queue(scheduled_for);
"];

pub(crate) async fn tune(conn: &Connection) -> anyhow::Result<()> {
    trace!(sql_query = %CONNECTION_TUNING, "Tuning connection");

    let mut batch = conn
        .execute_batch(CONNECTION_TUNING)
        .await
        .context("failed to tune the connection")?;

    // Some PRAGMAs answer with a row, which must be drained.
    while let Some(statement) = batch.next_stmt_row() {
        if let Some(mut rows) = statement {
            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA answer");
            }
        }
    }

    Ok(())
}

pub(crate) async fn upgrade(conn: &Connection) -> anyhow::Result<()> {
    let current = read_version(conn).await?;
    let target = UPGRADES.len();

    if current > target {
        warn!(current, target, "Job table is newer than this build");
        return Ok(());
    }

    if current == target {
        debug!(version = current, "Job table is up to date");
        return Ok(());
    }

    info!(current, target, "Upgrading job table");

    for (version, script) in UPGRADES.iter().enumerate().skip(current) {
        conn.execute_batch(script)
            .await
            .with_context(|| format!("failed to upgrade job table from version {version}"))?;

        write_version(conn, version + 1).await?;

        trace!(version = version + 1, "Job table upgraded");
    }

    info!(version = target, "Job table upgrade complete");

    Ok(())
}

async fn read_version(conn: &Connection) -> anyhow::Result<usize> {
    let row = conn
        .query("PRAGMA user_version", ())
        .await
        .context("failed to query user_version")?
        .next()
        .await
        .context("failed to read user_version row")?
        .context("user_version returned no row")?;

    let version = row.get::<u64>(0).context("user_version is not an integer")?;

    usize::try_from(version).context("user_version out of range")
}

async fn write_version(conn: &Connection, version: usize) -> anyhow::Result<()> {
    // PRAGMA values can't be bound as parameters.
    conn.execute(&format!("PRAGMA user_version = {version}"), ())
        .await
        .context("failed to update user_version")?;

    Ok(())
}
