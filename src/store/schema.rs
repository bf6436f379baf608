use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::util::now_utc_string;

pub(crate) const DB_SCHEMA_VERSION: &str = "0.1.0";

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    Ok(())
}

pub(crate) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;

    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dataruns (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          dataset_name TEXT NOT NULL,
          train_path TEXT NOT NULL,
          metric TEXT NOT NULL,
          direction TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hyperpartitions (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          datarun_id INTEGER NOT NULL,
          method TEXT NOT NULL,
          categoricals_json TEXT NOT NULL,
          UNIQUE (datarun_id, method, categoricals_json),
          FOREIGN KEY(datarun_id) REFERENCES dataruns(id)
        );

        CREATE TABLE IF NOT EXISTS jobs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          datarun_id INTEGER NOT NULL,
          hyperpartition_id INTEGER NOT NULL,
          params_json TEXT NOT NULL,
          params_hash TEXT NOT NULL,
          status TEXT NOT NULL,
          claimed_by TEXT,
          claimed_at TEXT,
          created_at TEXT NOT NULL,
          UNIQUE (datarun_id, params_hash),
          FOREIGN KEY(datarun_id) REFERENCES dataruns(id),
          FOREIGN KEY(hyperpartition_id) REFERENCES hyperpartitions(id)
        );

        CREATE TABLE IF NOT EXISTS classifiers (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          datarun_id INTEGER NOT NULL,
          hyperpartition_id INTEGER NOT NULL,
          job_id INTEGER NOT NULL,
          params_json TEXT NOT NULL,
          cv_judgment_metric REAL,
          cv_judgment_metric_stdev REAL,
          status TEXT NOT NULL,
          error_message TEXT,
          worker_id TEXT,
          created_at TEXT NOT NULL,
          completed_at TEXT,
          FOREIGN KEY(datarun_id) REFERENCES dataruns(id),
          FOREIGN KEY(hyperpartition_id) REFERENCES hyperpartitions(id),
          FOREIGN KEY(job_id) REFERENCES jobs(id)
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status_run ON jobs(status, datarun_id);
        CREATE INDEX IF NOT EXISTS idx_classifiers_run_created ON classifiers(datarun_id, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_classifiers_partition ON classifiers(hyperpartition_id);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}
