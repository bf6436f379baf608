use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rand::seq::SliceRandom;
use rusqlite::{
    Connection, OptionalExtension, TransactionBehavior, params, params_from_iter,
};
use serde::Serialize;
use tracing::debug;

use super::JobStore;
use super::schema::{configure_connection, ensure_schema};
use crate::model::{
    ClaimedJob, EnqueueCounts, Evaluation, EvaluationOutcome, EvaluationStatus, JobSpec, NewRun,
    Partition, Run, RunId, ScoreDirection, SelectionPolicy,
};
use crate::util::{now_utc_string, sha256_hex};

pub struct SqliteStore {
    connection: Connection,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub complete: i64,
    pub errored: i64,
}

struct JobRow {
    job_id: i64,
    datarun_id: RunId,
    partition_id: i64,
    method: String,
    categoricals_json: String,
    params_json: String,
    dataset_name: String,
    train_path: String,
    metric: String,
    direction: String,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn create_run(&mut self, run: &NewRun) -> Result<RunId> {
        if run.dataset_name.trim().is_empty() {
            bail!("dataset name must not be empty");
        }

        self.connection
            .execute(
                "INSERT INTO dataruns(dataset_name, train_path, metric, direction, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![
                    run.dataset_name,
                    run.train_path,
                    run.metric,
                    run.direction.as_str(),
                    now_utc_string()
                ],
            )
            .context("failed to insert datarun")?;

        Ok(self.connection.last_insert_rowid())
    }

    /// Adds jobs to the backlog of `datarun_id`. A job whose method,
    /// partition and parameters were already enqueued for the run is skipped.
    pub fn enqueue_jobs(&mut self, datarun_id: RunId, jobs: &[JobSpec]) -> Result<EnqueueCounts> {
        self.get_run(datarun_id)?;

        let now = now_utc_string();
        let mut counts = EnqueueCounts::default();
        let tx = self.connection.transaction()?;

        {
            let mut insert_partition = tx.prepare(
                "
                INSERT INTO hyperpartitions(datarun_id, method, categoricals_json)
                VALUES(?1, ?2, ?3)
                ON CONFLICT(datarun_id, method, categoricals_json) DO NOTHING
                ",
            )?;
            let mut select_partition = tx.prepare(
                "SELECT id FROM hyperpartitions
                 WHERE datarun_id = ?1 AND method = ?2 AND categoricals_json = ?3",
            )?;
            let mut insert_job = tx.prepare(
                "
                INSERT INTO jobs(datarun_id, hyperpartition_id, params_json, params_hash, status, created_at)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(datarun_id, params_hash) DO NOTHING
                ",
            )?;

            for job in jobs {
                let method = job.method.trim();
                if method.is_empty() {
                    bail!("job method must not be empty");
                }

                let categoricals_json = serde_json::to_string(&job.partition)
                    .context("failed to serialize partition")?;
                let params_json =
                    serde_json::to_string(&job.params).context("failed to serialize params")?;
                let params_hash = sha256_hex(
                    serde_json::json!({
                        "method": method,
                        "partition": job.partition,
                        "params": job.params,
                    })
                    .to_string()
                    .as_bytes(),
                );

                counts.partitions_created +=
                    insert_partition.execute(params![datarun_id, method, categoricals_json])?;
                let partition_id: i64 = select_partition.query_row(
                    params![datarun_id, method, categoricals_json],
                    |row| row.get(0),
                )?;

                let inserted = insert_job.execute(params![
                    datarun_id,
                    partition_id,
                    params_json,
                    params_hash,
                    EvaluationStatus::Pending.as_str(),
                    now
                ])?;
                if inserted == 0 {
                    counts.jobs_skipped += 1;
                } else {
                    counts.jobs_inserted += 1;
                }
            }
        }

        tx.commit()?;
        Ok(counts)
    }

    pub fn get_partition(&self, partition_id: i64) -> Result<Partition> {
        let row = self
            .connection
            .query_row(
                "SELECT id, datarun_id, method, categoricals_json FROM hyperpartitions WHERE id = ?1",
                [partition_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, RunId>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, datarun_id, method, categoricals_json)) = row else {
            bail!("hyperpartition {partition_id} does not exist");
        };

        Ok(Partition {
            id,
            datarun_id,
            method,
            categoricals: serde_json::from_str(&categoricals_json)
                .with_context(|| format!("invalid categoricals for hyperpartition {id}"))?,
        })
    }

    pub fn job_counts(&self, datarun_id: Option<RunId>) -> Result<JobCounts> {
        let mut statement = self.connection.prepare(
            "SELECT status, COUNT(*) FROM jobs
             WHERE (?1 IS NULL OR datarun_id = ?1)
             GROUP BY status",
        )?;

        let mut rows = statement.query([datarun_id])?;
        let mut counts = JobCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match EvaluationStatus::parse(&status)? {
                EvaluationStatus::Pending => counts.pending = count,
                EvaluationStatus::Running => counts.running = count,
                EvaluationStatus::Complete => counts.complete = count,
                EvaluationStatus::Errored => counts.errored = count,
            }
        }

        Ok(counts)
    }

    pub fn count_dataruns(&self) -> Result<i64> {
        let count = self
            .connection
            .query_row("SELECT COUNT(*) FROM dataruns", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl JobStore for SqliteStore {
    fn claim_next(
        &mut self,
        restriction: Option<&BTreeSet<RunId>>,
        policy: SelectionPolicy,
        worker_id: &str,
    ) -> Result<Option<ClaimedJob>> {
        if restriction.is_some_and(BTreeSet::is_empty) {
            return Ok(None);
        }

        // IMMEDIATE takes the write lock up front, so the select and the
        // status flip below cannot interleave with another worker's claim.
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin claim transaction")?;

        let candidates = eligible_job_ids(&tx, restriction, policy)?;
        let chosen = match policy {
            SelectionPolicy::First => candidates.first().copied(),
            SelectionPolicy::Random => candidates.choose(&mut rand::thread_rng()).copied(),
        };
        let Some(job_id) = chosen else {
            return Ok(None);
        };

        let now = now_utc_string();
        let updated = tx.execute(
            "UPDATE jobs SET status = ?1, claimed_by = ?2, claimed_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                EvaluationStatus::Running.as_str(),
                worker_id,
                now,
                job_id,
                EvaluationStatus::Pending.as_str()
            ],
        )?;
        if updated != 1 {
            bail!("job {job_id} was no longer pending when claimed");
        }

        let row = load_job_row(&tx, job_id)?;
        tx.execute(
            "INSERT INTO classifiers(datarun_id, hyperpartition_id, job_id, params_json, status, worker_id, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.datarun_id,
                row.partition_id,
                row.job_id,
                row.params_json,
                EvaluationStatus::Running.as_str(),
                worker_id,
                now
            ],
        )?;
        let classifier_id = tx.last_insert_rowid();
        tx.commit().context("failed to commit claim")?;

        debug!(job_id, classifier_id, worker_id, "claimed job");

        Ok(Some(ClaimedJob {
            job_id: row.job_id,
            classifier_id,
            datarun_id: row.datarun_id,
            partition_id: row.partition_id,
            method: row.method,
            categoricals: serde_json::from_str(&row.categoricals_json)
                .with_context(|| format!("invalid categoricals for job {job_id}"))?,
            params: serde_json::from_str(&row.params_json)
                .with_context(|| format!("invalid params for job {job_id}"))?,
            dataset_name: row.dataset_name,
            train_path: row.train_path,
            metric: row.metric,
            direction: ScoreDirection::parse(&row.direction)?,
        }))
    }

    fn record_result(&mut self, job: &ClaimedJob, outcome: &EvaluationOutcome) -> Result<()> {
        let status = outcome.status();
        let (metric, metric_stdev, error_message) = match outcome {
            EvaluationOutcome::Complete {
                metric,
                metric_stdev,
                ..
            } => (*metric, *metric_stdev, None),
            EvaluationOutcome::Errored { message } => (None, None, Some(message.as_str())),
        };

        let tx = self.connection.transaction()?;
        let updated = tx.execute(
            "UPDATE classifiers
             SET status = ?1, cv_judgment_metric = ?2, cv_judgment_metric_stdev = ?3,
                 error_message = ?4, completed_at = ?5
             WHERE id = ?6",
            params![
                status.as_str(),
                metric,
                metric_stdev,
                error_message,
                now_utc_string(),
                job.classifier_id
            ],
        )?;
        if updated != 1 {
            bail!("classifier {} does not exist", job.classifier_id);
        }
        tx.execute(
            "UPDATE jobs SET status = ?1 WHERE id = ?2",
            params![status.as_str(), job.job_id],
        )?;
        tx.commit()
            .with_context(|| format!("failed to record result for job {}", job.job_id))?;

        Ok(())
    }

    fn list_evaluations(
        &self,
        datarun_id: RunId,
        status: Option<EvaluationStatus>,
    ) -> Result<Vec<Evaluation>> {
        let mut statement = self.connection.prepare(
            "
            SELECT
              c.id,
              c.datarun_id,
              c.hyperpartition_id,
              h.method,
              c.job_id,
              c.params_json,
              c.cv_judgment_metric,
              c.cv_judgment_metric_stdev,
              c.status,
              c.error_message,
              c.worker_id,
              c.created_at,
              c.completed_at
            FROM classifiers c
            JOIN hyperpartitions h ON h.id = c.hyperpartition_id
            WHERE c.datarun_id = ?1 AND (?2 IS NULL OR c.status = ?2)
            ORDER BY c.created_at ASC, c.id ASC
            ",
        )?;

        let mut rows = statement.query(params![datarun_id, status.map(EvaluationStatus::as_str)])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let params_json: String = row.get(5)?;
            let status_raw: String = row.get(8)?;

            out.push(Evaluation {
                id,
                datarun_id: row.get(1)?,
                partition_id: row.get(2)?,
                method: row.get(3)?,
                job_id: row.get(4)?,
                params: serde_json::from_str(&params_json)
                    .with_context(|| format!("invalid params for classifier {id}"))?,
                metric: row.get(6)?,
                metric_stdev: row.get(7)?,
                status: EvaluationStatus::parse(&status_raw)?,
                error_message: row.get(9)?,
                worker_id: row.get(10)?,
                created_at: row.get(11)?,
                completed_at: row.get(12)?,
            });
        }

        Ok(out)
    }

    fn get_run(&self, datarun_id: RunId) -> Result<Run> {
        let row = self
            .connection
            .query_row(
                "SELECT id, dataset_name, train_path, metric, direction, created_at
                 FROM dataruns WHERE id = ?1",
                [datarun_id],
                |row| {
                    Ok((
                        row.get::<_, RunId>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, dataset_name, train_path, metric, direction, created_at)) = row else {
            bail!("datarun {datarun_id} does not exist");
        };

        Ok(Run {
            id,
            dataset_name,
            train_path,
            metric,
            direction: ScoreDirection::parse(&direction)?,
            created_at,
        })
    }
}

fn eligible_job_ids(
    connection: &Connection,
    restriction: Option<&BTreeSet<RunId>>,
    policy: SelectionPolicy,
) -> Result<Vec<i64>> {
    let run_ids: Vec<RunId> = restriction
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default();

    let mut sql = String::from("SELECT id FROM jobs WHERE status = 'pending'");
    if restriction.is_some() {
        let placeholders = vec!["?"; run_ids.len()].join(", ");
        sql.push_str(&format!(" AND datarun_id IN ({placeholders})"));
    }
    sql.push_str(" ORDER BY id ASC");
    if policy == SelectionPolicy::First {
        sql.push_str(" LIMIT 1");
    }

    let mut statement = connection.prepare(&sql)?;
    let ids = statement
        .query_map(params_from_iter(run_ids.iter()), |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

fn load_job_row(connection: &Connection, job_id: i64) -> Result<JobRow> {
    let row = connection.query_row(
        "
        SELECT
          j.id,
          j.datarun_id,
          j.hyperpartition_id,
          h.method,
          h.categoricals_json,
          j.params_json,
          d.dataset_name,
          d.train_path,
          d.metric,
          d.direction
        FROM jobs j
        JOIN hyperpartitions h ON h.id = j.hyperpartition_id
        JOIN dataruns d ON d.id = j.datarun_id
        WHERE j.id = ?1
        ",
        [job_id],
        |row| {
            Ok(JobRow {
                job_id: row.get(0)?,
                datarun_id: row.get(1)?,
                partition_id: row.get(2)?,
                method: row.get(3)?,
                categoricals_json: row.get(4)?,
                params_json: row.get(5)?,
                dataset_name: row.get(6)?,
                train_path: row.get(7)?,
                metric: row.get(8)?,
                direction: row.get(9)?,
            })
        },
    )?;
    Ok(row)
}
