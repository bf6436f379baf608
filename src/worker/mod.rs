use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{ClaimedJob, EvaluationOutcome, RunId, WorkerParams};
use crate::store::{JobStore, SqliteStore};
use crate::tracker::BestSoFar;
use crate::util::write_json_pretty;

mod evaluator;

pub use evaluator::{CommandEvaluator, Evaluator};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WorkerReport {
    pub complete: usize,
    pub errored: usize,
}

impl WorkerReport {
    pub fn processed(&self) -> usize {
        self.complete + self.errored
    }
}

pub fn worker_id(index: usize) -> String {
    format!("worker-{index}-pid{}", std::process::id())
}

/// Opens the store named in `params` and works the backlog with the
/// configured evaluation command.
pub fn run_worker(params: &WorkerParams, worker_id: &str) -> Result<WorkerReport> {
    let mut store = SqliteStore::open(&params.db_path)?;
    let evaluator = CommandEvaluator::from_params(params);
    work(&mut store, &evaluator, params, worker_id)
}

/// Processes jobs one at a time until the backlog has nothing eligible.
pub fn work<S, E>(
    store: &mut S,
    evaluator: &E,
    params: &WorkerParams,
    worker_id: &str,
) -> Result<WorkerReport>
where
    S: JobStore + ?Sized,
    E: Evaluator + ?Sized,
{
    let mut report = WorkerReport::default();
    let mut best_by_run: HashMap<RunId, BestSoFar> = HashMap::new();

    info!(worker_id, "worker started");

    while let Some(job) =
        store.claim_next(params.datarun_ids.as_ref(), params.selection, worker_id)?
    {
        info!(
            worker_id,
            job_id = job.job_id,
            classifier_id = job.classifier_id,
            datarun_id = job.datarun_id,
            method = %job.method,
            "evaluating candidate"
        );

        let outcome = evaluator.evaluate(&job);

        if params.save_artifacts {
            let path = artifact_path(&params.artifact_dir, &job);
            if let Err(err) = save_artifact(&path, &job, &outcome) {
                warn!(worker_id, path = %path.display(), error = %err, "failed to save artifact");
            }
        }

        store.record_result(&job, &outcome)?;

        match &outcome {
            EvaluationOutcome::Complete {
                metric,
                metric_stdev,
                ..
            } => {
                report.complete += 1;
                let tracker = best_by_run
                    .entry(job.datarun_id)
                    .or_insert_with(|| BestSoFar::new(job.direction));
                let previous = tracker.best();
                let current = tracker.observe(*metric);
                if current.is_some() && current != previous {
                    info!(
                        worker_id,
                        datarun_id = job.datarun_id,
                        classifier_id = job.classifier_id,
                        metric_name = %job.metric,
                        best = current,
                        stdev = *metric_stdev,
                        "new best"
                    );
                }
            }
            EvaluationOutcome::Errored { message } => {
                report.errored += 1;
                warn!(
                    worker_id,
                    job_id = job.job_id,
                    classifier_id = job.classifier_id,
                    error = %message,
                    "evaluation errored"
                );
            }
        }
    }

    info!(
        worker_id,
        complete = report.complete,
        errored = report.errored,
        "no eligible jobs left, worker exiting"
    );
    Ok(report)
}

fn artifact_path(artifact_dir: &Path, job: &ClaimedJob) -> PathBuf {
    artifact_dir
        .join(format!("datarun-{}", job.datarun_id))
        .join(format!("classifier-{}.json", job.classifier_id))
}

fn save_artifact(path: &Path, job: &ClaimedJob, outcome: &EvaluationOutcome) -> Result<()> {
    let result = match outcome {
        EvaluationOutcome::Complete {
            metric,
            metric_stdev,
            details,
        } => serde_json::json!({
            "status": outcome.status().as_str(),
            "metric": metric,
            "metric_stdev": metric_stdev,
            "details": details,
        }),
        EvaluationOutcome::Errored { message } => serde_json::json!({
            "status": outcome.status().as_str(),
            "error": message,
        }),
    };

    write_json_pretty(path, &serde_json::json!({ "job": job, "result": result }))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeSet;

    use super::*;
    use crate::model::{
        EvaluationStatus, EvaluatorSpec, ExecutionEnvironment, JobSpec, NewRun, ScoreDirection,
        SelectionPolicy,
    };

    fn params(datarun_ids: Option<BTreeSet<RunId>>, artifact_dir: PathBuf) -> WorkerParams {
        WorkerParams {
            db_path: PathBuf::from(":memory:"),
            datarun_ids,
            selection: SelectionPolicy::First,
            save_artifacts: false,
            artifact_dir,
            environment: ExecutionEnvironment::Local,
            blocking: true,
            evaluator: EvaluatorSpec {
                command: "true".to_string(),
            },
        }
    }

    fn seeded_store(jobs: usize) -> (SqliteStore, RunId) {
        let mut store = SqliteStore::open_in_memory().expect("store should open");
        let run_id = store
            .create_run(&NewRun {
                dataset_name: "iris".to_string(),
                train_path: "iris.csv".to_string(),
                metric: "accuracy".to_string(),
                direction: ScoreDirection::Maximize,
            })
            .unwrap();
        let specs: Vec<JobSpec> = (0..jobs)
            .map(|i| JobSpec {
                method: "svm".to_string(),
                partition: serde_json::json!({}),
                params: serde_json::json!({ "C": i }),
            })
            .collect();
        store.enqueue_jobs(run_id, &specs).unwrap();
        (store, run_id)
    }

    #[test]
    fn work_drains_backlog_and_records_each_job_once() {
        let (mut store, run_id) = seeded_store(4);
        let calls = Cell::new(0);
        let evaluator = |job: &ClaimedJob| {
            calls.set(calls.get() + 1);
            if job.params["C"] == 2 {
                EvaluationOutcome::Errored {
                    message: "singular matrix".to_string(),
                }
            } else {
                EvaluationOutcome::Complete {
                    metric: Some(0.1 * job.job_id as f64),
                    metric_stdev: Some(0.0),
                    details: serde_json::json!({}),
                }
            }
        };

        let report = work(&mut store, &evaluator, &params(None, PathBuf::new()), "w0")
            .expect("worker should finish");

        assert_eq!(calls.get(), 4);
        assert_eq!(report, WorkerReport { complete: 3, errored: 1 });
        let evaluations = store.list_evaluations(run_id, None).unwrap();
        assert_eq!(evaluations.len(), 4);
        assert_eq!(
            evaluations
                .iter()
                .filter(|evaluation| evaluation.status == EvaluationStatus::Errored)
                .count(),
            1
        );
        assert_eq!(store.job_counts(Some(run_id)).unwrap().pending, 0);
    }

    #[test]
    fn work_on_empty_backlog_exits_normally() {
        let (mut store, _) = seeded_store(0);
        let evaluator = |_: &ClaimedJob| -> EvaluationOutcome {
            panic!("nothing should be evaluated");
        };

        let report = work(&mut store, &evaluator, &params(None, PathBuf::new()), "w0")
            .expect("empty backlog is not an error");
        assert_eq!(report.processed(), 0);
    }

    #[test]
    fn work_respects_run_restriction() {
        let (mut store, run_id) = seeded_store(2);
        let other: BTreeSet<RunId> = [run_id + 100].into_iter().collect();
        let evaluator = |_: &ClaimedJob| EvaluationOutcome::Errored {
            message: "unexpected".to_string(),
        };

        let report = work(&mut store, &evaluator, &params(Some(other), PathBuf::new()), "w0")
            .unwrap();
        assert_eq!(report.processed(), 0);
        assert_eq!(store.job_counts(Some(run_id)).unwrap().pending, 2);
    }

    #[test]
    fn artifacts_are_written_when_enabled() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let (mut store, run_id) = seeded_store(1);
        let mut worker_params = params(None, dir.path().to_path_buf());
        worker_params.save_artifacts = true;
        let evaluator = |_: &ClaimedJob| EvaluationOutcome::Complete {
            metric: Some(0.9),
            metric_stdev: Some(0.01),
            details: serde_json::json!({ "folds": 10 }),
        };

        work(&mut store, &evaluator, &worker_params, "w0").unwrap();

        let classifier_id = store.list_evaluations(run_id, None).unwrap()[0].id;
        let path = dir
            .path()
            .join(format!("datarun-{run_id}"))
            .join(format!("classifier-{classifier_id}.json"));
        let raw = std::fs::read_to_string(path).expect("artifact should exist");
        let artifact: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(artifact["result"]["status"], "complete");
        assert_eq!(artifact["result"]["details"]["folds"], 10);
        assert_eq!(artifact["job"]["method"], "svm");
    }
}
