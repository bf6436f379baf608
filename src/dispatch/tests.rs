use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::*;
use crate::model::{
    ClaimedJob, EvaluationOutcome, EvaluationStatus, EvaluatorSpec, ExecutionEnvironment, JobSpec,
    NewRun, RunId, ScoreDirection, SelectionPolicy,
};
use crate::store::{JobStore, SqliteStore};
use crate::worker::work;

fn worker_params(db_path: &Path, blocking: bool) -> WorkerParams {
    WorkerParams {
        db_path: db_path.to_path_buf(),
        datarun_ids: None,
        selection: SelectionPolicy::Random,
        save_artifacts: false,
        artifact_dir: PathBuf::from("artifacts"),
        environment: ExecutionEnvironment::Local,
        blocking,
        evaluator: EvaluatorSpec {
            command: "true".to_string(),
        },
    }
}

fn seed_backlog(db_path: &Path, jobs: usize) -> RunId {
    let mut store = SqliteStore::open(db_path).expect("store should open");
    let run_id = store
        .create_run(&NewRun {
            dataset_name: "wine".to_string(),
            train_path: "wine.csv".to_string(),
            metric: "f1".to_string(),
            direction: ScoreDirection::Maximize,
        })
        .unwrap();
    let specs: Vec<JobSpec> = (0..jobs)
        .map(|i| JobSpec {
            method: "rf".to_string(),
            partition: serde_json::json!({ "criterion": "gini" }),
            params: serde_json::json!({ "n_estimators": 10 * (i + 1) }),
        })
        .collect();
    store.enqueue_jobs(run_id, &specs).unwrap();
    run_id
}

/// Drains the shared store from one worker, counting evaluations.
fn drain(
    index: usize,
    params: &WorkerParams,
    evaluations: &AtomicUsize,
) -> anyhow::Result<WorkerReport> {
    let mut store = SqliteStore::open(&params.db_path)?;
    let evaluator = |job: &ClaimedJob| {
        evaluations.fetch_add(1, Ordering::SeqCst);
        EvaluationOutcome::Complete {
            metric: Some(job.job_id as f64 / 100.0),
            metric_stdev: Some(0.0),
            details: serde_json::json!({}),
        }
    };
    work(&mut store, &evaluator, params, &format!("thread-{index}"))
}

fn counting_launcher(
    evaluations: Arc<AtomicUsize>,
    reports: Arc<Mutex<Vec<WorkerReport>>>,
) -> ThreadLauncher {
    ThreadLauncher::new(move |index, params| {
        let report = drain(index, params, &evaluations)?;
        reports
            .lock()
            .map_err(|_| anyhow::anyhow!("report lock poisoned"))?
            .push(report.clone());
        Ok(report)
    })
}

#[test]
fn zero_workers_is_rejected() {
    let launcher = ThreadLauncher::new(|_, _| Ok(WorkerReport::default()));
    let params = worker_params(Path::new("unused.sqlite"), true);
    assert!(work_parallel(&launcher, &params, 0).is_err());
}

#[test]
fn single_worker_runs_inline_on_caller_thread() {
    let caller = thread::current().id();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen_calls = Arc::clone(&calls);
    let launcher = ThreadLauncher::new(move |index, _| {
        assert_eq!(index, 0);
        assert_eq!(thread::current().id(), caller);
        seen_calls.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerReport {
            complete: 2,
            errored: 0,
        })
    });

    let params = worker_params(Path::new("unused.sqlite"), true);
    match work_parallel(&launcher, &params, 1).expect("dispatch should work") {
        Dispatch::Inline(report) => assert_eq!(report.complete, 2),
        _ => panic!("single worker must run inline"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn single_worker_error_reaches_caller() {
    let launcher = ThreadLauncher::new(|_, _| Err(anyhow::anyhow!("store unreachable")));
    let params = worker_params(Path::new("unused.sqlite"), true);
    let error = work_parallel(&launcher, &params, 1)
        .err()
        .expect("inline error should propagate");
    assert!(error.to_string().contains("store unreachable"));
}

#[test]
fn more_workers_than_jobs_executes_each_job_once() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let db_path = dir.path().join("backlog.sqlite");
    let run_id = seed_backlog(&db_path, 2);

    let evaluations = Arc::new(AtomicUsize::new(0));
    let reports = Arc::new(Mutex::new(Vec::new()));
    let launcher = counting_launcher(Arc::clone(&evaluations), Arc::clone(&reports));

    let summary = match work_parallel(&launcher, &worker_params(&db_path, true), 4).unwrap() {
        Dispatch::Joined(summary) => summary,
        _ => panic!("blocking dispatch must join"),
    };

    assert_eq!(
        summary,
        DispatchSummary {
            workers: 4,
            succeeded: 4,
            failed: 0,
        }
    );
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 4);
    assert_eq!(reports.iter().map(WorkerReport::processed).sum::<usize>(), 2);
    assert!(reports.iter().filter(|report| report.processed() == 0).count() >= 2);

    let store = SqliteStore::open(&db_path).unwrap();
    let records = store.list_evaluations(run_id, None).unwrap();
    let job_ids: HashSet<i64> = records.iter().map(|record| record.job_id).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(job_ids.len(), 2);
    assert!(
        records
            .iter()
            .all(|record| record.status == EvaluationStatus::Complete)
    );
}

#[test]
fn panicking_worker_does_not_stop_siblings() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let db_path = dir.path().join("backlog.sqlite");
    let run_id = seed_backlog(&db_path, 6);

    let evaluations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evaluations);
    let launcher = ThreadLauncher::new(move |index, params| {
        if index == 0 {
            panic!("worker 0 crashed");
        }
        drain(index, params, &counter)
    });

    let summary = match work_parallel(&launcher, &worker_params(&db_path, true), 3).unwrap() {
        Dispatch::Joined(summary) => summary,
        _ => panic!("blocking dispatch must join"),
    };

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(evaluations.load(Ordering::SeqCst), 6);

    let store = SqliteStore::open(&db_path).unwrap();
    assert_eq!(store.job_counts(Some(run_id)).unwrap().complete, 6);
}

#[test]
fn detached_pool_can_be_joined_later() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let db_path = dir.path().join("backlog.sqlite");
    seed_backlog(&db_path, 3);

    let evaluations = Arc::new(AtomicUsize::new(0));
    let launcher = counting_launcher(Arc::clone(&evaluations), Arc::new(Mutex::new(Vec::new())));

    let pool = match work_parallel(&launcher, &worker_params(&db_path, false), 2).unwrap() {
        Dispatch::Detached(pool) => pool,
        _ => panic!("non-blocking dispatch must return the pool"),
    };
    assert_eq!(pool.len(), 2);

    let summary = pool.join();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(evaluations.load(Ordering::SeqCst), 3);
}

#[test]
fn unlaunchable_workers_are_counted_as_failed() {
    let launcher = ProcessLauncher::new("/nonexistent/modelsearch-binary");
    let params = worker_params(Path::new("unused.sqlite"), true);

    match work_parallel(&launcher, &params, 3).expect("spawn failures are not fatal") {
        Dispatch::Joined(summary) => {
            assert_eq!(summary.workers, 3);
            assert_eq!(summary.failed, 3);
            assert_eq!(summary.succeeded, 0);
        }
        _ => panic!("blocking dispatch must join"),
    }
}
