use std::fs;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::EnqueueArgs;
use crate::model::{JobSpec, NewRun};
use crate::store::{JobStore, SqliteStore};
use crate::util::ensure_directory;

pub fn run(args: EnqueueArgs) -> Result<()> {
    let raw = fs::read(&args.jobs)
        .with_context(|| format!("failed to read {}", args.jobs.display()))?;
    let jobs: Vec<JobSpec> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", args.jobs.display()))?;
    if jobs.is_empty() {
        bail!("{} contains no jobs", args.jobs.display());
    }

    let db_path = args.store.resolve_db_path();
    if let Some(parent) = db_path.parent() {
        ensure_directory(parent)?;
    }
    let mut store = SqliteStore::open(&db_path)?;

    let datarun_id = match args.datarun_id {
        Some(datarun_id) => store.get_run(datarun_id)?.id,
        None => {
            let (Some(dataset_name), Some(train_path)) = (args.dataset_name, args.train_path) else {
                bail!("--dataset-name and --train-path are required for a new datarun");
            };
            let datarun_id = store.create_run(&NewRun {
                dataset_name,
                train_path,
                metric: args.metric,
                direction: args.direction,
            })?;
            info!(datarun_id, "created datarun");
            datarun_id
        }
    };

    let counts = store.enqueue_jobs(datarun_id, &jobs)?;
    info!(
        datarun_id,
        db_path = %db_path.display(),
        partitions_created = counts.partitions_created,
        jobs_inserted = counts.jobs_inserted,
        jobs_skipped = counts.jobs_skipped,
        "enqueue completed"
    );
    println!("{datarun_id}");

    Ok(())
}
