use anyhow::{Context, Result};
use tracing::info;

use crate::cli::WorkerArgs;
use crate::model::WorkerParams;
use crate::worker::{run_worker, worker_id};

pub fn run(args: WorkerArgs) -> Result<()> {
    let params: WorkerParams =
        serde_json::from_str(&args.params).context("failed to parse worker params")?;
    let worker_id = worker_id(args.worker_index);

    let report = run_worker(&params, &worker_id)?;
    info!(
        worker_id = %worker_id,
        complete = report.complete,
        errored = report.errored,
        "worker completed"
    );

    Ok(())
}
