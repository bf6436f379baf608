use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StoreArgs;
use crate::store::SqliteStore;

pub fn run(args: StoreArgs) -> Result<()> {
    let db_path = args.resolve_db_path();

    info!(cache_root = %args.cache_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "job store missing");
        return Ok(());
    }

    let store = SqliteStore::open(&db_path)?;
    let dataruns = store.count_dataruns()?;
    let jobs = store.job_counts(None)?;

    info!(
        path = %db_path.display(),
        dataruns,
        pending = jobs.pending,
        running = jobs.running,
        complete = jobs.complete,
        errored = jobs.errored,
        "job store status"
    );

    if jobs.running > 0 {
        warn!(
            running = jobs.running,
            "jobs are claimed but unfinished; a worker may still be busy or may have died"
        );
    }

    Ok(())
}
