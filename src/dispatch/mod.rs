use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::model::WorkerParams;
use crate::worker::WorkerReport;

mod launcher;
#[cfg(test)]
mod tests;

pub use launcher::{ProcessLauncher, ThreadLauncher, WORKER_PARAMS_ENV};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Failed(String),
}

pub trait WorkerHandle {
    /// Blocks until the worker has terminated. No timeout.
    fn wait(self) -> WorkerExit;
}

pub trait WorkerLauncher {
    type Handle: WorkerHandle;

    /// Runs the work function synchronously in the caller.
    fn run_inline(&self, params: &WorkerParams) -> Result<WorkerReport>;

    /// Starts one isolated worker with its own copy of `params`.
    fn spawn(&self, index: usize, params: &WorkerParams) -> Result<Self::Handle>;
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DispatchSummary {
    pub workers: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Workers that were started and not yet joined.
pub struct WorkerPool<H> {
    workers: usize,
    handles: Vec<(usize, H)>,
    spawn_failures: usize,
}

impl<H: WorkerHandle> WorkerPool<H> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker in launch order.
    pub fn join(self) -> DispatchSummary {
        let mut summary = DispatchSummary {
            workers: self.workers,
            succeeded: 0,
            failed: self.spawn_failures,
        };

        for (index, handle) in self.handles {
            match handle.wait() {
                WorkerExit::Success => {
                    summary.succeeded += 1;
                    info!(worker_index = index, "worker finished");
                }
                WorkerExit::Failed(reason) => {
                    summary.failed += 1;
                    warn!(worker_index = index, reason = %reason, "worker terminated abnormally");
                }
            }
        }

        info!(
            workers = summary.workers,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "all workers finished"
        );
        summary
    }
}

pub enum Dispatch<H> {
    /// A single worker ran in the caller.
    Inline(WorkerReport),
    /// Every worker was joined.
    Joined(DispatchSummary),
    /// Workers are still running; join the pool or drop it to let them run on.
    Detached(WorkerPool<H>),
}

pub fn work_parallel<L>(
    launcher: &L,
    params: &WorkerParams,
    n_workers: usize,
) -> Result<Dispatch<L::Handle>>
where
    L: WorkerLauncher,
{
    if n_workers == 0 {
        bail!("worker count must be at least 1");
    }

    if n_workers == 1 {
        info!("running single worker in-process");
        return Ok(Dispatch::Inline(launcher.run_inline(params)?));
    }

    info!(workers = n_workers, "starting workers");

    let mut pool = WorkerPool {
        workers: n_workers,
        handles: Vec::with_capacity(n_workers),
        spawn_failures: 0,
    };
    for index in 0..n_workers {
        match launcher.spawn(index, params) {
            Ok(handle) => pool.handles.push((index, handle)),
            Err(err) => {
                pool.spawn_failures += 1;
                let reason = format!("{err:#}");
                error!(worker_index = index, error = %reason, "failed to start worker");
            }
        }
    }

    if params.blocking {
        Ok(Dispatch::Joined(pool.join()))
    } else {
        info!(running = pool.len(), "workers detached");
        Ok(Dispatch::Detached(pool))
    }
}
