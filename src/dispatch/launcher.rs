use std::any::Any;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use super::{WorkerExit, WorkerHandle, WorkerLauncher};
use crate::model::WorkerParams;
use crate::worker::{WorkerReport, run_worker, worker_id};

/// Environment variable carrying the JSON-encoded [`WorkerParams`] into a
/// worker process.
pub const WORKER_PARAMS_ENV: &str = "MODELSEARCH_WORKER_PARAMS";

/// One OS process per worker: re-executes `program worker`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("failed to locate current executable")?;
        Ok(Self::new(program))
    }
}

pub struct ProcessHandle {
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn wait(mut self) -> WorkerExit {
        match self.child.wait() {
            Ok(status) if status.success() => WorkerExit::Success,
            Ok(status) => WorkerExit::Failed(format!("process {} {status}", self.child.id())),
            Err(err) => WorkerExit::Failed(format!("failed to wait for process: {err}")),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn run_inline(&self, params: &WorkerParams) -> Result<WorkerReport> {
        run_worker(params, &worker_id(0))
    }

    fn spawn(&self, index: usize, params: &WorkerParams) -> Result<ProcessHandle> {
        let encoded = serde_json::to_string(params).context("failed to encode worker params")?;

        let child = Command::new(&self.program)
            .arg("worker")
            .arg("--worker-index")
            .arg(index.to_string())
            .env(WORKER_PARAMS_ENV, encoded)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to execute {}", self.program.display()))?;

        Ok(ProcessHandle { child })
    }
}

type WorkFn = dyn Fn(usize, &WorkerParams) -> Result<WorkerReport> + Send + Sync;

/// One thread per worker. Errors and panics are captured per thread.
#[derive(Clone)]
pub struct ThreadLauncher {
    work: Arc<WorkFn>,
}

impl ThreadLauncher {
    pub fn new<F>(work: F) -> Self
    where
        F: Fn(usize, &WorkerParams) -> Result<WorkerReport> + Send + Sync + 'static,
    {
        Self {
            work: Arc::new(work),
        }
    }
}

pub struct ThreadHandle {
    handle: JoinHandle<Result<WorkerReport>>,
}

impl WorkerHandle for ThreadHandle {
    fn wait(self) -> WorkerExit {
        match self.handle.join() {
            Ok(Ok(_)) => WorkerExit::Success,
            Ok(Err(err)) => WorkerExit::Failed(format!("{err:#}")),
            Err(payload) => {
                WorkerExit::Failed(format!("panicked: {}", panic_message(payload.as_ref())))
            }
        }
    }
}

impl WorkerLauncher for ThreadLauncher {
    type Handle = ThreadHandle;

    fn run_inline(&self, params: &WorkerParams) -> Result<WorkerReport> {
        (self.work)(0, params)
    }

    fn spawn(&self, index: usize, params: &WorkerParams) -> Result<ThreadHandle> {
        let work = Arc::clone(&self.work);
        let params = params.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || work(index, &params))
            .context("failed to spawn worker thread")?;

        Ok(ThreadHandle { handle })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
