use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::baseline::DEFAULT_BASELINE_URL;
use crate::dispatch::WORKER_PARAMS_ENV;
use crate::model::{RunId, ScoreDirection, SelectionPolicy};

#[derive(Parser, Debug)]
#[command(
    name = "modelsearch",
    version,
    about = "Dispatch model-search workers and report on their results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a datarun (or extend one) and add candidate jobs to its backlog.
    Enqueue(EnqueueArgs),
    /// Start a pool of workers on the backlog.
    Dispatch(DispatchArgs),
    #[command(hide = true)]
    Worker(WorkerArgs),
    Summary(RunArgs),
    MethodSummary(RunArgs),
    PartitionSummary(RunArgs),
    BestSoFar(BestSoFarArgs),
    /// Compare a datarun's best-so-far curve against the stored baseline.
    Compare(CompareArgs),
    Status(StoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = ".cache/modelsearch")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

impl StoreArgs {
    pub fn resolve_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.cache_root.join("modelsearch.sqlite"))
    }
}

#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Extend an existing datarun instead of creating a new one.
    #[arg(long)]
    pub datarun_id: Option<RunId>,

    #[arg(long, required_unless_present = "datarun_id")]
    pub dataset_name: Option<String>,

    #[arg(long, required_unless_present = "datarun_id")]
    pub train_path: Option<String>,

    #[arg(long, default_value = "f1")]
    pub metric: String,

    #[arg(long, value_enum, default_value_t = ScoreDirection::Maximize)]
    pub direction: ScoreDirection,

    /// JSON array of `{"method": .., "partition": {..}, "params": {..}}`.
    #[arg(long)]
    pub jobs: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct DispatchArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Only work on these dataruns; all dataruns when omitted.
    #[arg(long = "datarun-id")]
    pub datarun_ids: Vec<RunId>,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, value_enum, default_value_t = SelectionPolicy::Random)]
    pub selection: SelectionPolicy,

    #[arg(long, default_value_t = false)]
    pub save_artifacts: bool,

    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub remote: bool,

    /// JSON file with `access_key`, `secret_key`, `s3_bucket`, `s3_folder`.
    #[arg(long, requires = "remote")]
    pub remote_config: Option<PathBuf>,

    /// Return right after the workers are started.
    #[arg(long, default_value_t = false)]
    pub detach: bool,

    /// Shell command that evaluates one job (JSON on stdin, result on stdout).
    #[arg(long)]
    pub eval_command: String,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long, default_value_t = 0)]
    pub worker_index: usize,

    #[arg(long, env = WORKER_PARAMS_ENV, hide_env_values = true)]
    pub params: String,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub datarun_id: RunId,
}

#[derive(Args, Debug, Clone)]
pub struct BestSoFarArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, default_value = DEFAULT_BASELINE_URL)]
    pub baseline_url: String,

    /// Read baselines from this directory instead of downloading them.
    #[arg(long, conflicts_with = "baseline_url")]
    pub baseline_dir: Option<PathBuf>,

    /// Write the first points of both curves here for plotting.
    #[arg(long)]
    pub series_out: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    pub series_length: usize,
}
