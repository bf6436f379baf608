use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub type RunId = i64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScoreDirection {
    Maximize,
    Minimize,
}

impl ScoreDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Maximize => "maximize",
            Self::Minimize => "minimize",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "maximize" => Ok(Self::Maximize),
            "minimize" => Ok(Self::Minimize),
            other => bail!("unknown score direction: {other}"),
        }
    }

    /// True when `candidate` strictly improves on `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Complete,
    Errored,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "errored" => Ok(Self::Errored),
            other => bail!("unknown evaluation status: {other}"),
        }
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    Random,
    First,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub dataset_name: String,
    pub train_path: String,
    pub metric: String,
    pub direction: ScoreDirection,
    pub created_at: String,
}

impl Run {
    /// File name of the training data; baselines are keyed by it.
    pub fn dataset_ref(&self) -> String {
        Path::new(&self.train_path)
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| self.train_path.clone())
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<datarun {}: {} {} ({})>",
            self.id,
            self.dataset_name,
            self.metric,
            self.direction.as_str()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub id: i64,
    pub datarun_id: RunId,
    pub method: String,
    pub categoricals: serde_json::Value,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {}>", self.method, self.categoricals)
    }
}

/// A completed or attempted evaluation of one candidate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: i64,
    pub datarun_id: RunId,
    pub partition_id: i64,
    pub method: String,
    pub job_id: i64,
    pub params: serde_json::Value,
    pub metric: Option<f64>,
    pub metric_stdev: Option<f64>,
    pub status: EvaluationStatus,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl Evaluation {
    /// The judgment metric, if it is usable for ranking.
    pub fn scored_metric(&self) -> Option<f64> {
        self.metric.filter(|value| !value.is_nan())
    }
}

/// A backlog job after a worker has claimed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job_id: i64,
    pub classifier_id: i64,
    pub datarun_id: RunId,
    pub partition_id: i64,
    pub method: String,
    pub categoricals: serde_json::Value,
    pub params: serde_json::Value,
    pub dataset_name: String,
    pub train_path: String,
    pub metric: String,
    pub direction: ScoreDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    Complete {
        metric: Option<f64>,
        metric_stdev: Option<f64>,
        details: serde_json::Value,
    },
    Errored {
        message: String,
    },
}

impl EvaluationOutcome {
    pub fn status(&self) -> EvaluationStatus {
        match self {
            Self::Complete { .. } => EvaluationStatus::Complete,
            Self::Errored { .. } => EvaluationStatus::Errored,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_folder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExecutionEnvironment {
    Local,
    Remote {
        #[serde(default)]
        credentials: Option<RemoteCredentials>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluatorSpec {
    pub command: String,
}

/// Everything a worker needs; every worker receives an identical copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerParams {
    pub db_path: PathBuf,
    pub datarun_ids: Option<BTreeSet<RunId>>,
    pub selection: SelectionPolicy,
    pub save_artifacts: bool,
    pub artifact_dir: PathBuf,
    pub environment: ExecutionEnvironment,
    pub blocking: bool,
    pub evaluator: EvaluatorSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub method: String,
    #[serde(default = "empty_object")]
    pub partition: serde_json::Value,
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub dataset_name: String,
    pub train_path: String,
    pub metric: String,
    pub direction: ScoreDirection,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EnqueueCounts {
    pub partitions_created: usize,
    pub jobs_inserted: usize,
    pub jobs_skipped: usize,
}
