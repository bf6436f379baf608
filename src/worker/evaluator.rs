use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::{ClaimedJob, EvaluationOutcome, ExecutionEnvironment, WorkerParams};

/// Trains and scores one claimed candidate.
pub trait Evaluator {
    /// Failures are reported as [`EvaluationOutcome::Errored`], never as a
    /// worker error, so one bad candidate cannot stop the loop.
    fn evaluate(&self, job: &ClaimedJob) -> EvaluationOutcome;
}

impl<F> Evaluator for F
where
    F: Fn(&ClaimedJob) -> EvaluationOutcome,
{
    fn evaluate(&self, job: &ClaimedJob) -> EvaluationOutcome {
        self(job)
    }
}

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    job: &'a ClaimedJob,
    execution: &'static str,
}

#[derive(Deserialize)]
struct EvaluationResponse {
    #[serde(default)]
    metric: Option<f64>,
    #[serde(default)]
    metric_stdev: Option<f64>,
    #[serde(flatten)]
    details: serde_json::Map<String, serde_json::Value>,
}

/// Runs a shell command per job: the job goes in as JSON on stdin and a JSON
/// object `{"metric": .., "metric_stdev": ..}` is expected on stdout.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    command: String,
    environment: ExecutionEnvironment,
}

impl CommandEvaluator {
    pub fn new(command: impl Into<String>, environment: ExecutionEnvironment) -> Self {
        Self {
            command: command.into(),
            environment,
        }
    }

    pub fn from_params(params: &WorkerParams) -> Self {
        Self::new(params.evaluator.command.clone(), params.environment.clone())
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match &self.environment {
            ExecutionEnvironment::Local => {
                command.env("MODELSEARCH_EXECUTION", "local");
            }
            ExecutionEnvironment::Remote { credentials } => {
                command.env("MODELSEARCH_EXECUTION", "remote");
                if let Some(credentials) = credentials {
                    command
                        .env("AWS_ACCESS_KEY_ID", &credentials.access_key)
                        .env("AWS_SECRET_ACCESS_KEY", &credentials.secret_key)
                        .env("MODELSEARCH_S3_BUCKET", &credentials.s3_bucket);
                    if let Some(folder) = &credentials.s3_folder {
                        command.env("MODELSEARCH_S3_FOLDER", folder);
                    }
                }
            }
        }

        command
    }

    fn run(&self, job: &ClaimedJob) -> Result<EvaluationOutcome> {
        let execution = match self.environment {
            ExecutionEnvironment::Local => "local",
            ExecutionEnvironment::Remote { .. } => "remote",
        };
        let payload = serde_json::to_vec(&EvaluationRequest { job, execution })
            .context("failed to serialize evaluation request")?;

        let mut child = self
            .build_command()
            .spawn()
            .with_context(|| format!("failed to execute evaluator: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // An evaluator may exit without reading its input.
            match stdin.write_all(&payload) {
                Err(err) if err.kind() != ErrorKind::BrokenPipe => {
                    return Err(err).context("failed to write evaluation request");
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .context("failed to wait for evaluator")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "evaluator returned non-zero exit status {} for job {}: {}",
                output.status,
                job.job_id,
                stderr.trim()
            );
        }

        parse_response(&output.stdout)
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&self, job: &ClaimedJob) -> EvaluationOutcome {
        match self.run(job) {
            Ok(outcome) => outcome,
            Err(err) => EvaluationOutcome::Errored {
                message: format!("{err:#}"),
            },
        }
    }
}

fn parse_response(stdout: &[u8]) -> Result<EvaluationOutcome> {
    let raw = String::from_utf8_lossy(stdout);
    let Some(last_line) = raw.lines().rev().find(|line| !line.trim().is_empty()) else {
        bail!("evaluator produced no output");
    };

    let response: EvaluationResponse = serde_json::from_str(last_line.trim())
        .with_context(|| format!("evaluator output is not a result object: {last_line}"))?;

    Ok(EvaluationOutcome::Complete {
        metric: response.metric,
        metric_stdev: response.metric_stdev,
        details: serde_json::Value::Object(response.details),
    })
}
