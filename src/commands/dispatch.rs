use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::DispatchArgs;
use crate::dispatch::{Dispatch, ProcessLauncher, work_parallel};
use crate::model::{
    EvaluatorSpec, ExecutionEnvironment, RemoteCredentials, WorkerParams,
};

pub fn run(args: DispatchArgs) -> Result<()> {
    let params = build_params(&args)?;
    if !params.db_path.exists() {
        bail!(
            "job store not found: {} (run enqueue first)",
            params.db_path.display()
        );
    }

    info!(
        db_path = %params.db_path.display(),
        workers = args.workers,
        selection = ?params.selection,
        restricted = params.datarun_ids.is_some(),
        save_artifacts = params.save_artifacts,
        remote = matches!(params.environment, ExecutionEnvironment::Remote { .. }),
        "starting dispatch"
    );

    let launcher = ProcessLauncher::current_exe()?;
    let mut output = io::BufWriter::new(io::stdout().lock());

    match work_parallel(&launcher, &params, args.workers)? {
        Dispatch::Inline(report) => {
            writeln!(
                output,
                "Worker finished: {} complete, {} errored",
                report.complete, report.errored
            )?;
        }
        Dispatch::Joined(summary) => {
            writeln!(
                output,
                "Workers finished: {} total; {} succeeded, {} failed",
                summary.workers, summary.succeeded, summary.failed
            )?;
        }
        Dispatch::Detached(pool) => {
            writeln!(output, "Workers started: {} running in background", pool.len())?;
        }
    }

    output.flush()?;
    Ok(())
}

fn build_params(args: &DispatchArgs) -> Result<WorkerParams> {
    if args.eval_command.trim().is_empty() {
        bail!("--eval-command must not be empty");
    }

    let datarun_ids = if args.datarun_ids.is_empty() {
        None
    } else {
        Some(args.datarun_ids.iter().copied().collect::<BTreeSet<_>>())
    };

    let environment = if args.remote {
        let credentials = args
            .remote_config
            .as_ref()
            .map(|path| -> Result<RemoteCredentials> {
                let raw = fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_slice(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))
            })
            .transpose()?;
        ExecutionEnvironment::Remote { credentials }
    } else {
        ExecutionEnvironment::Local
    };

    Ok(WorkerParams {
        db_path: args.store.resolve_db_path(),
        datarun_ids,
        selection: args.selection,
        save_artifacts: args.save_artifacts,
        artifact_dir: args
            .artifact_dir
            .clone()
            .unwrap_or_else(|| args.store.cache_root.join("artifacts")),
        environment,
        blocking: !args.detach,
        evaluator: EvaluatorSpec {
            command: args.eval_command.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::cli::StoreArgs;
    use crate::model::SelectionPolicy;

    fn args() -> DispatchArgs {
        DispatchArgs {
            store: StoreArgs {
                cache_root: PathBuf::from("/tmp/search"),
                db_path: None,
            },
            datarun_ids: vec![],
            workers: 4,
            selection: SelectionPolicy::Random,
            save_artifacts: false,
            artifact_dir: None,
            remote: false,
            remote_config: None,
            detach: false,
            eval_command: "python evaluate.py".to_string(),
        }
    }

    #[test]
    fn defaults_are_unrestricted_local_and_blocking() {
        let params = build_params(&args()).expect("params should build");
        assert_eq!(params.db_path, PathBuf::from("/tmp/search/modelsearch.sqlite"));
        assert_eq!(params.artifact_dir, PathBuf::from("/tmp/search/artifacts"));
        assert!(params.datarun_ids.is_none());
        assert!(params.blocking);
        assert_eq!(params.environment, ExecutionEnvironment::Local);
    }

    #[test]
    fn remote_config_is_loaded_into_credentials() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let config_path = dir.path().join("remote.json");
        fs::write(
            &config_path,
            r#"{"access_key": "ak", "secret_key": "sk", "s3_bucket": "models"}"#,
        )
        .unwrap();

        let mut args = args();
        args.remote = true;
        args.remote_config = Some(config_path);
        args.datarun_ids = vec![3, 1, 3];
        args.detach = true;

        let params = build_params(&args).expect("params should build");
        match params.environment {
            ExecutionEnvironment::Remote {
                credentials: Some(credentials),
            } => assert_eq!(credentials.s3_bucket, "models"),
            other => panic!("unexpected environment: {other:?}"),
        }
        assert_eq!(
            params.datarun_ids,
            Some([1, 3].into_iter().collect::<BTreeSet<_>>())
        );
        assert!(!params.blocking);
    }

    #[test]
    fn empty_eval_command_is_rejected() {
        let mut args = args();
        args.eval_command = "  ".to_string();
        assert!(build_params(&args).is_err());
    }
}
