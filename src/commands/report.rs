use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::baseline::{
    AucComparison, BaselineSource, DirectoryBaselineSource, HttpBaselineSource, compare_series,
};
use crate::cli::{BestSoFarArgs, CompareArgs, RunArgs, StoreArgs};
use crate::model::{Evaluation, Partition, Run, RunId};
use crate::store::{JobStore, SqliteStore};
use crate::summary::{
    GroupSummary, summarize, summarize_by_method, summarize_by_partition,
};
use crate::tracker::best_so_far;
use crate::util::write_json_pretty;

fn open_store(args: &StoreArgs) -> Result<SqliteStore> {
    let db_path = args.resolve_db_path();
    if !db_path.exists() {
        bail!("job store not found: {}", db_path.display());
    }
    SqliteStore::open(&db_path)
}

fn load_run(args: &RunArgs) -> Result<(SqliteStore, Run, Vec<Evaluation>)> {
    let store = open_store(&args.store)?;
    let run = store.get_run(args.datarun_id)?;
    let evaluations = store.list_evaluations(args.datarun_id, None)?;
    Ok((store, run, evaluations))
}

pub fn run_summary(args: RunArgs) -> Result<()> {
    let (_, run, evaluations) = load_run(&args)?;
    let summary = summarize(&evaluations, run.direction);

    let mut output = io::BufWriter::new(io::stdout().lock());
    write_run_summary(&mut output, &run, &summary)?;
    output.flush()?;
    Ok(())
}

pub fn run_method_summary(args: RunArgs) -> Result<()> {
    let (_, run, evaluations) = load_run(&args)?;
    let groups = summarize_by_method(&evaluations, run.direction);

    let mut output = io::BufWriter::new(io::stdout().lock());
    for group in &groups {
        writeln!(output)?;
        writeln!(output, "method {}:", group.key)?;
        write_group_body(&mut output, &run, group)?;
    }
    output.flush()?;
    Ok(())
}

pub fn run_partition_summary(args: RunArgs) -> Result<()> {
    let (store, run, evaluations) = load_run(&args)?;
    let groups = summarize_by_partition(&evaluations, run.direction);

    let mut output = io::BufWriter::new(io::stdout().lock());
    for group in &groups {
        let partition = store.get_partition(group.key)?;
        write_partition_group(&mut output, &run, &partition, group)?;
    }
    output.flush()?;
    Ok(())
}

pub fn run_best_so_far(args: BestSoFarArgs) -> Result<()> {
    let (_, run, evaluations) = load_run(&args.run)?;
    let series = best_so_far(&evaluations, run.direction);

    let mut output = io::BufWriter::new(io::stdout().lock());
    if args.json {
        serde_json::to_writer_pretty(&mut output, &series)
            .context("failed to serialize best-so-far series")?;
        writeln!(output)?;
    } else {
        for (index, value) in series.iter().enumerate() {
            writeln!(output, "{index}\t{value:.6}")?;
        }
    }
    output.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct PlotSeries<'a> {
    dataset: &'a str,
    datarun_id: RunId,
    metric: &'a str,
    baseline: &'a [f64],
    test: &'a [f64],
}

pub fn run_compare(args: CompareArgs) -> Result<()> {
    let (_, run, evaluations) = load_run(&args.run)?;
    let dataset_ref = run.dataset_ref();

    let source: Box<dyn BaselineSource> = match &args.baseline_dir {
        Some(dir) => Box::new(DirectoryBaselineSource::new(dir)),
        None => Box::new(HttpBaselineSource::new(
            args.baseline_url.clone(),
            args.run.store.cache_root.join("baselines").join("best_so_far"),
        )),
    };

    let test = best_so_far(&evaluations, run.direction);
    let baseline = source
        .fetch_baseline(&dataset_ref)
        .with_context(|| format!("cannot compare datarun {} without a baseline", run.id))?;
    let comparison = compare_series(&test, &baseline)
        .with_context(|| format!("cannot compare datarun {}", run.id))?;

    info!(
        datarun_id = run.id,
        dataset = %dataset_ref,
        points = comparison.points,
        best = test.last().copied(),
        "compared against baseline"
    );

    let mut output = io::BufWriter::new(io::stdout().lock());
    write_comparison(&mut output, &dataset_ref, run.id, &comparison)?;
    output.flush()?;

    if let Some(path) = &args.series_out {
        let baseline_len = baseline.len().min(args.series_length);
        let test_len = test.len().min(args.series_length);
        write_json_pretty(
            path,
            &PlotSeries {
                dataset: &dataset_ref,
                datarun_id: run.id,
                metric: &run.metric,
                baseline: &baseline[..baseline_len],
                test: &test[..test_len],
            },
        )?;
        info!(path = %path.display(), "wrote plot series");
    }

    Ok(())
}

fn write_best_line<W: Write>(
    output: &mut W,
    prefix: &str,
    run: &Run,
    best: Option<&Evaluation>,
) -> Result<()> {
    let Some(best) = best else {
        return Ok(());
    };
    let Some(score) = best.scored_metric() else {
        return Ok(());
    };

    let err = 2.0 * best.metric_stdev.unwrap_or(0.0);
    writeln!(
        output,
        "{prefix}classifier {}, {} = {:.3} +- {:.3}",
        best.id, run.metric, score, err
    )?;
    Ok(())
}

fn write_run_summary<W: Write>(
    output: &mut W,
    run: &Run,
    summary: &GroupSummary<()>,
) -> Result<()> {
    writeln!(output)?;
    writeln!(output, "Dataset {} ({})", run.dataset_name, run.train_path)?;
    writeln!(output, "Datarun {run}")?;
    writeln!(
        output,
        "Classifiers: {} total; {} errors, {} complete",
        summary.counts.total, summary.counts.errored, summary.counts.complete
    )?;
    write_best_line(output, "Best result overall: ", run, summary.best.as_ref())
}

fn write_group_body<W: Write, K>(output: &mut W, run: &Run, group: &GroupSummary<K>) -> Result<()> {
    writeln!(
        output,
        "\t{} errored, {} complete",
        group.counts.errored, group.counts.complete
    )?;
    write_best_line(output, "\tBest: ", run, group.best.as_ref())
}

fn write_partition_group<W: Write>(
    output: &mut W,
    run: &Run,
    partition: &Partition,
    group: &GroupSummary<i64>,
) -> Result<()> {
    writeln!(output)?;
    writeln!(output, "hyperpartition {}", partition.id)?;
    writeln!(output, "{partition}")?;
    write_group_body(output, run, group)
}

fn write_comparison<W: Write>(
    output: &mut W,
    dataset_ref: &str,
    datarun_id: RunId,
    comparison: &AucComparison,
) -> Result<()> {
    writeln!(output, "Dataset {dataset_ref} (datarun {datarun_id})")?;
    writeln!(
        output,
        "AUC: test = {:.3}, baseline = {:.3} ({:.3})",
        comparison.test_auc, comparison.baseline_auc, comparison.difference
    )?;
    Ok(())
}
