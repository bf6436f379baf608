mod baseline;
mod cli;
mod commands;
mod dispatch;
mod model;
mod store;
mod summary;
mod tracker;
mod util;
mod worker;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue(args) => commands::enqueue::run(args),
        Commands::Dispatch(args) => commands::dispatch::run(args),
        Commands::Worker(args) => commands::worker::run(args),
        Commands::Summary(args) => commands::report::run_summary(args),
        Commands::MethodSummary(args) => commands::report::run_method_summary(args),
        Commands::PartitionSummary(args) => commands::report::run_partition_summary(args),
        Commands::BestSoFar(args) => commands::report::run_best_so_far(args),
        Commands::Compare(args) => commands::report::run_compare(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
