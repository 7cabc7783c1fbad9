use std::{num::NonZeroUsize, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use mlc_eval::{
    cli::{Cli, Command, CompareArgs, EvaluateArgs, ScoreArgs},
    combine::run_compare,
    config::{CompareConfig, TaskFile},
    evaluation::cal_score,
    labels::{CategoryMap, LabelSet},
    observability::Telemetry,
    runner::{RunnerOptions, run_tasks},
};

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));
}

fn evaluate(telemetry: &Telemetry, args: &EvaluateArgs) -> anyhow::Result<bool> {
    let file = TaskFile::load(&args.tasks).context("failed to load task file")?;
    let options = RunnerOptions {
        jobs: args.jobs,
        errors_file: Some(args.errors_file.clone()),
    };
    let report = run_tasks(&file.tasks, &options, Some(telemetry.metrics()))?;

    if let Some(path) = &args.metrics_out {
        telemetry.write_prometheus(path)?;
    }
    if !report.is_success() {
        warn!(
            failed = report.failed.len(),
            errors_file = %args.errors_file.display(),
            "some tasks failed"
        );
    }
    Ok(report.is_success())
}

fn compare(telemetry: &Telemetry, args: &CompareArgs) -> anyhow::Result<bool> {
    let config = CompareConfig::load(&args.config).context("failed to load compare config")?;
    let report = run_compare(&config, Some(telemetry.metrics()))?;
    info!(
        files = report.written.len(),
        rows = report.rows_selected,
        "random selection comparison finished"
    );
    if let Some(path) = &args.metrics_out {
        telemetry.write_prometheus(path)?;
    }
    Ok(true)
}

fn score(args: &ScoreArgs) -> anyhow::Result<bool> {
    let categories = match &args.categories {
        Some(path) => CategoryMap::load_json(path)?,
        None => CategoryMap::builtin(args.dataset)?,
    };
    let labels_gt = LabelSet::parse(&args.labels_gt).to_canonical();
    let labels = LabelSet::parse(&args.labels).to_canonical();
    let value = cal_score(
        &labels_gt,
        &labels,
        categories.len(),
        args.way_num,
        &categories,
    );
    println!("{value}");
    Ok(true)
}

fn main() -> ExitCode {
    install_panic_hook();
    let cli = Cli::parse();

    let telemetry = match Telemetry::new(cli.log_format) {
        Ok(telemetry) => telemetry,
        Err(err) => {
            eprintln!("failed to initialize telemetry: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        threads = std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        "mlc-eval starting"
    );

    let result = match &cli.command {
        Command::Evaluate(args) => evaluate(&telemetry, args),
        Command::CompareRandom(args) => compare(&telemetry, args),
        Command::Score(args) => score(args),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = ?err, "run failed");
            ExitCode::FAILURE
        }
    }
}
