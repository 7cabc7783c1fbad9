//! 複数の評価タスクを独立に実行するランナー。
//!
//! タスク間で可変状態は共有しない。失敗したタスクはログに残して次へ進み、
//! 最後にエラーファイルへまとめて書き出す。

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{error, info, info_span};

use crate::{
    config::TaskConfig,
    evaluation::{EvaluationSummary, JsonlPredictionSource, evaluate, report::persist_outcome},
    observability::Metrics,
};

#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// `None` uses rayon's default thread count.
    pub jobs: Option<NonZeroUsize>,
    pub errors_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_name: String,
    pub written: Vec<PathBuf>,
    pub summary: EvaluationSummary,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct TaskFailure {
    pub task_name: String,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<TaskOutcome>,
    pub failed: Vec<TaskFailure>,
}

impl RunReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 1 タスクを評価し、成果物を `res_path` に書き出す。
pub fn run_task(config: &TaskConfig) -> Result<TaskOutcome> {
    let started = Instant::now();
    let categories = config.load_categories()?;
    let mut source =
        JsonlPredictionSource::open(&config.predictions, config.batch_size, categories.len())?;

    let outcome = evaluate(&mut source, &categories, config.settings())
        .with_context(|| format!("evaluation of task {} failed", config.task_name))?;
    let written = persist_outcome(&config.res_path, &config.task_name, &outcome)
        .with_context(|| format!("failed to persist results of task {}", config.task_name))?;

    Ok(TaskOutcome {
        task_name: config.task_name.clone(),
        written,
        summary: outcome.summary,
        elapsed: started.elapsed(),
    })
}

fn record_success(metrics: &Metrics, outcome: &TaskOutcome) {
    let summary = &outcome.summary;
    metrics.tasks_completed.inc();
    metrics.samples_evaluated.inc_by(summary.samples as f64);
    metrics.batches_evaluated.inc_by(summary.batches as f64);
    metrics.task_duration.observe(outcome.elapsed.as_secs_f64());
    let labels = [outcome.task_name.as_str()];
    metrics
        .task_map
        .with_label_values(&labels)
        .set(summary.mean_average_precision);
    metrics
        .task_pass_rate
        .with_label_values(&labels)
        .set(summary.pass_rate);
    metrics
        .task_micro_f1
        .with_label_values(&labels)
        .set(summary.precision_recall.micro_f1);
}

fn run_one(config: &TaskConfig, metrics: Option<&Metrics>) -> Result<TaskOutcome, TaskFailure> {
    let span = info_span!("task", task = %config.task_name);
    let _guard = span.enter();

    match run_task(config) {
        Ok(outcome) => {
            info!(
                samples = outcome.summary.samples,
                map = outcome.summary.mean_average_precision,
                pass_rate = outcome.summary.pass_rate,
                elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
                "task completed"
            );
            if let Some(metrics) = metrics {
                record_success(metrics, &outcome);
            }
            Ok(outcome)
        }
        Err(err) => {
            error!(error = ?err, "task failed");
            if let Some(metrics) = metrics {
                metrics.tasks_failed.inc();
            }
            Err(TaskFailure {
                task_name: config.task_name.clone(),
                error: err,
            })
        }
    }
}

/// `task_name`、エラーチェーン、空行の順で 1 件ずつ書く。
pub fn write_errors_file(path: &Path, failures: &[TaskFailure]) -> Result<()> {
    let mut contents = String::new();
    for failure in failures {
        contents.push_str(&format!("{}\n{:?}\n\n", failure.task_name, failure.error));
    }
    fs::write(path, contents)
        .with_context(|| format!("failed to write errors file {}", path.display()))
}

/// 全タスクを rayon で並列に実行する。結果の順序はタスク定義順。
pub fn run_tasks(
    tasks: &[TaskConfig],
    options: &RunnerOptions,
    metrics: Option<&Metrics>,
) -> Result<RunReport> {
    if let Some(path) = &options.errors_file {
        fs::write(path, "")
            .with_context(|| format!("failed to truncate errors file {}", path.display()))?;
    }

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(jobs) = options.jobs {
        builder = builder.num_threads(jobs.get());
    }
    let pool = builder.build().context("failed to build task thread pool")?;

    info!(tasks = tasks.len(), threads = pool.current_num_threads(), "running tasks");
    let results: Vec<Result<TaskOutcome, TaskFailure>> = pool.install(|| {
        tasks
            .par_iter()
            .map(|task| run_one(task, metrics))
            .collect()
    });

    let mut report = RunReport::default();
    for result in results {
        match result {
            Ok(outcome) => report.completed.push(outcome),
            Err(failure) => report.failed.push(failure),
        }
    }

    if let Some(path) = &options.errors_file {
        write_errors_file(path, &report.failed)?;
    }
    info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        "all tasks finished"
    );
    Ok(report)
}
