use std::{num::NonZeroUsize, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{labels::Dataset, observability::LogFormat};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format (json or pretty)
    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Evaluate every task listed in a YAML task file
    Evaluate(EvaluateArgs),
    /// Score random selections sized after covering arrays
    CompareRandom(CompareArgs),
    /// Print the combinatorial score of one prediction
    Score(ScoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// YAML task file
    #[arg(long, env = "MLC_EVAL_TASKS")]
    pub tasks: PathBuf,

    /// File receiving one block per failed task
    #[arg(long, env = "MLC_EVAL_ERRORS_FILE", default_value = "errors.txt")]
    pub errors_file: PathBuf,

    /// Number of tasks evaluated concurrently (defaults to the CPU count)
    #[arg(long, env = "MLC_EVAL_JOBS")]
    pub jobs: Option<NonZeroUsize>,

    /// Write Prometheus text metrics here after the run
    #[arg(long, env = "MLC_EVAL_METRICS_OUT")]
    pub metrics_out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    /// YAML comparison config
    #[arg(long, env = "MLC_EVAL_COMPARE_CONFIG")]
    pub config: PathBuf,

    /// Write Prometheus text metrics here after the run
    #[arg(long, env = "MLC_EVAL_METRICS_OUT")]
    pub metrics_out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ScoreArgs {
    /// Ground-truth labels, pipe separated
    #[arg(long, allow_hyphen_values = true)]
    pub labels_gt: String,

    /// Predicted labels, pipe separated
    #[arg(long, allow_hyphen_values = true)]
    pub labels: String,

    /// Interaction strength
    #[arg(long, default_value = "2")]
    pub way_num: usize,

    /// Built-in category table
    #[arg(long, value_enum, default_value = "voc")]
    pub dataset: Dataset,

    /// Category map JSON (`{"name": index}`), overrides --dataset
    #[arg(long)]
    pub categories: Option<PathBuf>,
}
