//! Evaluation core: confusion accumulation, mAP, combinatorial scores and the driver
//! that ties them to a prediction source.

pub mod average_precision;
pub mod driver;
pub mod metrics;
pub mod report;
pub mod score;
pub mod source;

use thiserror::Error;

pub use driver::{
    EvaluationDriver, EvaluationOutcome, EvaluationPhase, EvaluationSettings, EvaluationSummary,
    GroupAccuracy, ReportMode, ResultRow, ResultTable, evaluate,
};
pub use metrics::{
    ConfusionCounts, MetricAccumulator, PrecisionRecallSummary, RunningAverage, safe_div,
};
pub use score::{CombinatorialScorer, cal_score};
pub use source::{
    JsonlPredictionSource, MemoryPredictionSource, PredictionBatch, PredictionSource,
};

/// 評価処理で発生するドメインエラー。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("{context}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("invalid target value {value} at row {row}, class {class}; expected -1, 0 or 1")]
    InvalidTarget { row: usize, class: usize, value: i8 },
    #[error("invalid prediction value {value} at row {row}, class {class}; expected 0 or 1")]
    InvalidPrediction { row: usize, class: usize, value: i8 },
    #[error("batch has {identifiers} identifiers for {rows} rows")]
    IdentifierMismatch { identifiers: usize, rows: usize },
    #[error("category map has {categories} entries but predictions have {classes} classes")]
    CategoryMismatch { categories: usize, classes: usize },
    #[error("cannot {action} while the driver is {phase:?}")]
    InvalidPhase {
        action: &'static str,
        phase: EvaluationPhase,
    },
}
