/// Prometheusメトリクス定義。
use prometheus::{
    Counter, GaugeVec, Histogram, Registry, register_counter_with_registry,
    register_gauge_vec_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub tasks_completed: Counter,
    pub tasks_failed: Counter,
    pub samples_evaluated: Counter,
    pub batches_evaluated: Counter,
    pub rows_selected: Counter,

    // ヒストグラム
    pub task_duration: Histogram,

    // ゲージ（タスク別）
    pub task_map: GaugeVec,
    pub task_pass_rate: GaugeVec,
    pub task_micro_f1: GaugeVec,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            tasks_completed: register_counter_with_registry!(
                "mlc_eval_tasks_completed_total",
                "Total number of evaluation tasks completed",
                registry
            )?,
            tasks_failed: register_counter_with_registry!(
                "mlc_eval_tasks_failed_total",
                "Total number of evaluation tasks failed",
                registry
            )?,
            samples_evaluated: register_counter_with_registry!(
                "mlc_eval_samples_evaluated_total",
                "Total number of samples pushed through the accumulator",
                registry
            )?,
            batches_evaluated: register_counter_with_registry!(
                "mlc_eval_batches_evaluated_total",
                "Total number of prediction batches evaluated",
                registry
            )?,
            rows_selected: register_counter_with_registry!(
                "mlc_eval_rows_selected_total",
                "Total number of result rows drawn by random selection",
                registry
            )?,
            task_duration: register_histogram_with_registry!(
                "mlc_eval_task_duration_seconds",
                "Wall-clock duration of one evaluation task",
                registry
            )?,
            task_map: register_gauge_vec_with_registry!(
                "mlc_eval_task_map",
                "Mean average precision of the last run of a task",
                &["task"],
                registry
            )?,
            task_pass_rate: register_gauge_vec_with_registry!(
                "mlc_eval_task_pass_rate",
                "Share of rows whose predicted label set equals the ground truth",
                &["task"],
                registry
            )?,
            task_micro_f1: register_gauge_vec_with_registry!(
                "mlc_eval_task_micro_f1",
                "Micro-averaged F1 of the last run of a task",
                &["task"],
                registry
            )?,
        })
    }
}
