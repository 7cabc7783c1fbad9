use std::fmt;

use ndarray::{Array2, ArrayView2};
use serde::Serialize;

use super::EvaluationError;

/// 分母が 0 のときは 0.0 を返す除算。精度・再現率の縮退ケースはすべてここを通す。
#[must_use]
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// クラス単位の混同行列カウント。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfusionCounts {
    pub true_positive: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub true_negative: u64,
}

impl ConfusionCounts {
    /// 二値予測 {0,1} と符号付き正解 {-1,0,1} の 1 組を加算する。
    ///
    /// pred+target==2 → TP, pred−target==1 → FP, pred−target==−1 → FN, pred+target==0 → TN。
    fn record(&mut self, predicted: i8, target: i8) {
        let sum = predicted + target;
        let diff = predicted - target;
        if sum == 2 {
            self.true_positive += 1;
        }
        if diff == 1 {
            self.false_positive += 1;
        }
        if diff == -1 {
            self.false_negative += 1;
        }
        if sum == 0 {
            self.true_negative += 1;
        }
    }

    fn merge(&mut self, other: &ConfusionCounts) {
        self.true_positive += other.true_positive;
        self.false_positive += other.false_positive;
        self.false_negative += other.false_negative;
        self.true_negative += other.true_negative;
    }

    /// tp / (tp + fp), 0 when tp == 0.
    #[must_use]
    pub fn precision(&self) -> f64 {
        safe_div(
            self.true_positive as f64,
            (self.true_positive + self.false_positive) as f64,
        )
    }

    /// tp / (tp + fn), 0 when tp == 0.
    #[must_use]
    pub fn recall(&self) -> f64 {
        safe_div(
            self.true_positive as f64,
            (self.true_positive + self.false_negative) as f64,
        )
    }

    #[must_use]
    pub fn f1(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        safe_div(2.0 * precision * recall, precision + recall)
    }
}

/// Batch-size weighted meter. Tracks the latest value and the running average.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct RunningAverage {
    pub last: f64,
    pub sum: f64,
    pub count: u64,
}

impl RunningAverage {
    pub fn update(&mut self, value: f64, weight: u64) {
        self.last = value;
        self.sum += value * weight as f64;
        self.count += weight;
    }

    #[must_use]
    pub fn average(&self) -> f64 {
        safe_div(self.sum, self.count as f64)
    }
}

/// マクロ平均 (P_C, R_C, F_C) とマイクロ平均 (P_O, R_O, F_O)。
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct PrecisionRecallSummary {
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub micro_precision: f64,
    pub micro_recall: f64,
    pub micro_f1: f64,
}

impl fmt::Display for PrecisionRecallSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P_C {:.2} R_C {:.2} F_C {:.2} P_O {:.2} R_O {:.2} F_O {:.2}",
            self.macro_precision * 100.0,
            self.macro_recall * 100.0,
            self.macro_f1 * 100.0,
            self.micro_precision * 100.0,
            self.micro_recall * 100.0,
            self.micro_f1 * 100.0,
        )
    }
}

/// Pooled precision/recall of a single batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub samples: usize,
    pub precision: f64,
    pub recall: f64,
}

/// バッチ単位で混同行列を積み上げる集計器。
#[derive(Debug, Clone)]
pub struct MetricAccumulator {
    per_class: Vec<ConfusionCounts>,
    threshold: f32,
    batch_precision: RunningAverage,
    batch_recall: RunningAverage,
    samples: usize,
    batches: usize,
}

impl MetricAccumulator {
    #[must_use]
    pub fn new(num_classes: usize, threshold: f32) -> Self {
        Self {
            per_class: vec![ConfusionCounts::default(); num_classes],
            threshold,
            batch_precision: RunningAverage::default(),
            batch_recall: RunningAverage::default(),
            samples: 0,
            batches: 0,
        }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.per_class.len()
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Confidence → {0,1} with a strict `> threshold` cut.
    #[must_use]
    pub fn binarize(&self, scores: ArrayView2<'_, f32>) -> Array2<i8> {
        scores.mapv(|score| i8::from(score > self.threshold))
    }

    /// 確信度行列を閾値で二値化してから加算する。
    pub fn push(
        &mut self,
        scores: ArrayView2<'_, f32>,
        targets: ArrayView2<'_, i8>,
    ) -> Result<BatchStats, EvaluationError> {
        let predicted = self.binarize(scores);
        self.push_binary(predicted.view(), targets)
    }

    /// 二値予測と符号付き正解を加算する。検証に失敗した場合はカウントを一切変更しない。
    pub fn push_binary(
        &mut self,
        predicted: ArrayView2<'_, i8>,
        targets: ArrayView2<'_, i8>,
    ) -> Result<BatchStats, EvaluationError> {
        let expected = (predicted.nrows(), self.num_classes());
        if predicted.dim() != expected {
            return Err(EvaluationError::ShapeMismatch {
                context: "predicted batch",
                expected,
                actual: predicted.dim(),
            });
        }
        if targets.dim() != expected {
            return Err(EvaluationError::ShapeMismatch {
                context: "target batch",
                expected,
                actual: targets.dim(),
            });
        }
        validate_values(predicted, targets)?;

        let mut batch = ConfusionCounts::default();
        for (pred_row, target_row) in predicted.outer_iter().zip(targets.outer_iter()) {
            for (class, (&pred, &target)) in pred_row.iter().zip(target_row.iter()).enumerate() {
                let mut cell = ConfusionCounts::default();
                cell.record(pred, target);
                self.per_class[class].merge(&cell);
                batch.merge(&cell);
            }
        }

        let stats = BatchStats {
            samples: predicted.nrows(),
            precision: batch.precision(),
            recall: batch.recall(),
        };
        let weight = stats.samples as u64;
        self.batch_precision.update(stats.precision, weight);
        self.batch_recall.update(stats.recall, weight);
        self.samples += stats.samples;
        self.batches += 1;
        Ok(stats)
    }

    #[must_use]
    pub fn per_class(&self) -> &[ConfusionCounts] {
        &self.per_class
    }

    /// Counts summed over every class.
    #[must_use]
    pub fn overall(&self) -> ConfusionCounts {
        let mut total = ConfusionCounts::default();
        for counts in &self.per_class {
            total.merge(counts);
        }
        total
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples
    }

    #[must_use]
    pub fn batches(&self) -> usize {
        self.batches
    }

    #[must_use]
    pub fn batch_precision(&self) -> &RunningAverage {
        &self.batch_precision
    }

    #[must_use]
    pub fn batch_recall(&self) -> &RunningAverage {
        &self.batch_recall
    }

    #[must_use]
    pub fn summary(&self) -> PrecisionRecallSummary {
        let classes = self.per_class.len() as f64;
        let mut precision_sum = 0.0;
        let mut recall_sum = 0.0;
        let mut f1_sum = 0.0;
        for counts in &self.per_class {
            precision_sum += counts.precision();
            recall_sum += counts.recall();
            f1_sum += counts.f1();
        }

        let overall = self.overall();
        PrecisionRecallSummary {
            macro_precision: safe_div(precision_sum, classes),
            macro_recall: safe_div(recall_sum, classes),
            macro_f1: safe_div(f1_sum, classes),
            micro_precision: overall.precision(),
            micro_recall: overall.recall(),
            micro_f1: overall.f1(),
        }
    }
}

fn validate_values(
    predicted: ArrayView2<'_, i8>,
    targets: ArrayView2<'_, i8>,
) -> Result<(), EvaluationError> {
    for ((row, class), &value) in predicted.indexed_iter() {
        if !matches!(value, 0 | 1) {
            return Err(EvaluationError::InvalidPrediction { row, class, value });
        }
    }
    for ((row, class), &value) in targets.indexed_iter() {
        if !matches!(value, -1..=1) {
            return Err(EvaluationError::InvalidTarget { row, class, value });
        }
    }
    Ok(())
}
