//! Mean average precision over full prediction/target matrices.

use ndarray::{ArrayView1, ArrayView2, Axis};

use super::{EvaluationError, metrics::safe_div};

/// Average precision of one class.
///
/// Samples are ranked by confidence (descending, ties keep their order of
/// appearance). The precision at the rank of each positive (`target == 1`) is
/// averaged over the number of positives. A class without positives scores 0.
#[must_use]
pub fn average_precision(scores: ArrayView1<'_, f32>, targets: ArrayView1<'_, i8>) -> f64 {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    // sort_by は安定ソート
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut positives = 0_u64;
    let mut precision_sum = 0.0;
    for (rank, &sample) in order.iter().enumerate() {
        if targets[sample] == 1 {
            positives += 1;
            precision_sum += positives as f64 / (rank + 1) as f64;
        }
    }
    safe_div(precision_sum, positives as f64)
}

/// Per-class AP, in class index order.
pub fn per_class_average_precision(
    scores: ArrayView2<'_, f32>,
    targets: ArrayView2<'_, i8>,
) -> Result<Vec<f64>, EvaluationError> {
    if scores.dim() != targets.dim() {
        return Err(EvaluationError::ShapeMismatch {
            context: "mAP targets",
            expected: scores.dim(),
            actual: targets.dim(),
        });
    }
    if scores.is_empty() {
        return Ok(vec![0.0; scores.ncols()]);
    }
    Ok(scores
        .axis_iter(Axis(1))
        .zip(targets.axis_iter(Axis(1)))
        .map(|(class_scores, class_targets)| average_precision(class_scores, class_targets))
        .collect())
}

/// mAP = unweighted mean of per-class AP, in [0, 1].
pub fn mean_average_precision(
    scores: ArrayView2<'_, f32>,
    targets: ArrayView2<'_, i8>,
) -> Result<f64, EvaluationError> {
    let aps = per_class_average_precision(scores, targets)?;
    Ok(safe_div(aps.iter().sum(), aps.len() as f64))
}
