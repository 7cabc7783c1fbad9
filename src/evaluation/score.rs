//! 組合せテスト（カバリング配列）の観点での予測ラベル集合のスコア。
//!
//! 正解集合から取り出せる `way_num` 個の組合せのうち、予測集合に完全に含まれる
//! ものの割合をスコアとする。

use crate::labels::{CategoryMap, LabelSet};

/// Scores predicted label sets against ground truth at a fixed interaction strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinatorialScorer {
    way_num: usize,
}

impl CombinatorialScorer {
    #[must_use]
    pub fn new(way_num: usize) -> Self {
        Self { way_num }
    }

    #[must_use]
    pub fn way_num(&self) -> usize {
        self.way_num
    }

    /// Returns a score in [0, 1].
    ///
    /// * identical sets → 1.0
    /// * empty ground truth, non-empty prediction → 0.0
    /// * `|GT| < way_num` → 1.0 when the prediction contains every ground-truth label, else 0.0
    /// * otherwise C(|GT ∩ P|, k) / C(|GT|, k)
    #[must_use]
    pub fn score(&self, ground_truth: &LabelSet, predicted: &LabelSet) -> f64 {
        if ground_truth == predicted {
            return 1.0;
        }
        if ground_truth.is_empty() {
            return 0.0;
        }
        if self.way_num == 0 || ground_truth.len() < self.way_num {
            return if predicted.is_superset(ground_truth) {
                1.0
            } else {
                0.0
            };
        }

        let covered = ground_truth.intersection_len(predicted);
        combination_ratio(covered, ground_truth.len(), self.way_num)
    }
}

/// Number of `k`-subsets of an `n`-set, as a float so COCO-sized sets cannot overflow.
#[must_use]
pub fn interaction_count(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// C(covered, k) / C(total, k) = Π_{i<k} (covered − i) / (total − i)
fn combination_ratio(covered: usize, total: usize, k: usize) -> f64 {
    if covered < k {
        return 0.0;
    }
    (0..k)
        .map(|i| (covered - i) as f64 / (total - i) as f64)
        .product()
}

/// String-level entry point used by result tables.
///
/// `labels_gt` and `labels` are canonical pipe-joined label strings. `num_classes`
/// and `cat2idx` describe the label universe of the dataset; the score itself only
/// depends on set membership, so labels outside the map still take part by name.
/// Consistency between the two is checked where category maps are loaded.
#[must_use]
pub fn cal_score(
    labels_gt: &str,
    labels: &str,
    _num_classes: usize,
    way_num: usize,
    _cat2idx: &CategoryMap,
) -> f64 {
    let ground_truth = LabelSet::parse(labels_gt);
    let predicted = LabelSet::parse(labels);
    CombinatorialScorer::new(way_num).score(&ground_truth, &predicted)
}
