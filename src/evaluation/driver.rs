use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    EvaluationError,
    average_precision::per_class_average_precision,
    metrics::{MetricAccumulator, PrecisionRecallSummary, safe_div},
    score::CombinatorialScorer,
    source::{PredictionBatch, PredictionSource},
};
use crate::labels::{CategoryMap, LabelSet};

/// Layout of the result table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// `filename, labels_gt, labels, pass`
    #[default]
    Plain,
    /// `filename, <category...>, labels_gt, labels, pass, score`
    Confidence,
}

/// Idle → Accumulating → Finalizing → Done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationPhase {
    Idle,
    Accumulating,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSettings {
    pub threshold: f32,
    pub way_num: usize,
    /// 進捗ログの間隔（バッチ数）。0 で無効。
    pub print_freq: usize,
    pub mode: ReportMode,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            way_num: 2,
            print_freq: 0,
            mode: ReportMode::Plain,
        }
    }
}

/// 結果テーブルの 1 行（1 画像）。
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub filename: String,
    /// Confidence per category, ordered like `ResultTable::category_columns`; -1 below threshold.
    pub confidences: Option<Vec<f32>>,
    pub labels_gt: LabelSet,
    pub labels: LabelSet,
    pub pass: bool,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    pub mode: ReportMode,
    pub category_columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Column names in persisted order.
    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["filename".to_string()];
        header.extend(self.category_columns.iter().cloned());
        header.extend(["labels_gt", "labels", "pass"].map(String::from));
        if self.mode == ReportMode::Confidence {
            header.push("score".to_string());
        }
        header
    }

    /// Rows rendered as CSV fields, matching [`ResultTable::header`].
    pub fn records(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.rows.iter().map(move |row| {
            let mut record = Vec::with_capacity(self.category_columns.len() + 5);
            record.push(row.filename.clone());
            if let Some(confidences) = &row.confidences {
                record.extend(confidences.iter().map(ToString::to_string));
            }
            record.push(row.labels_gt.to_canonical());
            record.push(row.labels.to_canonical());
            record.push(u8::from(row.pass).to_string());
            if self.mode == ReportMode::Confidence {
                record.push(row.score.map(|s| s.to_string()).unwrap_or_default());
            }
            record
        })
    }

    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        let passed = self.rows.iter().filter(|row| row.pass).count();
        safe_div(passed as f64, self.rows.len() as f64)
    }

    #[must_use]
    pub fn mean_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self.rows.iter().filter_map(|row| row.score).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

/// 正解ラベル組合せごとの正答率。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupAccuracy {
    pub labels_gt: String,
    pub accuracy: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassAveragePrecision {
    pub category: String,
    pub average_precision: f64,
}

/// Aggregate metrics of one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub samples: usize,
    pub batches: usize,
    pub threshold: f32,
    pub way_num: usize,
    pub mode: ReportMode,
    pub precision_recall: PrecisionRecallSummary,
    pub batch_precision: f64,
    pub batch_recall: f64,
    pub mean_average_precision: f64,
    pub per_class_ap: Vec<ClassAveragePrecision>,
    pub pass_rate: f64,
    pub mean_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub summary: EvaluationSummary,
    pub table: ResultTable,
    /// Confidence mode only.
    pub accuracy: Option<Vec<GroupAccuracy>>,
}

/// バッチを受け取りながら集計し、最後に mAP と結果テーブルを組み立てる。
pub struct EvaluationDriver<'a> {
    categories: &'a CategoryMap,
    settings: EvaluationSettings,
    phase: EvaluationPhase,
    accumulator: MetricAccumulator,
    identifiers: Vec<String>,
    scores: Vec<Array2<f32>>,
    targets: Vec<Array2<i8>>,
}

impl<'a> EvaluationDriver<'a> {
    #[must_use]
    pub fn new(categories: &'a CategoryMap, settings: EvaluationSettings) -> Self {
        Self {
            categories,
            settings,
            phase: EvaluationPhase::Idle,
            accumulator: MetricAccumulator::new(categories.len(), settings.threshold),
            identifiers: Vec::new(),
            scores: Vec::new(),
            targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> EvaluationPhase {
        self.phase
    }

    #[must_use]
    pub fn accumulator(&self) -> &MetricAccumulator {
        &self.accumulator
    }

    pub fn push_batch(&mut self, batch: PredictionBatch) -> Result<(), EvaluationError> {
        if !matches!(
            self.phase,
            EvaluationPhase::Idle | EvaluationPhase::Accumulating
        ) {
            return Err(EvaluationError::InvalidPhase {
                action: "accept batches",
                phase: self.phase,
            });
        }
        if batch.identifiers.len() != batch.scores.nrows() {
            return Err(EvaluationError::IdentifierMismatch {
                identifiers: batch.identifiers.len(),
                rows: batch.scores.nrows(),
            });
        }
        if batch.num_classes() != self.categories.len() {
            return Err(EvaluationError::CategoryMismatch {
                categories: self.categories.len(),
                classes: batch.num_classes(),
            });
        }
        self.phase = EvaluationPhase::Accumulating;

        let stats = self
            .accumulator
            .push(batch.scores.view(), batch.targets.view())?;
        let batch_index = self.accumulator.batches() - 1;
        if self.settings.print_freq > 0 && batch_index % self.settings.print_freq == 0 {
            let precision = self.accumulator.batch_precision();
            let recall = self.accumulator.batch_recall();
            let precision = format!(
                "{:.2} ({:.2})",
                precision.last * 100.0,
                precision.average() * 100.0
            );
            let recall = format!(
                "{:.2} ({:.2})",
                recall.last * 100.0,
                recall.average() * 100.0
            );
            info!(
                batch = batch_index,
                samples = self.accumulator.samples(),
                precision = %precision,
                recall = %recall,
                summary = %self.accumulator.summary(),
                "evaluation progress"
            );
        } else {
            debug!(
                batch = batch_index,
                samples = stats.samples,
                precision = stats.precision,
                recall = stats.recall,
                "batch accumulated"
            );
        }

        self.identifiers.extend(batch.identifiers);
        self.scores.push(batch.scores);
        self.targets.push(batch.targets);
        Ok(())
    }

    /// Computes mAP, assembles the result table and moves the driver to `Done`.
    pub fn finish(&mut self) -> Result<EvaluationOutcome> {
        if self.phase == EvaluationPhase::Done || self.phase == EvaluationPhase::Finalizing {
            return Err(EvaluationError::InvalidPhase {
                action: "finish",
                phase: self.phase,
            }
            .into());
        }
        self.phase = EvaluationPhase::Finalizing;

        let num_classes = self.categories.len();
        let scores = stack_rows(&std::mem::take(&mut self.scores), num_classes)
            .context("failed to stack prediction batches")?;
        let targets = stack_rows(&std::mem::take(&mut self.targets), num_classes)
            .context("failed to stack target batches")?;
        let identifiers = std::mem::take(&mut self.identifiers);

        let aps = per_class_average_precision(scores.view(), targets.view())?;
        let mean_average_precision = safe_div(aps.iter().sum(), aps.len() as f64);

        let (table, accuracy) = match self.settings.mode {
            ReportMode::Plain => (
                assemble_plain(
                    self.categories,
                    &identifiers,
                    scores.view(),
                    targets.view(),
                    self.settings.threshold,
                ),
                None,
            ),
            ReportMode::Confidence => {
                let table = assemble_confidence(
                    self.categories,
                    &identifiers,
                    scores.view(),
                    targets.view(),
                    self.settings.threshold,
                    self.settings.way_num,
                );
                let accuracy = group_accuracy(&table);
                (table, Some(accuracy))
            }
        };

        let precision_recall = self.accumulator.summary();
        info!(
            summary = %precision_recall,
            map = %format!("{:.2}", mean_average_precision * 100.0),
            samples = self.accumulator.samples(),
            "evaluation finished"
        );

        let summary = EvaluationSummary {
            run_id: Uuid::now_v7(),
            generated_at: Utc::now(),
            samples: self.accumulator.samples(),
            batches: self.accumulator.batches(),
            threshold: self.settings.threshold,
            way_num: self.settings.way_num,
            mode: self.settings.mode,
            precision_recall,
            batch_precision: self.accumulator.batch_precision().average(),
            batch_recall: self.accumulator.batch_recall().average(),
            mean_average_precision,
            per_class_ap: self
                .categories
                .names()
                .iter()
                .zip(aps)
                .map(|(category, average_precision)| ClassAveragePrecision {
                    category: category.clone(),
                    average_precision,
                })
                .collect(),
            pass_rate: table.pass_rate(),
            mean_score: table.mean_score(),
        };

        self.phase = EvaluationPhase::Done;
        Ok(EvaluationOutcome {
            summary,
            table,
            accuracy,
        })
    }
}

/// Drains `source` through a fresh driver. Any error aborts the whole run.
pub fn evaluate(
    source: &mut dyn PredictionSource,
    categories: &CategoryMap,
    settings: EvaluationSettings,
) -> Result<EvaluationOutcome> {
    let mut driver = EvaluationDriver::new(categories, settings);
    while let Some(batch) = source.next_batch()? {
        driver
            .push_batch(batch)
            .with_context(|| format!("batch {} rejected", driver.accumulator().batches()))?;
    }
    driver.finish()
}

fn stack_rows<T: Clone + Default>(
    batches: &[Array2<T>],
    num_classes: usize,
) -> Result<Array2<T>> {
    if batches.is_empty() {
        return Ok(Array2::default((0, num_classes)));
    }
    let views: Vec<ArrayView2<'_, T>> = batches.iter().map(|batch| batch.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

fn row_labels(
    categories: &CategoryMap,
    scores: ArrayView2<'_, f32>,
    targets: ArrayView2<'_, i8>,
    row: usize,
    threshold: f32,
) -> (LabelSet, LabelSet) {
    let labels = categories.label_set(scores.row(row).iter().map(|&score| score > threshold));
    let labels_gt = categories.label_set(targets.row(row).iter().map(|&target| target > 0));
    (labels_gt, labels)
}

/// `filename`（ベース名のみ）, `labels_gt`, `labels`, `pass` の表。
#[must_use]
pub fn assemble_plain(
    categories: &CategoryMap,
    identifiers: &[String],
    scores: ArrayView2<'_, f32>,
    targets: ArrayView2<'_, i8>,
    threshold: f32,
) -> ResultTable {
    let rows = identifiers
        .iter()
        .enumerate()
        .map(|(row, identifier)| {
            let (labels_gt, labels) = row_labels(categories, scores, targets, row, threshold);
            let filename = Path::new(identifier)
                .file_name()
                .map_or_else(|| identifier.clone(), |name| name.to_string_lossy().into_owned());
            ResultRow {
                filename,
                confidences: None,
                pass: labels_gt == labels,
                labels_gt,
                labels,
                score: None,
            }
        })
        .collect();

    ResultTable {
        mode: ReportMode::Plain,
        category_columns: Vec::new(),
        rows,
    }
}

/// カテゴリ名順の確信度列と組合せスコアを含む表。
#[must_use]
pub fn assemble_confidence(
    categories: &CategoryMap,
    identifiers: &[String],
    scores: ArrayView2<'_, f32>,
    targets: ArrayView2<'_, i8>,
    threshold: f32,
    way_num: usize,
) -> ResultTable {
    let columns = categories.sorted_by_name();
    let scorer = CombinatorialScorer::new(way_num);

    let rows = identifiers
        .iter()
        .enumerate()
        .map(|(row, identifier)| {
            let (labels_gt, labels) = row_labels(categories, scores, targets, row, threshold);
            let confidences = columns
                .iter()
                .map(|&(_, class)| {
                    let confidence = scores[[row, class]];
                    if confidence > threshold { confidence } else { -1.0 }
                })
                .collect();
            let score = scorer.score(&labels_gt, &labels);
            ResultRow {
                filename: identifier.clone(),
                confidences: Some(confidences),
                pass: labels_gt == labels,
                labels_gt,
                labels,
                score: Some(score),
            }
        })
        .collect();

    ResultTable {
        mode: ReportMode::Confidence,
        category_columns: columns.iter().map(|(name, _)| (*name).to_string()).collect(),
        rows,
    }
}

/// Mean `pass` per distinct ground-truth combination, in order of first appearance.
#[must_use]
pub fn group_accuracy(table: &ResultTable) -> Vec<GroupAccuracy> {
    let mut groups: Vec<(String, usize, usize)> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for row in &table.rows {
        let key = row.labels_gt.to_canonical();
        let idx = *position.entry(key.clone()).or_insert_with(|| {
            groups.push((key, 0, 0));
            groups.len() - 1
        });
        groups[idx].1 += usize::from(row.pass);
        groups[idx].2 += 1;
    }
    groups
        .into_iter()
        .map(|(labels_gt, passed, samples)| GroupAccuracy {
            labels_gt,
            accuracy: safe_div(passed as f64, samples as f64),
            samples,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::source::MemoryPredictionSource;
    use ndarray::array;

    fn categories() -> CategoryMap {
        CategoryMap::from_names(["dog", "cat", "bird"]).expect("map")
    }

    fn batch(ids: &[&str], scores: Array2<f32>, targets: Array2<i8>) -> PredictionBatch {
        PredictionBatch::new(
            ids.iter().map(|s| (*s).to_string()).collect(),
            scores,
            targets,
        )
        .expect("valid batch")
    }

    fn sample_source() -> MemoryPredictionSource {
        MemoryPredictionSource::new(vec![
            batch(
                &["imgs/a.jpg", "imgs/b.jpg"],
                array![[0.9, 0.8, 0.1], [0.7, 0.2, 0.6]],
                array![[1, 1, -1], [1, 1, 1]],
            ),
            batch(
                &["imgs/c.jpg"],
                array![[0.1, 0.9, 0.2]],
                array![[1, 1, -1]],
            ),
        ])
    }

    #[test]
    fn plain_mode_builds_basename_rows() {
        let cats = categories();
        let outcome = evaluate(&mut sample_source(), &cats, EvaluationSettings::default())
            .expect("evaluation succeeds");
        let table = &outcome.table;
        assert_eq!(table.header(), vec!["filename", "labels_gt", "labels", "pass"]);
        assert_eq!(table.rows[0].filename, "a.jpg");
        assert_eq!(table.rows[0].labels.to_canonical(), "cat|dog");
        assert!(table.rows[0].pass);
        assert!(!table.rows[1].pass);
        assert_eq!(table.rows[1].labels_gt.to_canonical(), "bird|cat|dog");
        assert!(outcome.accuracy.is_none());
        assert_eq!(outcome.summary.samples, 3);
        assert_eq!(outcome.summary.batches, 2);
        assert!((outcome.summary.pass_rate - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn confidence_mode_adds_sorted_columns_and_scores() {
        let cats = categories();
        let settings = EvaluationSettings {
            mode: ReportMode::Confidence,
            ..EvaluationSettings::default()
        };
        let outcome = evaluate(&mut sample_source(), &cats, settings).expect("evaluation");
        let table = &outcome.table;
        assert_eq!(table.header(), vec![
            "filename",
            "bird",
            "cat",
            "dog",
            "labels_gt",
            "labels",
            "pass",
            "score"
        ]);
        // row b: bird 0.6, cat below threshold, dog 0.7
        assert_eq!(table.rows[1].confidences, Some(vec![0.6, -1.0, 0.7]));
        assert_eq!(table.rows[1].filename, "imgs/b.jpg");
        // GT {bird,cat,dog}, pred {bird,dog} → 1/3
        let score = table.rows[1].score.expect("score");
        assert!((score - 1.0 / 3.0).abs() < 1e-12);

        let accuracy = outcome.accuracy.expect("accuracy table");
        assert_eq!(accuracy.len(), 2);
        assert_eq!(accuracy[0].labels_gt, "cat|dog");
        assert!((accuracy[0].accuracy - 0.5).abs() < 1e-12);
        assert_eq!(accuracy[0].samples, 2);
        assert_eq!(accuracy[1].labels_gt, "bird|cat|dog");
        assert_eq!(accuracy[1].accuracy, 0.0);
    }

    #[test]
    fn records_follow_header_order() {
        let cats = categories();
        let settings = EvaluationSettings {
            mode: ReportMode::Confidence,
            ..EvaluationSettings::default()
        };
        let outcome = evaluate(&mut sample_source(), &cats, settings).expect("evaluation");
        let first: Vec<String> = outcome.table.records().next().expect("row");
        assert_eq!(first, vec![
            "imgs/a.jpg",
            "-1",
            "0.8",
            "0.9",
            "cat|dog",
            "cat|dog",
            "1",
            "1"
        ]);
    }

    #[test]
    fn map_is_computed_over_all_batches() {
        let cats = categories();
        let outcome =
            evaluate(&mut sample_source(), &cats, EvaluationSettings::default()).expect("eval");
        // dog: ranks a(+), b(+), c(+) → 1; cat: c, a, b all positive → 1; bird: b(+) first → 1
        assert!((outcome.summary.mean_average_precision - 1.0).abs() < 1e-12);
        assert_eq!(outcome.summary.per_class_ap.len(), 3);
        assert_eq!(outcome.summary.per_class_ap[0].category, "dog");
    }

    #[test]
    fn driver_walks_through_phases() {
        let cats = categories();
        let mut driver = EvaluationDriver::new(&cats, EvaluationSettings::default());
        assert_eq!(driver.phase(), EvaluationPhase::Idle);
        driver
            .push_batch(batch(&["a"], array![[0.9, 0.1, 0.1]], array![[1, -1, -1]]))
            .expect("accepts batch");
        assert_eq!(driver.phase(), EvaluationPhase::Accumulating);
        driver.finish().expect("finishes");
        assert_eq!(driver.phase(), EvaluationPhase::Done);

        let err = driver
            .push_batch(batch(&["b"], array![[0.9, 0.1, 0.1]], array![[1, -1, -1]]))
            .unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidPhase { .. }));
        assert!(driver.finish().is_err());
    }

    #[test]
    fn class_count_mismatch_aborts() {
        let cats = categories();
        let mut source = MemoryPredictionSource::new(vec![batch(
            &["a"],
            array![[0.9, 0.1]],
            array![[1, -1]],
        )]);
        let err = evaluate(&mut source, &cats, EvaluationSettings::default()).unwrap_err();
        assert!(
            err.chain()
                .any(|cause| cause.to_string().contains("category map has 3 entries")),
            "{err:#}"
        );
    }

    #[test]
    fn hand_built_batch_with_extra_identifiers_is_rejected() {
        let cats = categories();
        let mut driver = EvaluationDriver::new(&cats, EvaluationSettings::default());
        let unchecked = PredictionBatch {
            identifiers: vec!["x".to_string(), "y".to_string()],
            scores: array![[0.9, 0.1, 0.2]],
            targets: array![[1, -1, -1]],
        };
        let err = driver.push_batch(unchecked).unwrap_err();
        assert_eq!(err, EvaluationError::IdentifierMismatch {
            identifiers: 2,
            rows: 1
        });
        assert_eq!(driver.phase(), EvaluationPhase::Idle);
        assert_eq!(driver.accumulator().samples(), 0);
    }

    #[test]
    fn empty_source_yields_empty_table() {
        let cats = categories();
        let outcome = evaluate(
            &mut MemoryPredictionSource::default(),
            &cats,
            EvaluationSettings::default(),
        )
        .expect("empty evaluation");
        assert!(outcome.table.rows.is_empty());
        assert_eq!(outcome.summary.mean_average_precision, 0.0);
        assert_eq!(outcome.summary.precision_recall, PrecisionRecallSummary::default());
    }
}
