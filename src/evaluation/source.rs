//! 予測結果の供給元。
//!
//! モデル推論そのものは対象外で、推論済みの確信度ベクトルと符号付き正解を
//! バッチ単位で受け取る。

use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader, Lines},
    num::NonZeroUsize,
    path::Path,
};

use anyhow::{Context, Result, bail};
use ndarray::Array2;
use serde::Deserialize;

use super::EvaluationError;

/// One batch of `(identifier, confidence row, target row)` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionBatch {
    pub identifiers: Vec<String>,
    pub scores: Array2<f32>,
    pub targets: Array2<i8>,
}

impl PredictionBatch {
    pub fn new(
        identifiers: Vec<String>,
        scores: Array2<f32>,
        targets: Array2<i8>,
    ) -> Result<Self, EvaluationError> {
        if scores.dim() != targets.dim() {
            return Err(EvaluationError::ShapeMismatch {
                context: "batch targets",
                expected: scores.dim(),
                actual: targets.dim(),
            });
        }
        if identifiers.len() != scores.nrows() {
            return Err(EvaluationError::IdentifierMismatch {
                identifiers: identifiers.len(),
                rows: scores.nrows(),
            });
        }
        Ok(Self {
            identifiers,
            scores,
            targets,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.scores.ncols()
    }
}

/// A finite, ordered stream of prediction batches. `Ok(None)` marks exhaustion.
pub trait PredictionSource {
    fn next_batch(&mut self) -> Result<Option<PredictionBatch>>;
}

/// Serves prebuilt batches in order.
#[derive(Debug, Default)]
pub struct MemoryPredictionSource {
    batches: VecDeque<PredictionBatch>,
}

impl MemoryPredictionSource {
    #[must_use]
    pub fn new(batches: Vec<PredictionBatch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl PredictionSource for MemoryPredictionSource {
    fn next_batch(&mut self) -> Result<Option<PredictionBatch>> {
        Ok(self.batches.pop_front())
    }
}

#[derive(Debug, Deserialize)]
struct PredictionRecord {
    filename: String,
    scores: Vec<f32>,
    target: Vec<i8>,
}

/// JSON Lines の推論結果を `batch_size` 件ずつまとめて返す。
///
/// 1 行 = `{"filename": "...", "scores": [...], "target": [...]}`。空行は読み飛ばす。
pub struct JsonlPredictionSource<R: BufRead> {
    lines: Lines<R>,
    line_no: usize,
    batch_size: NonZeroUsize,
    num_classes: usize,
}

impl JsonlPredictionSource<BufReader<File>> {
    pub fn open(path: &Path, batch_size: NonZeroUsize, num_classes: usize) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open predictions at {}", path.display()))?;
        Ok(Self::from_reader(
            BufReader::new(file),
            batch_size,
            num_classes,
        ))
    }
}

impl<R: BufRead> JsonlPredictionSource<R> {
    pub fn from_reader(reader: R, batch_size: NonZeroUsize, num_classes: usize) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            batch_size,
            num_classes,
        }
    }

    fn next_record(&mut self) -> Result<Option<PredictionRecord>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line.with_context(|| format!("failed to read line {}", self.line_no))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PredictionRecord = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse JSON on line {}", self.line_no))?;
            if record.scores.len() != self.num_classes || record.target.len() != self.num_classes {
                bail!(
                    "line {}: expected {} classes, got {} scores and {} targets",
                    self.line_no,
                    self.num_classes,
                    record.scores.len(),
                    record.target.len()
                );
            }
            return Ok(Some(record));
        }
        Ok(None)
    }
}

impl<R: BufRead> PredictionSource for JsonlPredictionSource<R> {
    fn next_batch(&mut self) -> Result<Option<PredictionBatch>> {
        let capacity = self.batch_size.get();
        let mut identifiers = Vec::with_capacity(capacity);
        let mut scores = Vec::with_capacity(capacity * self.num_classes);
        let mut targets = Vec::with_capacity(capacity * self.num_classes);

        while identifiers.len() < capacity {
            let Some(record) = self.next_record()? else {
                break;
            };
            identifiers.push(record.filename);
            scores.extend(record.scores);
            targets.extend(record.target);
        }

        if identifiers.is_empty() {
            return Ok(None);
        }

        let rows = identifiers.len();
        let scores = Array2::from_shape_vec((rows, self.num_classes), scores)
            .context("failed to shape score batch")?;
        let targets = Array2::from_shape_vec((rows, self.num_classes), targets)
            .context("failed to shape target batch")?;
        Ok(Some(PredictionBatch::new(identifiers, scores, targets)?))
    }
}
