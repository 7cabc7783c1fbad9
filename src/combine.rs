//! カバリング配列のサイズに合わせたランダム抽出との比較。
//!
//! 各データセット・配列種別について、最初のモデルで `行数 × select_num` 件を
//! 非復元抽出し、同じデータセットの後続モデルは同じファイル名を再利用する。
//! 抽出した各行に `cal_score` を付けて CSV に書き出す。

use std::{
    collections::{HashMap, hash_map::Entry},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::CompareConfig,
    evaluation::cal_score,
    labels::{CategoryMap, LabelSet},
    observability::Metrics,
};

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("covering array type {0:?} has no numeric strength suffix")]
    InvalidStrength(String),
    #[error("no covering array #{index} matching {pattern} under {dir}")]
    CoveringArrayNotFound {
        dir: PathBuf,
        pattern: String,
        index: usize,
    },
    #[error("covering array {0} has no rows")]
    EmptyCoveringArray(PathBuf),
    #[error("cannot draw {requested} rows from {available}")]
    SampleTooLarge { requested: usize, available: usize },
    #[error("model {model}: selected file {filename} is missing from its results")]
    MissingFilename { model: String, filename: String },
    #[error("model {model} refers to unknown dataset {data}")]
    UnknownDataset { model: String, data: String },
}

/// Strength `k` from the trailing `_<k>` of a type name, e.g. `adaptive random_20_4_2` → 2.
pub fn parse_strength(ca_type: &str) -> Result<usize, CompareError> {
    ca_type
        .rsplit_once('_')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .ok_or_else(|| CompareError::InvalidStrength(ca_type.to_string()))
}

/// Only the shape of a covering array matters here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveringArray {
    pub path: PathBuf,
    pub rows: usize,
    pub factors: usize,
}

impl CoveringArray {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open covering array {}", path.display()))?;
        let factors = reader
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?
            .len();
        let mut rows = 0;
        for record in reader.records() {
            record.with_context(|| {
                format!("malformed row {} in {}", rows + 1, path.display())
            })?;
            rows += 1;
        }
        if rows == 0 {
            return Err(CompareError::EmptyCoveringArray(path.to_path_buf()).into());
        }
        Ok(Self {
            path: path.to_path_buf(),
            rows,
            factors,
        })
    }

    /// `index` 番目（ファイル名順）の `ca_<ca_type>*.csv` を読む。
    ///
    /// 配置先は `ca_root/<ca_type の最初の '_' より前>`。
    pub fn discover(ca_root: &Path, ca_type: &str, index: usize) -> Result<Self> {
        let family = ca_type.split('_').next().unwrap_or(ca_type);
        let dir = ca_root.join(family);
        let prefix = format!("ca_{ca_type}");

        let mut candidates: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".csv"))
            })
            .collect();
        candidates.sort();

        let path = candidates
            .get(index)
            .ok_or_else(|| CompareError::CoveringArrayNotFound {
                dir: dir.clone(),
                pattern: format!("{prefix}*.csv"),
                index,
            })?;
        Self::load(path)
    }

    #[must_use]
    pub fn sample_size(&self, select_num: usize) -> usize {
        self.rows * select_num
    }
}

#[derive(Debug, Deserialize)]
struct RawResultRecord {
    filename: String,
    labels_gt: String,
    labels: String,
}

/// One classified image from a results table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub filename: String,
    pub labels_gt: LabelSet,
    pub labels: LabelSet,
}

impl ResultRecord {
    #[must_use]
    pub fn pass(&self) -> bool {
        self.labels_gt == self.labels
    }
}

/// 結果 CSV を読み込む。余分な列は無視し、ラベル文字列は正規化する。
pub fn load_result_rows(path: &Path) -> Result<Vec<ResultRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open results {}", path.display()))?;
    let mut rows = Vec::new();
    for (idx, record) in reader.deserialize::<RawResultRecord>().enumerate() {
        let record = record
            .with_context(|| format!("failed to parse row {} of {}", idx + 1, path.display()))?;
        rows.push(ResultRecord {
            filename: record.filename,
            labels_gt: LabelSet::parse(&record.labels_gt),
            labels: LabelSet::parse(&record.labels),
        });
    }
    Ok(rows)
}

/// Filenames drawn for one (dataset, covering array type) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomSelection {
    filenames: Vec<String>,
}

impl RandomSelection {
    /// Draws `amount` distinct rows in random order.
    pub fn draw<R: Rng + ?Sized>(
        rows: &[ResultRecord],
        amount: usize,
        rng: &mut R,
    ) -> Result<Self, CompareError> {
        if amount > rows.len() {
            return Err(CompareError::SampleTooLarge {
                requested: amount,
                available: rows.len(),
            });
        }
        let filenames = index::sample(rng, rows.len(), amount)
            .into_iter()
            .map(|idx| rows[idx].filename.clone())
            .collect();
        Ok(Self { filenames })
    }

    #[must_use]
    pub fn filenames(&self) -> &[String] {
        &self.filenames
    }

    /// 選択済みファイル名を `rows` に左結合する。見つからない名前はエラー。
    pub fn resolve<'r>(
        &self,
        rows: &'r [ResultRecord],
        model: &str,
    ) -> Result<Vec<&'r ResultRecord>, CompareError> {
        let mut by_name: HashMap<&str, &ResultRecord> = HashMap::with_capacity(rows.len());
        for row in rows {
            by_name.entry(row.filename.as_str()).or_insert(row);
        }
        self.filenames
            .iter()
            .map(|filename| {
                by_name
                    .get(filename.as_str())
                    .copied()
                    .ok_or_else(|| CompareError::MissingFilename {
                        model: model.to_string(),
                        filename: filename.clone(),
                    })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRow {
    pub filename: String,
    pub labels_gt: String,
    pub labels: String,
    pub pass: u8,
    pub score: f64,
}

pub fn score_rows(
    rows: &[&ResultRecord],
    categories: &CategoryMap,
    way_num: usize,
) -> Vec<ScoredRow> {
    rows.iter()
        .map(|row| {
            let labels_gt = row.labels_gt.to_canonical();
            let labels = row.labels.to_canonical();
            let score = cal_score(&labels_gt, &labels, categories.len(), way_num, categories);
            ScoredRow {
                filename: row.filename.clone(),
                labels_gt,
                labels,
                pass: u8::from(row.pass()),
                score,
            }
        })
        .collect()
}

fn write_scored_rows(path: &Path, rows: &[ScoredRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    if rows.is_empty() {
        writer.write_record(["filename", "labels_gt", "labels", "pass", "score"])?;
    }
    for row in rows {
        writer.serialize(row).context("failed to write scored row")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

struct LoadedModel<'c> {
    model: &'c str,
    data: &'c str,
    dst_dir_name: &'c str,
    categories: CategoryMap,
    rows: Vec<ResultRecord>,
}

#[derive(Debug, Default)]
pub struct CompareReport {
    pub written: Vec<PathBuf>,
    pub rows_selected: usize,
}

/// 全モデル・全配列種別・全反復について抽出とスコア付けを行う。
///
/// 反復 `i`（0 始まり）の乱数は `seed + i` で初期化し、抽出結果の共有は
/// 同じ反復の中に限る。
pub fn run_compare(config: &CompareConfig, metrics: Option<&Metrics>) -> Result<CompareReport> {
    let mut models = Vec::with_capacity(config.models.len());
    for model in &config.models {
        let dataset = config
            .dataset(&model.data)
            .ok_or_else(|| CompareError::UnknownDataset {
                model: model.model.clone(),
                data: model.data.clone(),
            })?;
        let categories = dataset
            .category_map()
            .with_context(|| format!("failed to load categories for {}", dataset.name))?;
        let rows = load_result_rows(&model.results)?;
        debug!(model = %model.model, data = %model.data, rows = rows.len(), "results loaded");
        models.push(LoadedModel {
            model: &model.model,
            data: &model.data,
            dst_dir_name: &dataset.dst_dir_name,
            categories,
            rows,
        });
    }

    let mut report = CompareReport::default();
    for repetition in 0..config.repetitions {
        let run = repetition + 1;
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(repetition as u64));
        let mut selections: HashMap<String, RandomSelection> = HashMap::new();

        for loaded in &models {
            for suffix in &config.ca_types {
                let ca_type = format!("{}_{}{}", config.ca_family, loaded.categories.len(), suffix);
                let way_num = parse_strength(&ca_type)?;
                let key = format!("{}_{}", loaded.data, ca_type);

                let selection = match selections.entry(key) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let ca = CoveringArray::discover(&config.ca_root, &ca_type, repetition)?;
                        let amount = ca.sample_size(config.select_num);
                        info!(
                            data = loaded.data,
                            ca_type = %ca_type,
                            ca_rows = ca.rows,
                            amount,
                            run,
                            "drawing random selection"
                        );
                        entry.insert(RandomSelection::draw(&loaded.rows, amount, &mut rng)?)
                    }
                };

                let selected = selection.resolve(&loaded.rows, loaded.model)?;
                let scored = score_rows(&selected, &loaded.categories, way_num);

                let dst_dir = config
                    .dst_root
                    .join(format!("{}{}", loaded.dst_dir_name, config.version))
                    .join("random")
                    .join(format!("{ca_type}_No{run}"));
                let path = dst_dir.join(format!(
                    "res_{}_{}_{}_cmp_random_{}.csv",
                    loaded.data, loaded.model, ca_type, run
                ));
                write_scored_rows(&path, &scored)?;
                info!(
                    model = loaded.model,
                    rows = scored.len(),
                    path = %path.display(),
                    "selection scored"
                );

                if let Some(metrics) = metrics {
                    metrics.rows_selected.inc_by(scored.len() as f64);
                }
                report.rows_selected += scored.len();
                report.written.push(path);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(filename: &str, gt: &str, pred: &str) -> ResultRecord {
        ResultRecord {
            filename: filename.to_string(),
            labels_gt: LabelSet::parse(gt),
            labels: LabelSet::parse(pred),
        }
    }

    #[rstest]
    #[case("adaptive random_20_4_2", 2)]
    #[case("adaptive random_80_4_3", 3)]
    #[case("x_1", 1)]
    fn strength_is_trailing_number(#[case] ca_type: &str, #[case] expected: usize) {
        assert_eq!(parse_strength(ca_type).expect("strength"), expected);
    }

    #[rstest]
    #[case("adaptive random")]
    #[case("adaptive random_20_4_x")]
    fn strength_requires_numeric_suffix(#[case] ca_type: &str) {
        assert!(matches!(
            parse_strength(ca_type),
            Err(CompareError::InvalidStrength(_))
        ));
    }

    #[test]
    fn covering_array_shape_and_sample_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let family = dir.path().join("adaptive random");
        fs::create_dir_all(&family).expect("family dir");
        fs::write(family.join("ca_adaptive random_20_4_2_b.csv"), "f1,f2,f3\n0,1,2\n1,0,2\n")
            .expect("ca b");
        fs::write(family.join("ca_adaptive random_20_4_2_a.csv"), "f1,f2,f3\n0,1,2\n")
            .expect("ca a");
        fs::write(family.join("notes.txt"), "ignored").expect("noise");

        let first = CoveringArray::discover(dir.path(), "adaptive random_20_4_2", 0)
            .expect("first array");
        assert_eq!((first.rows, first.factors), (1, 3));
        let second = CoveringArray::discover(dir.path(), "adaptive random_20_4_2", 1)
            .expect("second array");
        assert_eq!(second.sample_size(10), 20);

        let err = CoveringArray::discover(dir.path(), "adaptive random_20_4_2", 2).unwrap_err();
        assert!(err.to_string().contains("no covering array #2"), "{err}");
    }

    #[test]
    fn draw_is_distinct_and_reproducible() {
        let rows: Vec<ResultRecord> = (0..50)
            .map(|i| record(&format!("{i:03}.jpg"), "cat", "cat"))
            .collect();
        let a = RandomSelection::draw(&rows, 20, &mut StdRng::seed_from_u64(7)).expect("draw");
        let b = RandomSelection::draw(&rows, 20, &mut StdRng::seed_from_u64(7)).expect("draw");
        assert_eq!(a, b);

        let mut names = a.filenames().to_vec();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 20);
    }

    #[test]
    fn draw_rejects_oversized_sample() {
        let rows = vec![record("a.jpg", "cat", "cat")];
        let err = RandomSelection::draw(&rows, 2, &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(
            err,
            CompareError::SampleTooLarge {
                requested: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn resolve_reports_missing_filename() {
        let first = vec![record("a.jpg", "cat", "cat"), record("b.jpg", "dog", "dog")];
        let selection =
            RandomSelection::draw(&first, 2, &mut StdRng::seed_from_u64(1)).expect("draw");
        let other = vec![record("a.jpg", "cat", "")];
        let err = selection.resolve(&other, "mlgcn").unwrap_err();
        assert!(matches!(err, CompareError::MissingFilename { model, filename }
            if model == "mlgcn" && filename == "b.jpg"));
    }

    #[test]
    fn load_result_rows_canonicalizes_labels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("res.csv");
        fs::write(
            &path,
            "filename,labels_gt,labels,pass,extra\nx.jpg,dog|cat,cat|dog,0,1\ny.jpg,person,,0,2\n",
        )
        .expect("results");
        let rows = load_result_rows(&path).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].labels_gt.to_canonical(), "cat|dog");
        assert!(rows[0].pass());
        assert!(rows[1].labels.is_empty());
        assert!(!rows[1].pass());
    }

    #[test]
    fn scored_rows_use_strength() {
        let categories =
            CategoryMap::from_names(["bird", "cat", "dog"]).expect("categories");
        let rows = [record("a.jpg", "bird|cat|dog", "cat|dog")];
        let refs: Vec<&ResultRecord> = rows.iter().collect();
        let scored = score_rows(&refs, &categories, 2);
        assert_eq!(scored[0].pass, 0);
        assert!((scored[0].score - 1.0 / 3.0).abs() < 1e-12);
    }
}
