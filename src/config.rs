use std::{
    collections::HashSet,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    evaluation::{EvaluationSettings, ReportMode},
    labels::{CategoryMap, CategoryMapError, Dataset},
};

const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_WAY_NUM: usize = 2;
const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("task {task}: missing value for {field}")]
    Missing { task: String, field: &'static str },
    #[error("task {task}: invalid value for {field}: {reason}")]
    Invalid {
        task: String,
        field: &'static str,
        reason: String,
    },
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),
}

/// タスクファイル共通の既定値。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskDefaults {
    threshold: Option<f32>,
    way_num: Option<usize>,
    batch_size: Option<usize>,
    print_freq: Option<usize>,
    mode: Option<ReportMode>,
    res_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    task_name: String,
    dataset: Dataset,
    #[serde(default)]
    categories_path: Option<PathBuf>,
    predictions: PathBuf,
    #[serde(default)]
    res_path: Option<PathBuf>,
    #[serde(default)]
    num_classes: Option<usize>,
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    way_num: Option<usize>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    print_freq: Option<usize>,
    #[serde(default)]
    mode: Option<ReportMode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTaskFile {
    #[serde(default)]
    defaults: TaskDefaults,
    tasks: Vec<RawTask>,
}

/// 1 つの評価タスク（データセット × モデル）の設定。
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub task_name: String,
    pub dataset: Dataset,
    pub categories_path: Option<PathBuf>,
    pub predictions: PathBuf,
    pub res_path: PathBuf,
    pub num_classes: Option<usize>,
    pub threshold: f32,
    pub way_num: usize,
    pub batch_size: NonZeroUsize,
    pub print_freq: usize,
    pub mode: ReportMode,
}

impl TaskConfig {
    #[must_use]
    pub fn settings(&self) -> EvaluationSettings {
        EvaluationSettings {
            threshold: self.threshold,
            way_num: self.way_num,
            print_freq: self.print_freq,
            mode: self.mode,
        }
    }

    /// Built-in table for VOC/COCO, `categories_path` for custom datasets.
    ///
    /// An explicit `categories_path` wins over the built-in table.
    pub fn category_map(&self) -> Result<CategoryMap, CategoryMapError> {
        match &self.categories_path {
            Some(path) => CategoryMap::load_json(path),
            None => CategoryMap::builtin(self.dataset),
        }
    }

    fn resolve(raw: RawTask, defaults: &TaskDefaults) -> Result<Self, ConfigError> {
        let task = raw.task_name.clone();
        let threshold = raw
            .threshold
            .or(defaults.threshold)
            .unwrap_or(DEFAULT_THRESHOLD);
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                task,
                field: "threshold",
                reason: format!("{threshold} is outside [0, 1]"),
            });
        }

        let way_num = raw.way_num.or(defaults.way_num).unwrap_or(DEFAULT_WAY_NUM);
        if way_num == 0 {
            return Err(ConfigError::Invalid {
                task,
                field: "way_num",
                reason: "must be at least 1".to_string(),
            });
        }

        let batch_size = raw
            .batch_size
            .or(defaults.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let batch_size = NonZeroUsize::new(batch_size).ok_or_else(|| ConfigError::Invalid {
            task: task.clone(),
            field: "batch_size",
            reason: "must be at least 1".to_string(),
        })?;

        if raw.dataset == Dataset::Custom && raw.categories_path.is_none() {
            return Err(ConfigError::Missing {
                task,
                field: "categories_path",
            });
        }

        let res_path = raw
            .res_path
            .or_else(|| defaults.res_path.as_ref().map(|base| base.join(&raw.task_name)))
            .ok_or_else(|| ConfigError::Missing {
                task: task.clone(),
                field: "res_path",
            })?;

        Ok(Self {
            task_name: raw.task_name,
            dataset: raw.dataset,
            categories_path: raw.categories_path,
            predictions: raw.predictions,
            res_path,
            num_classes: raw.num_classes,
            threshold,
            way_num,
            batch_size,
            print_freq: raw.print_freq.or(defaults.print_freq).unwrap_or(0),
            mode: raw.mode.or(defaults.mode).unwrap_or_default(),
        })
    }

    /// カテゴリ表を読み込み、`num_classes` との整合性を確認する。
    pub fn load_categories(&self) -> anyhow::Result<CategoryMap> {
        let map = self.category_map()?;
        if let Some(expected) = self.num_classes {
            anyhow::ensure!(
                map.len() == expected,
                "task {}: category map has {} entries but num_classes is {}",
                self.task_name,
                map.len(),
                expected
            );
        }
        Ok(map)
    }
}

/// YAML タスクファイル（`defaults` + `tasks`）。
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFile {
    pub tasks: Vec<TaskConfig>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawTaskFile =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Deserialize {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawTaskFile) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for task in raw.tasks {
            if !seen.insert(task.task_name.clone()) {
                return Err(ConfigError::DuplicateTask(task.task_name));
            }
            tasks.push(TaskConfig::resolve(task, &raw.defaults)?);
        }
        Ok(Self { tasks })
    }

    #[cfg(test)]
    fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawTaskFile =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Deserialize {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::from_raw(raw)
    }
}

/// 比較用データセットの設定。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareDataset {
    pub name: String,
    pub dataset: Dataset,
    #[serde(default)]
    pub categories_path: Option<PathBuf>,
    pub dst_dir_name: String,
}

impl CompareDataset {
    pub fn category_map(&self) -> Result<CategoryMap, CategoryMapError> {
        match &self.categories_path {
            Some(path) => CategoryMap::load_json(path),
            None => CategoryMap::builtin(self.dataset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareModel {
    pub model: String,
    pub data: String,
    /// Results CSV with at least `filename,labels_gt,labels`.
    pub results: PathBuf,
}

/// Random-selection comparison settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareConfig {
    pub ca_root: PathBuf,
    pub dst_root: PathBuf,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_ca_family")]
    pub ca_family: String,
    /// Suffixes such as `_4_2` (factor levels, strength).
    pub ca_types: Vec<String>,
    #[serde(default = "default_select_num")]
    pub select_num: usize,
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
    #[serde(default)]
    pub seed: u64,
    pub datasets: Vec<CompareDataset>,
    pub models: Vec<CompareModel>,
}

fn default_ca_family() -> String {
    "adaptive random".to_string()
}

fn default_select_num() -> usize {
    10
}

fn default_repetitions() -> usize {
    5
}

impl CompareConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Deserialize {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::Invalid {
            task: "compare-random".to_string(),
            field,
            reason,
        };
        if self.select_num == 0 {
            return Err(invalid("select_num", "must be at least 1".to_string()));
        }
        for model in &self.models {
            if !self.datasets.iter().any(|data| data.name == model.data) {
                return Err(invalid(
                    "models",
                    format!("model {} refers to unknown dataset {}", model.model, model.data),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&CompareDataset> {
        self.datasets.iter().find(|data| data.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASKS: &str = r"
defaults:
  threshold: 0.5
  way_num: 2
  batch_size: 8
  mode: confidence
  res_path: out
tasks:
  - task_name: voc_msrn
    dataset: voc
    predictions: data/voc/msrn.jsonl
  - task_name: coco_asl
    dataset: coco
    predictions: data/coco/asl.jsonl
    threshold: 0.8
    batch_size: 64
    print_freq: 640
    mode: plain
    res_path: elsewhere/coco_asl
";

    #[test]
    fn defaults_fill_missing_task_values() {
        let file = TaskFile::from_yaml(TASKS).expect("valid task file");
        assert_eq!(file.tasks.len(), 2);

        let voc = &file.tasks[0];
        assert_eq!(voc.threshold, 0.5);
        assert_eq!(voc.batch_size.get(), 8);
        assert_eq!(voc.mode, ReportMode::Confidence);
        assert_eq!(voc.res_path, PathBuf::from("out/voc_msrn"));
        assert_eq!(voc.category_map().expect("builtin").len(), 20);

        let coco = &file.tasks[1];
        assert_eq!(coco.threshold, 0.8);
        assert_eq!(coco.print_freq, 640);
        assert_eq!(coco.mode, ReportMode::Plain);
        assert_eq!(coco.res_path, PathBuf::from("elsewhere/coco_asl"));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let yaml = "tasks:\n  - task_name: t\n    dataset: voc\n    predictions: p.jsonl\n    res_path: out\n    threshold: 1.5\n";
        let err = TaskFile::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "threshold", .. }));
    }

    #[test]
    fn rejects_zero_way_num() {
        let yaml = "tasks:\n  - task_name: t\n    dataset: voc\n    predictions: p.jsonl\n    res_path: out\n    way_num: 0\n";
        let err = TaskFile::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "way_num", .. }));
    }

    #[test]
    fn custom_dataset_requires_categories() {
        let yaml = "tasks:\n  - task_name: t\n    dataset: custom\n    predictions: p.jsonl\n    res_path: out\n";
        let err = TaskFile::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { field: "categories_path", .. }));
    }

    #[test]
    fn missing_res_path_is_reported() {
        let yaml = "tasks:\n  - task_name: t\n    dataset: voc\n    predictions: p.jsonl\n";
        let err = TaskFile::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { field: "res_path", .. }));
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let yaml = "defaults:\n  res_path: out\ntasks:\n  - task_name: t\n    dataset: voc\n    predictions: a.jsonl\n  - task_name: t\n    dataset: coco\n    predictions: b.jsonl\n";
        let err = TaskFile::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTask(name) if name == "t"));
    }

    #[test]
    fn num_classes_must_match_category_map() {
        let yaml = "tasks:\n  - task_name: t\n    dataset: voc\n    predictions: p.jsonl\n    res_path: out\n    num_classes: 80\n";
        let file = TaskFile::from_yaml(yaml).expect("parses");
        let err = file.tasks[0].load_categories().unwrap_err();
        assert!(err.to_string().contains("num_classes is 80"), "{err}");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = TaskFile::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn compare_config_rejects_unknown_dataset_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("compare.yaml");
        fs::write(
            &path,
            "ca_root: ca\ndst_root: dst\nca_types: [\"_4_2\"]\ndatasets:\n  - name: voc\n    dataset: voc\n    dst_dir_name: VOC_20\nmodels:\n  - model: msrn\n    data: coco\n    results: r.csv\n",
        )
        .expect("write config");
        let err = CompareConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("unknown dataset coco"), "{err}");
    }
}
