//! カテゴリ表とラベル集合。
//!
//! `CategoryMap` はデータセットごとに固定されるクラス名とインデックスの全単射。
//! `LabelSet` は順序を持たないラベル集合で、入出力の境界でのみ `|` 区切りの
//! ソート済み文字列（正準形）に変換する。

use std::{
    collections::{BTreeSet, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 正準形でラベルを区切る文字。
pub const LABEL_DELIMITER: char = '|';

const VOC_CATEGORIES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "dining table",
    "dog",
    "horse",
    "motorbike",
    "person",
    "potted plant",
    "sheep",
    "sofa",
    "train",
    "tv",
];

const COCO_CATEGORIES: [&str; 80] = [
    "airplane",
    "apple",
    "backpack",
    "banana",
    "baseball bat",
    "baseball glove",
    "bear",
    "bed",
    "bench",
    "bicycle",
    "bird",
    "boat",
    "book",
    "bottle",
    "bowl",
    "broccoli",
    "bus",
    "cake",
    "car",
    "carrot",
    "cat",
    "cell phone",
    "chair",
    "clock",
    "couch",
    "cow",
    "cup",
    "dining table",
    "dog",
    "donut",
    "elephant",
    "fire hydrant",
    "fork",
    "frisbee",
    "giraffe",
    "hair dryer",
    "handbag",
    "horse",
    "hot dog",
    "keyboard",
    "kite",
    "knife",
    "laptop",
    "microwave",
    "motorcycle",
    "mouse",
    "orange",
    "oven",
    "parking meter",
    "person",
    "pizza",
    "potted plant",
    "refrigerator",
    "remote",
    "sandwich",
    "scissors",
    "sheep",
    "sink",
    "skateboard",
    "skis",
    "snowboard",
    "spoon",
    "sports ball",
    "stop sign",
    "suitcase",
    "surfboard",
    "teddy bear",
    "tennis racket",
    "tie",
    "toaster",
    "toilet",
    "toothbrush",
    "traffic light",
    "train",
    "truck",
    "tv",
    "umbrella",
    "vase",
    "wine glass",
    "zebra",
];

/// Benchmark dataset a category table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Voc,
    Coco,
    Custom,
}

impl Dataset {
    fn builtin_names(self) -> Option<&'static [&'static str]> {
        match self {
            Dataset::Voc => Some(&VOC_CATEGORIES),
            Dataset::Coco => Some(&COCO_CATEGORIES),
            Dataset::Custom => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CategoryMapError {
    #[error("failed to read category map at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse category map at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("category index {index} is assigned to both {first:?} and {second:?}")]
    DuplicateIndex {
        index: usize,
        first: String,
        second: String,
    },
    #[error("category {0:?} appears more than once")]
    DuplicateName(String),
    #[error("category indices must be contiguous from 0; index {0} is missing")]
    MissingIndex(usize),
    #[error("dataset {0:?} has no built-in category table")]
    NoBuiltin(Dataset),
}

/// クラス名 ⇔ インデックスの全単射。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMap {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl CategoryMap {
    /// 位置をそのままインデックスとして採用する。
    pub fn from_names<I, S>(names: I) -> Result<Self, CategoryMapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut index = HashMap::new();
        for name in names {
            let name = name.into();
            if index.insert(name.clone(), ordered.len()).is_some() {
                return Err(CategoryMapError::DuplicateName(name));
            }
            ordered.push(name);
        }
        Ok(Self {
            names: ordered,
            index,
        })
    }

    /// `{ "name": index }` 形式の表から構築する。インデックスは 0 から連続している必要がある。
    pub fn from_index_map(map: HashMap<String, usize>) -> Result<Self, CategoryMapError> {
        let mut slots: Vec<Option<String>> = vec![None; map.len()];
        for (name, idx) in &map {
            let Some(slot) = slots.get_mut(*idx) else {
                // 範囲外のインデックスがある場合、どこかに欠番がある
                let missing = (0..map.len())
                    .find(|candidate| !map.values().any(|value| value == candidate))
                    .unwrap_or(map.len());
                return Err(CategoryMapError::MissingIndex(missing));
            };
            if let Some(existing) = slot.replace(name.clone()) {
                let (first, second) = if existing < *name {
                    (existing, name.clone())
                } else {
                    (name.clone(), existing)
                };
                return Err(CategoryMapError::DuplicateIndex {
                    index: *idx,
                    first,
                    second,
                });
            }
        }

        let mut names = Vec::with_capacity(slots.len());
        for (idx, slot) in slots.into_iter().enumerate() {
            names.push(slot.ok_or(CategoryMapError::MissingIndex(idx))?);
        }
        Ok(Self { names, index: map })
    }

    /// データセットの `category.json` を読み込む。
    pub fn load_json(path: &Path) -> Result<Self, CategoryMapError> {
        let contents = fs::read_to_string(path).map_err(|source| CategoryMapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: HashMap<String, usize> =
            serde_json::from_str(&contents).map_err(|source| CategoryMapError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_index_map(raw)
    }

    pub fn builtin(dataset: Dataset) -> Result<Self, CategoryMapError> {
        let names = dataset
            .builtin_names()
            .ok_or(CategoryMapError::NoBuiltin(dataset))?;
        Self::from_names(names.iter().copied())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Category names in index order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// `(name, index)` pairs ordered by name, the column order of confidence reports.
    #[must_use]
    pub fn sorted_by_name(&self) -> Vec<(&str, usize)> {
        let mut pairs: Vec<(&str, usize)> = self
            .names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();
        pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
        pairs
    }

    /// Collects the names of every class whose flag is set.
    pub fn label_set<I>(&self, flags: I) -> LabelSet
    where
        I: IntoIterator<Item = bool>,
    {
        self.names
            .iter()
            .zip(flags)
            .filter_map(|(name, present)| present.then(|| name.clone()))
            .collect()
    }
}

/// 順序を持たないラベル集合。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 正準形（`|` 区切り）を解析する。空文字列は空集合になる。
    #[must_use]
    pub fn parse(canonical: &str) -> Self {
        canonical
            .split(LABEL_DELIMITER)
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    /// ソート済みの `|` 区切り文字列。
    #[must_use]
    pub fn to_canonical(&self) -> String {
        let mut out = String::new();
        for (idx, label) in self.0.iter().enumerate() {
            if idx > 0 {
                out.push(LABEL_DELIMITER);
            }
            out.push_str(label);
        }
        out
    }

    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        self.0.insert(label.into())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    #[must_use]
    pub fn is_superset(&self, other: &LabelSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Number of labels present in both sets.
    #[must_use]
    pub fn intersection_len(&self, other: &LabelSet) -> usize {
        self.0.intersection(&other.0).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn builtin_tables_have_expected_sizes() {
        let voc = CategoryMap::builtin(Dataset::Voc).expect("voc table");
        let coco = CategoryMap::builtin(Dataset::Coco).expect("coco table");
        assert_eq!(voc.len(), 20);
        assert_eq!(coco.len(), 80);
        assert_eq!(voc.index_of("dog"), Some(11));
        assert_eq!(coco.index_of("zebra"), Some(79));
        assert_eq!(coco.name(49), Some("person"));
    }

    #[test]
    fn custom_dataset_has_no_builtin() {
        let err = CategoryMap::builtin(Dataset::Custom).unwrap_err();
        assert!(matches!(err, CategoryMapError::NoBuiltin(Dataset::Custom)));
    }

    #[test]
    fn from_index_map_rejects_duplicate_index() {
        let map = HashMap::from([("cat".to_string(), 0), ("dog".to_string(), 0)]);
        let err = CategoryMap::from_index_map(map).unwrap_err();
        match err {
            CategoryMapError::DuplicateIndex {
                index,
                first,
                second,
            } => {
                assert_eq!(index, 0);
                assert_eq!(first, "cat");
                assert_eq!(second, "dog");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn from_index_map_rejects_gaps() {
        let map = HashMap::from([("cat".to_string(), 0), ("dog".to_string(), 2)]);
        let err = CategoryMap::from_index_map(map).unwrap_err();
        assert!(matches!(err, CategoryMapError::MissingIndex(1)));
    }

    #[test]
    fn from_names_rejects_duplicates() {
        let err = CategoryMap::from_names(["cat", "dog", "cat"]).unwrap_err();
        assert!(matches!(err, CategoryMapError::DuplicateName(name) if name == "cat"));
    }

    #[test]
    fn sorted_by_name_keeps_original_indices() {
        let map = CategoryMap::from_names(["zebra", "ant", "mole"]).expect("map");
        assert_eq!(
            map.sorted_by_name(),
            vec![("ant", 1), ("mole", 2), ("zebra", 0)]
        );
    }

    #[test]
    fn label_set_from_flags_follows_index_order() {
        let map = CategoryMap::from_names(["cat", "dog", "bird"]).expect("map");
        let set = map.label_set([true, false, true]);
        assert_eq!(set.to_canonical(), "bird|cat");
    }

    #[rstest]
    #[case("", "")]
    #[case("dog|cat", "cat|dog")]
    #[case("dining table|person", "dining table|person")]
    #[case("cat||dog|", "cat|dog")]
    fn canonical_form_is_sorted(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(LabelSet::parse(raw).to_canonical(), expected);
    }

    #[test]
    fn empty_string_parses_to_empty_set() {
        assert!(LabelSet::parse("").is_empty());
    }

    #[test]
    fn set_equality_ignores_input_order() {
        assert_eq!(LabelSet::parse("b|a|c"), LabelSet::parse("c|b|a"));
        assert_eq!(LabelSet::parse("b|a").intersection_len(&LabelSet::parse("a|z")), 1);
    }
}
