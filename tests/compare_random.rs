//! Random selection sized after covering arrays, shared across models.

use std::{fs, path::Path};

use mlc_eval::{combine::run_compare, config::CompareConfig};

fn write_results(path: &Path, predictions: &[&str]) {
    let mut contents = String::from("filename,labels_gt,labels\n");
    let truths = ["cat", "cat|dog", "bird|cat|dog", "dog", "bird", "bird|dog"];
    for (idx, (gt, pred)) in truths.iter().zip(predictions).enumerate() {
        contents.push_str(&format!("{idx}.jpg,{gt},{pred}\n"));
    }
    fs::write(path, contents).expect("results csv");
}

fn fixture(dir: &Path) -> std::path::PathBuf {
    let family = dir.join("ca/adaptive random");
    fs::create_dir_all(&family).expect("ca dir");
    fs::write(family.join("ca_adaptive random_3_4_2_1.csv"), "a,b,c\n0,1,0\n1,0,1\n")
        .expect("ca 1");
    fs::write(family.join("ca_adaptive random_3_4_2_2.csv"), "a,b,c\n1,1,1\n").expect("ca 2");

    fs::write(dir.join("categories.json"), r#"{"cat": 0, "dog": 1, "bird": 2}"#)
        .expect("categories");
    write_results(
        &dir.join("m1.csv"),
        &["cat", "cat|dog", "cat|dog", "dog", "", "bird|dog"],
    );
    write_results(
        &dir.join("m2.csv"),
        &["dog", "cat", "bird|cat|dog", "dog", "bird", "bird"],
    );

    let root = dir.display();
    let yaml = format!(
        r#"
ca_root: "{root}/ca"
dst_root: "{root}/dst"
version: "_v1"
ca_types: ["_4_2"]
select_num: 2
repetitions: 2
seed: 11
datasets:
  - name: toy
    dataset: custom
    categories_path: "{root}/categories.json"
    dst_dir_name: TOY_3
models:
  - model: m1
    data: toy
    results: "{root}/m1.csv"
  - model: m2
    data: toy
    results: "{root}/m2.csv"
"#
    );
    let path = dir.join("compare.yaml");
    fs::write(&path, yaml).expect("compare config");
    path
}

fn column(path: &Path, name: &str) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).expect("open output");
    let idx = reader
        .headers()
        .expect("header")
        .iter()
        .position(|h| h == name)
        .expect("column present");
    reader
        .records()
        .map(|record| record.expect("row")[idx].to_string())
        .collect()
}

#[test]
fn later_models_reuse_the_first_selection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = CompareConfig::load(&fixture(dir.path())).expect("config");
    let report = run_compare(&config, None).expect("compare runs");

    assert_eq!(report.written.len(), 4);
    assert_eq!(report.rows_selected, 2 * 4 + 2 * 2);

    let run_dir = dir.path().join("dst/TOY_3_v1/random/adaptive random_3_4_2_No1");
    let m1 = run_dir.join("res_toy_m1_adaptive random_3_4_2_cmp_random_1.csv");
    let m2 = run_dir.join("res_toy_m2_adaptive random_3_4_2_cmp_random_1.csv");

    let header = fs::read_to_string(&m1).expect("m1 output");
    assert!(header.starts_with("filename,labels_gt,labels,pass,score\n"));

    let names = column(&m1, "filename");
    assert_eq!(names.len(), 4);
    assert_eq!(names, column(&m2, "filename"));
    assert_eq!(column(&m1, "labels_gt"), column(&m2, "labels_gt"));

    let second = dir
        .path()
        .join("dst/TOY_3_v1/random/adaptive random_3_4_2_No2")
        .join("res_toy_m2_adaptive random_3_4_2_cmp_random_2.csv");
    assert_eq!(column(&second, "filename").len(), 2);

    for score in column(&m2, "score") {
        let score: f64 = score.parse().expect("numeric score");
        assert!((0.0..=1.0).contains(&score));
    }
}

#[test]
fn same_seed_gives_same_files() {
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    let a = run_compare(&CompareConfig::load(&fixture(first.path())).expect("a"), None)
        .expect("run a");
    let b = run_compare(&CompareConfig::load(&fixture(second.path())).expect("b"), None)
        .expect("run b");

    for (left, right) in a.written.iter().zip(&b.written) {
        assert_eq!(column(left, "filename"), column(right, "filename"));
        assert_eq!(column(left, "score"), column(right, "score"));
    }
}

#[test]
fn oversized_selection_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = CompareConfig::load(&fixture(dir.path())).expect("config");
    config.select_num = 10;
    let err = run_compare(&config, None).unwrap_err();
    assert!(format!("{err:#}").contains("cannot draw 20 rows from 6"), "{err:#}");
}
