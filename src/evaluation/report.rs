//! 評価結果の永続化（CSV / JSON）。

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::warn;

use super::driver::{EvaluationOutcome, EvaluationSummary, GroupAccuracy, ResultTable};

const STAGING_SUFFIX: &str = ".partial";

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

/// Writes the result table with its header; column order follows [`ResultTable::header`].
pub fn write_results_csv(path: &Path, table: &ResultTable) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer
        .write_record(table.header())
        .context("failed to write result header")?;
    for record in table.records() {
        writer
            .write_record(&record)
            .context("failed to write result row")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

/// `labels_gt,accuracy` の表。行が無くてもヘッダは書く。
pub fn write_accuracy_csv(path: &Path, rows: &[GroupAccuracy]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer
        .write_record(["labels_gt", "accuracy"])
        .context("failed to write accuracy header")?;
    for row in rows {
        writer
            .write_record([row.labels_gt.clone(), row.accuracy.to_string()])
            .context("failed to write accuracy row")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

pub fn write_summary_json(path: &Path, summary: &EvaluationSummary) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(summary).context("failed to encode summary")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

fn discard<'p>(paths: impl IntoIterator<Item = &'p PathBuf>) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove artifact"),
        }
    }
}

/// 一時ファイルへ書き出す。失敗時に片付けられるよう、書く前に `staged` へ登録する。
fn stage_outcome(
    res_path: &Path,
    task_name: &str,
    outcome: &EvaluationOutcome,
    staged: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<()> {
    let results = res_path.join(format!("{task_name}_result.csv"));
    let staging = staging_path(&results);
    staged.push((staging.clone(), results));
    write_results_csv(&staging, &outcome.table)?;

    if let Some(accuracy) = &outcome.accuracy {
        let path = res_path.join(format!("{task_name}_accuracy.csv"));
        let staging = staging_path(&path);
        staged.push((staging.clone(), path));
        write_accuracy_csv(&staging, accuracy)?;
    }

    let summary = res_path.join(format!("{task_name}_summary.json"));
    let staging = staging_path(&summary);
    staged.push((staging.clone(), summary));
    write_summary_json(&staging, &outcome.summary)
}

/// タスクの成果物を `res_path` 配下に書き出し、書き出したパスを返す。
///
/// `<task>_result.csv`, `<task>_accuracy.csv`（confidence モードのみ）, `<task>_summary.json`。
/// いずれかの書き込みに失敗した場合は何も残さない。
pub fn persist_outcome(
    res_path: &Path,
    task_name: &str,
    outcome: &EvaluationOutcome,
) -> Result<Vec<PathBuf>> {
    let mut staged = Vec::with_capacity(3);
    if let Err(err) = stage_outcome(res_path, task_name, outcome, &mut staged) {
        discard(staged.iter().map(|(staging, _)| staging));
        return Err(err);
    }

    let mut committed: Vec<PathBuf> = Vec::with_capacity(staged.len());
    for (idx, (staging, target)) in staged.iter().enumerate() {
        if let Err(err) = fs::rename(staging, target) {
            discard(committed.iter());
            discard(staged[idx..].iter().map(|(staging, _)| staging));
            return Err(err).with_context(|| format!("failed to move {}", target.display()));
        }
        committed.push(target.clone());
    }
    Ok(committed)
}
