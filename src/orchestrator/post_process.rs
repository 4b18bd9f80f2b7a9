//! Post-run processing utilities.
//!
//! After a run completes, rescans the output root and works out which result files the run produced.

use crate::model::RunOutcome;
use crate::results::{self, ResultFile};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub results: Vec<ResultFile>,
    /// Files that are new, or were rewritten, since `before` was taken.
    pub new_results: Vec<ResultFile>,
    pub messages: Vec<String>,
}

/// Identity of a result file for change detection.
pub(crate) type Snapshot = HashMap<PathBuf, (u64, Option<String>)>;

pub(crate) fn snapshot(files: &[ResultFile]) -> Snapshot {
    files
        .iter()
        .map(|f| (f.path.clone(), (f.size_bytes, f.modified_utc.clone())))
        .collect()
}

/// Refresh the results listing and report what changed during the run.
pub(crate) fn process_run_completion(
    output_root: &Path,
    before: &Snapshot,
    outcome: &RunOutcome,
) -> ProcessedRun {
    let mut messages = Vec::new();
    let results = match results::list_result_files(output_root) {
        Ok(r) => r,
        Err(e) => {
            messages.push(format!("Could not rescan results: {e:#}"));
            Vec::new()
        }
    };

    let task_dir = outcome.task.dir_name();
    let new_results: Vec<ResultFile> = results
        .iter()
        .filter(|f| f.task_dir == task_dir)
        .filter(|f| before.get(&f.path) != Some(&(f.size_bytes, f.modified_utc.clone())))
        .cloned()
        .collect();

    for f in &new_results {
        messages.push(format!("New result: {}", f.display_name()));
    }
    if outcome.success && new_results.is_empty() {
        messages.push(format!("No new result files under {}", task_dir));
    }
    tracing::debug!(run_id = %outcome.run_id, new = new_results.len(), "results rescanned");

    ProcessedRun {
        results,
        new_results,
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    fn outcome(task: Task) -> RunOutcome {
        RunOutcome {
            run_id: "r".into(),
            task,
            label: "cot_gpt-4".into(),
            command: String::new(),
            started_utc: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
            cancelled: false,
            timed_out: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn reports_files_created_by_the_run() {
        let root = tempfile::tempdir().unwrap();
        let sq = root.path().join("scienceqa");
        std::fs::create_dir_all(&sq).unwrap();
        std::fs::write(sq.join("old.json"), "{}").unwrap();
        let before = snapshot(&results::list_result_files(root.path()).unwrap());

        std::fs::write(sq.join("cot_gpt-4.json"), "{\"acc\": 1}").unwrap();
        let processed = process_run_completion(root.path(), &before, &outcome(Task::ScienceQa));

        assert_eq!(processed.results.len(), 2);
        let new: Vec<_> = processed.new_results.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(new, ["cot_gpt-4.json"]);
        assert_eq!(processed.messages, ["New result: scienceqa/cot_gpt-4.json"]);
    }

    #[test]
    fn other_tasks_are_ignored_and_absence_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let tab = root.path().join("tabmwp");
        std::fs::create_dir_all(&tab).unwrap();
        std::fs::write(tab.join("x.json"), "{}").unwrap();
        let processed =
            process_run_completion(root.path(), &Snapshot::new(), &outcome(Task::ScienceQa));
        assert!(processed.new_results.is_empty());
        assert_eq!(processed.messages, ["No new result files under scienceqa"]);
    }
}
