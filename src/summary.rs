//! Text summary builder for a finished run.

use crate::model::RunOutcome;

/// Pre-formatted lines for text output, split by where they belong.
pub(crate) struct TextSummary {
    pub headline: String,
    pub lines: Vec<String>,
}

fn push_block(lines: &mut Vec<String>, title: &str, body: &str) {
    lines.push(title.to_string());
    lines.extend(body.lines().map(str::to_string));
}

/// Build the status headline and captured-output blocks for a run.
///
/// `include_stdout` is false when stdout lines were already streamed live.
pub(crate) fn build_text_summary(outcome: &RunOutcome, include_stdout: bool) -> TextSummary {
    let mut lines = Vec::new();
    let headline = if outcome.success {
        if include_stdout {
            push_block(&mut lines, "Output:", &outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            push_block(&mut lines, "Warnings/Errors:", &outcome.stderr);
        }
        format!(
            "Experiment completed successfully in {}!",
            outcome.duration_display()
        )
    } else {
        push_block(&mut lines, "Error output:", &outcome.stderr);
        if outcome.cancelled {
            format!("Experiment cancelled after {}.", outcome.duration_display())
        } else if outcome.timed_out {
            format!("Experiment timed out after {}.", outcome.duration_display())
        } else {
            match outcome.exit_code {
                Some(code) => format!("Experiment failed! (exit code {code})"),
                None => "Experiment failed! (terminated by signal)".to_string(),
            }
        }
    };
    TextSummary { headline, lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    fn outcome(exit_code: Option<i32>, stdout: &str, stderr: &str) -> RunOutcome {
        RunOutcome {
            run_id: "r1".into(),
            task: Task::ScienceQa,
            label: "cot_gpt-4".into(),
            command: "python run_scienceqa/run.py".into(),
            started_utc: String::new(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            success: exit_code == Some(0),
            cancelled: false,
            timed_out: false,
            duration_ms: 2500,
        }
    }

    #[test]
    fn success_shows_output_and_warnings() {
        let s = build_text_summary(&outcome(Some(0), "acc 90\n", "deprecation\n"), true);
        assert_eq!(s.headline, "Experiment completed successfully in 2.50 seconds!");
        assert_eq!(s.lines, ["Output:", "acc 90", "Warnings/Errors:", "deprecation"]);
    }

    #[test]
    fn streamed_stdout_is_not_repeated() {
        let s = build_text_summary(&outcome(Some(0), "acc 90\n", ""), false);
        assert!(s.lines.is_empty());
    }

    #[test]
    fn failure_shows_stderr_only() {
        let s = build_text_summary(&outcome(Some(1), "partial\n", "Traceback\n"), true);
        assert_eq!(s.headline, "Experiment failed! (exit code 1)");
        assert_eq!(s.lines, ["Error output:", "Traceback"]);
    }

    #[test]
    fn cancelled_run_says_so() {
        let mut o = outcome(None, "", "");
        o.cancelled = true;
        let s = build_text_summary(&o, true);
        assert!(s.headline.starts_with("Experiment cancelled"));
    }

    #[test]
    fn failure_header_is_kept_without_stderr() {
        let s = build_text_summary(&outcome(Some(2), "", ""), true);
        assert_eq!(s.lines, ["Error output:"]);
    }

    #[test]
    fn whitespace_stderr_still_counts_as_warnings() {
        let s = build_text_summary(&outcome(Some(0), "", "\n"), false);
        assert_eq!(s.lines, ["Warnings/Errors:", ""]);
    }
}
