//! Command-line construction for the two benchmark scripts.

use crate::model::{
    ApiKeys, ExperimentRequest, RunConfig, Task, TEST_NUMBER_MAX, TEST_NUMBER_MIN,
};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Reasons a form submission is refused before anything is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("model '{model}' is not available for {task}")]
    UnsupportedModel { task: &'static str, model: &'static str },
    #[error("number of test examples must be between {min} and {max}, got {got}")]
    TestNumberOutOfRange { got: u32, min: u32, max: u32 },
    #[error("Please set your OpenAI API Key")]
    MissingOpenAiKey,
}

/// Check a request against the task's options and the available secrets.
pub fn validate_request(req: &ExperimentRequest, keys: &ApiKeys) -> Result<(), RequestError> {
    if !req.task.supports(req.model) {
        return Err(RequestError::UnsupportedModel {
            task: req.task.display_name(),
            model: req.model.as_str(),
        });
    }
    if !(TEST_NUMBER_MIN..=TEST_NUMBER_MAX).contains(&req.test_number) {
        return Err(RequestError::TestNumberOutOfRange {
            got: req.test_number,
            min: TEST_NUMBER_MIN,
            max: TEST_NUMBER_MAX,
        });
    }
    if !keys.has_openai() {
        return Err(RequestError::MissingOpenAiKey);
    }
    Ok(())
}

/// A fully resolved process invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl LaunchCommand {
    /// Shell-like rendering for display. Environment values are never included.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_arg)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_tokio(&self, workdir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env).current_dir(workdir);
        cmd
    }
}

impl std::fmt::Debug for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty()
        && !arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\' | '$' | '`'))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

/// Build the script invocation for a run.
pub fn build_command(cfg: &RunConfig) -> LaunchCommand {
    let req = &cfg.request;
    let engine = req.engine.as_str();
    let task_dir = req.task.dir_name();
    let data_root = cfg.data_root.join(task_dir);
    let output_root = cfg.output_root.join(task_dir);

    let mut args = vec![req.task.script().to_string()];
    push_flag(&mut args, "--model", req.model.as_str());
    push_flag(&mut args, "--label", req.label());

    match req.task {
        Task::ScienceQa => {
            for flag in ["--policy_engine", "--kr_engine", "--qg_engine", "--sg_engine"] {
                push_flag(&mut args, flag, engine);
            }
            push_flag(&mut args, "--test_split", "test");
            push_flag(&mut args, "--test_number", req.test_number.to_string());
        }
        Task::TabMwp => {
            push_flag(&mut args, "--test_split", "test");
            for flag in [
                "--policy_engine",
                "--rl_engine",
                "--cl_engine",
                "--tv_engine",
                "--kr_engine",
                "--sg_engine",
                "--pg_engine",
            ] {
                push_flag(&mut args, flag, engine);
            }
            push_flag(&mut args, "--test_number", req.test_number.to_string());
            push_flag(&mut args, "--rl_cell_threshold", "18");
            push_flag(&mut args, "--cl_cell_threshold", "18");
        }
    }

    push_flag(&mut args, "--data_root", data_root.to_string_lossy());
    push_flag(&mut args, "--output_root", output_root.to_string_lossy());

    LaunchCommand {
        program: cfg.python.clone(),
        args,
        env: cfg.keys.child_env(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Engine, Model};
    use std::path::PathBuf;

    fn cfg(request: ExperimentRequest) -> RunConfig {
        RunConfig {
            run_id: "abc".into(),
            request,
            python: "python".into(),
            workdir: PathBuf::from("."),
            data_root: PathBuf::from("/app/data"),
            output_root: PathBuf::from("/app/results"),
            keys: ApiKeys::new(Some("sk-test".into()), None),
            timeout: None,
        }
    }

    #[test]
    fn scienceqa_command_matches_script_interface() {
        let cmd = build_command(&cfg(ExperimentRequest {
            task: Task::ScienceQa,
            model: Model::Cot,
            engine: Engine::Gpt35Turbo,
            test_number: 25,
        }));
        assert_eq!(cmd.program, "python");
        let expected: Vec<String> = [
            "run_scienceqa/run.py",
            "--model",
            "cot",
            "--label",
            "cot_gpt-3.5-turbo",
            "--policy_engine",
            "gpt-3.5-turbo",
            "--kr_engine",
            "gpt-3.5-turbo",
            "--qg_engine",
            "gpt-3.5-turbo",
            "--sg_engine",
            "gpt-3.5-turbo",
            "--test_split",
            "test",
            "--test_number",
            "25",
            "--data_root",
            "/app/data/scienceqa",
            "--output_root",
            "/app/results/scienceqa",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(cmd.args, expected);
    }

    #[test]
    fn tabmwp_command_carries_all_engines_and_thresholds() {
        let cmd = build_command(&cfg(ExperimentRequest {
            task: Task::TabMwp,
            model: Model::Pot,
            engine: Engine::Gpt4,
            test_number: 10,
        }));
        assert_eq!(cmd.args[0], "run_tabmwp/run.py");
        assert_eq!(&cmd.args[5..7], &["--test_split", "test"]);
        let engine_flags = cmd
            .args
            .windows(2)
            .filter(|w| w[0].ends_with("_engine"))
            .inspect(|w| assert_eq!(w[1], "gpt-4"))
            .count();
        assert_eq!(engine_flags, 7);
        let joined = cmd.args.join(" ");
        assert!(joined.contains("--test_number 10 --rl_cell_threshold 18 --cl_cell_threshold 18"));
        assert!(joined.ends_with("--data_root /app/data/tabmwp --output_root /app/results/tabmwp"));
    }

    #[test]
    fn secrets_stay_out_of_display() {
        let cmd = build_command(&cfg(ExperimentRequest::new(Task::ScienceQa)));
        assert_eq!(cmd.env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-test"));
        assert!(!cmd.display().contains("sk-test"));
        assert!(!format!("{cmd:?}").contains("sk-test"));
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = LaunchCommand {
            program: "python".into(),
            args: vec!["--data_root".into(), "/my data/it's".into()],
            env: BTreeMap::new(),
        };
        assert_eq!(cmd.display(), r#"python --data_root '/my data/it'\''s'"#);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let keys = ApiKeys::new(Some("sk".into()), None);
        let mut req = ExperimentRequest::new(Task::ScienceQa);
        req.model = Model::Pot;
        assert!(matches!(
            validate_request(&req, &keys),
            Err(RequestError::UnsupportedModel { .. })
        ));

        let mut req = ExperimentRequest::new(Task::TabMwp);
        req.test_number = 0;
        assert!(matches!(
            validate_request(&req, &keys),
            Err(RequestError::TestNumberOutOfRange { got: 0, .. })
        ));
        req.test_number = 1001;
        assert!(validate_request(&req, &keys).is_err());

        req.test_number = 1000;
        assert_eq!(validate_request(&req, &keys), Ok(()));
        assert_eq!(
            validate_request(&req, &ApiKeys::default()),
            Err(RequestError::MissingOpenAiKey)
        );
    }
}
