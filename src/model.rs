use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const TEST_NUMBER_MIN: u32 = 1;
pub const TEST_NUMBER_MAX: u32 = 1000;
pub const TEST_NUMBER_DEFAULT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[value(name = "scienceqa")]
    ScienceQa,
    #[value(name = "tabmwp")]
    TabMwp,
}

impl Task {
    pub const ALL: [Task; 2] = [Task::ScienceQa, Task::TabMwp];

    pub fn display_name(self) -> &'static str {
        match self {
            Task::ScienceQa => "ScienceQA",
            Task::TabMwp => "TabMWP",
        }
    }

    /// Subdirectory used under both the data root and the output root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Task::ScienceQa => "scienceqa",
            Task::TabMwp => "tabmwp",
        }
    }

    /// Script path relative to the working directory.
    pub fn script(self) -> &'static str {
        match self {
            Task::ScienceQa => "run_scienceqa/run.py",
            Task::TabMwp => "run_tabmwp/run.py",
        }
    }

    pub fn models(self) -> &'static [Model] {
        match self {
            Task::ScienceQa => &[Model::Chameleon, Model::Cot],
            Task::TabMwp => &[Model::Chameleon, Model::Cot, Model::Pot],
        }
    }

    pub fn supports(self, model: Model) -> bool {
        self.models().contains(&model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Chameleon,
    Cot,
    Pot,
}

impl Model {
    pub fn as_str(self) -> &'static str {
        match self {
            Model::Chameleon => "chameleon",
            Model::Cot => "cot",
            Model::Pot => "pot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Engine {
    #[serde(rename = "gpt-4")]
    #[value(name = "gpt-4")]
    Gpt4,
    #[serde(rename = "gpt-3.5-turbo")]
    #[value(name = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::Gpt4, Engine::Gpt35Turbo];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Gpt4 => "gpt-4",
            Engine::Gpt35Turbo => "gpt-3.5-turbo",
        }
    }
}

/// Form input for one experiment launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRequest {
    pub task: Task,
    pub model: Model,
    pub engine: Engine,
    #[serde(default = "default_test_number")]
    pub test_number: u32,
}

fn default_test_number() -> u32 {
    TEST_NUMBER_DEFAULT
}

impl ExperimentRequest {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            model: Model::Chameleon,
            engine: Engine::Gpt4,
            test_number: TEST_NUMBER_DEFAULT,
        }
    }

    /// Label passed to the script and used for its output file names.
    pub fn label(&self) -> String {
        format!("{}_{}", self.model.as_str(), self.engine.as_str())
    }
}

/// API keys held for one operator session. Never written to the panel's own environment.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiKeys {
    #[serde(default)]
    pub openai: Option<String>,
    #[serde(default)]
    pub bing: Option<String>,
}

impl ApiKeys {
    pub fn new(openai: Option<String>, bing: Option<String>) -> Self {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            openai: clean(openai),
            bing: clean(bing),
        }
    }

    pub fn has_openai(&self) -> bool {
        self.openai.is_some()
    }

    pub fn has_bing(&self) -> bool {
        self.bing.is_some()
    }

    /// Variables injected into the child environment.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(k) = &self.openai {
            env.insert("OPENAI_API_KEY".to_string(), k.clone());
        }
        if let Some(k) = &self.bing {
            env.insert("BING_SEARCH_API_KEY".to_string(), k.clone());
        }
        env
    }
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys")
            .field("openai", &self.openai.as_ref().map(|_| "<set>"))
            .field("bing", &self.bing.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// A validated request bound to the panel's paths and the operator's secrets.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub run_id: String,
    pub request: ExperimentRequest,
    pub python: String,
    pub workdir: PathBuf,
    pub data_root: PathBuf,
    pub output_root: PathBuf,
    #[serde(skip)]
    pub keys: ApiKeys,
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        command: String,
    },
    Line {
        stream: OutputStream,
        text: String,
    },
    Info {
        message: String,
    },
    Completed {
        // Boxed so line events stay small; the outcome carries the full captured text.
        outcome: Box<RunOutcome>,
    },
    Failed {
        message: String,
    },
}

impl RunEvent {
    pub fn info(message: impl Into<String>) -> Self {
        RunEvent::Info {
            message: message.into(),
        }
    }

    /// True for the events that end a run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Completed { .. } | RunEvent::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub task: Task,
    pub label: String,
    pub command: String,
    #[serde(default)]
    pub started_utc: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn duration_display(&self) -> String {
        format!("{:.2} seconds", self.duration().as_secs_f64())
    }
}
