use crate::launcher::buffer::OutputBuffer;
use crate::model::{
    ApiKeys, Engine, ExperimentRequest, Model, RunEvent, RunOutcome, Task, TEST_NUMBER_MAX,
};
use crate::orchestrator::{snapshot, ProcessedRun, Snapshot};
use crate::results::ResultFile;
use crate::summary::{build_text_summary, TextSummary};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Launch,
    Output,
    Results,
    Help,
}

impl Tab {
    pub const ALL: [Tab; 4] = [Tab::Launch, Tab::Output, Tab::Results, Tab::Help];

    pub fn title(self) -> &'static str {
        match self {
            Tab::Launch => "Launch",
            Tab::Output => "Output",
            Tab::Results => "Results",
            Tab::Help => "Help",
        }
    }

    pub fn index(self) -> usize {
        Tab::ALL.iter().position(|t| *t == self).unwrap_or(0)
    }

    pub fn next(self) -> Tab {
        Tab::ALL[(self.index() + 1) % Tab::ALL.len()]
    }

    pub fn prev(self) -> Tab {
        Tab::ALL[(self.index() + Tab::ALL.len() - 1) % Tab::ALL.len()]
    }
}

/// Focusable rows of the launch form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Task,
    Model,
    Engine,
    TestNumber,
    OpenAiKey,
    BingKey,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Task,
        Field::Model,
        Field::Engine,
        Field::TestNumber,
        Field::OpenAiKey,
        Field::BingKey,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Field::Task => "Task",
            Field::Model => "Model",
            Field::Engine => "Engine",
            Field::TestNumber => "Test examples",
            Field::OpenAiKey => "OpenAI API key",
            Field::BingKey => "Bing Search API key",
        }
    }

    pub fn is_key(self) -> bool {
        matches!(self, Field::OpenAiKey | Field::BingKey)
    }

    fn step(self, delta: isize) -> Field {
        let n = Field::ALL.len() as isize;
        let i = Field::ALL.iter().position(|f| *f == self).unwrap_or(0) as isize;
        Field::ALL[((i + delta).rem_euclid(n)) as usize]
    }
}

/// An opened result file, pre-rendered into lines.
pub struct ResultDetail {
    pub title: String,
    pub lines: Vec<String>,
    pub scroll: usize,
}

fn cycle<T: Copy + PartialEq>(options: &[T], current: T, forward: bool) -> T {
    let Some(i) = options.iter().position(|o| *o == current) else {
        return options.first().copied().unwrap_or(current);
    };
    let n = options.len();
    let next = if forward { (i + 1) % n } else { (i + n - 1) % n };
    options[next]
}

/// Mask a secret for display, keeping only its length visible.
pub fn mask(secret: &str) -> String {
    "•".repeat(secret.chars().count().min(24))
}

pub(crate) struct UiState {
    pub tab: Tab,
    pub field: Field,
    pub request: ExperimentRequest,
    pub keys: ApiKeys,
    /// Text typed into the focused key field while editing.
    pub key_edit: Option<String>,

    pub output: OutputBuffer,
    pub follow: bool,
    /// First visible output line when not following.
    pub scroll: usize,

    pub running: bool,
    pub command: Option<String>,
    pub run_started: Option<Instant>,
    pub last_outcome: Option<RunOutcome>,
    pub summary: Option<TextSummary>,
    pub failure: Option<String>,
    pub run_messages: Vec<String>,

    pub results: Vec<ResultFile>,
    pub results_selected: usize,
    pub detail: Option<ResultDetail>,
    /// Result files as they were when the current run was launched.
    pub before_run: Snapshot,

    pub info: String,
}

impl UiState {
    pub fn new(request: ExperimentRequest, keys: ApiKeys, results: Vec<ResultFile>) -> Self {
        Self {
            tab: Tab::Launch,
            field: Field::Task,
            request,
            keys,
            key_edit: None,
            output: OutputBuffer::default(),
            follow: true,
            scroll: 0,
            running: false,
            command: None,
            run_started: None,
            last_outcome: None,
            summary: None,
            failure: None,
            run_messages: Vec::new(),
            before_run: snapshot(&results),
            results,
            results_selected: 0,
            detail: None,
            info: String::new(),
        }
    }

    // Launch form

    pub fn focus_next(&mut self) {
        self.field = self.field.step(1);
    }

    pub fn focus_prev(&mut self) {
        self.field = self.field.step(-1);
    }

    /// Change the focused field's value (Left/Right).
    pub fn cycle_value(&mut self, forward: bool) {
        match self.field {
            Field::Task => {
                self.request.task = cycle(&Task::ALL, self.request.task, forward);
                if !self.request.task.supports(self.request.model) {
                    self.request.model = Model::Chameleon;
                }
            }
            Field::Model => {
                self.request.model =
                    cycle(self.request.task.models(), self.request.model, forward);
            }
            Field::Engine => {
                self.request.engine = cycle(&Engine::ALL, self.request.engine, forward);
            }
            Field::TestNumber => {
                self.request.test_number = if forward {
                    (self.request.test_number + 1).min(TEST_NUMBER_MAX)
                } else {
                    self.request.test_number.saturating_sub(1)
                };
            }
            Field::OpenAiKey | Field::BingKey => {}
        }
    }

    pub fn type_digit(&mut self, d: u32) {
        if self.field != Field::TestNumber {
            return;
        }
        let n = self.request.test_number.saturating_mul(10).saturating_add(d);
        self.request.test_number = if n > TEST_NUMBER_MAX { d } else { n };
    }

    pub fn erase_digit(&mut self) {
        if self.field == Field::TestNumber {
            self.request.test_number /= 10;
        }
    }

    pub fn start_key_edit(&mut self) {
        if self.field.is_key() {
            self.key_edit = Some(String::new());
        }
    }

    pub fn key_edit_push(&mut self, c: char) {
        if let Some(buf) = self.key_edit.as_mut() {
            buf.push(c);
        }
    }

    pub fn key_edit_pop(&mut self) {
        if let Some(buf) = self.key_edit.as_mut() {
            buf.pop();
        }
    }

    pub fn cancel_key_edit(&mut self) {
        self.key_edit = None;
        self.info = "Key edit cancelled".into();
    }

    /// Apply the edited key. An empty entry clears the key.
    pub fn commit_key_edit(&mut self) -> Option<ApiKeys> {
        let value = self.key_edit.take()?;
        let (openai, bing) = match self.field {
            Field::OpenAiKey => (Some(value), self.keys.bing.clone()),
            Field::BingKey => (self.keys.openai.clone(), Some(value)),
            _ => return None,
        };
        self.keys = ApiKeys::new(openai, bing);
        self.info = match self.field {
            Field::OpenAiKey if self.keys.has_openai() => "OpenAI API key set".into(),
            Field::OpenAiKey => "OpenAI API key cleared".into(),
            _ if self.keys.has_bing() => "Bing Search API key set".into(),
            _ => "Bing Search API key cleared".into(),
        };
        Some(self.keys.clone())
    }

    /// Display value for one form row.
    pub fn field_value(&self, field: Field) -> String {
        let key_display = |k: &Option<String>| match k {
            Some(k) => mask(k),
            None => "(not set)".to_string(),
        };
        match field {
            Field::Task => self.request.task.display_name().to_string(),
            Field::Model => self.request.model.as_str().to_string(),
            Field::Engine => self.request.engine.as_str().to_string(),
            Field::TestNumber => self.request.test_number.to_string(),
            Field::OpenAiKey | Field::BingKey if self.field == field && self.key_edit.is_some() => {
                format!("{}_", mask(self.key_edit.as_deref().unwrap_or_default()))
            }
            Field::OpenAiKey => key_display(&self.keys.openai),
            Field::BingKey => key_display(&self.keys.bing),
        }
    }

    // Run events

    pub fn apply_event(&mut self, ev: RunEvent) {
        match ev {
            RunEvent::Started { run_id, command } => {
                self.running = true;
                self.output.clear();
                self.follow = true;
                self.scroll = 0;
                self.command = Some(command);
                self.run_started = Some(Instant::now());
                self.last_outcome = None;
                self.summary = None;
                self.failure = None;
                self.run_messages.clear();
                self.tab = Tab::Output;
                self.info = format!("Experiment {run_id} started");
            }
            RunEvent::Line { stream, text } => {
                self.output.push(stream, text);
            }
            RunEvent::Info { message } => self.info = message,
            RunEvent::Completed { outcome } => {
                self.running = false;
                let summary = build_text_summary(&outcome, false);
                self.info = summary.headline.clone();
                self.summary = Some(summary);
                self.last_outcome = Some(*outcome);
            }
            RunEvent::Failed { message } => {
                self.running = false;
                self.info = message.clone();
                self.failure = Some(message);
            }
        }
    }

    /// Fold post-run processing into the results view.
    pub fn apply_processed(&mut self, processed: ProcessedRun) {
        let newest = processed.new_results.first().map(|f| f.path.clone());
        self.set_results(processed.results);
        if let Some(path) = newest {
            if let Some(i) = self.results.iter().position(|f| f.path == path) {
                self.results_selected = i;
            }
        }
        self.run_messages = processed.messages;
    }

    // Output view

    /// Index range of output lines visible in a pane `height` lines tall.
    pub fn output_window(&self, height: usize) -> (usize, usize) {
        let total = self.output.len();
        let height = height.max(1);
        let start = if self.follow {
            total.saturating_sub(height)
        } else {
            self.scroll.min(total.saturating_sub(1))
        };
        (start, (start + height).min(total))
    }

    pub fn scroll_output(&mut self, delta: isize, height: usize) {
        let total = self.output.len();
        let current = self.output_window(height).0;
        let max_start = total.saturating_sub(height.max(1));
        let next = (current as isize + delta).clamp(0, max_start as isize) as usize;
        self.scroll = next;
        self.follow = next >= max_start && delta > 0;
    }

    pub fn toggle_follow(&mut self) {
        self.follow = !self.follow;
        self.info = if self.follow {
            "Following output".into()
        } else {
            "Follow paused".into()
        };
    }

    // Results view

    pub fn set_results(&mut self, results: Vec<ResultFile>) {
        self.results = results;
        if self.results_selected >= self.results.len() {
            self.results_selected = self.results.len().saturating_sub(1);
        }
    }

    pub fn select_result(&mut self, delta: isize) {
        if self.results.is_empty() {
            return;
        }
        let last = self.results.len() as isize - 1;
        self.results_selected = (self.results_selected as isize + delta).clamp(0, last) as usize;
    }

    pub fn selected_result(&self) -> Option<&ResultFile> {
        self.results.get(self.results_selected)
    }

    pub fn scroll_detail(&mut self, delta: isize) {
        if let Some(d) = self.detail.as_mut() {
            let max = d.lines.len().saturating_sub(1) as isize;
            d.scroll = (d.scroll as isize + delta).clamp(0, max) as usize;
        }
    }
}
