use crate::config::PanelConfig;
use crate::launcher::{ExperimentRunner, RunControl};
use crate::model::{
    ApiKeys, Engine, ExperimentRequest, Model, OutputStream, RunEvent, RunOutcome, Task,
    TEST_NUMBER_DEFAULT, TEST_NUMBER_MAX, TEST_NUMBER_MIN,
};
use crate::summary::build_text_summary;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "chameleon-panel",
    version,
    about = "Control panel for the Chameleon ScienceQA and TabMWP experiment scripts"
)]
pub struct Cli {
    /// Benchmark task to run
    #[arg(long, value_enum, default_value_t = Task::ScienceQa)]
    pub task: Task,

    /// Reasoning model (ScienceQA supports chameleon and cot only)
    #[arg(long, value_enum, default_value_t = Model::Chameleon)]
    pub model: Model,

    /// LLM engine used for every module of the pipeline
    #[arg(long, value_enum, default_value_t = Engine::Gpt4)]
    pub engine: Engine,

    /// Number of test examples
    #[arg(
        long,
        default_value_t = TEST_NUMBER_DEFAULT,
        value_parser = clap::value_parser!(u32).range(TEST_NUMBER_MIN as i64..=TEST_NUMBER_MAX as i64)
    )]
    pub test_number: u32,

    /// Root of the benchmark datasets
    #[arg(long, env = "DATA_ROOT", default_value = "/app/data")]
    pub data_root: PathBuf,

    /// Root the scripts write result files under
    #[arg(long, env = "OUTPUT_ROOT", default_value = "/app/results")]
    pub output_root: PathBuf,

    /// Python interpreter used to run the scripts
    #[arg(long, default_value = "python")]
    pub python: String,

    /// Directory containing run_scienceqa/ and run_tabmwp/
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// OpenAI API key passed to the experiment process
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Bing Search API key passed to the experiment process
    #[arg(long, env = "BING_SEARCH_API_KEY", hide_env_values = true)]
    pub bing_api_key: Option<String>,

    /// Kill the experiment if it runs longer than this (e.g. 2h)
    #[arg(long)]
    pub run_timeout: Option<humantime::Duration>,

    /// Run once and print the outcome as JSON (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Run once, streaming output as text (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Serve the browser panel on this address (e.g. 127.0.0.1:7860)
    #[arg(long, value_name = "ADDR")]
    pub serve: Option<SocketAddr>,

    /// List result files under the output root and exit
    #[arg(long)]
    pub list_results: bool,

    /// Print the sections of one result file and exit
    #[arg(long, value_name = "PATH")]
    pub show_result: Option<PathBuf>,

    /// Launch the selected experiment as soon as the TUI opens
    #[arg(long)]
    pub launch_on_start: bool,

    /// Log file used while the TUI owns the terminal
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// True when the TUI is going to own the terminal.
    pub fn is_tui(&self) -> bool {
        cfg!(feature = "tui")
            && !self.json
            && !self.text
            && !self.silent
            && self.serve.is_none()
            && !self.list_results
            && self.show_result.is_none()
    }

    /// True for modes that run to completion and exit on their own.
    pub fn is_headless(&self) -> bool {
        self.json || self.text || self.silent || self.list_results || self.show_result.is_some()
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    let panel = build_panel_config(&args)?;

    if let Some(addr) = args.serve {
        return crate::web::serve(addr, panel).await;
    }
    if args.list_results {
        return list_results(&panel);
    }
    if let Some(path) = args.show_result.as_deref() {
        return show_result(&panel, path);
    }

    let request = build_request(&args);

    // Silent mode takes precedence over other output modes
    if args.silent {
        return run_json(panel, request, true).await;
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(panel, request, args.launch_on_start).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(panel, request).await;
        }
    }

    if args.json {
        return run_json(panel, request, false).await;
    }

    run_text(panel, request).await
}

/// Resolve panel-wide settings from CLI arguments.
pub fn build_panel_config(args: &Cli) -> Result<PanelConfig> {
    let workdir = if args.workdir.as_os_str() == "." {
        std::env::current_dir().context("resolve working directory")?
    } else {
        args.workdir.clone()
    };
    Ok(PanelConfig {
        python: args.python.clone(),
        workdir,
        data_root: args.data_root.clone(),
        output_root: args.output_root.clone(),
        run_timeout: args.run_timeout.map(Duration::from),
        default_keys: ApiKeys::new(args.openai_api_key.clone(), args.bing_api_key.clone()),
    })
}

/// The experiment selected by `--task`/`--model`/`--engine`/`--test-number`.
pub fn build_request(args: &Cli) -> ExperimentRequest {
    ExperimentRequest {
        task: args.task,
        model: args.model,
        engine: args.engine,
        test_number: args.test_number,
    }
}

/// Validate, spawn and drive one run, forwarding events and cancelling on Ctrl+C.
async fn run_once(
    panel: &PanelConfig,
    request: ExperimentRequest,
    mut on_event: impl FnMut(RunEvent),
) -> Result<RunOutcome> {
    let cfg = panel.run_config(request, &panel.default_keys)?;
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<RunControl>();

    let runner = ExperimentRunner::new(cfg);
    let handle = tokio::spawn(async move { runner.run(evt_tx, ctrl_rx).await });

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            ev = evt_rx.recv() => match ev {
                Some(ev) => on_event(ev),
                None => break,
            },
            _ = &mut ctrl_c, if !cancel_sent => {
                cancel_sent = true;
                tracing::info!("Ctrl+C received, cancelling experiment");
                let _ = ctrl_tx.send(RunControl::Cancel);
                on_event(RunEvent::info("Cancelling…"));
            }
        }
    }

    handle
        .await
        .context("experiment task failed")?
        .context("Error running experiment")
}

async fn run_json(panel: PanelConfig, request: ExperimentRequest, silent: bool) -> Result<()> {
    let outcome = run_once(&panel, request, |_| {}).await?;

    if !silent {
        let (out_tx, out_handle) = spawn_output_writer();
        let out = serde_json::to_string_pretty(&outcome)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
        drop(out_tx);
        let _ = out_handle.await;
    }

    if !outcome.success {
        return Err(anyhow::anyhow!(build_text_summary(&outcome, false).headline));
    }
    Ok(())
}

/// A failed run whose summary was already printed; only the exit status is left to set.
#[derive(Debug, thiserror::Error)]
#[error("{headline}")]
pub struct RunFailed {
    pub headline: String,
}

async fn run_text(panel: PanelConfig, request: ExperimentRequest) -> Result<()> {
    let before = crate::orchestrator::snapshot(
        &crate::results::list_result_files(&panel.output_root).unwrap_or_default(),
    );
    let (out_tx, out_handle) = spawn_output_writer();

    let tx = out_tx.clone();
    let result = run_once(&panel, request, move |ev| match ev {
        RunEvent::Started { command, .. } => {
            let _ = tx.send(OutputLine::Stderr(format!("Running: {command}")));
        }
        RunEvent::Line { stream, text } => {
            let line = match stream {
                OutputStream::Stdout => OutputLine::Stdout(text),
                OutputStream::Stderr => OutputLine::Stderr(text),
            };
            let _ = tx.send(line);
        }
        RunEvent::Info { message } => {
            let _ = tx.send(OutputLine::Stderr(message));
        }
        RunEvent::Completed { .. } | RunEvent::Failed { .. } => {}
    })
    .await;

    let outcome = match result {
        Ok(o) => o,
        Err(e) => {
            drop(out_tx);
            let _ = out_handle.await;
            return Err(e);
        }
    };

    // Stdout was streamed live; only stderr is repeated in the summary.
    let summary = build_text_summary(&outcome, false);
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stderr(line));
    }
    let _ = out_tx.send(OutputLine::Stdout(summary.headline.clone()));

    let processed =
        crate::orchestrator::process_run_completion(&panel.output_root, &before, &outcome);
    for message in processed.messages {
        let _ = out_tx.send(OutputLine::Stderr(message));
    }

    drop(out_tx);
    let _ = out_handle.await;

    if !outcome.success {
        return Err(RunFailed {
            headline: summary.headline,
        }
        .into());
    }
    Ok(())
}

fn list_results(panel: &PanelConfig) -> Result<()> {
    let files = crate::results::list_result_files(&panel.output_root)?;
    if files.is_empty() {
        eprintln!("No result files under {}", panel.output_root.display());
        return Ok(());
    }
    let mut out = std::io::stdout().lock();
    for f in files {
        writeln!(
            out,
            "{}\t{} bytes\t{}",
            f.display_name(),
            f.size_bytes,
            f.modified_utc.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}

fn show_result(panel: &PanelConfig, path: &std::path::Path) -> Result<()> {
    // Relative paths that do not exist as given are looked up under the output root.
    let path = if path.is_relative() && !path.exists() {
        panel.output_root.join(path)
    } else {
        path.to_path_buf()
    };
    let value = crate::results::load_result(&path).context("Error loading results")?;
    let mut out = std::io::stdout().lock();
    for line in crate::results::section_lines(&crate::results::sections(&value)) {
        writeln!(out, "{line}")?;
    }
    Ok(())
}
