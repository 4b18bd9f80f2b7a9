pub mod buffer;
pub mod command;
mod relay;

pub use command::{build_command, validate_request, RequestError};

use crate::model::{OutputStream, RunConfig, RunEvent, RunOutcome};
use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum RunControl {
    /// Kill the child process
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exited,
    Cancelled,
    TimedOut,
}

/// How long to keep draining pipes after the child was killed.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Kill the child and everything it started. The child leads its own process group
/// on unix, so background helpers holding the pipes go down with it.
fn kill_tree(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pgid) = pgid {
            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                tracing::debug!(pgid, error = %e, "killpg failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
    let _ = child.start_kill();
}

/// Result of a pipe reader, or `None` when it was abandoned.
fn reader_text(
    joined: Option<Result<String, JoinError>>,
    task: &JoinHandle<String>,
    stream: OutputStream,
    event_tx: &mpsc::UnboundedSender<RunEvent>,
) -> Result<String> {
    match joined {
        Some(res) => res.context("output reader task failed"),
        None => {
            task.abort();
            tracing::warn!(?stream, "pipe still open after kill, abandoning reader");
            let _ = event_tx.send(RunEvent::info(format!(
                "{stream:?} still held open by a leftover process; captured text is incomplete"
            )));
            Ok(String::new())
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

pub struct ExperimentRunner {
    cfg: RunConfig,
}

impl ExperimentRunner {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg }
    }

    /// Spawn the script, relay both pipes until exit and return the outcome.
    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<RunEvent>,
        mut control_rx: mpsc::UnboundedReceiver<RunControl>,
    ) -> Result<RunOutcome> {
        let launch = build_command(&self.cfg);
        let shown = launch.display();
        let started_utc = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into());

        let mut cmd = launch.to_tokio(&self.cfg.workdir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::info!(run_id = %self.cfg.run_id, command = %shown, "launching experiment");
        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", launch.program))?;
        let pgid = child.id();

        let _ = event_tx.send(RunEvent::Started {
            run_id: self.cfg.run_id.clone(),
            command: shown.clone(),
        });

        // Each pipe gets its own reader so a chatty stderr can never stall stdout (or vice versa).
        let stdout = child.stdout.take().context("child stdout was not piped")?;
        let stderr = child.stderr.take().context("child stderr was not piped")?;
        let mut out_task = tokio::spawn(relay::relay_lines(
            stdout,
            OutputStream::Stdout,
            event_tx.clone(),
        ));
        let mut err_task = tokio::spawn(relay::relay_lines(
            stderr,
            OutputStream::Stderr,
            event_tx.clone(),
        ));

        let deadline = sleep_until_opt(self.cfg.timeout.map(|t| start + t));
        tokio::pin!(deadline);

        let mut stop = Stop::Exited;
        let mut control_open = true;
        let mut status = None;
        let mut out_text = None;
        let mut err_text = None;
        // Set once the process tree was killed; readers still open by then are abandoned.
        let mut drain_until: Option<Instant> = None;

        // The run ends when the child has exited and both pipes reached EOF. A leftover
        // background process can hold the pipes past exit, so cancel and the deadline
        // stay live until then.
        while status.is_none() || out_text.is_none() || err_text.is_none() {
            tokio::select! {
                res = child.wait(), if status.is_none() => {
                    status = Some(res.context("waiting for child process")?);
                    if stop != Stop::Exited {
                        drain_until.get_or_insert_with(|| Instant::now() + KILL_DRAIN_GRACE);
                    }
                }
                res = &mut out_task, if out_text.is_none() => out_text = Some(res),
                res = &mut err_task, if err_text.is_none() => err_text = Some(res),
                msg = control_rx.recv(), if control_open && stop == Stop::Exited => match msg {
                    Some(RunControl::Cancel) => {
                        tracing::info!(run_id = %self.cfg.run_id, "cancelling experiment");
                        stop = Stop::Cancelled;
                        kill_tree(&mut child, pgid);
                        if status.is_some() {
                            drain_until = Some(Instant::now() + KILL_DRAIN_GRACE);
                        }
                    }
                    // Nobody can cancel any more; just wait for exit.
                    None => control_open = false,
                },
                _ = &mut deadline, if stop == Stop::Exited => {
                    tracing::warn!(run_id = %self.cfg.run_id, "experiment timed out");
                    stop = Stop::TimedOut;
                    let _ = event_tx.send(RunEvent::info("Run timed out, killing process"));
                    kill_tree(&mut child, pgid);
                    if status.is_some() {
                        drain_until = Some(Instant::now() + KILL_DRAIN_GRACE);
                    }
                }
                _ = sleep_until_opt(drain_until), if drain_until.is_some() && status.is_some() => break,
            }
        }

        let Some(status) = status else {
            anyhow::bail!("child process status was not collected");
        };
        let stdout = reader_text(out_text, &out_task, OutputStream::Stdout, &event_tx)?;
        let stderr = reader_text(err_text, &err_task, OutputStream::Stderr, &event_tx)?;
        let duration = start.elapsed();

        let exit_code = status.code();
        let cancelled = stop == Stop::Cancelled;
        let timed_out = stop == Stop::TimedOut;
        let success = exit_code == Some(0) && !cancelled && !timed_out;
        tracing::info!(
            run_id = %self.cfg.run_id,
            ?exit_code,
            success,
            cancelled,
            timed_out,
            elapsed_ms = duration.as_millis() as u64,
            "experiment finished"
        );

        Ok(RunOutcome {
            run_id: self.cfg.run_id.clone(),
            task: self.cfg.request.task,
            label: self.cfg.request.label(),
            command: shown,
            started_utc,
            stdout,
            stderr,
            exit_code,
            success,
            cancelled,
            timed_out,
            duration_ms: duration.as_millis() as u64,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{ApiKeys, ExperimentRequest, Task};
    use std::path::Path;

    /// Config whose "interpreter" is `sh`, with a fake script written into `dir`.
    fn sh_config(dir: &Path, script: &str, timeout: Option<Duration>) -> RunConfig {
        let script_dir = dir.join("run_scienceqa");
        std::fs::create_dir_all(&script_dir).unwrap();
        std::fs::write(script_dir.join("run.py"), script).unwrap();
        RunConfig {
            run_id: "test-run".into(),
            request: ExperimentRequest::new(Task::ScienceQa),
            python: "sh".into(),
            workdir: dir.to_path_buf(),
            data_root: dir.join("data"),
            output_root: dir.join("results"),
            keys: ApiKeys::new(Some("sk-from-panel".into()), None),
            timeout,
        }
    }

    async fn run_collect(cfg: RunConfig) -> (Result<RunOutcome>, Vec<RunEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let res = ExperimentRunner::new(cfg).run(tx, ctrl_rx).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (res, events)
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sh_config(
            dir.path(),
            "echo out-1\necho err-1 >&2\necho out-2\nexit 3\n",
            None,
        );
        let (res, events) = run_collect(cfg).await;
        let outcome = res.unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success);
        assert_eq!(outcome.stdout, "out-1\nout-2\n");
        assert_eq!(outcome.stderr, "err-1\n");
        assert_eq!(outcome.label, "chameleon_gpt-4");

        assert!(matches!(events.first(), Some(RunEvent::Started { .. })));
        let stdout_lines: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Line {
                    stream: OutputStream::Stdout,
                    text,
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout_lines, ["out-1", "out-2"]);
    }

    #[tokio::test]
    async fn passes_session_key_and_script_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sh_config(dir.path(), "echo \"$OPENAI_API_KEY\"\necho \"$@\"\n", None);
        let (res, _) = run_collect(cfg).await;
        let outcome = res.unwrap();
        assert!(outcome.success);
        let mut lines = outcome.stdout.lines();
        assert_eq!(lines.next(), Some("sk-from-panel"));
        let args = lines.next().unwrap();
        assert!(args.starts_with("--model chameleon --label chameleon_gpt-4"));
        assert!(args.contains("--test_number 10"));
        assert!(!outcome.command.contains("sk-from-panel"));
    }

    #[tokio::test]
    async fn large_output_on_both_pipes_does_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        // Well past a pipe buffer on each stream, interleaved.
        let script = "i=0\nwhile [ $i -lt 4000 ]; do\n  echo \"stdout line $i padding padding padding\"\n  echo \"stderr line $i padding padding padding\" >&2\n  i=$((i+1))\ndone\n";
        let cfg = sh_config(dir.path(), script, Some(Duration::from_secs(30)));
        let (res, events) = run_collect(cfg).await;
        let outcome = res.unwrap();
        assert!(outcome.success);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.stdout.lines().count(), 4000);
        assert_eq!(outcome.stderr.lines().count(), 4000);
        let line_events = events
            .iter()
            .filter(|e| matches!(e, RunEvent::Line { .. }))
            .count();
        assert_eq!(line_events, 8000);
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sh_config(dir.path(), "echo ready\nexec sleep 30\n", None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(ExperimentRunner::new(cfg).run(tx, ctrl_rx));

        // Wait for the first line so the child is definitely running.
        loop {
            match rx.recv().await {
                Some(RunEvent::Line { .. }) => break,
                Some(_) => continue,
                None => panic!("runner ended before producing output"),
            }
        }
        ctrl_tx.send(RunControl::Cancel).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("cancel should end the run promptly")
            .unwrap()
            .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert_eq!(outcome.stdout, "ready\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sh_config(dir.path(), "exec sleep 30\n", Some(Duration::from_millis(200)));
        let (res, events) = run_collect(cfg).await;
        let outcome = res.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::Info { message } if message.contains("timed out"))));
    }

    /// Spawn a runner and return its handle once the first output line arrived.
    async fn start_and_wait_for_output(
        cfg: RunConfig,
    ) -> (
        JoinHandle<Result<RunOutcome>>,
        mpsc::UnboundedReceiver<RunEvent>,
        mpsc::UnboundedSender<RunControl>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(ExperimentRunner::new(cfg).run(tx, ctrl_rx));
        loop {
            match rx.recv().await {
                Some(RunEvent::Line { .. }) => break,
                Some(_) => continue,
                None => panic!("runner ended before producing output"),
            }
        }
        (handle, rx, ctrl_tx)
    }

    #[tokio::test]
    async fn cancel_after_exit_stops_background_pipe_holder() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sh_config(dir.path(), "sleep 20 &\necho done\nexit 0\n", None);
        let (handle, _rx, ctrl_tx) = start_and_wait_for_output(cfg).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        ctrl_tx.send(RunControl::Cancel).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(6), handle)
            .await
            .expect("cancel must end the run while a background process holds the pipes")
            .unwrap()
            .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert_eq!(outcome.stdout, "done\n");
    }

    #[tokio::test]
    async fn timeout_applies_after_exit_while_pipes_are_held() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sh_config(
            dir.path(),
            "sleep 20 &\necho done\nexit 0\n",
            Some(Duration::from_millis(500)),
        );
        let (res, _) = tokio::time::timeout(Duration::from_secs(6), run_collect(cfg))
            .await
            .expect("timeout must end the run while a background process holds the pipes");
        let outcome = res.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.success);
    }

    // `setsid` moves the helper out of the child's process group, so the kill cannot reach it.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn readers_are_abandoned_after_kill_grace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sh_config(
            dir.path(),
            "setsid sleep 6 &\nsleep 0.2\necho ready\nexec sleep 30\n",
            None,
        );
        let (handle, mut rx, ctrl_tx) = start_and_wait_for_output(cfg).await;
        let cancelled_at = std::time::Instant::now();
        ctrl_tx.send(RunControl::Cancel).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("kill grace must bound the drain")
            .unwrap()
            .unwrap();
        assert!(outcome.cancelled);
        assert!(cancelled_at.elapsed() >= KILL_DRAIN_GRACE);

        let mut abandoned = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let RunEvent::Info { message } = ev {
                if message.contains("still held open") {
                    abandoned.push(message);
                }
            }
        }
        assert_eq!(abandoned.len(), 2, "{abandoned:?}");
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = sh_config(dir.path(), "", None);
        cfg.python = "definitely-not-a-real-interpreter-xyz".into();
        let (res, events) = run_collect(cfg).await;
        let err = res.unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn"));
        assert!(events.is_empty());
    }
}
