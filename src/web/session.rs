//! Per-browser sessions and the run relay that feeds their event streams.

use crate::config::{gen_run_id, PanelConfig};
use crate::launcher::buffer::{BufferedLine, OutputBuffer};
use crate::launcher::{ExperimentRunner, RunControl};
use crate::model::{ApiKeys, ExperimentRequest, RunConfig, RunEvent, RunOutcome};
use crate::summary::build_text_summary;
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

/// Sessions idle longer than this are dropped when new sessions are created.
const SESSION_IDLE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const LIVE_CHANNEL_CAPACITY: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves plain data behind; keep serving it.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A run event as relayed to browsers. Output lines carry their buffer sequence number.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Relayed {
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub event: RunEvent,
}

impl Relayed {
    fn from_line(line: BufferedLine) -> Self {
        Self {
            seq: Some(line.seq),
            event: RunEvent::Line {
                stream: line.stream,
                text: line.text,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RunStatus {
    Running,
    Completed,
    Failed,
}

struct RunState {
    buffer: OutputBuffer,
    status: RunStatus,
    started: Option<RunEvent>,
    terminal: Option<RunEvent>,
    outcome: Option<RunOutcome>,
    failure: Option<String>,
}

/// One launched experiment and everything needed to replay it to late subscribers.
pub(crate) struct RunHandle {
    pub run_id: String,
    pub request: ExperimentRequest,
    pub command: String,
    ctrl_tx: mpsc::UnboundedSender<RunControl>,
    live: broadcast::Sender<Relayed>,
    state: Mutex<RunState>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RunSummary {
    pub run_id: String,
    pub request: ExperimentRequest,
    pub command: String,
    pub status: RunStatus,
    pub buffered_lines: usize,
    pub dropped_lines: u64,
    pub last_seq: u64,
    pub headline: Option<String>,
    pub exit_code: Option<i32>,
    pub duration: Option<String>,
    pub error: Option<String>,
}

/// Events a new subscriber must see before switching to the live channel.
pub(crate) struct Subscription {
    pub replay: Vec<Relayed>,
    pub finished: bool,
    pub live: broadcast::Receiver<Relayed>,
}

impl RunHandle {
    fn new(cfg: &RunConfig, ctrl_tx: mpsc::UnboundedSender<RunControl>) -> Arc<Self> {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Arc::new(Self {
            run_id: cfg.run_id.clone(),
            request: cfg.request,
            command: crate::launcher::build_command(cfg).display(),
            ctrl_tx,
            live,
            state: Mutex::new(RunState {
                buffer: OutputBuffer::default(),
                status: RunStatus::Running,
                started: None,
                terminal: None,
                outcome: None,
                failure: None,
            }),
        })
    }

    fn record(&self, event: RunEvent) {
        let mut st = lock(&self.state);
        let relayed = match event {
            RunEvent::Line { stream, text } => {
                let seq = st.buffer.push(stream, text.clone());
                Relayed {
                    seq: Some(seq),
                    event: RunEvent::Line { stream, text },
                }
            }
            RunEvent::Started { .. } => {
                st.started = Some(event.clone());
                Relayed { seq: None, event }
            }
            RunEvent::Completed { outcome } => {
                st.status = RunStatus::Completed;
                // Browsers already received every line; keep the relayed copy small.
                let slim = RunOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    ..(*outcome).clone()
                };
                let slim = RunEvent::Completed {
                    outcome: Box::new(slim),
                };
                st.outcome = Some(*outcome);
                st.terminal = Some(slim.clone());
                Relayed {
                    seq: None,
                    event: slim,
                }
            }
            RunEvent::Failed { ref message } => {
                st.status = RunStatus::Failed;
                st.failure = Some(message.clone());
                st.terminal = Some(event.clone());
                Relayed { seq: None, event }
            }
            RunEvent::Info { .. } => Relayed { seq: None, event },
        };
        // Sent under the state lock so a subscriber's replay and live stream never overlap or gap.
        let _ = self.live.send(relayed);
    }

    /// Snapshot buffered events after `after` and subscribe to what follows, atomically.
    pub fn subscribe(&self, after: u64) -> Subscription {
        let st = lock(&self.state);
        let live = self.live.subscribe();
        let mut replay = Vec::new();
        if let Some(started) = &st.started {
            replay.push(Relayed {
                seq: None,
                event: started.clone(),
            });
        }
        replay.extend(st.buffer.since(after).into_iter().map(Relayed::from_line));
        if let Some(t) = &st.terminal {
            replay.push(Relayed {
                seq: None,
                event: t.clone(),
            });
        }
        Subscription {
            replay,
            finished: st.terminal.is_some(),
            live,
        }
    }

    /// Buffered lines after `seq`, used to recover from a lagging live receiver.
    fn lines_since(&self, seq: u64) -> Vec<Relayed> {
        let st = lock(&self.state);
        st.buffer
            .since(seq)
            .into_iter()
            .map(Relayed::from_line)
            .collect()
    }

    /// Buffered history after `after`, then live events until the run ends or
    /// `shutdown` turns true. A receiver that falls behind the live channel
    /// resyncs from the buffer; sequence numbers keep lines from repeating.
    pub fn events(
        self: &Arc<Self>,
        after: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> impl Stream<Item = Relayed> {
        let sub = self.subscribe(after);
        tracing::debug!(run_id = %self.run_id, after, replay = sub.replay.len(), "event stream opened");
        let run = Arc::clone(self);

        async_stream::stream! {
            let mut last_seq = after;
            let mut live = sub.live;
            for relayed in sub.replay {
                if let Some(seq) = relayed.seq {
                    last_seq = seq;
                }
                yield relayed;
            }
            if !sub.finished {
                loop {
                    if *shutdown.borrow_and_update() {
                        tracing::debug!(run_id = %run.run_id, "event stream closed for shutdown");
                        break;
                    }
                    let received = tokio::select! {
                        r = live.recv() => r,
                        Ok(()) = shutdown.changed() => continue,
                    };
                    match received {
                        Ok(relayed) => {
                            if let Some(seq) = relayed.seq {
                                if seq <= last_seq {
                                    continue;
                                }
                                last_seq = seq;
                            }
                            let terminal = relayed.event.is_terminal();
                            yield relayed;
                            if terminal {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(run_id = %run.run_id, skipped, "event stream lagged, resyncing from buffer");
                            for relayed in run.lines_since(last_seq) {
                                if let Some(seq) = relayed.seq {
                                    last_seq = seq;
                                }
                                yield relayed;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).status == RunStatus::Running
    }

    pub fn cancel(&self) -> bool {
        self.ctrl_tx.send(RunControl::Cancel).is_ok()
    }

    pub fn summary(&self) -> RunSummary {
        let st = lock(&self.state);
        let outcome = st.outcome.as_ref();
        RunSummary {
            run_id: self.run_id.clone(),
            request: self.request,
            command: self.command.clone(),
            status: st.status,
            buffered_lines: st.buffer.len(),
            dropped_lines: st.buffer.dropped(),
            last_seq: st.buffer.last_seq(),
            headline: outcome.map(|o| build_text_summary(o, false).headline),
            exit_code: outcome.and_then(|o| o.exit_code),
            duration: outcome.map(RunOutcome::duration_display),
            error: st.failure.clone(),
        }
    }
}

/// Start the runner for `cfg` and a relay task that records its events on the handle.
pub(crate) fn spawn_run(cfg: RunConfig) -> Arc<RunHandle> {
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let handle = RunHandle::new(&cfg, ctrl_tx);

    let relay = handle.clone();
    tokio::spawn(async move {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(ExperimentRunner::new(cfg).run(event_tx, ctrl_rx));
        // Ends once the runner and both pipe readers have dropped their senders.
        while let Some(ev) = event_rx.recv().await {
            relay.record(ev);
        }
        let terminal = match runner.await {
            Ok(Ok(outcome)) => RunEvent::Completed {
                outcome: Box::new(outcome),
            },
            Ok(Err(e)) => {
                tracing::error!(run_id = %relay.run_id, error = %format!("{e:#}"), "experiment run failed");
                RunEvent::Failed {
                    message: format!("Error running experiment: {e:#}"),
                }
            }
            Err(e) => RunEvent::Failed {
                message: format!("Run join failed: {e}"),
            },
        };
        relay.record(terminal);
    });

    handle
}

pub(crate) struct Session {
    keys: Mutex<ApiKeys>,
    run: Mutex<Option<Arc<RunHandle>>>,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn new(keys: ApiKeys) -> Self {
        Self {
            keys: Mutex::new(keys),
            run: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn keys(&self) -> ApiKeys {
        lock(&self.keys).clone()
    }

    /// Apply a key update: `None` leaves a key unchanged, an empty string clears it.
    pub fn update_keys(&self, openai: Option<String>, bing: Option<String>) -> ApiKeys {
        let mut keys = lock(&self.keys);
        let merged = ApiKeys::new(
            openai.or_else(|| keys.openai.clone()),
            bing.or_else(|| keys.bing.clone()),
        );
        *keys = merged.clone();
        merged
    }

    pub fn current_run(&self) -> Option<Arc<RunHandle>> {
        lock(&self.run).clone()
    }

    fn is_idle_since(&self, cutoff: Instant) -> bool {
        *lock(&self.last_seen) < cutoff
            && !self.current_run().map(|r| r.is_running()).unwrap_or(false)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LaunchError {
    #[error(transparent)]
    Invalid(#[from] crate::launcher::RequestError),
    #[error("an experiment is already running in this session")]
    Busy,
}

impl Session {
    /// Validate and start a run unless one is already active.
    pub fn launch(
        &self,
        panel: &PanelConfig,
        request: ExperimentRequest,
    ) -> Result<Arc<RunHandle>, LaunchError> {
        let mut slot = lock(&self.run);
        if slot.as_ref().map(|r| r.is_running()).unwrap_or(false) {
            return Err(LaunchError::Busy);
        }
        let cfg = panel.run_config(request, &self.keys())?;
        let handle = spawn_run(cfg);
        *slot = Some(handle.clone());
        Ok(handle)
    }
}

#[derive(Default)]
pub(crate) struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn create(&self, keys: ApiKeys) -> (String, Arc<Session>) {
        let mut sessions = lock(&self.sessions);
        if let Some(cutoff) = Instant::now().checked_sub(SESSION_IDLE_TTL) {
            sessions.retain(|_, s| !s.is_idle_since(cutoff));
        }
        let id = format!("{}{}", gen_run_id(), gen_run_id());
        let session = Arc::new(Session::new(keys));
        sessions.insert(id.clone(), session.clone());
        tracing::info!(session = %id, active = sessions.len(), "session created");
        (id, session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = lock(&self.sessions).get(id).cloned();
        if let Some(s) = &session {
            s.touch();
        }
        session
    }

    fn running(&self) -> Vec<Arc<RunHandle>> {
        lock(&self.sessions)
            .values()
            .filter_map(|s| s.current_run())
            .filter(|r| r.is_running())
            .collect()
    }

    /// Ask every running experiment to stop. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        self.running().iter().filter(|r| r.cancel()).count()
    }

    /// Wait until no experiment is running, or `limit` passed. Returns true when idle.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.running().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{OutputStream, Task};
    use futures::StreamExt;
    use std::path::Path;

    fn panel(dir: &Path, script: &str) -> PanelConfig {
        let script_dir = dir.join("run_scienceqa");
        std::fs::create_dir_all(&script_dir).unwrap();
        std::fs::write(script_dir.join("run.py"), script).unwrap();
        PanelConfig {
            python: "sh".into(),
            workdir: dir.to_path_buf(),
            data_root: dir.join("data"),
            output_root: dir.join("results"),
            run_timeout: Some(Duration::from_secs(20)),
            default_keys: ApiKeys::default(),
        }
    }

    async fn wait_finished(handle: &RunHandle) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.is_running() {
            assert!(Instant::now() < deadline, "run did not finish");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_full_replay() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(dir.path(), "echo one\necho two >&2\necho three\n");
        let store = SessionStore::default();
        let (_, session) = store.create(ApiKeys::new(Some("sk".into()), None));
        let handle = session
            .launch(&panel, ExperimentRequest::new(Task::ScienceQa))
            .unwrap();
        wait_finished(&handle).await;

        let sub = handle.subscribe(0);
        assert!(sub.finished);
        assert!(matches!(sub.replay.first().map(|r| &r.event), Some(RunEvent::Started { .. })));
        let lines: Vec<_> = sub
            .replay
            .iter()
            .filter_map(|r| match &r.event {
                RunEvent::Line { stream, text } => Some((*stream, text.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&(OutputStream::Stderr, "two")));
        match &sub.replay.last().unwrap().event {
            RunEvent::Completed { outcome } => {
                assert!(outcome.success);
                assert!(outcome.stdout.is_empty(), "relayed outcome is slimmed");
            }
            other => panic!("unexpected last event {other:?}"),
        }

        let summary = handle.summary();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.exit_code, Some(0));
        assert_eq!(summary.last_seq, 3);
        assert!(summary.headline.unwrap().starts_with("Experiment completed successfully"));

        // Resuming after the second line only replays the third.
        let resumed = handle.subscribe(2);
        let resumed_lines = resumed
            .replay
            .iter()
            .filter(|r| r.seq.is_some())
            .count();
        assert_eq!(resumed_lines, 1);
    }

    #[tokio::test]
    async fn busy_session_rejects_second_launch() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(dir.path(), "exec sleep 30\n");
        let store = SessionStore::default();
        let (_, session) = store.create(ApiKeys::new(Some("sk".into()), None));
        let handle = session
            .launch(&panel, ExperimentRequest::new(Task::ScienceQa))
            .unwrap();
        assert!(matches!(
            session.launch(&panel, ExperimentRequest::new(Task::ScienceQa)),
            Err(LaunchError::Busy)
        ));
        assert!(handle.cancel());
        wait_finished(&handle).await;
        assert!(session
            .launch(&panel, ExperimentRequest::new(Task::ScienceQa))
            .is_ok());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut panel = panel(dir.path(), "");
        panel.python = "no-such-interpreter-for-tests".into();
        let store = SessionStore::default();
        let (_, session) = store.create(ApiKeys::new(Some("sk".into()), None));
        let handle = session
            .launch(&panel, ExperimentRequest::new(Task::ScienceQa))
            .unwrap();
        wait_finished(&handle).await;
        let summary = handle.summary();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.error.unwrap().contains("failed to spawn"));
    }

    /// A run handle with no process behind it, fed by `record` directly.
    fn detached_handle(dir: &Path) -> Arc<RunHandle> {
        let cfg = panel(dir, "")
            .run_config(
                ExperimentRequest::new(Task::ScienceQa),
                &ApiKeys::new(Some("sk".into()), None),
            )
            .unwrap();
        let (ctrl_tx, _) = mpsc::unbounded_channel();
        RunHandle::new(&cfg, ctrl_tx)
    }

    #[tokio::test]
    async fn lagging_stream_resyncs_from_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let handle = detached_handle(dir.path());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = handle.events(0, shutdown_rx);

        // Nobody polls the stream yet, so its live receiver overflows.
        let total = LIVE_CHANNEL_CAPACITY as u64 * 3;
        for i in 0..total {
            handle.record(RunEvent::Line {
                stream: OutputStream::Stdout,
                text: format!("line {i}"),
            });
        }
        handle.record(RunEvent::Failed {
            message: "boom".into(),
        });

        let relayed: Vec<Relayed> = tokio::time::timeout(Duration::from_secs(5), events.collect())
            .await
            .expect("stream should end at the terminal event");
        let seqs: Vec<u64> = relayed.iter().filter_map(|r| r.seq).collect();
        assert_eq!(seqs, (1..=total).collect::<Vec<_>>());
        assert!(matches!(
            relayed.last().map(|r| &r.event),
            Some(RunEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_a_live_stream() {
        let dir = tempfile::tempdir().unwrap();
        let handle = detached_handle(dir.path());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut events = Box::pin(handle.events(0, shutdown_rx));

        handle.record(RunEvent::Line {
            stream: OutputStream::Stderr,
            text: "one".into(),
        });
        let first = events.next().await.unwrap();
        assert_eq!(first.seq, Some(1));

        shutdown_tx.send_replace(true);
        let rest: Vec<Relayed> = tokio::time::timeout(Duration::from_secs(5), events.collect())
            .await
            .expect("shutdown should end the stream while the run is still going");
        assert!(rest.is_empty());
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn cancel_all_stops_running_experiments() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel(dir.path(), "exec sleep 30\n");
        let store = SessionStore::default();
        let (_, first) = store.create(ApiKeys::new(Some("sk".into()), None));
        let (_, second) = store.create(ApiKeys::new(Some("sk".into()), None));
        let a = first
            .launch(&panel, ExperimentRequest::new(Task::ScienceQa))
            .unwrap();
        let b = second
            .launch(&panel, ExperimentRequest::new(Task::ScienceQa))
            .unwrap();

        assert_eq!(store.cancel_all(), 2);
        assert!(store.wait_idle(Duration::from_secs(10)).await);
        assert_eq!(a.summary().status, RunStatus::Completed);
        assert!(!b.is_running());
        assert_eq!(store.cancel_all(), 0);
    }

    #[test]
    fn key_updates_merge_and_clear() {
        let session = Session::new(ApiKeys::new(Some("a".into()), None));
        let keys = session.update_keys(None, Some("b".into()));
        assert_eq!(keys.openai.as_deref(), Some("a"));
        assert_eq!(keys.bing.as_deref(), Some("b"));
        let keys = session.update_keys(Some(String::new()), None);
        assert!(!keys.has_openai());
        assert!(keys.has_bing());
    }

    #[test]
    fn store_lookup_by_id() {
        let store = SessionStore::default();
        let (id, _) = store.create(ApiKeys::default());
        assert!(store.get(&id).is_some());
        assert!(store.get("missing").is_none());
    }
}
