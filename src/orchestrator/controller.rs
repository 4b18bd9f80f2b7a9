//! Run lifecycle controller.
//!
//! Owns launch/cancel orchestration and emits events for presentation layers.

use crate::config::PanelConfig;
use crate::launcher::{ExperimentRunner, RunControl};
use crate::model::{ApiKeys, ExperimentRequest, RunEvent, RunOutcome};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

/// How long a cancel may take before the UI is told it is still in progress.
const CANCEL_WATCHDOG: Duration = Duration::from_secs(1);

/// Commands emitted by UI layers to control experiment runs.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Launch(ExperimentRequest),
    Cancel,
    UpdateKeys(ApiKeys),
    Quit,
}

/// Internal handle for a running experiment task.
struct RunCtx {
    ctrl_tx: UnboundedSender<RunControl>,
    handle: Option<tokio::task::JoinHandle<Result<RunOutcome>>>,
}

/// Spawn a run task. The returned context owns its cancel channel.
fn start_run(
    panel: &PanelConfig,
    keys: &ApiKeys,
    request: ExperimentRequest,
    event_tx: &UnboundedSender<RunEvent>,
) -> Option<RunCtx> {
    let cfg = match panel.run_config(request, keys) {
        Ok(cfg) => cfg,
        Err(e) => {
            let _ = event_tx.send(RunEvent::info(e.to_string()));
            return None;
        }
    };
    let (ctrl_tx, ctrl_rx) = tokio::sync::mpsc::unbounded_channel::<RunControl>();
    let runner = ExperimentRunner::new(cfg);
    let tx = event_tx.clone();
    let handle = tokio::spawn(async move { runner.run(tx, ctrl_rx).await });
    Some(RunCtx {
        ctrl_tx,
        handle: Some(handle),
    })
}

/// Orchestrate runs based on UI commands and emit events back to presentation layers.
pub(crate) async fn run_controller(
    panel: &PanelConfig,
    initial: Option<ExperimentRequest>,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut keys = panel.default_keys.clone();
    let mut run_ctx = initial.and_then(|req| start_run(panel, &keys, req, &event_tx));
    let mut quit_pending = false;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep UI feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(250));

    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(UiCommand::Launch(req)) => {
                        // Launches are serialized: one experiment at a time.
                        if run_ctx.is_some() {
                            let _ = event_tx.send(RunEvent::info(
                                "An experiment is already running; cancel it first (x)",
                            ));
                        } else {
                            run_ctx = start_run(panel, &keys, req, &event_tx);
                        }
                    }
                    Some(UiCommand::Cancel) => {
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(RunControl::Cancel);
                            let _ = event_tx.send(RunEvent::info("Cancelling…"));
                            cancel_deadline = Some(tokio::time::Instant::now() + CANCEL_WATCHDOG);
                        } else {
                            let _ = event_tx.send(RunEvent::info("No experiment is running"));
                        }
                    }
                    Some(UiCommand::UpdateKeys(k)) => {
                        keys = k;
                    }
                    Some(UiCommand::Quit) => {
                        // Quit waits for the current run to finish so the child is never orphaned.
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(RunControl::Cancel);
                            let _ = event_tx.send(RunEvent::info("Cancelling…"));
                            cancel_deadline = Some(tokio::time::Instant::now() + CANCEL_WATCHDOG);
                        } else {
                            break Ok(());
                        }
                    }
                    // Every UI handle is gone; stop like Quit but without new feedback.
                    None => {
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(RunControl::Cancel);
                        } else {
                            break Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = &mut run_ctx {
                        ctx.handle.take();
                    }
                    match join_res {
                        Ok(Ok(outcome)) => {
                            let _ = event_tx.send(RunEvent::Completed { outcome: Box::new(outcome) });
                        }
                        Ok(Err(e)) => {
                            tracing::error!(error = %format!("{e:#}"), "experiment run failed");
                            let _ = event_tx.send(RunEvent::Failed {
                                message: format!("Error running experiment: {e:#}"),
                            });
                        }
                        Err(e) => {
                            let _ = event_tx.send(RunEvent::Failed {
                                message: format!("Run join failed: {e}"),
                            });
                        }
                    }
                    run_ctx = None;
                    cancel_deadline = None;
                    if quit_pending {
                        break Ok(());
                    }
                }
            }
            // If the child ignores the kill for a while, keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        let _ = event_tx.send(RunEvent::info("Still cancelling…"));
                        cancel_deadline = None;
                    }
                }
            }
        }
    };

    res
}
