mod clipboard;
mod help;
mod state;

use crate::config::PanelConfig;
use crate::model::{ExperimentRequest, OutputStream, RunEvent, RunOutcome};
use crate::orchestrator::{self, UiCommand};
use crate::results;
use anyhow::{Context, Result};
use clipboard::{copy_to_clipboard, shorten_for_status};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use help::draw_help;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{Field, ResultDetail, Tab, UiState};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Lines moved by PageUp/PageDown in scrollable views.
const PAGE: isize = 20;

pub async fn run(panel: PanelConfig, request: ExperimentRequest, launch_on_start: bool) -> Result<()> {
    // Unbounded channels avoid backpressure on the pipe readers.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_panel = panel.clone();
    let ui_handle =
        std::thread::spawn(move || run_threaded(ui_panel, request, event_rx, cmd_tx));

    let initial = launch_on_start.then_some(request);
    let res = orchestrator::run_controller(&panel, initial, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// What the key handler asks the loop to do next.
enum Flow {
    Continue,
    Quit,
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    panel: PanelConfig,
    request: ExperimentRequest,
    mut event_rx: UnboundedReceiver<RunEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let listing = results::list_result_files(&panel.output_root).unwrap_or_else(|e| {
        tracing::warn!(error = %format!("{e:#}"), "initial results scan failed");
        Vec::new()
    });
    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::new(request, panel.default_keys.clone(), listing);
    if !state.keys.has_openai() {
        state.info = "Set your OpenAI API key on the Launch tab before running".into();
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    // Output pane height from the last draw, used for paging.
    let mut output_height = 20usize;

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            match ev {
                RunEvent::Completed { outcome } => {
                    handle_run_completed(&panel, &mut state, *outcome);
                }
                other => state.apply_event(other),
            }
        }

        if last_tick.elapsed() >= tick_rate {
            terminal
                .draw(|f| {
                    output_height = draw(f.area(), f, &state, &panel);
                })
                .ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if let Flow::Quit = handle_key(k, &mut state, &panel, &cmd_tx, output_height) {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    break Ok(());
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn handle_key(
    k: KeyEvent,
    state: &mut UiState,
    panel: &PanelConfig,
    cmd_tx: &UnboundedSender<UiCommand>,
    output_height: usize,
) -> Flow {
    if k.modifiers.contains(KeyModifiers::CONTROL) && k.code == KeyCode::Char('c') {
        return Flow::Quit;
    }

    // A key being typed swallows everything else.
    if state.key_edit.is_some() {
        match k.code {
            KeyCode::Enter => {
                if let Some(keys) = state.commit_key_edit() {
                    let _ = cmd_tx.send(UiCommand::UpdateKeys(keys));
                }
            }
            KeyCode::Esc => state.cancel_key_edit(),
            KeyCode::Backspace => state.key_edit_pop(),
            KeyCode::Char(c) => state.key_edit_push(c),
            _ => {}
        }
        return Flow::Continue;
    }

    match k.code {
        KeyCode::Char('q') => return Flow::Quit,
        KeyCode::Char('x') => {
            let _ = cmd_tx.send(UiCommand::Cancel);
        }
        KeyCode::Tab => state.tab = state.tab.next(),
        KeyCode::BackTab => state.tab = state.tab.prev(),
        KeyCode::Char('?') => state.tab = Tab::Help,
        _ => match state.tab {
            Tab::Launch => handle_launch_key(k.code, state, panel, cmd_tx),
            Tab::Output => handle_output_key(k.code, state, output_height),
            Tab::Results => handle_results_key(k.code, state, panel),
            Tab::Help => {}
        },
    }
    Flow::Continue
}

fn handle_launch_key(
    code: KeyCode,
    state: &mut UiState,
    panel: &PanelConfig,
    cmd_tx: &UnboundedSender<UiCommand>,
) {
    match code {
        KeyCode::Up | KeyCode::Char('k') => state.focus_prev(),
        KeyCode::Down | KeyCode::Char('j') => state.focus_next(),
        KeyCode::Left | KeyCode::Char('h') => state.cycle_value(false),
        KeyCode::Right | KeyCode::Char('l') => state.cycle_value(true),
        KeyCode::Char(c) if c.is_ascii_digit() => {
            state.type_digit(c.to_digit(10).unwrap_or(0));
        }
        KeyCode::Backspace => state.erase_digit(),
        KeyCode::Enter if state.field.is_key() => state.start_key_edit(),
        KeyCode::Enter => {
            if state.running {
                state.info = "An experiment is already running; cancel it first (x)".into();
                return;
            }
            // Remember what existed so the finished run's new files can be picked out.
            refresh_results(panel, state);
            state.before_run = orchestrator::snapshot(&state.results);
            state.info = format!("Launching {}…", state.request.label());
            let _ = cmd_tx.send(UiCommand::Launch(state.request));
        }
        _ => {}
    }
}

fn handle_output_key(code: KeyCode, state: &mut UiState, height: usize) {
    match code {
        KeyCode::Up | KeyCode::Char('k') => state.scroll_output(-1, height),
        KeyCode::Down | KeyCode::Char('j') => state.scroll_output(1, height),
        KeyCode::PageUp => state.scroll_output(-PAGE, height),
        KeyCode::PageDown => state.scroll_output(PAGE, height),
        KeyCode::Home => {
            state.follow = false;
            state.scroll = 0;
        }
        KeyCode::End => state.follow = true,
        KeyCode::Char('f') => state.toggle_follow(),
        _ => {}
    }
}

fn handle_results_key(code: KeyCode, state: &mut UiState, panel: &PanelConfig) {
    if state.detail.is_some() {
        match code {
            KeyCode::Up | KeyCode::Char('k') => state.scroll_detail(-1),
            KeyCode::Down | KeyCode::Char('j') => state.scroll_detail(1),
            KeyCode::PageUp => state.scroll_detail(-PAGE),
            KeyCode::PageDown => state.scroll_detail(PAGE),
            KeyCode::Esc | KeyCode::Backspace | KeyCode::Left => state.detail = None,
            KeyCode::Char('y') => copy_selected_path(state),
            _ => {}
        }
        return;
    }
    match code {
        KeyCode::Up | KeyCode::Char('k') => state.select_result(-1),
        KeyCode::Down | KeyCode::Char('j') => state.select_result(1),
        KeyCode::PageUp => state.select_result(-PAGE),
        KeyCode::PageDown => state.select_result(PAGE),
        KeyCode::Enter | KeyCode::Right => open_selected(state),
        KeyCode::Char('y') => copy_selected_path(state),
        KeyCode::Char('r') => {
            let before = state.results.len();
            refresh_results(panel, state);
            state.info = format!("Refreshed: {} result file(s)", state.results.len());
            if state.results.len() > before {
                state.info.push_str(&format!(", {} new", state.results.len() - before));
            }
        }
        _ => {}
    }
}

fn refresh_results(panel: &PanelConfig, state: &mut UiState) {
    match results::list_result_files(&panel.output_root) {
        Ok(list) => state.set_results(list),
        Err(e) => state.info = format!("Refresh failed: {e:#}"),
    }
}

fn open_selected(state: &mut UiState) {
    let Some(file) = state.selected_result() else {
        state.info = "No result file selected".into();
        return;
    };
    let title = file.display_name();
    let path = file.path.clone();
    match results::load_result(&path) {
        Ok(value) => {
            let lines = results::section_lines(&results::sections(&value));
            tracing::info!(path = %path.display(), "result file opened");
            state.detail = Some(ResultDetail {
                title,
                lines,
                scroll: 0,
            });
        }
        Err(e) => state.info = format!("Error loading results: {e:#}"),
    }
}

fn copy_selected_path(state: &mut UiState) {
    let Some(file) = state.selected_result() else {
        state.info = "No result file selected".into();
        return;
    };
    let path = file.path.display().to_string();
    state.info = match copy_to_clipboard(&path) {
        Ok(()) => format!("✓ Copied to clipboard: {}", shorten_for_status(&path, 60)),
        Err(e) => format!("Clipboard copy failed: {e:#}"),
    };
}

fn handle_run_completed(panel: &PanelConfig, state: &mut UiState, outcome: RunOutcome) {
    let processed =
        orchestrator::process_run_completion(&panel.output_root, &state.before_run, &outcome);
    state.apply_event(RunEvent::Completed {
        outcome: Box::new(outcome),
    });
    state.apply_processed(processed);
}

/// Draw the whole screen; returns the output pane's inner height.
fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState, panel: &PanelConfig) -> usize {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(area);

    let tabs = Tabs::new(Tab::ALL.iter().map(|t| Line::from(t.title())).collect::<Vec<_>>())
        .select(state.tab.index())
        .block(Block::default().borders(Borders::ALL).title("chameleon-panel"))
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    let body = chunks[1];
    // Output pane: body minus the run block and the pane's own borders.
    let output_height = body.height.saturating_sub(7) as usize;
    match state.tab {
        Tab::Launch => draw_launch(body, f, state, panel),
        Tab::Output => draw_output(body, f, state),
        Tab::Results => draw_results(body, f, state),
        Tab::Help => draw_help(body, f),
    }

    draw_status(chunks[2], f, state);
    output_height.max(1)
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let run = if state.running {
        let secs = state
            .run_started
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        Span::styled(
            format!("● running {secs}s  "),
            Style::default().fg(Color::Green),
        )
    } else {
        Span::styled("○ idle  ", Style::default().fg(Color::Gray))
    };
    let p = Paragraph::new(Line::from(vec![run, Span::raw(state.info.clone())]))
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

fn draw_launch(area: Rect, f: &mut ratatui::Frame, state: &UiState, panel: &PanelConfig) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(area);

    let mut lines = Vec::new();
    for field in state::Field::ALL {
        let focused = state.field == field;
        let marker = if focused { "› " } else { "  " };
        let label_style = if focused {
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Gray)
        };
        let value = state.field_value(field);
        let value = if focused && !field.is_key() {
            format!("◀ {value} ▶")
        } else {
            value
        };
        lines.push(Line::from(vec![
            Span::styled(format!("{marker}{:<20}", field.label()), label_style),
            Span::raw(value),
        ]));
        if field == Field::TestNumber {
            lines.push(Line::from(""));
        }
    }
    lines.push(Line::from(""));
    lines.push(Line::from(vec![
        Span::styled("enter", Style::default().fg(Color::Magenta)),
        Span::raw(if state.key_edit.is_some() {
            ": save key, "
        } else if state.field.is_key() {
            ": edit key, "
        } else {
            ": run experiment, "
        }),
        Span::styled("x", Style::default().fg(Color::Magenta)),
        Span::raw(": cancel"),
    ]));
    let form = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Run {} experiment", state.request.task.display_name())),
    );
    f.render_widget(form, cols[0]);

    let mut info = vec![
        kv_line("Python", &panel.python),
        kv_line("Working dir", &panel.workdir.display().to_string()),
        kv_line("Data root", &panel.data_root.display().to_string()),
        kv_line("Output root", &panel.output_root.display().to_string()),
        kv_line(
            "Run timeout",
            &panel
                .run_timeout
                .map(|d| humantime::format_duration(d).to_string())
                .unwrap_or_else(|| "none".into()),
        ),
        Line::from(""),
    ];
    match panel.preview_command(state.request, &state.keys) {
        Ok(command) => {
            info.push(Line::from(Span::styled(
                "Command:",
                Style::default().fg(Color::Gray),
            )));
            info.push(Line::from(command));
        }
        Err(e) => info.push(Line::from(Span::styled(
            e.to_string(),
            Style::default().fg(Color::Red),
        ))),
    }
    let side = Paragraph::new(info)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Panel"));
    f.render_widget(side, cols[1]);
}

fn kv_line(label: &str, value: &str) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        Span::raw(value.to_string()),
    ])
}

fn draw_output(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(5)])
        .split(area);

    let height = rows[0].height.saturating_sub(2) as usize;
    let (start, end) = state.output_window(height);
    let lines: Vec<Line> = state
        .output
        .lines()
        .skip(start)
        .take(end - start)
        .map(|l| match l.stream {
            OutputStream::Stdout => Line::from(l.text.clone()),
            OutputStream::Stderr => {
                Line::from(Span::styled(l.text.clone(), Style::default().fg(Color::Red)))
            }
        })
        .collect();
    let mut title = format!(
        "Output ({} lines, {})",
        state.output.len(),
        if state.follow { "following" } else { "scrolled" }
    );
    if state.output.dropped() > 0 {
        title.push_str(&format!(", {} oldest dropped", state.output.dropped()));
    }
    let out = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(out, rows[0]);

    let mut summary = Vec::new();
    if let Some(cmd) = &state.command {
        summary.push(kv_line("Command", cmd));
    }
    if let (Some(outcome), Some(s)) = (&state.last_outcome, &state.summary) {
        let color = if outcome.success { Color::Green } else { Color::Red };
        summary.push(Line::from(Span::styled(
            s.headline.clone(),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )));
    } else if let Some(msg) = &state.failure {
        summary.push(Line::from(Span::styled(
            msg.clone(),
            Style::default().fg(Color::Red),
        )));
    } else if state.running {
        summary.push(Line::from("Running…"));
    } else {
        summary.push(Line::from("No experiment has run yet."));
    }
    for m in &state.run_messages {
        summary.push(Line::from(m.clone()));
    }
    let p = Paragraph::new(summary)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Run"));
    f.render_widget(p, rows[1]);
}

fn draw_results(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    if let Some(detail) = &state.detail {
        let lines: Vec<Line> = detail
            .lines
            .iter()
            .skip(detail.scroll)
            .map(|l| {
                if !l.starts_with(' ') && l.ends_with(':') {
                    Line::from(Span::styled(l.clone(), Style::default().fg(Color::Cyan)))
                } else {
                    Line::from(l.clone())
                }
            })
            .collect();
        let p = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("{} (esc: back, y: copy path)", detail.title)),
        );
        f.render_widget(p, area);
        return;
    }

    let mut lines: Vec<Line> = Vec::new();
    let max_items = (area.height as usize).saturating_sub(4).max(1);
    let total = state.results.len();
    let current = if total > 0 { state.results_selected + 1 } else { 0 };
    lines.push(Line::from(vec![
        Span::raw(format!("Results ({current}/{total}) - ")),
        Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("enter", Style::default().fg(Color::Magenta)),
        Span::raw(": open, "),
        Span::styled("y", Style::default().fg(Color::Magenta)),
        Span::raw(": copy path, "),
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(": refresh"),
    ]));
    lines.push(Line::from(""));

    if total == 0 {
        lines.push(Line::from(Span::styled(
            "No result files yet.",
            Style::default().fg(Color::Gray),
        )));
    }
    let offset = state.results_selected.saturating_sub(max_items - 1);
    for (i, file) in state.results.iter().enumerate().skip(offset).take(max_items) {
        let selected = i == state.results_selected;
        let style = if selected {
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::styled(if selected { "› " } else { "  " }, style),
            Span::styled(format!("{:<48}", file.display_name()), style),
            Span::styled(
                format!(
                    "{:>10}  {}",
                    format!("{} B", file.size_bytes),
                    file.modified_utc.as_deref().unwrap_or("-")
                ),
                Style::default().fg(Color::Gray),
            ),
        ]));
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Results"));
    f.render_widget(p, area);
}
