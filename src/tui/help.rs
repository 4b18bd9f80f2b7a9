use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, pad: usize, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(what),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (cancels a running experiment)"),
        ]),
        key_line("x", 11, "Cancel the running experiment"),
        key_line("tab", 9, "Switch tabs (shift-tab goes back)"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Launch tab:"),
        key_line("↑/↓", 9, "Select field"),
        key_line("←/→", 9, "Change value"),
        key_line("0-9", 9, "Type the number of test examples"),
        key_line("enter", 7, "Edit the selected API key, otherwise run the experiment"),
        key_line("esc", 9, "Stop editing a key without saving"),
        Line::from(""),
        Line::from("Output tab:"),
        key_line("↑/↓", 9, "Scroll"),
        key_line("PgUp/PgDn", 3, "Scroll a page"),
        key_line("f", 11, "Toggle follow"),
        key_line("End", 9, "Jump to the newest line and follow"),
        Line::from(""),
        Line::from("Results tab:"),
        key_line("↑/↓", 9, "Select result file (scrolls an open file)"),
        key_line("enter", 7, "Open the selected file"),
        key_line("esc", 9, "Back to the list"),
        key_line("y", 11, "Copy the selected file's path to the clipboard"),
        key_line("r", 11, "Refresh the list"),
        Line::from(""),
        Line::from("API keys are passed only to the experiment process and are never saved."),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
