use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};
use serde_json::{Map, Value};

use replay_core::interpreter::RunOutcome;
use replay_core::platform::hotkey;
use replay_core::step::{ActionKind, Step};
use replay_core::types::RunState;

use crate::App;

pub fn draw(f: &mut Frame, app: &App) {
    let chunks = if app.log_visible {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(f.area())
    } else {
        Layout::default().constraints([Constraint::Percentage(100)]).split(f.area())
    };

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0), Constraint::Length(5)])
        .split(chunks[0]);

    let shared = app.shared();

    let hk = hotkey::hotkey_label();
    let (banner_label, banner_bg) = match shared.state {
        RunState::Running => (format!("RUNNING (S or {} to stop)", hk), Color::Green),
        RunState::Stopping => ("STOPPING...".to_string(), Color::Yellow),
        RunState::Idle => (format!("IDLE (S or {} to start)", hk), Color::Red),
    };
    let width = left[0].width as usize;
    let pad_total = width.saturating_sub(banner_label.len());
    let pad_left = pad_total / 2;
    let banner = format!("{}{}{}", " ".repeat(pad_left), banner_label, " ".repeat(pad_total - pad_left));
    f.render_widget(
        Paragraph::new(Line::from(Span::styled(
            banner,
            Style::default().fg(Color::Black).bg(banner_bg).add_modifier(Modifier::BOLD),
        ))),
        left[0],
    );

    // -- Step list --
    let title = match &shared.path {
        Some(p) => format!(" {} ", p.display()),
        None => " no macro loaded ".to_string(),
    };
    let mut lines: Vec<Line> = Vec::new();
    for (i, (step, depth)) in shared.steps.iter().zip(depths(&shared.steps)).enumerate() {
        let marker = if i == app.selected { "> " } else { "  " };
        let known = step.kind().is_some();
        let color = if !known {
            Color::Red
        } else if step.kind().is_some_and(|k| k.opens_block() || is_block_tag(k)) {
            Color::Magenta
        } else {
            Color::White
        };
        let mut spans = vec![
            Span::raw(marker),
            Span::styled(format!("{:>3} ", i + 1), Style::default().fg(Color::DarkGray)),
            Span::raw("  ".repeat(depth)),
            Span::styled(step.action.clone(), Style::default().fg(color).add_modifier(Modifier::BOLD)),
        ];
        let params = summarize(&step.params);
        if !params.is_empty() {
            spans.push(Span::styled(format!("  {}", params), Style::default().fg(Color::DarkGray)));
        }
        lines.push(Line::from(spans));
    }
    // Keep the selection in view.
    let visible = left[1].height.saturating_sub(1) as usize;
    let scroll = app.selected.saturating_sub(visible.saturating_sub(1));
    let list = Paragraph::new(lines)
        .scroll((scroll as u16, 0))
        .block(
            Block::default()
                .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
                .border_style(Style::default().fg(Color::Cyan))
                .title(title),
        );
    f.render_widget(list, left[1]);

    // -- Status --
    let mut status = vec![Line::from(vec![
        Span::styled(" status ", Style::default().fg(Color::DarkGray)),
        Span::styled(shared.status.clone(), Style::default().fg(Color::Cyan)),
    ])];
    status.push(match &shared.outcome {
        Some(o) => outcome_line(o),
        None => Line::from(""),
    });
    if let Some(stats) = &shared.stats {
        status.push(Line::from(Span::styled(format!(" {}", stats), Style::default().fg(Color::DarkGray))));
    }
    status.push(Line::from(vec![
        Span::styled(" j", Style::default().fg(Color::Yellow)),
        Span::raw("/"),
        Span::styled("k", Style::default().fg(Color::Yellow)),
        Span::raw(" select  "),
        Span::styled("s", Style::default().fg(Color::Yellow)),
        Span::raw(" run/stop  "),
        Span::styled("r", Style::default().fg(Color::Yellow)),
        Span::raw(" reload  "),
        Span::styled("l", Style::default().fg(Color::Yellow)),
        Span::raw(" logs  "),
        Span::styled("q", Style::default().fg(Color::Yellow)),
        Span::raw(" quit"),
    ]));
    f.render_widget(Paragraph::new(status), left[2]);
    drop(shared);

    // -- Right panel: logs --
    if app.log_visible && chunks.len() > 1 {
        let visible_height = chunks[1].height.saturating_sub(2) as usize;
        let total = app.log_messages.len();
        let max_scroll = total.saturating_sub(visible_height);
        let scroll = app.log_scroll.min(max_scroll);
        let start = total.saturating_sub(visible_height + scroll);
        let end = total.saturating_sub(scroll);
        let log_lines: Vec<Line> = app.log_messages[start..end].iter().map(|m| parse_log_line(m)).collect();

        let log_panel = Paragraph::new(log_lines)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" Logs ")
                    .border_style(Style::default().fg(Color::Yellow)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(log_panel, chunks[1]);
    }

    if let Some(dialog) = &app.confirm {
        dialog.render(f);
    }
}

fn is_block_tag(kind: ActionKind) -> bool {
    matches!(kind, ActionKind::Else | ActionKind::EndIf | ActionKind::EndLoop)
}

/// Display indent of each step. ELSE sits at its IF's level.
fn depths(steps: &[Step]) -> Vec<usize> {
    let mut depth = 0usize;
    steps
        .iter()
        .map(|s| match s.kind() {
            Some(k) if k.opens_block() => {
                depth += 1;
                depth - 1
            }
            Some(ActionKind::EndIf | ActionKind::EndLoop) => {
                depth = depth.saturating_sub(1);
                depth
            }
            Some(ActionKind::Else) => depth.saturating_sub(1),
            _ => depth,
        })
        .collect()
}

/// `key=value` pairs for the list view. The persisted search hint is noise
/// here and is left out.
fn summarize(params: &Map<String, Value>) -> String {
    params
        .iter()
        .filter(|(k, _)| k.as_str() != "cache_box")
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn outcome_line(outcome: &RunOutcome) -> Line<'static> {
    match outcome {
        RunOutcome::Completed => Line::from(Span::styled(" completed", Style::default().fg(Color::Green))),
        RunOutcome::Stopped => Line::from(Span::styled(" stopped", Style::default().fg(Color::Yellow))),
        RunOutcome::Failed { step, action, error } => Line::from(Span::styled(
            format!(" failed at step {} ({}): {}", step + 1, action, error),
            Style::default().fg(Color::Red),
        )),
    }
}

/// Parse a structured log line (level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage)
/// into a colored Line for TUI rendering.
fn parse_log_line(raw: &str) -> Line<'_> {
    let parts: Vec<&str> = raw.splitn(5, '\x1f').collect();
    if parts.len() < 5 {
        return Line::from(raw);
    }

    let level = parts[0];
    let prefix = parts[1];
    let color_idx: u8 = parts[2].parse().unwrap_or(0);
    let timestamp = parts[3];
    let message = parts[4];

    let line_color = match color_idx {
        1 => Color::DarkGray,  // COLOR_GRAY
        2 => Color::LightBlue, // COLOR_BLUE
        3 => Color::Yellow,    // COLOR_YELLOW
        _ => Color::White,
    };

    let mut spans = vec![Span::styled(timestamp, Style::default().fg(Color::DarkGray)), Span::raw(" ")];

    match level {
        "ERROR" => spans.push(Span::styled("error ", Style::default().fg(Color::Red))),
        "WARN" => spans.push(Span::styled("warn ", Style::default().fg(Color::Yellow))),
        _ => {}
    }

    if !prefix.is_empty() {
        spans.push(Span::styled(prefix, Style::default().fg(line_color).add_modifier(Modifier::BOLD)));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(message, Style::default().fg(line_color)));

    Line::from(spans)
}
