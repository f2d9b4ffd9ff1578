use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

/// Yes/No modal shown before a run starts.
pub struct ConfirmDialog {
    pub question: String,
    pub detail: String,
    pub yes: bool,
}

impl ConfirmDialog {
    pub fn new(question: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { question: question.into(), detail: detail.into(), yes: true }
    }

    pub fn toggle(&mut self) {
        self.yes = !self.yes;
    }

    pub fn render(&self, f: &mut Frame) {
        let width = (self.detail.chars().count() as u16 + 6).clamp(36, 70);
        let area = centered_rect(width, 8, f.area());
        f.render_widget(Clear, area);

        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(" Confirm ");
        let inner = block.inner(area);
        f.render_widget(block, area);

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Length(1), // question
                Constraint::Length(1), // detail
                Constraint::Length(1),
                Constraint::Length(1), // buttons
            ])
            .split(inner);

        let question = Paragraph::new(Line::from(Span::styled(
            self.question.as_str(),
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        )))
        .alignment(Alignment::Center);
        f.render_widget(question, rows[1]);

        let detail = Paragraph::new(Line::from(Span::styled(self.detail.as_str(), Style::default().fg(Color::Gray))))
            .alignment(Alignment::Center);
        f.render_widget(detail, rows[2]);

        let on = |bg| Style::default().fg(Color::Black).bg(bg).add_modifier(Modifier::BOLD);
        let off = Style::default().fg(Color::DarkGray);
        let buttons = Line::from(vec![
            Span::styled("  [Y]es  ", if self.yes { on(Color::Green) } else { off }),
            Span::raw("   "),
            Span::styled("  [N]o  ", if self.yes { off } else { on(Color::Red) }),
        ]);
        f.render_widget(Paragraph::new(buttons).alignment(Alignment::Center), rows[4]);
    }
}

/// A `width` x `height` rect centered in `area`.
fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let x = area.x + area.width.saturating_sub(width) / 2;
    let y = area.y + area.height.saturating_sub(height) / 2;
    Rect::new(x, y, width.min(area.width), height.min(area.height))
}
