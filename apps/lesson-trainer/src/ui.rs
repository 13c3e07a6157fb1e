//! UI rendering for lesson trainer.

use crate::app::{App, View};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
    Frame,
};
use review_engine::{DrillType, GradeOutcome, SessionItem};

pub fn draw(f: &mut Frame, app: &App) {
    match app.view {
        View::Lesson => draw_lesson(f, app),
        View::Review => draw_review(f, app),
    }

    if app.show_help {
        draw_help(f);
    }

    if let Some(msg) = &app.message {
        draw_message(f, msg);
    }
}

fn drill_hint(drill: DrillType) -> &'static str {
    match drill {
        DrillType::Dictation => "Write down the sentence",
        DrillType::Listening => "Write what you understood",
        DrillType::Speaking => "Type what you would say",
        DrillType::Translation => "Translate the sentence",
    }
}

fn draw_progress(f: &mut Frame, app: &App, area: Rect) {
    let mut spans = vec![
        Span::styled(format!("{} due", app.counts.due_now), Style::default().fg(Color::Yellow)),
        Span::raw(", "),
        Span::styled(format!("{} new", app.counts.new), Style::default().fg(Color::Blue)),
        Span::raw(format!(" ({} total)", app.counts.total)),
        Span::raw(format!(" | graded {}", app.graded)),
    ];
    if let Some(snapshot) = &app.snapshot {
        spans.push(Span::raw(format!(" | queued {}", snapshot.queue_len)));
        if snapshot.awaiting > 0 {
            spans.push(Span::styled(
                format!(" | grading {}", snapshot.awaiting),
                Style::default().fg(Color::Cyan),
            ));
        }
        if let Some(stage) = snapshot.stage {
            spans.push(Span::raw(format!(" | stage: {}", stage.name())));
        }
    }

    let progress = Paragraph::new(Line::from(spans))
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL).title(format!(" {} ", app.config.learner)));
    f.render_widget(progress, area);
}

fn draw_lesson(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),  // Progress
            Constraint::Min(0),     // Prompt
            Constraint::Length(3),  // Answer
            Constraint::Length(4),  // Last result
            Constraint::Length(3),  // Keys
        ])
        .split(f.area());

    draw_progress(f, app, chunks[0]);

    let current: Option<&SessionItem> = app.snapshot.as_ref().and_then(|s| s.current.as_ref());
    match current {
        Some(item) => {
            let mut lines = vec![Line::from(Span::styled(
                item.prompt.as_str(),
                Style::default().add_modifier(Modifier::BOLD),
            ))];
            if app.config.display.show_drill_hint {
                lines.push(Line::from(""));
                lines.push(Line::from(Span::styled(
                    drill_hint(item.drill()),
                    Style::default().fg(Color::DarkGray),
                )));
            }
            let prompt = Paragraph::new(lines)
                .alignment(Alignment::Center)
                .block(
                    Block::default()
                        .borders(Borders::ALL)
                        .title(format!(" {} ({}) ", item.drill().name(), item.language)),
                )
                .wrap(Wrap { trim: true });
            f.render_widget(prompt, chunks[1]);
        }
        None => {
            let waiting = Paragraph::new("Waiting for grades...")
                .alignment(Alignment::Center)
                .style(Style::default().fg(Color::DarkGray))
                .block(Block::default().borders(Borders::ALL));
            f.render_widget(waiting, chunks[1]);
        }
    }

    let input = Paragraph::new(app.input.as_str())
        .style(Style::default().fg(Color::Yellow))
        .block(Block::default().borders(Borders::ALL).title(" Answer "));
    f.render_widget(input, chunks[2]);
    let cursor_x = chunks[2].x + 1 + app.input.chars().count() as u16;
    f.set_cursor_position((cursor_x.min(chunks[2].right().saturating_sub(2)), chunks[2].y + 1));

    draw_last_result(f, app, chunks[3]);

    let footer = Paragraph::new("Enter:Submit  Ctrl-G:Give up  Ctrl-F:Skip  F1:Help  Esc:Quit")
        .style(Style::default().fg(Color::DarkGray))
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(footer, chunks[4]);
}

fn draw_last_result(f: &mut Frame, app: &App, area: Rect) {
    let Some(result) = &app.last_result else {
        f.render_widget(Block::default().borders(Borders::ALL), area);
        return;
    };

    let mut lines = Vec::new();
    match &result.outcome {
        GradeOutcome::Success => {
            lines.push(Line::from(Span::styled(
                format!("Correct: {}", result.prompt),
                Style::default().fg(Color::Green),
            )));
        }
        GradeOutcome::Failure { reason, .. } => {
            lines.push(Line::from(Span::styled(
                format!("Incorrect: {reason}"),
                Style::default().fg(Color::Red),
            )));
            if app.config.display.reveal_answer_on_failure {
                lines.push(Line::from(format!("Answer: {}", result.reference)));
            }
        }
        GradeOutcome::Error { message } => {
            lines.push(Line::from(Span::styled(
                format!("Could not grade \"{}\": {message}", result.prompt),
                Style::default().fg(Color::Magenta),
            )));
        }
    }

    let panel = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Last answer "))
        .wrap(Wrap { trim: true });
    f.render_widget(panel, area);
}

fn draw_review(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)])
        .split(f.area());

    draw_progress(f, app, chunks[0]);

    let failures = app.snapshot.as_ref().map(|s| s.failures.as_slice()).unwrap_or_default();
    if failures.is_empty() {
        let done = Paragraph::new("Lesson complete! No mistakes.")
            .alignment(Alignment::Center)
            .style(Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
            .block(Block::default().borders(Borders::ALL).title(" Review "));
        f.render_widget(done, chunks[1]);
    } else {
        let items: Vec<ListItem> = failures
            .iter()
            .enumerate()
            .map(|(i, view)| {
                let (prompt, reference) = view
                    .item
                    .as_ref()
                    .map(|item| (item.prompt.as_str(), item.reference_answer.as_str()))
                    .unwrap_or(("?", "?"));
                let answer = if view.failure.user_answer.is_empty() {
                    "-"
                } else {
                    view.failure.user_answer.as_str()
                };
                let spans = vec![
                    Span::styled(prompt, Style::default().add_modifier(Modifier::BOLD)),
                    Span::raw("  you: "),
                    Span::styled(answer, Style::default().fg(Color::Red)),
                    Span::raw("  expected: "),
                    Span::styled(reference, Style::default().fg(Color::Green)),
                    Span::styled(format!("  ({})", view.failure.reason), Style::default().fg(Color::DarkGray)),
                ];

                ListItem::new(Line::from(spans)).style(if i == app.selected_failure {
                    Style::default().bg(Color::DarkGray)
                } else {
                    Style::default()
                })
            })
            .collect();

        let title = format!(" Review: {} to revisit ", failures.len());
        let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));
        f.render_widget(list, chunks[1]);
    }

    let footer = Paragraph::new("j/k:Navigate  r:Check for more cards  F1:Help  q/Esc:Quit")
        .style(Style::default().fg(Color::DarkGray))
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(footer, chunks[2]);
}

fn draw_help(f: &mut Frame) {
    let area = centered_rect(60, 70, f.area());
    f.render_widget(Clear, area);

    let help = r#"
Lesson Trainer Keybindings

Lesson:
  Enter           Submit answer
  Ctrl-G          Give up on this card
  Ctrl-F          Skip card until next lesson
  Backspace       Delete character

Review:
  j/k, Up/Down    Navigate mistakes
  r               Check for more due cards
  q               Quit

General:
  F1              Show this help
  Esc             Quit

Press any key to close
"#;

    let popup = Paragraph::new(help)
        .block(Block::default().borders(Borders::ALL).title(" Help "))
        .wrap(Wrap { trim: false });
    f.render_widget(popup, area);
}

fn draw_message(f: &mut Frame, msg: &str) {
    let area = Rect::new(
        f.area().x + 2,
        f.area().height.saturating_sub(5),
        f.area().width.saturating_sub(4),
        3,
    );
    f.render_widget(Clear, area);

    let message = Paragraph::new(msg)
        .style(Style::default().fg(Color::Cyan))
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(message, area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
