use ratatui::{
    layout::{Constraint, Layout, Rect},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use super::state::{Screen, UiState, DONE_FOOTER_HEIGHT};
use super::theme::StyleRegistry;
use crate::session::RunMode;

const INPUT_HELP: &str = "Tab switch mode • Enter start • Esc quit";
const RUNNING_HELP: &str = "q quit";
const DONE_HELP: &str = "↑/↓ j/k scroll • r run again • q quit";

pub(crate) fn draw(frame: &mut Frame, state: &UiState, styles: &StyleRegistry) {
    let area = frame.area();
    match state.screen {
        Screen::Input => draw_input(frame, area, state, styles),
        Screen::Running => draw_running(frame, area, state, styles),
        Screen::Done => draw_done(frame, area, state, styles),
    }
}

fn mode_line<'a>(mode: RunMode, styles: &StyleRegistry) -> Line<'a> {
    let (task, prd) = match mode {
        RunMode::SingleTask => (styles.title, styles.help),
        RunMode::Checklist => (styles.help, styles.title),
    };
    Line::from(vec![
        Span::styled("Mode: ", styles.label),
        Span::styled("task", task),
        Span::styled(" / ", styles.help),
        Span::styled("prd", prd),
    ])
}

fn draw_input(frame: &mut Frame, area: Rect, state: &UiState, styles: &StyleRegistry) {
    let [_, body, _] = Layout::vertical([
        Constraint::Fill(1),
        Constraint::Length(8),
        Constraint::Fill(1),
    ])
    .areas(area);
    let [title, mode, input, help] = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(2),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(body);

    let prompt = match state.mode {
        RunMode::SingleTask => "Task",
        RunMode::Checklist => "PRD file",
    };
    frame.render_widget(
        Paragraph::new(Line::styled("tatsu", styles.title)).centered(),
        title,
    );
    frame.render_widget(Paragraph::new(mode_line(state.mode, styles)).centered(), mode);
    frame.render_widget(
        Paragraph::new(Line::from(vec![
            Span::styled("> ", styles.label),
            Span::styled(state.input.as_str(), styles.input),
            Span::styled("█", styles.help),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(styles.border)
                .title(Span::styled(prompt, styles.label)),
        ),
        input,
    );
    frame.render_widget(
        Paragraph::new(Line::styled(INPUT_HELP, styles.help)).centered(),
        help,
    );
}

fn draw_running(frame: &mut Frame, area: Rect, state: &UiState, styles: &StyleRegistry) {
    let validation_rows = if state.validation_output.is_some() {
        8
    } else {
        0
    };
    let [header, error, output, validation, help] = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(u16::from(state.agent_error.is_some())),
        Constraint::Min(3),
        Constraint::Length(validation_rows),
        Constraint::Length(1),
    ])
    .areas(area);

    let mut header_lines = vec![Line::from(vec![
        Span::styled("tatsu ", styles.title),
        Span::styled(
            format!("Iteration {}/{}", state.iteration, state.max_iterations),
            styles.label,
        ),
        Span::styled(format!(" • {}", state.status), styles.help),
    ])];
    if let Some(progress) = &state.checklist {
        header_lines.push(Line::styled(
            format!(
                "📌 Task {}/{}: {}",
                progress.current, progress.total, progress.title
            ),
            styles.text,
        ));
    } else if let Some(run) = &state.run {
        header_lines.push(Line::styled(run.input.clone(), styles.text));
    }
    frame.render_widget(Paragraph::new(header_lines), header);

    if let Some(message) = &state.agent_error {
        frame.render_widget(
            Paragraph::new(Line::styled(
                format!("⚠️  Agent error: {}", message),
                styles.error,
            )),
            error,
        );
    }

    let inner_rows = usize::from(output.height.saturating_sub(2));
    let skip = state.live_output.len().saturating_sub(inner_rows);
    let lines: Vec<Line> = state
        .live_output
        .iter()
        .skip(skip)
        .map(|line| Line::styled(line.as_str(), styles.text))
        .collect();
    frame.render_widget(
        Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(styles.border)
                .title(Span::styled("Agent output", styles.label)),
        ),
        output,
    );

    if let Some(tail) = state.validation_tail() {
        frame.render_widget(
            Paragraph::new(tail)
                .style(styles.text)
                .wrap(Wrap { trim: false })
                .block(
                    Block::default()
                        .borders(Borders::ALL)
                        .border_style(styles.border)
                        .title(Span::styled("Validation", styles.label)),
                ),
            validation,
        );
    }

    frame.render_widget(Paragraph::new(Line::styled(RUNNING_HELP, styles.help)), help);
}

fn draw_done(frame: &mut Frame, area: Rect, state: &UiState, styles: &StyleRegistry) {
    let [transcript, footer] =
        Layout::vertical([Constraint::Min(1), Constraint::Length(DONE_FOOTER_HEIGHT)])
            .areas(area);

    let lines: Vec<Line> = state
        .transcript
        .iter()
        .map(|line| Line::styled(line.as_str(), styles.text))
        .collect();
    let offset = u16::try_from(state.scroll).unwrap_or(u16::MAX);
    frame.render_widget(Paragraph::new(lines).scroll((offset, 0)), transcript);

    let status = if state.run_success {
        Line::styled("✅ Done", styles.success)
    } else {
        let detail = state.run_error.as_deref().unwrap_or("run failed");
        Line::styled(format!("❌ {}", detail), styles.error)
    };
    let position = Line::styled(
        format!(
            "{} lines • {}/{}",
            state.transcript.len(),
            state.scroll,
            state.max_scroll()
        ),
        styles.help,
    );
    frame.render_widget(
        Paragraph::new(vec![status, position, Line::styled(DONE_HELP, styles.help)]).block(
            Block::default()
                .borders(Borders::TOP)
                .border_style(styles.border),
        ),
        footer,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MaxIterations;
    use crate::session::RunEvent;
    use crate::tui::state::SessionSettings;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use ratatui::{backend::TestBackend, Terminal};

    fn render(state: &UiState) -> String {
        let mut terminal = Terminal::new(TestBackend::new(60, 20)).expect("terminal");
        let styles = StyleRegistry::new();
        terminal
            .draw(|frame| draw(frame, state, &styles))
            .expect("draw");
        let buffer = terminal.backend().buffer().clone();
        let mut text = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                text.push_str(buffer[(x, y)].symbol());
            }
            text.push('\n');
        }
        text
    }

    fn state() -> UiState {
        let mut state = UiState::new(SessionSettings {
            agent_template: "agent \"%s\"".to_string(),
            validate_command: "true".to_string(),
            max_iterations: MaxIterations::new(4).expect("max"),
        });
        state.resize(60, 20);
        state
    }

    fn press(state: &mut UiState, code: KeyCode) {
        state.handle_key(KeyEvent::new(code, KeyModifiers::NONE));
    }

    #[test]
    fn input_screen_shows_prompt_and_text() {
        let mut state = state();
        for c in "fix bug".chars() {
            press(&mut state, KeyCode::Char(c));
        }
        let screen = render(&state);
        assert!(screen.contains("tatsu"));
        assert!(screen.contains("> fix bug"));
        assert!(screen.contains("Task"));
    }

    #[test]
    fn running_screen_shows_iteration_and_latest_output() {
        let mut state = state();
        press(&mut state, KeyCode::Char('x'));
        press(&mut state, KeyCode::Enter);
        state.apply_event(RunEvent::IterationStart {
            iteration: 2,
            max: 4,
        });
        for index in 0..40 {
            state.apply_event(RunEvent::AgentOutputLine {
                text: format!("output {index}"),
            });
        }
        let screen = render(&state);
        assert!(screen.contains("Iteration 2/4"));
        assert!(screen.contains("output 39"));
        assert!(!screen.contains("output 0 "));
    }

    #[test]
    fn done_screen_shows_result_and_help() {
        let mut state = state();
        press(&mut state, KeyCode::Char('x'));
        press(&mut state, KeyCode::Enter);
        state.apply_event(RunEvent::RunComplete {
            success: false,
            error: Some("max iterations reached".to_string()),
        });
        let screen = render(&state);
        assert!(screen.contains("max iterations reached"));
        assert!(screen.contains("r run again"));
    }
}
