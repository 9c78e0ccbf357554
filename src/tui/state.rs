//! Presentation state machine: `Input -> Running -> Done -> Input`.
//!
//! Pure data plus transitions, so every key and event path is testable
//! without a terminal.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

use crate::runner::MaxIterations;
use crate::session::{RunContext, RunEvent, RunMode};

/// Agent lines kept for the live view while a run is in progress.
pub(crate) const LIVE_OUTPUT_LIMIT: usize = 100;
/// Characters of validation output shown in the live view.
pub(crate) const VALIDATION_TAIL_CHARS: usize = 500;
/// Rows reserved below the scrollable transcript on the done screen.
pub(crate) const DONE_FOOTER_HEIGHT: u16 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Screen {
    Input,
    Running,
    Done,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    Start(RunContext),
    Quit,
}

/// Fixed inputs for every run launched from this session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SessionSettings {
    pub(crate) agent_template: String,
    pub(crate) validate_command: String,
    pub(crate) max_iterations: MaxIterations,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChecklistProgress {
    pub(crate) current: usize,
    pub(crate) total: usize,
    pub(crate) title: String,
}

#[derive(Debug)]
pub(crate) struct UiState {
    settings: SessionSettings,
    pub(crate) screen: Screen,
    pub(crate) mode: RunMode,
    pub(crate) input: String,
    pub(crate) width: u16,
    pub(crate) height: u16,

    pub(crate) run: Option<RunContext>,
    pub(crate) iteration: u32,
    pub(crate) max_iterations: u32,
    pub(crate) status: String,
    pub(crate) live_output: VecDeque<String>,
    pub(crate) agent_error: Option<String>,
    pub(crate) validation_output: Option<String>,
    pub(crate) checklist: Option<ChecklistProgress>,
    pub(crate) transcript: Vec<String>,

    pub(crate) run_success: bool,
    pub(crate) run_error: Option<String>,
    pub(crate) scroll: usize,
}

impl UiState {
    pub(crate) fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            screen: Screen::Input,
            mode: RunMode::SingleTask,
            input: String::new(),
            width: 0,
            height: 0,
            run: None,
            iteration: 0,
            max_iterations: 0,
            status: String::new(),
            live_output: VecDeque::new(),
            agent_error: None,
            validation_output: None,
            checklist: None,
            transcript: Vec::new(),
            run_success: false,
            run_error: None,
            scroll: 0,
        }
    }

    pub(crate) fn resize(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
        self.scroll = self.scroll.min(self.max_scroll());
    }

    /// Transcript rows visible above the done-screen footer.
    pub(crate) fn visible_height(&self) -> usize {
        usize::from(self.height.saturating_sub(DONE_FOOTER_HEIGHT)).max(1)
    }

    pub(crate) fn max_scroll(&self) -> usize {
        self.transcript.len().saturating_sub(self.visible_height())
    }

    /// Last [`VALIDATION_TAIL_CHARS`] characters of the latest validation output.
    pub(crate) fn validation_tail(&self) -> Option<&str> {
        let output = self.validation_output.as_deref()?;
        let count = output.chars().count();
        if count <= VALIDATION_TAIL_CHARS {
            return Some(output);
        }
        let start = output
            .char_indices()
            .nth(count - VALIDATION_TAIL_CHARS)
            .map(|(index, _)| index)
            .unwrap_or(0);
        Some(&output[start..])
    }

    pub(crate) fn handle_key(&mut self, key: KeyEvent) -> Action {
        match self.screen {
            Screen::Input => self.handle_input_key(key),
            Screen::Running => {
                if is_ctrl_c(&key) || key.code == KeyCode::Char('q') {
                    return Action::Quit;
                }
                Action::None
            }
            Screen::Done => self.handle_done_key(key),
        }
    }

    fn handle_input_key(&mut self, key: KeyEvent) -> Action {
        if is_ctrl_c(&key) {
            return Action::Quit;
        }
        match key.code {
            KeyCode::Esc => Action::Quit,
            KeyCode::Tab | KeyCode::Left | KeyCode::Right => {
                self.mode = self.mode.toggle();
                Action::None
            }
            KeyCode::Enter => self.start_run(),
            KeyCode::Backspace => {
                self.input.pop();
                Action::None
            }
            KeyCode::Char(c) => {
                let modified = key
                    .modifiers
                    .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT);
                if !modified && (c == ' ' || !c.is_control()) {
                    self.input.push(c);
                }
                Action::None
            }
            _ => Action::None,
        }
    }

    fn handle_done_key(&mut self, key: KeyEvent) -> Action {
        if is_ctrl_c(&key) {
            return Action::Quit;
        }
        let page = self.visible_height();
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Action::Quit,
            KeyCode::Char('r') | KeyCode::Enter => self.restart(),
            KeyCode::Up | KeyCode::Char('k') => self.scroll_up(1),
            KeyCode::Down | KeyCode::Char('j') => self.scroll_down(1),
            KeyCode::PageUp => self.scroll_up(page),
            KeyCode::PageDown => self.scroll_down(page),
            KeyCode::Home => self.scroll = 0,
            KeyCode::End => self.scroll = self.max_scroll(),
            _ => {}
        }
        Action::None
    }

    fn scroll_up(&mut self, rows: usize) {
        self.scroll = self.scroll.saturating_sub(rows);
    }

    fn scroll_down(&mut self, rows: usize) {
        self.scroll = self.scroll.saturating_add(rows).min(self.max_scroll());
    }

    fn start_run(&mut self) -> Action {
        let input = self.input.trim();
        if input.is_empty() {
            return Action::None;
        }
        let ctx = RunContext {
            agent_template: self.settings.agent_template.clone(),
            validate_command: self.settings.validate_command.clone(),
            max_iterations: self.settings.max_iterations,
            mode: self.mode,
            input: input.to_string(),
        };
        self.clear_run_state();
        self.screen = Screen::Running;
        self.max_iterations = ctx.max_iterations.get();
        self.status = "starting...".to_string();
        self.run = Some(ctx.clone());
        Action::Start(ctx)
    }

    fn restart(&mut self) {
        self.clear_run_state();
        self.screen = Screen::Input;
    }

    fn clear_run_state(&mut self) {
        self.run = None;
        self.iteration = 0;
        self.max_iterations = 0;
        self.status.clear();
        self.live_output.clear();
        self.agent_error = None;
        self.validation_output = None;
        self.checklist = None;
        self.transcript.clear();
        self.run_success = false;
        self.run_error = None;
        self.scroll = 0;
    }

    pub(crate) fn apply_event(&mut self, event: RunEvent) {
        if self.screen != Screen::Running {
            return;
        }
        match event {
            RunEvent::ChecklistTaskStart {
                current,
                total,
                title,
            } => {
                self.transcript
                    .push(format!("📌 Task {}/{}: {}", current, total, title));
                self.checklist = Some(ChecklistProgress {
                    current,
                    total,
                    title,
                });
            }
            RunEvent::IterationStart { iteration, max } => {
                self.iteration = iteration;
                self.max_iterations = max;
                self.status = "running agent".to_string();
                self.live_output.clear();
                self.agent_error = None;
                self.transcript
                    .push(format!("🔁 Iteration {}/{}", iteration, max));
            }
            RunEvent::AgentOutputLine { text } => {
                let line = display_line(&text);
                self.transcript.push(line.clone());
                self.live_output.push_back(line);
                while self.live_output.len() > LIVE_OUTPUT_LIMIT {
                    self.live_output.pop_front();
                }
            }
            RunEvent::AgentError { message } => {
                self.transcript.push(format!("⚠️  Agent error: {}", message));
                self.agent_error = Some(message);
            }
            RunEvent::ValidationStart => {
                self.status = "validating".to_string();
                self.transcript.push("🧪 Validating...".to_string());
            }
            RunEvent::ValidationResult { success, output } => {
                if success {
                    self.status = "success".to_string();
                    self.transcript.push("✅ Validation passed".to_string());
                } else {
                    self.status = "validation failed".to_string();
                    self.transcript.push("❌ Validation failed:".to_string());
                    self.transcript.extend(output.lines().map(display_line));
                }
                self.validation_output = Some(output);
            }
            RunEvent::RunComplete { success, error } => {
                self.run_success = success;
                self.run_error = error;
                self.screen = Screen::Done;
                self.scroll = 0;
            }
        }
    }
}

fn is_ctrl_c(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
}

fn ansi_escape_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi escape regex is valid")
    })
}

/// Strips terminal escape sequences and control characters from a raw output
/// line so it cannot corrupt the screen.
pub(crate) fn display_line(raw: &str) -> String {
    let stripped = ansi_escape_regex().replace_all(raw, "");
    let mut line = String::with_capacity(stripped.len());
    for c in stripped.chars() {
        match c {
            '\t' => line.push_str("    "),
            c if c.is_control() => {}
            c => line.push(c),
        }
    }
    line
}
