//! Interactive session: one background run at a time, one thread drawing.
//!
//! Terminal input and run progress share a single channel so the loop only
//! wakes when something happened.

mod render;
mod state;
mod theme;

use crossterm::{
    event::{self, Event, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::io::{self, IsTerminal, Stdout};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::logger::Logger;
use crate::session::{spawn_run, RunEvent};

pub(crate) use state::SessionSettings;
use state::{Action, UiState};
use theme::StyleRegistry;

#[derive(Debug)]
enum AppEvent {
    Terminal(Event),
    Run(RunEvent),
    InputError(String),
}

impl From<RunEvent> for AppEvent {
    fn from(event: RunEvent) -> Self {
        Self::Run(event)
    }
}

/// Raw mode and the alternate screen, undone on drop.
struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalGuard {
    fn enter() -> Result<Self, String> {
        enable_raw_mode().map_err(|err| format!("Failed to enable raw mode: {}", err))?;
        let mut stdout = io::stdout();
        if let Err(err) = execute!(stdout, EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(format!("Failed to enter alternate screen: {}", err));
        }
        let terminal = match Terminal::new(CrosstermBackend::new(stdout)) {
            Ok(terminal) => terminal,
            Err(err) => {
                let _ = disable_raw_mode();
                let _ = execute!(io::stdout(), LeaveAlternateScreen);
                return Err(format!("Failed to initialize terminal: {}", err));
            }
        };
        Ok(Self { terminal })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

fn spawn_input_reader(tx: mpsc::Sender<AppEvent>) {
    thread::spawn(move || loop {
        let message = match event::read() {
            Ok(event) => AppEvent::Terminal(event),
            Err(err) => {
                let _ = tx.send(AppEvent::InputError(err.to_string()));
                return;
            }
        };
        if tx.send(message).is_err() {
            return;
        }
    });
}

pub(crate) fn run_tui(settings: SessionSettings, logger: Arc<Logger>) -> Result<(), String> {
    if !io::stdin().is_terminal() || !io::stdout().is_terminal() {
        return Err(
            "Interactive mode requires an interactive terminal; use `tatsu run` or `tatsu prd`."
                .to_string(),
        );
    }

    let mut guard = TerminalGuard::enter()?;
    logger.hold_warnings();
    let result = run_session(&mut guard, settings, &logger);
    drop(guard);
    logger.release_warnings();
    result
}

fn run_session(
    guard: &mut TerminalGuard,
    settings: SessionSettings,
    logger: &Arc<Logger>,
) -> Result<(), String> {
    let size = guard
        .terminal
        .size()
        .map_err(|err| format!("Failed to read terminal size: {}", err))?;
    let mut state = UiState::new(settings);
    state.resize(size.width, size.height);
    let styles = StyleRegistry::new();

    let (tx, rx) = mpsc::channel::<AppEvent>();
    spawn_input_reader(tx.clone());
    logger.log_transition("tui start");

    loop {
        guard
            .terminal
            .draw(|frame| render::draw(frame, &state, &styles))
            .map_err(|err| format!("Failed to draw: {}", err))?;

        let Ok(first) = rx.recv() else {
            return Err("Event channel closed unexpectedly".to_string());
        };
        // Apply everything already queued before the next redraw.
        let mut pending = Some(first);
        while let Some(message) = pending.take().or_else(|| rx.try_recv().ok()) {
            match message {
                AppEvent::Terminal(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                    match state.handle_key(key) {
                        Action::None => {}
                        Action::Start(ctx) => {
                            // Detached; a quit mid-run leaves the thread to die with the process.
                            let _ = spawn_run(ctx, Arc::clone(logger), tx.clone());
                        }
                        Action::Quit => {
                            logger.log_transition("tui quit");
                            return Ok(());
                        }
                    }
                }
                AppEvent::Terminal(Event::Resize(width, height)) => {
                    state.resize(width, height);
                }
                AppEvent::Terminal(_) => {}
                AppEvent::Run(event) => state.apply_event(event),
                AppEvent::InputError(err) => {
                    return Err(format!("Failed to read terminal input: {}", err));
                }
            }
        }
    }
}
