use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::checklist::load_checklist;
use crate::executor::execute_all;
use crate::logger::{log_token, Logger};
use crate::runner::{MaxIterations, RunObserver, Runner};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunMode {
    SingleTask,
    Checklist,
}

impl RunMode {
    pub(crate) fn toggle(self) -> Self {
        match self {
            Self::SingleTask => Self::Checklist,
            Self::Checklist => Self::SingleTask,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::SingleTask => "task",
            Self::Checklist => "prd",
        }
    }
}

/// Everything a background run needs, frozen when the run is launched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RunContext {
    pub(crate) agent_template: String,
    pub(crate) validate_command: String,
    pub(crate) max_iterations: MaxIterations,
    pub(crate) mode: RunMode,
    /// Task text in single-task mode, document path in checklist mode.
    pub(crate) input: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RunEvent {
    IterationStart { iteration: u32, max: u32 },
    AgentOutputLine { text: String },
    AgentError { message: String },
    ValidationStart,
    ValidationResult { success: bool, output: String },
    ChecklistTaskStart { current: usize, total: usize, title: String },
    /// Always the last event of a run.
    RunComplete { success: bool, error: Option<String> },
}

/// Observer that turns runner progress into [`RunEvent`]s on a channel.
///
/// Sends to a dropped receiver are ignored: the presentation side has exited.
#[derive(Debug)]
pub(crate) struct EventSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T: From<RunEvent>> EventSender<T> {
    pub(crate) fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, event: RunEvent) {
        let _ = self.tx.send(event.into());
    }
}

impl<T: From<RunEvent>> RunObserver for EventSender<T> {
    fn iteration_started(&mut self, iteration: u32, max: u32) {
        self.send(RunEvent::IterationStart { iteration, max });
    }

    fn agent_output(&mut self, line: &str) {
        self.send(RunEvent::AgentOutputLine {
            text: line.to_string(),
        });
    }

    fn agent_failed(&mut self, message: &str) {
        self.send(RunEvent::AgentError {
            message: message.to_string(),
        });
    }

    fn validation_started(&mut self) {
        self.send(RunEvent::ValidationStart);
    }

    fn validation_finished(&mut self, success: bool, output: &str) {
        self.send(RunEvent::ValidationResult {
            success,
            output: output.to_string(),
        });
    }

    fn checklist_task_started(&mut self, current: usize, total: usize, title: &str) {
        self.send(RunEvent::ChecklistTaskStart {
            current,
            total,
            title: title.to_string(),
        });
    }
}

pub(crate) fn execute_run(
    ctx: &RunContext,
    logger: Arc<Logger>,
    observer: &mut dyn RunObserver,
) -> Result<(), String> {
    logger.log_transition(&format!(
        "session start mode={} input={} max={}",
        ctx.mode.as_str(),
        log_token(&ctx.input),
        ctx.max_iterations
    ));
    let runner = Runner::new(
        ctx.agent_template.clone(),
        ctx.validate_command.clone(),
        ctx.max_iterations,
        logger,
    );
    match ctx.mode {
        RunMode::SingleTask => runner.run(&ctx.input, observer).into_result(),
        RunMode::Checklist => {
            let path = PathBuf::from(&ctx.input);
            let checklist = load_checklist(&path)?;
            execute_all(&checklist, Some(&path), &runner, observer)
        }
    }
}

/// Starts `ctx` on its own thread. The thread emits exactly one
/// `RunComplete`, even if the run panics.
pub(crate) fn spawn_run<T>(
    ctx: RunContext,
    logger: Arc<Logger>,
    tx: mpsc::Sender<T>,
) -> JoinHandle<()>
where
    T: From<RunEvent> + Send + 'static,
{
    thread::spawn(move || {
        let mut sender = EventSender::new(tx);
        let session_logger = Arc::clone(&logger);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            execute_run(&ctx, session_logger, &mut sender)
        }))
        .unwrap_or_else(|payload| {
            let detail = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            Err(format!("run crashed unexpectedly: {}", detail))
        });

        let event = match result {
            Ok(()) => {
                logger.log_transition("session complete success=true");
                RunEvent::RunComplete {
                    success: true,
                    error: None,
                }
            }
            Err(message) => {
                logger.log_transition(&format!(
                    "session complete success=false err={}",
                    message
                ));
                RunEvent::RunComplete {
                    success: false,
                    error: Some(message),
                }
            }
        };
        sender.send(event);
    })
}
