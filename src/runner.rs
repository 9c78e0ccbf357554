use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::logger::{log_token, Logger};
use crate::shell::{run_shell_command_capture, run_shell_command_streaming, CommandEnv};
use crate::template;

pub(crate) const DEFAULT_MAX_ITERATIONS: u32 = 15;
/// Hard ceiling applied by callers before a runner is built.
pub(crate) const MAX_ITERATIONS_LIMIT: u32 = 100;
pub(crate) const EXHAUSTED_MESSAGE: &str = "max iterations reached";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct MaxIterations(NonZeroU32);

impl MaxIterations {
    pub(crate) fn new(value: u32) -> Result<Self, String> {
        let Some(value) = NonZeroU32::new(value) else {
            return Err("max-iterations must be at least 1".to_string());
        };
        Ok(Self(value))
    }

    pub(crate) fn get(self) -> u32 {
        self.0.get()
    }
}

impl Default for MaxIterations {
    fn default() -> Self {
        Self(NonZeroU32::new(DEFAULT_MAX_ITERATIONS).unwrap_or(NonZeroU32::MIN))
    }
}

impl fmt::Display for MaxIterations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Success,
    Exhausted,
}

impl RunOutcome {
    pub(crate) fn is_success(self) -> bool {
        self == Self::Success
    }

    pub(crate) fn into_result(self) -> Result<(), String> {
        if self.is_success() {
            Ok(())
        } else {
            Err(EXHAUSTED_MESSAGE.to_string())
        }
    }
}

/// Receives progress from the runner and the checklist executor.
///
/// The runner never prints; headless mode plugs in [`ConsoleReporter`] and the
/// interactive session plugs in an event sender.
pub(crate) trait RunObserver {
    fn iteration_started(&mut self, iteration: u32, max: u32);
    fn agent_output(&mut self, line: &str);
    fn agent_failed(&mut self, message: &str);
    fn validation_started(&mut self);
    fn validation_finished(&mut self, success: bool, output: &str);

    fn checklist_all_completed(&mut self) {}
    fn checklist_summary(&mut self, _total: usize, _completed: usize, _remaining: usize) {}
    fn checklist_task_started(&mut self, _current: usize, _total: usize, _title: &str) {}
    fn checklist_persist_failed(&mut self, _title: &str, _message: &str) {}
    fn checklist_finished(&mut self) {}
}

/// The retry loop: agent, then validation, until validation passes or the
/// iteration budget runs out.
#[derive(Debug, Clone)]
pub(crate) struct Runner {
    agent_template: String,
    validate_command: String,
    max_iterations: MaxIterations,
    logger: Arc<Logger>,
}

impl Runner {
    pub(crate) fn new(
        agent_template: impl Into<String>,
        validate_command: impl Into<String>,
        max_iterations: MaxIterations,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            agent_template: agent_template.into(),
            validate_command: validate_command.into(),
            max_iterations,
            logger,
        }
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    pub(crate) fn run(&self, task: &str, observer: &mut dyn RunObserver) -> RunOutcome {
        let max = self.max_iterations.get();
        let env = CommandEnv::unattended();
        let task_token = log_token(task);

        for iteration in 1..=max {
            self.logger.log_transition(&format!(
                "iteration start task={} iteration={} max={}",
                task_token, iteration, max
            ));
            observer.iteration_started(iteration, max);

            // Agent failures are soft: the workspace may still validate.
            if let Err(message) = self.run_agent(task, &env, observer) {
                self.logger.log_transition(&format!(
                    "agent_failed task={} iteration={} err={}",
                    task_token, iteration, message
                ));
                observer.agent_failed(&message);
            }

            observer.validation_started();
            let (success, output) = self.validate(&env);
            observer.validation_finished(success, &output);
            if success {
                self.logger.log_transition(&format!(
                    "outcome=success task={} iteration={}",
                    task_token, iteration
                ));
                return RunOutcome::Success;
            }
            self.logger.log_transition(&format!(
                "validation_failed task={} iteration={}",
                task_token, iteration
            ));
        }

        self.logger.log_transition(&format!(
            "outcome=exhausted task={} iterations={}",
            task_token, max
        ));
        RunOutcome::Exhausted
    }

    fn run_agent(
        &self,
        task: &str,
        env: &CommandEnv,
        observer: &mut dyn RunObserver,
    ) -> Result<(), String> {
        let command = template::render(&self.agent_template, task);
        let exit = run_shell_command_streaming(
            &command,
            "agent",
            env,
            &self.logger,
            &mut |line: &str| observer.agent_output(line),
        )?;
        if exit != 0 {
            return Err(format!("agent exited with code {}", exit));
        }
        Ok(())
    }

    fn validate(&self, env: &CommandEnv) -> (bool, String) {
        match run_shell_command_capture(&self.validate_command, "validate", env, &self.logger) {
            Ok(result) => (result.success(), result.output),
            Err(message) => (false, message),
        }
    }
}

/// Prints progress for headless `run` and `prd`.
#[derive(Debug, Default)]
pub(crate) struct ConsoleReporter {
    iteration: u32,
    max: u32,
}

impl ConsoleReporter {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl RunObserver for ConsoleReporter {
    fn iteration_started(&mut self, iteration: u32, max: u32) {
        self.iteration = iteration;
        self.max = max;
        println!("🔁 Iteration {}/{}", iteration, max);
    }

    fn agent_output(&mut self, line: &str) {
        println!("{}", line);
    }

    fn agent_failed(&mut self, message: &str) {
        println!("⚠️  Agent error: {}", message);
    }

    fn validation_started(&mut self) {}

    fn validation_finished(&mut self, success: bool, output: &str) {
        if success {
            println!("\n✅ Task completed successfully!");
            return;
        }
        println!("\n📋 Validation output:\n{}", output);
        if self.iteration < self.max {
            println!("❌ Validation failed, retrying...\n");
        } else {
            println!("❌ Validation failed\n");
        }
    }

    fn checklist_all_completed(&mut self) {
        println!("✅ All tasks are already completed!");
    }

    fn checklist_summary(&mut self, total: usize, completed: usize, remaining: usize) {
        println!("📋 PRD Summary:");
        println!("   Total tasks: {}", total);
        println!("   Completed: {}", completed);
        println!("   Remaining: {}\n", remaining);
    }

    fn checklist_task_started(&mut self, current: usize, total: usize, title: &str) {
        println!("📌 Task {}/{}: {}\n", current, total, title);
    }

    fn checklist_persist_failed(&mut self, title: &str, message: &str) {
        eprintln!("⚠️  Could not mark '{}' complete: {}", title, message);
    }

    fn checklist_finished(&mut self) {
        println!("✅ All PRD tasks completed successfully!");
    }
}
