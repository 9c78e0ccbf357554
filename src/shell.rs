use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::harness::agent_env;
use crate::logger::{sanitize_log_value, Logger};

#[derive(Debug, Clone, Default)]
pub(crate) struct CommandEnv {
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) vars: Vec<(String, String)>,
}

impl CommandEnv {
    /// Process environment plus the unattended-agent overrides.
    pub(crate) fn unattended() -> Self {
        Self {
            cwd: None,
            vars: agent_env(),
        }
    }

    pub(crate) fn apply(&self, cmd: &mut Command) {
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

#[derive(Debug)]
pub(crate) struct CommandResult {
    pub(crate) output: String,
    pub(crate) exit_code: i32,
}

impl CommandResult {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn shell_command(command: &str, env: &CommandEnv) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    env.apply(&mut cmd);
    cmd
}

fn log_start(logger: &Logger, log_label: &str, command: &str) {
    logger.log_transition(&format!(
        "cmd start label={} mode=bash_c command={}",
        log_label,
        sanitize_log_value(command)
    ));
}

fn log_exit(logger: &Logger, log_label: &str, exit_code: i32) {
    logger.log_transition(&format!("cmd exit label={} exit={}", log_label, exit_code));
}

/// How long a finished command's already-written output may take to arrive.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

enum StreamMessage {
    Line(String),
    ReaderClosed,
    Exited(io::Result<ExitStatus>),
}

/// Runs `command` and hands every output line to `on_line` as it arrives.
///
/// stdout and stderr are read on their own threads; lines from the two
/// streams are delivered in arrival order with no ordering guarantee between
/// them. Returns the exit code once the child is reaped and its output has
/// drained. A background process that inherited the pipes does not hold the
/// call open: after exit, queued lines get `OUTPUT_DRAIN_GRACE` to arrive and
/// the readers are then left behind. A child killed by a signal reports exit
/// code 1.
pub(crate) fn run_shell_command_streaming(
    command: &str,
    log_label: &str,
    env: &CommandEnv,
    logger: &Logger,
    on_line: &mut dyn FnMut(&str),
) -> Result<i32, String> {
    log_start(logger, log_label, command);

    let mut cmd = shell_command(command, env);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|err| format!("Failed to run command '{}': {}", command, err))?;

    let (tx, rx) = mpsc::channel::<StreamMessage>();
    let mut open_readers = 0usize;
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone());
        open_readers += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx.clone());
        open_readers += 1;
    }
    thread::spawn(move || {
        let _ = tx.send(StreamMessage::Exited(child.wait()));
    });

    let mut exited: Option<io::Result<ExitStatus>> = None;
    let mut drain_deadline: Option<Instant> = None;
    while exited.is_none() || open_readers > 0 {
        let message = match drain_deadline {
            None => rx.recv().ok(),
            Some(deadline) => rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                .ok(),
        };
        let Some(message) = message else {
            break;
        };
        match message {
            StreamMessage::Line(line) => on_line(&line),
            StreamMessage::ReaderClosed => open_readers -= 1,
            StreamMessage::Exited(result) => {
                exited = Some(result);
                drain_deadline = Some(Instant::now() + OUTPUT_DRAIN_GRACE);
            }
        }
    }

    let status = exited
        .ok_or_else(|| format!("Failed to wait for command '{}': no exit status", command))?
        .map_err(|err| format!("Failed to wait for command '{}': {}", command, err))?;
    let exit_code = status.code().unwrap_or(1);
    log_exit(logger, log_label, exit_code);
    Ok(exit_code)
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<StreamMessage>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(reader);
        for chunk in reader.split(b'\n') {
            let Ok(bytes) = chunk else {
                break;
            };
            let mut line = String::from_utf8_lossy(&bytes).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if tx.send(StreamMessage::Line(line)).is_err() {
                return;
            }
        }
        let _ = tx.send(StreamMessage::ReaderClosed);
    });
}

/// Runs `command` to completion with stdout and stderr captured into one
/// buffer in write order.
pub(crate) fn run_shell_command_capture(
    command: &str,
    log_label: &str,
    env: &CommandEnv,
    logger: &Logger,
) -> Result<CommandResult, String> {
    log_start(logger, log_label, command);

    let (mut reader, writer) =
        io::pipe().map_err(|err| format!("Failed to create output pipe: {}", err))?;
    let stderr_writer = writer
        .try_clone()
        .map_err(|err| format!("Failed to create output pipe: {}", err))?;

    let mut cmd = shell_command(command, env);
    cmd.stdout(writer);
    cmd.stderr(stderr_writer);
    let spawned = cmd.spawn();
    // The command still owns both write ends; drop it so the read sees EOF.
    drop(cmd);
    let mut child =
        spawned.map_err(|err| format!("Failed to run command '{}': {}", command, err))?;

    let mut bytes = Vec::new();
    let read_result = reader.read_to_end(&mut bytes);
    let status = child
        .wait()
        .map_err(|err| format!("Failed to wait for command '{}': {}", command, err))?;
    read_result.map_err(|err| format!("Failed to read output of '{}': {}", command, err))?;

    let exit_code = status.code().unwrap_or(1);
    log_exit(logger, log_label, exit_code);
    Ok(CommandResult {
        output: String::from_utf8_lossy(&bytes).into_owned(),
        exit_code,
    })
}
