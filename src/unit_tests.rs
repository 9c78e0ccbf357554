use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::app::{main_with_args, run_with_args};
use crate::checklist::{load_checklist, parse_checklist};
use crate::cli::{Cli, CliCommand};
use crate::executor::execute_all;
use crate::logger::{log_token, sanitize_log_value, Logger};
use crate::runner::{MaxIterations, RunObserver, RunOutcome, Runner, EXHAUSTED_MESSAGE};
use crate::session::{spawn_run, RunContext, RunEvent, RunMode};

#[cfg(unix)]
fn capture_stderr<F: FnOnce()>(f: F) -> String {
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd};
    use std::os::raw::c_int;

    extern "C" {
        fn pipe(fds: *mut c_int) -> c_int;
        fn dup(fd: c_int) -> c_int;
        fn dup2(oldfd: c_int, newfd: c_int) -> c_int;
        fn close(fd: c_int) -> c_int;
    }

    unsafe {
        let mut fds = [0 as c_int; 2];
        if pipe(fds.as_mut_ptr()) != 0 {
            panic!("pipe failed");
        }
        let read_fd = fds[0];
        let write_fd = fds[1];

        let stderr_fd = std::io::stderr().as_raw_fd();
        let saved_stderr_fd = dup(stderr_fd);
        if saved_stderr_fd < 0 {
            let _ = close(read_fd);
            let _ = close(write_fd);
            panic!("dup stderr failed");
        }

        if dup2(write_fd, stderr_fd) < 0 {
            let _ = close(saved_stderr_fd);
            let _ = close(read_fd);
            let _ = close(write_fd);
            panic!("dup2 stderr failed");
        }
        let _ = close(write_fd);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

        if dup2(saved_stderr_fd, stderr_fd) < 0 {
            let _ = close(saved_stderr_fd);
            let _ = close(read_fd);
            panic!("dup2 restore stderr failed");
        }
        let _ = close(saved_stderr_fd);

        let mut output = Vec::new();
        let mut reader = std::fs::File::from_raw_fd(read_fd);
        reader.read_to_end(&mut output).expect("read stderr");
        let output = String::from_utf8_lossy(&output).into_owned();

        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }

        output
    }
}

/// Observer that records every callback as one string.
#[derive(Debug, Default)]
struct Recorder {
    events: Vec<String>,
}

impl Recorder {
    fn count(&self, prefix: &str) -> usize {
        self.events
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }
}

impl RunObserver for Recorder {
    fn iteration_started(&mut self, iteration: u32, max: u32) {
        self.events.push(format!("iteration {}/{}", iteration, max));
    }

    fn agent_output(&mut self, line: &str) {
        self.events.push(format!("agent {}", line));
    }

    fn agent_failed(&mut self, message: &str) {
        self.events.push(format!("agent_failed {}", message));
    }

    fn validation_started(&mut self) {
        self.events.push("validation_started".to_string());
    }

    fn validation_finished(&mut self, success: bool, output: &str) {
        let event = format!("validation {} {}", success, output.trim_end());
        self.events.push(event.trim_end().to_string());
    }

    fn checklist_all_completed(&mut self) {
        self.events.push("all_completed".to_string());
    }

    fn checklist_summary(&mut self, total: usize, completed: usize, remaining: usize) {
        self.events
            .push(format!("summary {} {} {}", total, completed, remaining));
    }

    fn checklist_task_started(&mut self, current: usize, total: usize, title: &str) {
        self.events
            .push(format!("task {}/{} {}", current, total, title));
    }

    fn checklist_persist_failed(&mut self, title: &str, _message: &str) {
        self.events.push(format!("persist_failed {}", title));
    }

    fn checklist_finished(&mut self) {
        self.events.push("finished".to_string());
    }
}

fn max(value: u32) -> MaxIterations {
    MaxIterations::new(value).expect("max iterations")
}

fn runner(agent: &str, validate: &str, iterations: u32) -> Runner {
    Runner::new(agent, validate, max(iterations), Arc::new(Logger::disabled()))
}

fn quoted(path: &Path) -> String {
    format!("'{}'", path.display())
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

#[test]
fn sanitize_log_value_replaces_controls() {
    let value = "line\ncarriage\rtab\t";
    assert_eq!(sanitize_log_value(value), "line\\ncarriage\\rtab\\t");
}

#[test]
fn log_token_quotes_titles_with_spaces() {
    assert_eq!(log_token("fix-parser"), "fix-parser");
    assert_eq!(log_token("fix the parser"), "'fix the parser'");
    assert_eq!(log_token("two\nlines"), "'two\\nlines'");
}

#[test]
fn log_line_has_timestamp_and_message() {
    let temp = TempDir::new().expect("temp dir");
    let log_path = temp.path().join("tatsu.log");
    let logger = Logger::new(Some(log_path.clone()));

    logger.log_transition("iteration start task='fix parser' iteration=2 max=15");

    let log_contents = fs::read_to_string(&log_path).expect("read log file");
    let line = log_contents.lines().next().expect("log line");
    let (timestamp, message) = line.split_once(' ').expect("timestamp separator");
    assert_eq!(timestamp.len(), "2026-01-01T00:00:00Z".len());
    assert!(timestamp.ends_with('Z'), "timestamp: {timestamp}");
    assert_eq!(message, "iteration start task='fix parser' iteration=2 max=15");
}

#[cfg(unix)]
#[test]
fn log_transition_warns_once_and_disables_after_error() {
    let temp = TempDir::new().expect("temp dir");
    let log_dir = temp.path().join("missing-log-dir");
    let log_path = log_dir.join("tatsu.log");
    let logger = Logger::new(Some(log_path.clone()));

    let stderr = capture_stderr(|| {
        logger.log_transition("first");
        fs::create_dir(&log_dir).expect("create log dir");
        logger.log_transition("second");
    });

    let lines: Vec<&str> = stderr
        .lines()
        .filter(|line| line.contains("transition logging disabled"))
        .collect();
    assert_eq!(lines.len(), 1, "expected one warning line, got: {stderr:?}");
    assert!(
        lines[0].contains(&log_path.display().to_string()),
        "warning should include the log path, got: {stderr:?}"
    );
    assert!(
        !log_path.exists(),
        "logging should be disabled after first error; log file unexpectedly exists at {}",
        log_path.display()
    );
}

#[cfg(unix)]
#[test]
fn held_warning_is_printed_only_on_release() {
    let temp = TempDir::new().expect("temp dir");
    let log_path = temp.path().join("missing-log-dir").join("tatsu.log");
    let logger = Logger::new(Some(log_path.clone()));

    logger.hold_warnings();
    let while_held = capture_stderr(|| logger.log_transition("during session"));
    assert!(while_held.is_empty(), "stderr while held: {while_held:?}");

    let on_release = capture_stderr(|| logger.release_warnings());
    assert_eq!(
        on_release
            .lines()
            .filter(|line| line.contains("transition logging disabled"))
            .count(),
        1,
        "stderr on release: {on_release:?}"
    );
    assert!(on_release.contains(&log_path.display().to_string()));

    let after = capture_stderr(|| {
        logger.log_transition("after");
        logger.release_warnings();
    });
    assert!(after.is_empty(), "stderr after release: {after:?}");
}

#[test]
fn runner_stops_after_first_passing_validation() {
    let temp = TempDir::new().expect("temp dir");
    let agent_log = temp.path().join("agent.log");
    let runner = runner(
        &format!("echo \"%s\" >> {}; echo working", quoted(&agent_log)),
        "true",
        5,
    );
    let mut recorder = Recorder::default();

    let outcome = runner.run("add tests", &mut recorder);

    assert_eq!(outcome, RunOutcome::Success);
    assert_eq!(
        recorder.events,
        vec![
            "iteration 1/5".to_string(),
            "agent working".to_string(),
            "validation_started".to_string(),
            "validation true".to_string(),
        ]
    );
    assert_eq!(fs::read_to_string(&agent_log).expect("log"), "add tests\n");
}

#[test]
fn runner_exhausts_exactly_max_iterations() {
    let temp = TempDir::new().expect("temp dir");
    let validations = temp.path().join("validations.log");
    let runner = runner(
        "echo agent",
        &format!("echo run >> {}; echo 'still failing'; exit 1", quoted(&validations)),
        3,
    );
    let mut recorder = Recorder::default();

    let outcome = runner.run("task", &mut recorder);

    assert_eq!(outcome, RunOutcome::Exhausted);
    assert_eq!(outcome.into_result(), Err(EXHAUSTED_MESSAGE.to_string()));
    assert_eq!(recorder.count("iteration "), 3);
    assert!(!recorder.events.contains(&"iteration 4/3".to_string()));
    assert_eq!(recorder.count("validation false still failing"), 3);
    assert_eq!(line_count(&validations), 3);
}

#[test]
fn runner_validates_even_when_agent_fails() {
    let temp = TempDir::new().expect("temp dir");
    let marker = temp.path().join("second");
    // The first validation fails and leaves a marker; the second passes.
    let validate = format!(
        "if [ -f {m} ]; then exit 0; fi; touch {m}; exit 1",
        m = quoted(&marker)
    );
    let runner = runner("echo broken >&2; exit 4", &validate, 5);
    let mut recorder = Recorder::default();

    let outcome = runner.run("task", &mut recorder);

    assert!(outcome.is_success());
    assert_eq!(recorder.count("agent_failed agent exited with code 4"), 2);
    assert_eq!(recorder.count("agent broken"), 2);
    assert_eq!(recorder.count("validation_started"), 2);
    assert_eq!(recorder.count("iteration "), 2);
}

#[test]
fn runner_passes_escaped_task_to_agent() {
    let temp = TempDir::new().expect("temp dir");
    let agent_log = temp.path().join("agent.log");
    let runner = runner(
        &format!("echo \"%s\" >> {}", quoted(&agent_log)),
        "true",
        1,
    );
    let mut recorder = Recorder::default();

    runner.run("say \"hi\"", &mut recorder);

    assert_eq!(fs::read_to_string(&agent_log).expect("log"), "say \"hi\"\n");
}

#[test]
fn runner_sets_unattended_environment_for_commands() {
    let runner = runner(
        "echo \"ci=$CI\"",
        "test \"$CI\" = true && test -n \"$OPENCODE_CONFIG_CONTENT\"",
        1,
    );
    let mut recorder = Recorder::default();

    assert!(runner.run("task", &mut recorder).is_success());
    assert!(recorder.events.contains(&"agent ci=true".to_string()));
}

#[test]
fn runner_logs_transitions() {
    let temp = TempDir::new().expect("temp dir");
    let log_path = temp.path().join("tatsu.log");
    let runner = Runner::new(
        "true",
        "false",
        max(2),
        Arc::new(Logger::new(Some(log_path.clone()))),
    );

    runner.run("fix parser", &mut Recorder::default());

    let log = fs::read_to_string(&log_path).expect("read log");
    assert!(log.contains("iteration start task='fix parser' iteration=1 max=2"));
    assert!(log.contains("iteration start task='fix parser' iteration=2 max=2"));
    assert!(log.contains("cmd exit label=validate exit=1"));
    assert!(log.contains("outcome=exhausted task='fix parser' iterations=2"));
}

#[test]
fn max_iterations_rejects_zero() {
    assert_eq!(
        MaxIterations::new(0),
        Err("max-iterations must be at least 1".to_string())
    );
    assert_eq!(MaxIterations::default().get(), 15);
}

fn write_prd(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("PRD.md");
    fs::write(&path, content).expect("write prd");
    path
}

#[test]
fn executor_runs_tasks_in_order_and_marks_them_done() {
    let temp = TempDir::new().expect("temp dir");
    let prd = write_prd(&temp, "# Plan\n- [ ] t1\n- [ ] t2\n");
    let agent_log = temp.path().join("agent.log");
    let runner = runner(
        &format!("echo \"%s\" >> {}", quoted(&agent_log)),
        "true",
        3,
    );
    let checklist = load_checklist(&prd).expect("load");
    let mut recorder = Recorder::default();

    execute_all(&checklist, Some(&prd), &runner, &mut recorder).expect("execute");

    assert_eq!(fs::read_to_string(&agent_log).expect("log"), "t1\nt2\n");
    assert_eq!(
        fs::read_to_string(&prd).expect("prd"),
        "# Plan\n- [x] t1\n- [x] t2\n"
    );
    assert_eq!(recorder.events.first().map(String::as_str), Some("summary 2 0 2"));
    assert!(recorder.events.contains(&"task 1/2 t1".to_string()));
    assert!(recorder.events.contains(&"task 2/2 t2".to_string()));
    assert_eq!(recorder.events.last().map(String::as_str), Some("finished"));
}

#[test]
fn executor_stops_at_first_failing_task() {
    let temp = TempDir::new().expect("temp dir");
    let original = "- [x] A\n- [ ] B\n- [ ] C\n";
    let prd = write_prd(&temp, original);
    let agent_log = temp.path().join("agent.log");
    let runner = runner(
        &format!("echo \"%s\" >> {}", quoted(&agent_log)),
        &format!("test \"$(tail -n 1 {})\" != B", quoted(&agent_log)),
        2,
    );
    let checklist = load_checklist(&prd).expect("load");
    let mut recorder = Recorder::default();

    let err = execute_all(&checklist, Some(&prd), &runner, &mut recorder)
        .expect_err("B should fail");

    assert_eq!(err, "task 'B' failed: max iterations reached");
    assert_eq!(fs::read_to_string(&agent_log).expect("log"), "B\nB\n");
    assert_eq!(fs::read_to_string(&prd).expect("prd"), original);
    assert_eq!(recorder.events.first().map(String::as_str), Some("summary 3 1 2"));
    assert!(!recorder.events.iter().any(|event| event.contains(" C")));
    assert!(!recorder.events.contains(&"finished".to_string()));
}

#[test]
fn executor_reports_when_everything_is_done() {
    let temp = TempDir::new().expect("temp dir");
    let calls = temp.path().join("calls.log");
    let runner = runner(
        &format!("echo x >> {}", quoted(&calls)),
        &format!("echo x >> {}", quoted(&calls)),
        3,
    );
    let checklist = parse_checklist("- [x] a\n* [X] b\n").expect("parse");
    let mut recorder = Recorder::default();

    execute_all(&checklist, None, &runner, &mut recorder).expect("execute");

    assert_eq!(recorder.events, vec!["all_completed".to_string()]);
    assert!(!calls.exists());
}

#[test]
fn executor_without_document_does_not_write() {
    let temp = TempDir::new().expect("temp dir");
    let prd = write_prd(&temp, "- [ ] only\n");
    let runner = runner("true", "true", 1);
    let checklist = load_checklist(&prd).expect("load");

    execute_all(&checklist, None, &runner, &mut Recorder::default()).expect("execute");

    assert_eq!(fs::read_to_string(&prd).expect("prd"), "- [ ] only\n");
}

#[test]
fn executor_persist_failure_is_not_fatal() {
    let temp = TempDir::new().expect("temp dir");
    let missing = temp.path().join("gone.md");
    let runner = runner("true", "true", 1);
    let checklist = parse_checklist("- [ ] one\n- [ ] two\n").expect("parse");
    let mut recorder = Recorder::default();

    execute_all(&checklist, Some(&missing), &runner, &mut recorder).expect("execute");

    assert_eq!(recorder.count("persist_failed"), 2);
    assert_eq!(recorder.events.last().map(String::as_str), Some("finished"));
}

fn collect_events(rx: &mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(Duration::from_secs(30)) {
        let done = matches!(event, RunEvent::RunComplete { .. });
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn context(mode: RunMode, input: &str, validate: &str) -> RunContext {
    RunContext {
        agent_template: "echo \"agent: %s\"".to_string(),
        validate_command: validate.to_string(),
        max_iterations: max(2),
        mode,
        input: input.to_string(),
    }
}

#[test]
fn spawn_run_streams_events_and_completes_once() {
    let (tx, rx) = mpsc::channel();
    let handle = spawn_run(
        context(RunMode::SingleTask, "fix it", "true"),
        Arc::new(Logger::disabled()),
        tx,
    );

    let events = collect_events(&rx);
    handle.join().expect("join run thread");

    assert_eq!(
        events,
        vec![
            RunEvent::IterationStart {
                iteration: 1,
                max: 2
            },
            RunEvent::AgentOutputLine {
                text: "agent: fix it".to_string()
            },
            RunEvent::ValidationStart,
            RunEvent::ValidationResult {
                success: true,
                output: String::new()
            },
            RunEvent::RunComplete {
                success: true,
                error: None
            },
        ]
    );
    assert!(rx.try_recv().is_err());
}

#[test]
fn spawn_run_reports_exhaustion() {
    let (tx, rx) = mpsc::channel();
    let handle = spawn_run(
        context(RunMode::SingleTask, "fix it", "false"),
        Arc::new(Logger::disabled()),
        tx,
    );

    let events = collect_events(&rx);
    handle.join().expect("join run thread");

    let iterations = events
        .iter()
        .filter(|event| matches!(event, RunEvent::IterationStart { .. }))
        .count();
    assert_eq!(iterations, 2);
    assert_eq!(
        events.last(),
        Some(&RunEvent::RunComplete {
            success: false,
            error: Some(EXHAUSTED_MESSAGE.to_string())
        })
    );
}

#[test]
fn spawn_run_checklist_persists_and_reports_progress() {
    let temp = TempDir::new().expect("temp dir");
    let prd = write_prd(&temp, "- [ ] first\n- [x] skip\n- [ ] second\n");
    let (tx, rx) = mpsc::channel();
    let handle = spawn_run(
        context(RunMode::Checklist, &prd.display().to_string(), "true"),
        Arc::new(Logger::disabled()),
        tx,
    );

    let events = collect_events(&rx);
    handle.join().expect("join run thread");

    let starts: Vec<&RunEvent> = events
        .iter()
        .filter(|event| matches!(event, RunEvent::ChecklistTaskStart { .. }))
        .collect();
    assert_eq!(
        starts,
        vec![
            &RunEvent::ChecklistTaskStart {
                current: 1,
                total: 2,
                title: "first".to_string()
            },
            &RunEvent::ChecklistTaskStart {
                current: 2,
                total: 2,
                title: "second".to_string()
            },
        ]
    );
    assert_eq!(
        events.last(),
        Some(&RunEvent::RunComplete {
            success: true,
            error: None
        })
    );
    assert_eq!(
        fs::read_to_string(&prd).expect("prd"),
        "- [x] first\n- [x] skip\n- [x] second\n"
    );
}

#[test]
fn spawn_run_reports_missing_document() {
    let temp = TempDir::new().expect("temp dir");
    let missing = temp.path().join("missing.md");
    let (tx, rx) = mpsc::channel();
    let handle = spawn_run(
        context(RunMode::Checklist, &missing.display().to_string(), "true"),
        Arc::new(Logger::disabled()),
        tx,
    );

    let events = collect_events(&rx);
    handle.join().expect("join run thread");

    assert_eq!(
        events,
        vec![RunEvent::RunComplete {
            success: false,
            error: Some(format!("PRD file not found: {}", missing.display()))
        }]
    );
}

#[test]
fn spawn_run_survives_dropped_receiver() {
    let (tx, rx) = mpsc::channel::<RunEvent>();
    drop(rx);
    let handle = spawn_run(
        context(RunMode::SingleTask, "task", "true"),
        Arc::new(Logger::disabled()),
        tx,
    );
    handle.join().expect("run thread should not panic");
}

#[test]
fn cli_parses_subcommands_and_global_flags() {
    let cli = Cli::try_parse_from(["tatsu", "run", "add tests", "--max-iterations", "5"])
        .expect("parse run");
    assert_eq!(cli.max_iterations, 5);
    assert!(matches!(cli.command, Some(CliCommand::Run { ref task }) if task == "add tests"));

    let cli = Cli::try_parse_from(["tatsu", "-C", "/tmp", "prd", "PRD.md"]).expect("parse prd");
    assert_eq!(cli.dir, Some(PathBuf::from("/tmp")));
    assert_eq!(cli.config, PathBuf::from("tatsu.yaml"));
    assert!(matches!(cli.command, Some(CliCommand::Prd { ref file }) if file == Path::new("PRD.md")));

    let cli = Cli::try_parse_from(["tatsu", "gen", "-f"]).expect("parse gen");
    assert!(matches!(cli.command, Some(CliCommand::Generate { force: true })));

    let cli = Cli::try_parse_from(["tatsu"]).expect("parse bare");
    assert!(cli.command.is_none());
    assert_eq!(cli.max_iterations, 15);
}

#[test]
fn cli_rejects_out_of_range_iterations() {
    for value in ["0", "101", "-3", "many"] {
        assert!(
            Cli::try_parse_from(["tatsu", "--max-iterations", value, "run", "x"]).is_err(),
            "{value} should be rejected"
        );
    }
    assert!(Cli::try_parse_from(["tatsu", "--max-iterations", "100", "run", "x"]).is_ok());
    assert!(Cli::try_parse_from(["tatsu", "--max-iterations", "1", "run", "x"]).is_ok());
}

#[test]
fn run_with_args_returns_quit_on_cli_parse_failure() {
    let quit = run_with_args(vec!["tatsu".into(), "bogus".into()]).expect_err("parse failure");
    assert_eq!(quit.code, 2);
    assert_eq!(quit.reason, "cli_parse");
}

#[test]
fn version_succeeds() {
    assert!(run_with_args(vec!["tatsu".into(), "version".into()]).is_ok());
    let _ = main_with_args(vec!["tatsu".into(), "version".into()]);
}

#[test]
fn background_run_does_not_block_the_receiver() {
    // The receiver sees agent output before the agent exits.
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    let handle = spawn_run(
        RunContext {
            agent_template: "echo early; sleep 3; echo late".to_string(),
            validate_command: "true".to_string(),
            max_iterations: max(1),
            mode: RunMode::SingleTask,
            input: "task".to_string(),
        },
        Arc::new(Logger::disabled()),
        tx,
    );

    let mut early_after = None;
    while let Ok(event) = rx.recv_timeout(Duration::from_secs(30)) {
        if let RunEvent::AgentOutputLine { text } = &event {
            assert_ne!(text, "late", "late arrived before early");
            if text == "early" {
                early_after = Some(started.elapsed());
                break;
            }
        }
    }
    let early_after = early_after.expect("early line");
    assert!(
        early_after < Duration::from_secs(2),
        "early arrived after {early_after:?}"
    );
    let remaining = collect_events(&rx);
    assert!(matches!(
        remaining.last(),
        Some(RunEvent::RunComplete { success: true, .. })
    ));
    handle.join().expect("join");
}
