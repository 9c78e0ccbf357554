use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{self, ExitCode};
use std::sync::Arc;

use crate::checklist::load_checklist;
use crate::cli::{Cli, CliCommand};
use crate::config::{generate_config, load_config, Config};
use crate::executor::execute_all;
use crate::harness::{Harness, OpenCodeHarness};
use crate::logger::{sanitize_log_value, Logger};
use crate::runner::{ConsoleReporter, MaxIterations, Runner};
use crate::tui::{run_tui, SessionSettings};

pub(crate) const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug)]
pub(crate) struct Quit {
    pub(crate) code: i32,
    #[allow(dead_code)]
    pub(crate) reason: String,
}

impl Quit {
    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code as u8)
    }

    fn failure(reason: impl Into<String>) -> Self {
        Self {
            code: 1,
            reason: reason.into(),
        }
    }
}

pub(crate) fn quit(logger: &Logger, reason: &str, code: i32) -> Quit {
    let sanitized = if reason.trim().is_empty() {
        "unknown".to_string()
    } else {
        sanitize_log_value(reason)
    };
    logger.log_transition(&format!("quit reason={}", sanitized));
    Quit {
        code,
        reason: reason.to_string(),
    }
}

fn install_interrupt_handler(logger: Arc<Logger>) {
    if let Err(err) = ctrlc::set_handler(move || {
        logger.log_transition("quit reason=interrupted");
        process::exit(INTERRUPTED_EXIT_CODE);
    }) {
        eprintln!("Failed to set interrupt handler: {}", err);
    }
}

fn generate_command(config_path: &Path, force: bool) -> Result<(), Quit> {
    if force {
        println!(
            "🔧 Generating {} (overwriting existing file)...",
            config_path.display()
        );
    } else {
        println!("🔧 Generating {}...", config_path.display());
    }

    let generated = generate_config(config_path, &project_dir(config_path), force).map_err(
        |message| {
            println!("❌ {}", message);
            Quit::failure(message)
        },
    )?;

    if let Some(backup) = &generated.backup {
        println!("📦 Backed up previous config to {}", backup.display());
    }
    println!("✅ Created {}", config_path.display());
    println!("\n📝 Review and update the configuration as needed:");
    println!("   - agent.command: Your AI agent command");
    println!(
        "   - validate.command: Your test/validation command (detected: {})",
        generated.validate_command
    );
    Ok(())
}

/// Directory whose marker files decide the generated validation command.
fn project_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn ensure_config(config_path: &Path) -> Result<(), Quit> {
    if config_path.exists() {
        return Ok(());
    }
    println!(
        "📝 No {} found. Generating configuration...",
        config_path.display()
    );
    generate_config(config_path, &project_dir(config_path), false).map_err(|message| {
        println!("❌ Failed to generate config: {}", message);
        Quit::failure(message)
    })?;
    println!("✅ Created {}", config_path.display());
    println!("   (Run 'tatsu generate --force' to regenerate)");
    Ok(())
}

fn open_logger(config: &Config) -> Arc<Logger> {
    if let Some(parent) = config
        .log_path
        .as_deref()
        .and_then(Path::parent)
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        // A failure here surfaces as the logger's own one-time warning.
        let _ = fs::create_dir_all(parent);
    }
    Arc::new(Logger::new(config.log_path.clone()))
}

fn require_harness(harness: &dyn Harness, logger: &Logger) -> Result<(), Quit> {
    if harness.is_available() {
        return Ok(());
    }
    let message = format!("{} is not installed or not in PATH", harness.name());
    println!("❌ {}", message);
    println!("   Install from: {}", OpenCodeHarness::INSTALL_HINT);
    Err(quit(logger, &message, 1))
}

fn print_config_summary(config: &Config, max_iterations: MaxIterations) {
    println!("✅ Configuration loaded successfully");
    println!("   Agent: {}", config.agent.command);
    println!("   Validate: {}", config.validate.command);
    println!("   Max iterations: {}", max_iterations);
    println!();
}

fn run_task(task: &str, runner: &Runner) -> Result<(), Quit> {
    let mut reporter = ConsoleReporter::new();
    runner
        .run(task, &mut reporter)
        .into_result()
        .map_err(|message| {
            println!("⚠️  {}", message);
            quit(runner.logger(), &message, 1)
        })
}

fn run_prd(file: &Path, runner: &Runner) -> Result<(), Quit> {
    let checklist = load_checklist(file).map_err(|message| {
        println!("❌ Failed to load PRD: {}", message);
        quit(runner.logger(), &message, 1)
    })?;
    let mut reporter = ConsoleReporter::new();
    execute_all(&checklist, Some(file), runner, &mut reporter).map_err(|message| {
        println!("⚠️  {}", message);
        quit(runner.logger(), &message, 1)
    })
}

pub(crate) fn run_with_cli(cli: Cli) -> Result<(), Quit> {
    if matches!(cli.command, Some(CliCommand::Version)) {
        println!("tatsu v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if let Some(dir) = &cli.dir {
        env::set_current_dir(dir).map_err(|err| {
            let message = format!("Failed to change directory to {}: {}", dir.display(), err);
            println!("❌ Error: {}", message);
            Quit::failure(message)
        })?;
    }

    let max_iterations = MaxIterations::new(cli.max_iterations).map_err(|message| {
        println!("❌ Error: {}", message);
        Quit::failure(message)
    })?;

    let command = match cli.command {
        Some(CliCommand::Generate { force }) => return generate_command(&cli.config, force),
        Some(CliCommand::Version) => return Ok(()),
        other => other,
    };

    match &command {
        Some(CliCommand::Run { task }) => println!("🎯 Task: {}\n", task),
        Some(CliCommand::Prd { file }) => println!("📄 Loading PRD: {}\n", file.display()),
        _ => {}
    }

    ensure_config(&cli.config)?;
    let loaded = load_config(&cli.config).map_err(|message| {
        println!("❌ {}", message);
        Quit::failure(message)
    })?;
    for warning in &loaded.warnings {
        eprintln!("Warning: {}", warning);
    }
    let config = loaded.config;
    let logger = open_logger(&config);

    let harness = OpenCodeHarness::new();
    let Some(command) = command else {
        require_harness(&harness, &logger)?;
        let settings = SessionSettings {
            agent_template: config.agent.command,
            validate_command: config.validate.command,
            max_iterations,
        };
        return run_tui(settings, Arc::clone(&logger)).map_err(|message| {
            eprintln!("❌ {}", message);
            quit(&logger, &message, 1)
        });
    };

    print_config_summary(&config, max_iterations);
    require_harness(&harness, &logger)?;
    println!("✅ {} is available\n", harness.name());

    install_interrupt_handler(Arc::clone(&logger));
    let runner = Runner::new(
        config.agent.command,
        config.validate.command,
        max_iterations,
        Arc::clone(&logger),
    );
    match command {
        CliCommand::Run { task } => run_task(&task, &runner),
        CliCommand::Prd { file } => run_prd(&file, &runner),
        CliCommand::Generate { .. } | CliCommand::Version => Ok(()),
    }
}

pub(crate) fn run_with_args(args: Vec<OsString>) -> Result<(), Quit> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // clap's `Error::print()` uses termcolor and can bypass Rust's test output
            // capturing. Rendering it ourselves keeps CLI errors capture-friendly.
            eprintln!("{err}");
            return Err(Quit {
                code: err.exit_code(),
                reason: "cli_parse".to_string(),
            });
        }
    };
    run_with_cli(cli)
}

pub(crate) fn main_with_args(args: Vec<OsString>) -> ExitCode {
    let result = run_with_args(args);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(quit) => quit.exit_code(),
    }
}

pub(crate) fn main() -> ExitCode {
    main_with_args(env::args_os().collect())
}
