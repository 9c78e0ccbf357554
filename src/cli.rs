use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;
use crate::runner::{DEFAULT_MAX_ITERATIONS, MAX_ITERATIONS_LIMIT};

#[derive(Debug, Parser)]
#[command(
    name = "tatsu",
    about = "Tatsu reruns a coding agent until your validation command passes.",
    long_about = "Tatsu renders the agent command with the task, runs it, then runs the validation command, and repeats until validation passes or the iteration budget is spent.\n\nWithout a subcommand an interactive session opens (Tab switches between a single task and a PRD checklist).",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// Maximum agent/validation iterations per task.
    #[arg(
        long = "max-iterations",
        global = true,
        value_name = "N",
        default_value_t = DEFAULT_MAX_ITERATIONS,
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_ITERATIONS_LIMIT)),
        help = "Maximum agent/validation iterations per task (1-100)."
    )]
    pub(crate) max_iterations: u32,

    /// Change into DIR before loading config and running commands.
    #[arg(
        short = 'C',
        global = true,
        value_name = "DIR",
        help = "Change into DIR before loading config and running commands."
    )]
    pub(crate) dir: Option<PathBuf>,

    /// Load configuration from PATH instead of ./tatsu.yaml.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_FILE,
        help = "Load configuration from PATH instead of ./tatsu.yaml."
    )]
    pub(crate) config: PathBuf,

    #[command(subcommand)]
    pub(crate) command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Run a single task until validation passes.
    #[command(about = "Run a single task until validation passes.")]
    Run {
        #[arg(value_name = "TASK")]
        task: String,
    },
    /// Run every unchecked task in a markdown checklist.
    #[command(about = "Run every unchecked task in a markdown checklist.")]
    Prd {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Write a default tatsu.yaml.
    #[command(about = "Write a default tatsu.yaml.", visible_alias = "gen")]
    Generate {
        #[arg(short = 'f', long = "force", help = "Overwrite an existing config (a backup is kept).")]
        force: bool,
    },
    /// Print the version.
    #[command(about = "Print the version.")]
    Version,
}
