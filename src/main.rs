use std::process::ExitCode;

mod app;
mod checklist;
mod cli;
mod config;
mod executor;
mod harness;
mod logger;
mod runner;
mod session;
mod shell;
mod template;
mod tui;

#[cfg(test)]
mod unit_tests;

fn main() -> ExitCode {
    app::main()
}
