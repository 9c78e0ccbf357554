use chrono::Utc;
use shell_escape::unix::escape;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Append-only transition log. A missing path turns every call into a no-op.
#[derive(Debug)]
pub(crate) struct Logger {
    path: Option<PathBuf>,
    disabled: AtomicBool,
    warning: Mutex<WarningSlot>,
}

/// Where the disable warning goes while someone else owns the terminal.
#[derive(Debug, Default)]
struct WarningSlot {
    held: bool,
    pending: Option<String>,
}

impl Logger {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            disabled: AtomicBool::new(false),
            warning: Mutex::new(WarningSlot::default()),
        }
    }

    /// Keeps warnings off stderr until `release_warnings`.
    pub(crate) fn hold_warnings(&self) {
        if let Ok(mut slot) = self.warning.lock() {
            slot.held = true;
        }
    }

    /// Stops holding warnings and prints the one held back, if any.
    pub(crate) fn release_warnings(&self) {
        let pending = match self.warning.lock() {
            Ok(mut slot) => {
                slot.held = false;
                slot.pending.take()
            }
            Err(_) => None,
        };
        if let Some(warning) = pending {
            write_warning(&warning);
        }
    }

    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self::new(None)
    }

    pub(crate) fn log_transition(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let sanitized = sanitize_log_value(message);
        let line = format!("{} {}\n", ts, sanitized);
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => file,
            Err(err) => {
                self.disable_with_warning(path, &err);
                return;
            }
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            self.disable_with_warning(path, &err);
        }
    }

    fn disable_with_warning(&self, path: &Path, err: &std::io::Error) {
        if self
            .disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let warning = format!(
            "Warning: transition logging disabled log_path={} io_error={}",
            path.display(),
            err
        );
        if let Ok(mut slot) = self.warning.lock() {
            if slot.held {
                slot.pending = Some(warning);
                return;
            }
        }
        write_warning(&warning);
    }
}

fn write_warning(warning: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", warning);
}

pub(crate) fn sanitize_log_value(value: &str) -> String {
    value
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

/// Quotes a task title so it stays a single `key=value` token in a log line.
pub(crate) fn log_token(value: &str) -> String {
    sanitize_log_value(escape(value.into()).as_ref())
}
