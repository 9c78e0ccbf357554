use regex::Regex;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;
use tempfile::NamedTempFile;

const CHECKBOX_INCOMPLETE: &str = " [ ] ";
const CHECKBOX_COMPLETE: &str = " [x] ";
pub(crate) const NO_TASKS_MESSAGE: &str = "no tasks found in markdown";

fn task_line_regex() -> &'static Regex {
    static TASK_LINE: OnceLock<Regex> = OnceLock::new();
    TASK_LINE.get_or_init(|| {
        // ASCII whitespace only; a non-breaking space does not separate the parts.
        Regex::new(r"^[\t\f\r ]*[-*+][\t\f\r ]+\[([\t\f\r xX])\][\t\f\r ]+(.+)$")
            .expect("task line regex is valid")
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Task {
    pub(crate) title: String,
    pub(crate) completed: bool,
    /// 1-based line in the source document. `None` for tasks built in code,
    /// which can never be marked complete on disk.
    pub(crate) source_line: Option<usize>,
}

impl Task {
    pub(crate) fn new(title: impl Into<String>, completed: bool) -> Self {
        Self {
            title: title.into(),
            completed,
            source_line: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParseError {
    pub(crate) message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ParseError {}

/// Ordered, non-empty task list. Never updated in memory after a task is
/// completed; reload the document to observe persisted completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Checklist {
    tasks: Vec<Task>,
}

impl Checklist {
    pub(crate) fn new(tasks: Vec<Task>) -> Result<Self, ParseError> {
        if tasks.is_empty() {
            return Err(ParseError {
                message: "checklist must contain at least one task".to_string(),
            });
        }
        if let Some(index) = tasks.iter().position(|task| task.title.trim().is_empty()) {
            return Err(ParseError {
                message: format!("task at index {} has empty title", index),
            });
        }
        Ok(Self { tasks })
    }

    pub(crate) fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub(crate) fn total_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn completed_count(&self) -> usize {
        self.tasks().iter().filter(|task| task.completed).count()
    }

    pub(crate) fn incomplete_tasks(&self) -> Vec<&Task> {
        self.tasks().iter().filter(|task| !task.completed).collect()
    }
}

/// Extracts checkbox list items (`- [ ] title`, `* [x] title`, `+ [X] title`).
/// Anything else, including items whose title is blank, is skipped.
pub(crate) fn parse_checklist(text: &str) -> Result<Checklist, ParseError> {
    let regex = task_line_regex();
    let mut tasks = Vec::new();

    for (index, line) in text.split('\n').enumerate() {
        let Some(captures) = regex.captures(line) else {
            continue;
        };
        let title = captures[2].trim();
        if title.is_empty() {
            continue;
        }
        let checkbox = captures[1].trim();
        tasks.push(Task {
            source_line: Some(index + 1),
            ..Task::new(title, checkbox.eq_ignore_ascii_case("x"))
        });
    }

    if tasks.is_empty() {
        return Err(ParseError {
            message: NO_TASKS_MESSAGE.to_string(),
        });
    }
    Checklist::new(tasks)
}

pub(crate) fn load_checklist(path: &Path) -> Result<Checklist, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(format!("PRD file not found: {}", path.display()));
        }
        Err(err) => return Err(format!("failed to read PRD file: {}", err)),
    };
    parse_checklist(&content).map_err(|err| format!("failed to parse PRD file: {}", err))
}

/// Flips `" [ ] "` to `" [x] "` on `line_number` (1-based).
///
/// Out-of-range lines and lines without that exact substring are left alone
/// without error. The document is rewritten through a sibling temp file so
/// readers never observe a half-written file.
pub(crate) fn mark_complete(path: &Path, line_number: usize) -> Result<(), String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("read PRD file {}: {}", path.display(), err))?;
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    if line_number == 0 || line_number > lines.len() {
        return Ok(());
    }

    let index = line_number - 1;
    if !lines[index].contains(CHECKBOX_INCOMPLETE) {
        return Ok(());
    }
    lines[index] = lines[index].replacen(CHECKBOX_INCOMPLETE, CHECKBOX_COMPLETE, 1);
    write_atomically(path, &lines.join("\n"))
}

fn write_atomically(path: &Path, content: &str) -> Result<(), String> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)
        .map_err(|err| format!("create temp file in {}: {}", dir.display(), err))?;
    temp.write_all(content.as_bytes())
        .map_err(|err| format!("write PRD file {}: {}", path.display(), err))?;
    if let Ok(metadata) = fs::metadata(path) {
        let _ = fs::set_permissions(temp.path(), metadata.permissions());
    }
    temp.persist(path)
        .map_err(|err| format!("write PRD file {}: {}", path.display(), err.error))?;
    Ok(())
}
