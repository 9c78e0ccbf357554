/// Substitution marker inside `agent.command`.
pub(crate) const TASK_MARKER: &str = "%s";

/// Backslash-escapes double quotes and nothing else.
///
/// This assumes the template wraps the marker in double quotes. `$`, backticks
/// and backslashes pass through untouched, so a task can still expand inside
/// the shell.
pub(crate) fn escape_task(task: &str) -> String {
    task.replace('"', "\\\"")
}

/// Builds the concrete agent command for one task.
///
/// A template without a marker is returned unchanged (the task is dropped).
/// Every marker occurrence receives the escaped task.
pub(crate) fn render(template: &str, task: &str) -> String {
    if !template.contains(TASK_MARKER) {
        return template.to_string();
    }
    template.replace(TASK_MARKER, &escape_task(task))
}

pub(crate) fn marker_count(template: &str) -> usize {
    template.matches(TASK_MARKER).count()
}
