use std::path::Path;

use crate::checklist::{mark_complete, Checklist};
use crate::logger::{log_token, sanitize_log_value};
use crate::runner::{RunObserver, Runner};

/// Runs every incomplete task in document order, stopping at the first one
/// the runner cannot finish.
///
/// The incomplete set is computed once up front. After each success the
/// task's checkbox is flipped in `document` when both a path and a source line
/// are known; a failed write is reported but never fails the run.
pub(crate) fn execute_all(
    checklist: &Checklist,
    document: Option<&Path>,
    runner: &Runner,
    observer: &mut dyn RunObserver,
) -> Result<(), String> {
    let logger = runner.logger();
    let incomplete = checklist.incomplete_tasks();
    if incomplete.is_empty() {
        logger.log_transition("checklist all_completed");
        observer.checklist_all_completed();
        return Ok(());
    }

    let total = incomplete.len();
    observer.checklist_summary(checklist.total_count(), checklist.completed_count(), total);
    logger.log_transition(&format!(
        "checklist start total={} completed={} remaining={}",
        checklist.total_count(),
        checklist.completed_count(),
        total
    ));

    for (index, task) in incomplete.into_iter().enumerate() {
        let task_token = log_token(&task.title);
        observer.checklist_task_started(index + 1, total, &task.title);
        logger.log_transition(&format!(
            "checklist task_start task={} index={} total={}",
            task_token,
            index + 1,
            total
        ));

        if let Err(err) = runner.run(&task.title, observer).into_result() {
            logger.log_transition(&format!("checklist task_failed task={}", task_token));
            return Err(format!("task '{}' failed: {}", task.title, err));
        }

        let (Some(path), Some(line)) = (document, task.source_line) else {
            continue;
        };
        match mark_complete(path, line) {
            Ok(()) => logger.log_transition(&format!(
                "checklist mark_complete task={} line={}",
                task_token, line
            )),
            Err(err) => {
                logger.log_transition(&format!(
                    "checklist mark_complete_failed task={} line={} err={}",
                    task_token,
                    line,
                    sanitize_log_value(&err)
                ));
                observer.checklist_persist_failed(&task.title, &err);
            }
        }
    }

    logger.log_transition("checklist completed");
    observer.checklist_finished();
    Ok(())
}
