//! Incremental fixes from an analysis report.
//!
//! Each urgent task runs builder then QA on its own, with a bounded number of
//! attempts. Gate 4 feeds the attempt log back to the builder, Gate 5 rejects
//! fixes without a mutation and Gate 3 forces a live test before a PASS counts.
//! The fix list is saved after every status change.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use events::{Event, EventBus};
use flowforge_core::{
    ConversationEntry, FixAttempt, FixResult, FixTask, QaReport, QaStatus, Stage, TaskPriority,
    TaskStatus, TodoList,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::todo_store::TodoStore;
use crate::agents::{BuilderAgent, QaAgent};
use crate::config::DEFAULT_MAX_FIX_ATTEMPTS;
use crate::error::Result;
use crate::flow::forced_test_failure;
use crate::gates::GateEnforcer;
use crate::session_store::SessionStore;
use crate::state_machine::StageMachine;

/// What to do with a finished analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixApproval {
    AutoFix,
    Manual,
    Save,
    Quit,
}

impl FixApproval {
    /// `A`, `M`, `S` or `Q` in any case. Anything else saves.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_uppercase().as_str() {
            "A" => Self::AutoFix,
            "M" => Self::Manual,
            "Q" => Self::Quit,
            _ => Self::Save,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFixResult {
    pub task_id: String,
    pub applied: bool,
    /// QA passed with a live test.
    pub validated: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FixSummary {
    /// `None` when there was nothing to apply.
    pub session_id: Option<Uuid>,
    pub results: Vec<TaskFixResult>,
}

impl FixSummary {
    pub fn applied(&self) -> usize {
        self.results.iter().filter(|r| r.applied).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.applied).count()
    }
}

enum Attempt {
    Validated,
    /// The task's nodes are clean but QA reported errors elsewhere.
    NewErrors(String),
    Retry(String),
}

pub struct IncrementalFixer {
    store: Arc<SessionStore>,
    builder: Arc<BuilderAgent>,
    qa: Arc<QaAgent>,
    todos: Arc<TodoStore>,
    event_bus: EventBus,
    max_attempts: u32,
}

impl IncrementalFixer {
    pub fn new(
        store: Arc<SessionStore>,
        builder: Arc<BuilderAgent>,
        qa: Arc<QaAgent>,
        todos: Arc<TodoStore>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            builder,
            qa,
            todos,
            event_bus,
            max_attempts: DEFAULT_MAX_FIX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Applies every pending P0/P1 task in priority order. A failed task does
    /// not stop the run.
    pub async fn apply(&self, todo: &mut TodoList) -> Result<FixSummary> {
        let queue: Vec<FixTask> = todo.urgent_pending().into_iter().cloned().collect();
        if queue.is_empty() {
            info!(analysis_id = %todo.analysis_id, "No P0/P1 tasks to apply");
            return Ok(FixSummary::default());
        }

        let session = self
            .store
            .create_at(Some(todo.workflow_id.clone()), Stage::Build)
            .await;
        self.store
            .add_history(
                session.id,
                ConversationEntry::user(format!(
                    "Apply {} fixes from analysis {}",
                    queue.len(),
                    todo.analysis_id
                )),
            )
            .await?;
        let mut gates = GateEnforcer::new(session.id).with_event_bus(self.event_bus.clone());

        info!(
            session_id = %session.id,
            workflow_id = %todo.workflow_id,
            tasks = queue.len(),
            "Applying fixes"
        );

        let mut results = Vec::with_capacity(queue.len());
        for task in &queue {
            info!(task_id = %task.id, priority = %task.priority, title = %task.title, "Fix task");
            self.mark(todo, &task.id, TaskStatus::InProgress, None).await;

            let result = self
                .apply_task(session.id, &todo.workflow_id, task, &mut gates)
                .await;
            let status = if result.applied {
                TaskStatus::Completed
            } else {
                warn!(task_id = %task.id, error = ?result.error, "Fix task failed");
                TaskStatus::Failed
            };
            self.mark(todo, &task.id, status, result.error.clone()).await;

            self.event_bus.emit(Event::FixTaskFinished {
                session_id: session.id,
                task_id: task.id.clone(),
                applied: result.applied,
                validated: result.validated,
                attempts: result.attempts,
            });
            results.push(result);
        }

        let summary = FixSummary {
            session_id: Some(session.id),
            results,
        };
        self.close(session.id, summary.applied() > 0).await;
        Ok(summary)
    }

    async fn apply_task(
        &self,
        session_id: Uuid,
        workflow_id: &str,
        task: &FixTask,
        gates: &mut GateEnforcer,
    ) -> TaskFixResult {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            let outcome = self
                .attempt(session_id, workflow_id, task, gates)
                .await
                .unwrap_or_else(|e| Attempt::Retry(e.to_string()));

            match outcome {
                Attempt::Validated => {
                    return TaskFixResult {
                        task_id: task.id.clone(),
                        applied: true,
                        validated: true,
                        attempts: attempt,
                        error: None,
                    }
                }
                Attempt::NewErrors(errors) => {
                    return TaskFixResult {
                        task_id: task.id.clone(),
                        applied: true,
                        validated: false,
                        attempts: attempt,
                        error: Some(format!("New errors: {}", errors)),
                    }
                }
                Attempt::Retry(reason) => {
                    warn!(
                        task_id = %task.id,
                        attempt,
                        max_attempts = self.max_attempts,
                        reason = %reason,
                        "Fix attempt failed"
                    );
                    last_error = reason;
                }
            }
        }

        TaskFixResult {
            task_id: task.id.clone(),
            applied: false,
            validated: false,
            attempts: self.max_attempts,
            error: Some(format!(
                "Failed after {} attempts: {}",
                self.max_attempts, last_error
            )),
        }
    }

    async fn attempt(
        &self,
        session_id: Uuid,
        workflow_id: &str,
        task: &FixTask,
        gates: &mut GateEnforcer,
    ) -> Result<Attempt> {
        let cycle = self.store.increment_cycle(session_id).await?;
        self.store.update_stage(session_id, Stage::Build).await?;

        let session = self.store.snapshot(session_id).await?;
        let already_tried = gates
            .inject_fix_attempts(&session)
            .already_tried()
            .unwrap_or_default()
            .to_string();

        let fix = self
            .builder
            .fix(
                session_id,
                workflow_id,
                &task.affected_nodes,
                &fix_instructions(task),
                &already_tried,
            )
            .await?;

        let approach = format!("{} {}", task.id, task.title);
        let mutation_check = gates.verify_mutation_calls(&fix.calls);
        if !mutation_check.passed || !fix.data.verification.expected_changes_applied {
            let reason = mutation_check
                .message
                .or(fix.error)
                .unwrap_or_else(|| "builder did not apply the change".to_string());
            let attempt = FixAttempt::new(cycle, approach, FixResult::Failed)
                .with_nodes(task.affected_nodes.clone())
                .with_error_type(reason.clone());
            self.store.log_fix_attempt(session_id, attempt).await?;
            return Ok(Attempt::Retry(reason));
        }

        self.store.update_stage(session_id, Stage::Validate).await?;
        let mut report = self.qa.validate(session_id, workflow_id).await?.data;
        if report.status == QaStatus::Pass && !gates.check_live_verification(&report).passed {
            self.store.update_stage(session_id, Stage::Test).await?;
            let live = self.qa.test_workflow(session_id, workflow_id).await?.data;
            if live.all_passed() {
                report.live_test_executed = true;
            } else {
                report = forced_test_failure(report, &live.tests, &live.summary);
            }
        }

        let outcome = match report.status {
            QaStatus::Pass => Attempt::Validated,
            QaStatus::Fail if !still_broken(task, &report) => {
                Attempt::NewErrors(report.error_summary())
            }
            _ => Attempt::Retry(report.error_summary()),
        };

        let result = match outcome {
            Attempt::Retry(_) => FixResult::Failed,
            _ => FixResult::Success,
        };
        let mut attempt =
            FixAttempt::new(cycle, approach, result).with_nodes(task.affected_nodes.clone());
        if let Attempt::Retry(reason) = &outcome {
            attempt = attempt.with_error_type(reason.clone());
        }
        self.store.log_fix_attempt(session_id, attempt).await?;
        Ok(outcome)
    }

    async fn mark(
        &self,
        todo: &mut TodoList,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) {
        todo.set_status(task_id, status, error);
        if let Err(e) = self.todos.save(todo).await {
            warn!(analysis_id = %todo.analysis_id, error = %e, "Failed to save fix list");
        }
    }

    /// Complete when anything was applied, blocked otherwise. Best-effort.
    async fn close(&self, session_id: Uuid, applied: bool) {
        let target = if applied { Stage::Complete } else { Stage::Blocked };
        let result = async {
            let session = self.store.snapshot(session_id).await?;
            if !StageMachine::can_transition(&session.stage, &target) {
                self.store.update_stage(session_id, Stage::Validate).await?;
            }
            self.store.update_stage(session_id, target).await
        }
        .await;
        if let Err(e) = result {
            warn!(session_id = %session_id, error = %e, "Failed to close fix session");
        }
        if let Err(e) = self.store.archive(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to archive fix session");
        }
    }
}

/// The task as builder instructions.
pub fn fix_instructions(task: &FixTask) -> String {
    let mut out = format!("{} {}: {}\n", task.id, task.priority, task.title);
    if !task.evidence.is_empty() {
        out.push_str("\nEvidence:\n");
        for evidence in &task.evidence {
            let _ = writeln!(out, "- {}", evidence);
        }
    }
    out.push_str("\nApply this single fix. Leave every other node untouched.");
    out
}

/// QA still reports an error on one of the task's nodes.
fn still_broken(task: &FixTask, report: &QaReport) -> bool {
    report.errors.iter().any(|e| {
        e.node
            .as_ref()
            .is_some_and(|node| task.affected_nodes.contains(node))
    })
}

/// Step-by-step instructions grouped by priority, for fixing by hand.
pub fn render_manual_instructions(todo: &TodoList, report_path: Option<&Path>) -> String {
    let mut out = format!("# Manual fixes for workflow {}\n", todo.workflow_id);

    for priority in [
        TaskPriority::P0,
        TaskPriority::P1,
        TaskPriority::P2,
        TaskPriority::P3,
    ] {
        let tasks: Vec<&FixTask> = todo.tasks.iter().filter(|t| t.priority == priority).collect();
        if tasks.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n## {} ({})", priority, priority.label());
        for task in tasks {
            let _ = writeln!(out, "\n### {}: {} [{}]", task.id, task.title, task.status);
            if !task.affected_nodes.is_empty() {
                let _ = writeln!(out, "Affected nodes: {}", task.affected_nodes.join(", "));
            }
            for evidence in &task.evidence {
                let _ = writeln!(out, "- {}", evidence);
            }
        }
    }

    if todo.tasks.is_empty() {
        out.push_str("\nNo recommendations to apply.\n");
    }
    out.push_str("\nApply one change at a time and run a test execution after each.\n");
    if let Some(path) = report_path {
        let _ = writeln!(out, "Full report: {}", path.display());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::{AnalysisReport, AuditFindings, AuditIssue, QaIssue};

    fn todo() -> TodoList {
        let report = AnalysisReport {
            recommendations: vec![
                "P0: Retry the HTTP node on 429".to_string(),
                "P2: Rename nodes".to_string(),
            ],
            ..AnalysisReport::default()
        };
        let findings = AuditFindings {
            issues: vec![AuditIssue {
                node: Some("HTTP".to_string()),
                severity: "high".to_string(),
                description: "no retry on 429".to_string(),
            }],
            ..AuditFindings::default()
        };
        TodoList::from_report(Uuid::new_v4(), "wf-9", &report, Some(&findings))
    }

    #[test]
    fn test_parse_approval() {
        assert_eq!(FixApproval::parse("a"), FixApproval::AutoFix);
        assert_eq!(FixApproval::parse(" M "), FixApproval::Manual);
        assert_eq!(FixApproval::parse("q"), FixApproval::Quit);
        assert_eq!(FixApproval::parse("S"), FixApproval::Save);
        assert_eq!(FixApproval::parse("yes please"), FixApproval::Save);
        assert_eq!(FixApproval::parse(""), FixApproval::Save);
    }

    #[test]
    fn test_fix_instructions() {
        let todo = todo();
        let text = fix_instructions(&todo.tasks[0]);

        assert!(text.starts_with("T-001 P0: Retry the HTTP node on 429\n"));
        assert!(text.contains("- HTTP: no retry on 429"));
    }

    #[test]
    fn test_still_broken_only_on_task_nodes() {
        let todo = todo();
        let task = &todo.tasks[0];
        let mut report = QaReport {
            status: QaStatus::Fail,
            errors: vec![QaIssue {
                node: Some("Slack".to_string()),
                message: "missing channel".to_string(),
            }],
            ..QaReport::default()
        };
        assert!(!still_broken(task, &report));

        report.errors.push(QaIssue {
            node: Some("HTTP".to_string()),
            message: "still 429".to_string(),
        });
        assert!(still_broken(task, &report));
    }

    #[test]
    fn test_manual_instructions_grouped() {
        let mut todo = todo();
        todo.set_status("T-002", TaskStatus::Failed, None);
        let text = render_manual_instructions(&todo, Some(Path::new("reports/a.md")));

        let p0 = text.find("## P0 (Critical - fix immediately)").unwrap();
        let p2 = text.find("## P2 (Medium - plan to fix)").unwrap();
        assert!(p0 < p2);
        assert!(!text.contains("## P1"));
        assert!(text.contains("### T-001: Retry the HTTP node on 429 [pending]"));
        assert!(text.contains("### T-002: Rename nodes [failed]"));
        assert!(text.contains("Affected nodes: HTTP"));
        assert!(text.ends_with("Full report: reports/a.md\n"));
    }

    #[test]
    fn test_summary_counts() {
        let summary = FixSummary {
            session_id: None,
            results: vec![
                TaskFixResult {
                    task_id: "T-001".to_string(),
                    applied: true,
                    validated: false,
                    attempts: 1,
                    error: None,
                },
                TaskFixResult {
                    task_id: "T-002".to_string(),
                    applied: false,
                    validated: false,
                    attempts: 3,
                    error: Some("timeout".to_string()),
                },
            ],
        };
        assert_eq!(summary.applied(), 1);
        assert_eq!(summary.failed(), 1);
    }
}
