//! Build flow
//!
//! Drives one request from clarification to a terminal stage. The orchestrator
//! owns stage and cycle sequencing; every external action is delegated to a
//! role adapter and checked by the gate enforcer before or after it runs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use events::{Event, EventBus};
use flowforge_core::{
    AgentRole, Blueprint, BuildOption, ConversationEntry, CredentialSelection, Diagnosis,
    EscalationLevel, FixAttempt, FixResult, QaIssue, QaReport, QaStatus, Requirements,
    ResearchFindings, Stage, TodoList,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::analyst::{generate_user_report, token_usage};
use crate::agents::{
    AgentInvoker, AgentRuntime, AnalystAgent, ArchitectAgent, BuilderAgent, QaAgent,
    ResearcherAgent,
};
use crate::analysis::FixApproval;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::gates::{GateContext, GateEnforcer};
use crate::knowledge::KnowledgeBase;
use crate::session_store::SessionStore;
use crate::state_machine::StageMachine;

const DEFAULT_CONVERSATIONAL_REPLY: &str = "How can I help you build a workflow?";

/// User decisions needed in interactive mode.
#[async_trait]
pub trait DecisionPrompter: Send + Sync {
    /// Index into `options`; `None` keeps the recommendation.
    async fn choose_option(&self, options: &[BuildOption]) -> Option<usize>;
    async fn confirm_blueprint(&self, blueprint: &Blueprint) -> bool;

    /// What to do with a finished analysis; keeps the report by default.
    async fn approve_fixes(&self, _todo: &TodoList, _report_path: Option<&Path>) -> FixApproval {
        FixApproval::Save
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Conversational,
    Completed { resource_id: String },
    Blocked,
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub session_id: Uuid,
    pub outcome: TaskOutcome,
    pub message: String,
}

impl TaskReport {
    pub fn is_blocked(&self) -> bool {
        self.outcome == TaskOutcome::Blocked
    }
}

/// Result of the QA loop for one session.
enum LoopExit {
    Passed(String),
    Blocked(String),
    Exhausted(u32),
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<SessionStore>,
    event_bus: EventBus,
    architect: ArchitectAgent,
    researcher: ResearcherAgent,
    builder: BuilderAgent,
    qa: QaAgent,
    analyst: AnalystAgent,
    prompter: Option<Arc<dyn DecisionPrompter>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self::with_event_bus(config, runtime, EventBus::new())
    }

    pub fn with_event_bus(
        config: OrchestratorConfig,
        runtime: Arc<dyn AgentRuntime>,
        event_bus: EventBus,
    ) -> Self {
        let store = Arc::new(
            SessionStore::new(&config.storage_dir).with_event_bus(event_bus.clone()),
        );
        let invoker = Arc::new(
            AgentInvoker::new(runtime, store.clone())
                .with_timeout(config.agent_timeout)
                .with_event_bus(event_bus.clone()),
        );
        let knowledge = KnowledgeBase::new(
            &config.learnings_path,
            &config.context_path,
            &config.reports_dir,
        );

        Self {
            architect: ArchitectAgent::new(invoker.clone()),
            researcher: ResearcherAgent::new(invoker.clone()),
            builder: BuilderAgent::new(invoker.clone()),
            qa: QaAgent::new(invoker.clone()),
            analyst: AnalystAgent::new(invoker, knowledge),
            config,
            store,
            event_bus,
            prompter: None,
        }
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn DecisionPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Run a new request to a terminal outcome. Any failure inside the flow
    /// ends in a post-mortem report rather than an error.
    pub async fn start(
        &self,
        request: &str,
        target_resource_id: Option<String>,
    ) -> Result<TaskReport> {
        let session = self.store.create(target_resource_id).await;
        self.store
            .add_history(session.id, ConversationEntry::user(request))
            .await?;
        info!(session_id = %session.id, "Starting build flow");

        Ok(self.run_guarded(session.id, request).await)
    }

    pub async fn resume(&self, session_id: Uuid) -> Result<TaskReport> {
        let session = self
            .store
            .load(session_id)
            .await
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;
        info!(session_id = %session_id, stage = %session.stage, "Resuming session");

        match session.stage {
            Stage::Clarification => {
                let request = session
                    .history
                    .first()
                    .map(|entry| entry.content.clone())
                    .unwrap_or_default();
                Ok(self.run_guarded(session_id, &request).await)
            }
            Stage::Complete => Ok(TaskReport {
                session_id,
                outcome: match session.target_resource_id {
                    Some(resource_id) => TaskOutcome::Completed { resource_id },
                    None => TaskOutcome::Conversational,
                },
                message: format!("Session {} is already complete", session_id),
            }),
            Stage::Blocked => Ok(self
                .block(session_id, "Resumed a blocked session")
                .await),
            stage => {
                self.store.update_stage(session_id, Stage::Blocked).await?;
                Err(OrchestratorError::ResumeUnsupported { session_id, stage })
            }
        }
    }

    async fn run_guarded(&self, session_id: Uuid, request: &str) -> TaskReport {
        match self.run_flow(session_id, request).await {
            Ok(report) => report,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Build flow failed");
                self.event_bus.emit(Event::Error {
                    message: e.to_string(),
                    context: Some(session_id.to_string()),
                });
                self.block(session_id, &e.to_string()).await
            }
        }
    }

    async fn run_flow(&self, session_id: Uuid, request: &str) -> Result<TaskReport> {
        let mut gates = GateEnforcer::new(session_id)
            .with_freshness(self.config.investigation_freshness)
            .with_event_bus(self.event_bus.clone());

        // Clarification
        let clarification = self.architect.clarify(session_id, request).await?.data;
        if clarification.is_conversational {
            let response = clarification
                .response
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONVERSATIONAL_REPLY.to_string());
            self.store.update_stage(session_id, Stage::Complete).await?;
            self.archive_best_effort(session_id).await;
            return Ok(TaskReport {
                session_id,
                outcome: TaskOutcome::Conversational,
                message: response,
            });
        }

        let requirements = Requirements {
            min_node_count: clarification
                .explicit_requirements
                .as_ref()
                .and_then(|r| r.min_nodes)
                .or(clarification.node_count),
            constraints: clarification
                .explicit_requirements
                .as_ref()
                .map(|r| r.notes.clone())
                .unwrap_or_default(),
        };
        if !requirements.is_empty() {
            self.store
                .set_requirements(session_id, requirements.clone())
                .await?;
        }
        let requirements = (!requirements.is_empty()).then_some(requirements);

        // Research
        let query = if clarification.requirements.trim().is_empty() {
            request.to_string()
        } else {
            clarification.requirements.clone()
        };
        let mut findings = if clarification.needs_research {
            self.store.update_stage(session_id, Stage::Research).await?;
            self.researcher.search(session_id, &query).await?.data
        } else {
            ResearchFindings::pass_through(&query)
        };

        // Decision
        self.store.update_stage(session_id, Stage::Decision).await?;
        if !gates
            .validate_hypothesis(&findings.hypothesis, findings.hypothesis_validated)
            .passed
        {
            let retried = self.researcher.validate_hypothesis(session_id, &findings).await?;
            findings = retried.data;
            if !gates
                .validate_hypothesis(&findings.hypothesis, findings.hypothesis_validated)
                .passed
            {
                warn!(session_id = %session_id, "Proceeding with an unvalidated hypothesis");
            }
        }

        let option = self.select_option(session_id, &findings).await?;
        let blueprint = self
            .architect
            .create_blueprint(session_id, &option, &findings, requirements.as_ref())
            .await?
            .data;

        let min_nodes = requirements.as_ref().and_then(|r| r.min_node_count);
        if let Err(e) = blueprint.validate(min_nodes) {
            let reason = match e {
                flowforge_core::CoreError::Validation(reason) => reason,
                other => other.to_string(),
            };
            warn!(session_id = %session_id, reason = %reason, "Blueprint rejected");
            self.store.update_stage(session_id, Stage::Blocked).await?;
            self.archive_best_effort(session_id).await;
            return Ok(TaskReport {
                session_id,
                outcome: TaskOutcome::Blocked,
                message: format!("Cannot proceed: Blueprint validation failed: {}", reason),
            });
        }

        if self.config.interactive {
            if let Some(prompter) = &self.prompter {
                if !prompter.confirm_blueprint(&blueprint).await {
                    return Err(OrchestratorError::BlueprintRejected);
                }
            }
        }

        // Credentials
        self.store.update_stage(session_id, Stage::Credentials).await?;
        let credentials = self.resolve_credentials(session_id, &blueprint).await?;

        // Implementation: findings gathered so far become build guidance.
        self.store
            .update_stage(session_id, Stage::Implementation)
            .await?;

        // Build
        self.store.update_stage(session_id, Stage::Build).await?;
        let build = self
            .builder
            .build(session_id, &blueprint, &findings, credentials.as_ref())
            .await?;
        let resource_id = match build.data.resource_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                let cause = build
                    .error
                    .map(|e| format!("Build produced no resource id: {}", e))
                    .unwrap_or_else(|| OrchestratorError::MissingResourceId.to_string());
                return Ok(self.block(session_id, &cause).await);
            }
        };
        self.store
            .set_target_resource_id(session_id, resource_id.clone())
            .await?;
        self.store.update_stage(session_id, Stage::Validate).await?;

        match self.qa_loop(session_id, &resource_id, &mut gates).await? {
            LoopExit::Passed(resource_id) => {
                self.store.update_stage(session_id, Stage::Complete).await?;
                self.archive_best_effort(session_id).await;
                info!(session_id = %session_id, resource_id = %resource_id, "Workflow complete");
                Ok(TaskReport {
                    session_id,
                    message: format!("SUCCESS: Workflow {} is ready", resource_id),
                    outcome: TaskOutcome::Completed { resource_id },
                })
            }
            LoopExit::Blocked(reason) => Ok(self.block(session_id, &reason).await),
            LoopExit::Exhausted(cycles) => {
                let cause = format!("QA loop exhausted after {} cycles without a PASS", cycles);
                Ok(self.block(session_id, &cause).await)
            }
        }
    }

    async fn select_option(
        &self,
        session_id: Uuid,
        findings: &ResearchFindings,
    ) -> Result<BuildOption> {
        let presented = self
            .architect
            .present_options(session_id, findings)
            .await?
            .data;

        let Some(mut index) = presented.recommended_index() else {
            return Ok(BuildOption {
                name: "Direct implementation".to_string(),
                description: findings.hypothesis.clone(),
                recommended: true,
                ..BuildOption::default()
            });
        };
        let mut options = presented.options;
        if self.config.interactive {
            if let Some(prompter) = &self.prompter {
                if let Some(choice) = prompter.choose_option(&options).await {
                    if choice < options.len() {
                        index = choice;
                    } else {
                        warn!(choice, "Option index out of range, using recommendation");
                    }
                }
            }
        }
        Ok(options.swap_remove(index))
    }

    async fn resolve_credentials(
        &self,
        session_id: Uuid,
        blueprint: &Blueprint,
    ) -> Result<Option<CredentialSelection>> {
        let needed = blueprint.credential_types();
        if needed.is_empty() {
            return Ok(None);
        }

        let discovered = self
            .researcher
            .discover_credentials(session_id, needed)
            .await?
            .data;
        let selection = self
            .architect
            .select_credentials(session_id, needed, &discovered)
            .await?
            .data;

        if !selection.missing.is_empty() {
            warn!(
                session_id = %session_id,
                missing = ?selection.missing,
                "Credentials missing, build will need them configured"
            );
        }
        Ok(Some(selection))
    }

    async fn qa_loop(
        &self,
        session_id: Uuid,
        resource_id: &str,
        gates: &mut GateEnforcer,
    ) -> Result<LoopExit> {
        loop {
            let completed = self.store.snapshot(session_id).await?.cycle;
            if completed >= self.config.max_qa_cycles {
                return Ok(LoopExit::Exhausted(completed));
            }
            let cycle = self.store.increment_cycle(session_id).await?;
            let session = self.store.snapshot(session_id).await?;
            let level = session.escalation_level();
            info!(session_id = %session_id, cycle, level = %level, "QA cycle");
            self.event_bus.emit(Event::CycleStarted {
                session_id,
                cycle,
                level: level.to_string(),
            });

            let escalation =
                gates.check_progressive_escalation(&session, AgentRole::Qa, chrono::Utc::now());
            if escalation.requires_post_mortem() {
                return Ok(LoopExit::Blocked(
                    escalation
                        .message
                        .unwrap_or_else(|| "L4 escalation".to_string()),
                ));
            }

            let diagnosis = self
                .investigate(session_id, resource_id, level, None)
                .await?;

            let validation = self.qa.validate(session_id, resource_id).await?;
            let mut report = validation.data;
            let mut has_failed_execution =
                report.live_test_executed && report.status == QaStatus::Fail;

            if report.status == QaStatus::Pass && !gates.check_live_verification(&report).passed {
                self.store.update_stage(session_id, Stage::Test).await?;
                let live = self.qa.test_workflow(session_id, resource_id).await?.data;
                if live.all_passed() {
                    report.live_test_executed = true;
                } else {
                    has_failed_execution = live.has_failure();
                    report = forced_test_failure(report, &live.tests, &live.summary);
                }
            }

            match report.status {
                QaStatus::Pass => return Ok(LoopExit::Passed(resource_id.to_string())),
                QaStatus::Blocked => {
                    return Ok(LoopExit::Blocked(format!(
                        "QA reported BLOCKED: {}",
                        report.error_summary()
                    )))
                }
                QaStatus::Fail => {
                    self.fix_cycle(
                        session_id,
                        resource_id,
                        cycle,
                        &report,
                        diagnosis,
                        has_failed_execution,
                        gates,
                    )
                    .await?;
                }
            }
        }
    }

    /// L2 runs a targeted execution analysis, L3 a deep dive over every prior
    /// attempt. `errors` overrides the default error context.
    async fn investigate(
        &self,
        session_id: Uuid,
        resource_id: &str,
        level: EscalationLevel,
        errors: Option<&str>,
    ) -> Result<Option<Diagnosis>> {
        let last_errors = match errors {
            Some(errors) => errors.to_string(),
            None => self
                .store
                .get_fix_attempts(session_id)
                .await?
                .last()
                .map(|a| a.approach.clone())
                .unwrap_or_default(),
        };

        let diagnosis = match level {
            EscalationLevel::L2 => Some(
                self.researcher
                    .analyze_execution(session_id, resource_id, &last_errors)
                    .await?
                    .data,
            ),
            EscalationLevel::L3 => {
                let already_tried = self.store.format_already_tried(session_id).await?;
                Some(
                    self.researcher
                        .deep_dive(session_id, resource_id, &already_tried)
                        .await?
                        .data,
                )
            }
            _ => None,
        };
        Ok(diagnosis)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fix_cycle(
        &self,
        session_id: Uuid,
        resource_id: &str,
        cycle: u32,
        report: &QaReport,
        mut diagnosis: Option<Diagnosis>,
        has_failed_execution: bool,
        gates: &mut GateEnforcer,
    ) -> Result<()> {
        let error_summary = report.error_summary();
        let ctx = GateContext {
            has_failed_execution,
            qa_report: Some(report),
            findings: None,
        };

        let session = self.store.snapshot(session_id).await?;
        let check = gates.check_all(&session, AgentRole::Builder, ctx);
        if !check.passed {
            let needs_research = check
                .violations
                .iter()
                .any(|v| v.required_agent() == Some(AgentRole::Researcher));
            if !needs_research {
                warn!(
                    session_id = %session_id,
                    cycle,
                    violations = %check.summary(),
                    "Pre-fix gates failed, skipping fix this cycle"
                );
                self.store.update_stage(session_id, Stage::Validate).await?;
                return Ok(());
            }

            warn!(
                session_id = %session_id,
                violations = %check.summary(),
                "Pre-fix gates failed, investigating"
            );
            diagnosis = Some(
                self.researcher
                    .analyze_execution(session_id, resource_id, &error_summary)
                    .await?
                    .data,
            );

            let session = self.store.snapshot(session_id).await?;
            let recheck = gates.check_all(&session, AgentRole::Builder, ctx);
            if !recheck.passed {
                warn!(
                    session_id = %session_id,
                    cycle,
                    violations = %recheck.summary(),
                    "Pre-fix gates still failing, skipping fix this cycle"
                );
                self.store.update_stage(session_id, Stage::Validate).await?;
                return Ok(());
            }
        }

        self.store.update_stage(session_id, Stage::Build).await?;
        let session = self.store.snapshot(session_id).await?;
        let already_tried = gates
            .inject_fix_attempts(&session)
            .already_tried()
            .unwrap_or_default()
            .to_string();

        let errors = match &diagnosis {
            Some(d) if !d.root_cause.is_empty() || !d.recommended_fix.is_empty() => format!(
                "{}\n\nInvestigation:\n- Root cause: {}\n- Recommended fix: {}",
                error_summary, d.root_cause, d.recommended_fix
            ),
            _ => error_summary.clone(),
        };
        let edit_scope = if report.edit_scope.is_empty() {
            diagnosis
                .as_ref()
                .map(|d| d.failing_nodes.clone())
                .unwrap_or_default()
        } else {
            report.edit_scope.clone()
        };

        let fix = self
            .builder
            .fix(session_id, resource_id, &edit_scope, &errors, &already_tried)
            .await?;

        let mutation_check = gates.verify_mutation_calls(&fix.calls);
        if !mutation_check.passed {
            warn!(
                session_id = %session_id,
                cycle,
                reason = mutation_check.message.as_deref().unwrap_or_default(),
                "Fix made no mutation"
            );
        }

        let result = if fix.success && fix.data.verification.expected_changes_applied {
            FixResult::Success
        } else {
            FixResult::Failed
        };
        let mut attempt = FixAttempt::new(cycle, error_summary, result).with_nodes(edit_scope);
        if let Some(error) = &fix.error {
            attempt = attempt.with_error_type(error.clone());
        }
        self.store.log_fix_attempt(session_id, attempt).await?;

        self.store.update_stage(session_id, Stage::Validate).await?;
        Ok(())
    }

    /// The in-memory session stays authoritative when the archive write fails.
    async fn archive_best_effort(&self, session_id: Uuid) {
        if let Err(e) = self.store.archive(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to archive session");
        }
    }

    /// Post-mortem, knowledge updates, report and archive. Never fails: a
    /// broken post-mortem still yields a minimal report.
    async fn block(&self, session_id: Uuid, cause: &str) -> TaskReport {
        match self.post_mortem(session_id, cause).await {
            Ok(report) => report,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Post-mortem failed");
                TaskReport {
                    session_id,
                    outcome: TaskOutcome::Blocked,
                    message: format!(
                        "BLOCKED: Workflow could not be completed.\n\nCause: {}\n\
                         Post-mortem failed: {}",
                        cause, e
                    ),
                }
            }
        }
    }

    async fn post_mortem(&self, session_id: Uuid, cause: &str) -> Result<TaskReport> {
        let session = self.store.snapshot(session_id).await?;
        if session.stage != Stage::Blocked
            && StageMachine::can_transition(&session.stage, &Stage::Blocked)
        {
            self.store.update_stage(session_id, Stage::Blocked).await?;
        }

        let session = self.store.snapshot(session_id).await?;
        let mut post_mortem = self
            .analyst
            .post_mortem(&session, session.target_resource_id.as_deref(), cause)
            .await?
            .data;
        if post_mortem.root_cause.trim().is_empty() {
            post_mortem.root_cause = cause.to_string();
        }

        let learning_ids = self.analyst.apply_post_mortem(&post_mortem).await;
        if !learning_ids.is_empty() {
            info!(session_id = %session_id, learnings = ?learning_ids, "Recorded learnings");
        }

        let session = self.store.snapshot(session_id).await?;
        let report = generate_user_report(&session, &post_mortem, &token_usage(&session));
        if let Err(e) = self
            .analyst
            .write_report(&format!("{}_post_mortem.md", session_id), &report)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to write post-mortem report");
        }
        self.archive_best_effort(session_id).await;

        Ok(TaskReport {
            session_id,
            outcome: TaskOutcome::Blocked,
            message: format!("BLOCKED: Workflow could not be completed.\n\n{}", report),
        })
    }
}

/// A PASS that failed its forced live test becomes a FAIL carrying the test errors.
pub(crate) fn forced_test_failure(
    report: QaReport,
    tests: &[flowforge_core::TestRun],
    summary: &str,
) -> QaReport {
    let mut errors: Vec<QaIssue> = tests
        .iter()
        .filter(|t| !t.success)
        .map(|t| QaIssue {
            node: None,
            message: format!(
                "Live test '{}' failed: {}",
                t.name,
                t.error.as_deref().unwrap_or("no error detail")
            ),
        })
        .collect();
    if errors.is_empty() {
        errors.push(QaIssue {
            node: None,
            message: "Live test was required but none executed".to_string(),
        });
    }

    QaReport {
        status: QaStatus::Fail,
        errors,
        live_test_executed: !tests.is_empty(),
        summary: summary.to_string(),
        ..report
    }
}
