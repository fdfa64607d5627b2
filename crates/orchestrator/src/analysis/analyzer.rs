//! Read-only workflow audit.
//!
//! Architect explains intent from the project docs, the researcher audits the
//! live workflow and may ask the architect, the analyst synthesizes a report
//! and may ask the researcher. Nothing here mutates the workflow.
//!
//! The report's recommendations become a persisted fix list. After review the
//! user can have the urgent ones applied through [`IncrementalFixer`].

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use events::EventBus;
use flowforge_core::{
    AgentMessage, AgentRole, AnalysisStatus, ConversationEntry, ProjectDocs, Stage, TodoList,
};
use futures::future::join_all;
use serde_json::json;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context_store::{ContextWrite, SharedContext, SharedContextStore, Writer};
use super::coordinator::{MessageCoordinator, MessageHandler};
use super::fix_flow::{render_manual_instructions, FixApproval, FixSummary, IncrementalFixer};
use super::todo_store::TodoStore;
use crate::agents::{
    AgentInvoker, AgentRuntime, AnalystAgent, ArchitectAgent, BuilderAgent, Invocation, QaAgent,
    ResearcherAgent,
};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::flow::DecisionPrompter;
use crate::knowledge::KnowledgeBase;
use crate::session_store::SessionStore;

const ROOT_DOCS: [&str; 4] = ["README.md", "TODO.md", "PLAN.md", "ARCHITECTURE.md"];
const CONTEXT_DIR: &str = ".context";

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub success: bool,
    pub analysis_id: Option<Uuid>,
    pub report_path: Option<PathBuf>,
    pub report: String,
    /// Recommendations as fix tasks, present on success.
    pub todo: Option<TodoList>,
    pub todo_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Result of [`AnalyzerOrchestrator::review`].
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    Fixed(FixSummary),
    /// Instructions for applying the fixes by hand.
    Manual(String),
    Saved(Option<PathBuf>),
    /// Report and fix list were deleted.
    Discarded,
}

/// Routes a question to the role's `answer` operation.
enum Answerer {
    Architect(Arc<ArchitectAgent>),
    Researcher(Arc<ResearcherAgent>),
    Analyst(Arc<AnalystAgent>),
}

struct AgentHandler {
    answerer: Answerer,
    session_id: Uuid,
    context: Arc<SharedContextStore>,
}

#[async_trait]
impl MessageHandler for AgentHandler {
    async fn handle(&self, message: &AgentMessage) -> Result<String> {
        let shared = self.context.snapshot().await;
        let context = json!({
            "question_context": message.context,
            "workflow_id": shared.workflow_id,
            "architect_context": shared.architect_context,
            "researcher_findings": shared.researcher_findings,
        });

        let invocation: Invocation<flowforge_core::Answer> = match &self.answerer {
            Answerer::Architect(agent) => {
                agent
                    .answer(self.session_id, message.from, &message.content, context)
                    .await?
            }
            Answerer::Researcher(agent) => {
                agent
                    .answer(self.session_id, message.from, &message.content, context)
                    .await?
            }
            Answerer::Analyst(agent) => {
                agent
                    .answer(self.session_id, message.from, &message.content, context)
                    .await?
            }
        };

        match invocation.error {
            Some(error) => Err(OrchestratorError::ExecutionFailed(error)),
            None => Ok(invocation.data.answer),
        }
    }
}

pub struct AnalyzerOrchestrator {
    config: OrchestratorConfig,
    store: Arc<SessionStore>,
    event_bus: EventBus,
    architect: Arc<ArchitectAgent>,
    researcher: Arc<ResearcherAgent>,
    analyst: Arc<AnalystAgent>,
    builder: Arc<BuilderAgent>,
    qa: Arc<QaAgent>,
    todos: Arc<TodoStore>,
}

impl AnalyzerOrchestrator {
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
            architect: Arc::new(ArchitectAgent::new(invoker.clone())),
            researcher: Arc::new(ResearcherAgent::new(invoker.clone())),
            builder: Arc::new(BuilderAgent::new(invoker.clone())),
            qa: Arc::new(QaAgent::new(invoker.clone())),
            analyst: Arc::new(AnalystAgent::new(invoker, knowledge)),
            todos: Arc::new(TodoStore::new(config.analysis_dir())),
            config,
            store,
            event_bus,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub async fn analyze(&self, workflow_id: &str, project_path: Option<&Path>) -> AnalysisResult {
        let session = self.store.create(Some(workflow_id.to_string())).await;
        let context = Arc::new(
            SharedContextStore::new(self.config.analysis_dir(), workflow_id)
                .with_event_bus(self.event_bus.clone()),
        );
        let analysis_id = context.analysis_id().await;
        info!(analysis_id = %analysis_id, workflow_id = %workflow_id, "Starting analysis");

        let coordinator = Arc::new(
            MessageCoordinator::new(context.clone())
                .with_timing(self.config.message_poll_interval, self.config.message_timeout)
                .with_max_retries(self.config.message_max_retries),
        );
        self.register_handlers(&coordinator, session.id, &context).await;
        let pump = spawn_pump(coordinator.clone());

        let outcome = self
            .run(session.id, workflow_id, project_path, &context, &coordinator)
            .await;
        pump.abort();

        match outcome {
            Ok((report_path, report)) => {
                self.finish_session(session.id, Stage::Complete).await;
                let (todo, todo_path) = self.save_todo(&context).await;
                AnalysisResult {
                    success: true,
                    analysis_id: Some(analysis_id),
                    report_path: Some(report_path),
                    report,
                    todo: Some(todo),
                    todo_path,
                    error: None,
                }
            }
            Err(e) => {
                warn!(analysis_id = %analysis_id, error = %e, "Analysis failed");
                self.finish_session(session.id, Stage::Blocked).await;
                AnalysisResult {
                    success: false,
                    analysis_id: Some(analysis_id),
                    report_path: None,
                    report: String::new(),
                    todo: None,
                    todo_path: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Asks the prompter what to do with a successful analysis and does it.
    pub async fn review(
        &self,
        result: &AnalysisResult,
        prompter: &dyn DecisionPrompter,
    ) -> Result<ReviewOutcome> {
        let (Some(analysis_id), Some(todo)) = (result.analysis_id, result.todo.as_ref()) else {
            return Err(OrchestratorError::ExecutionFailed(
                "analysis produced no report to review".to_string(),
            ));
        };
        let report_path = result.report_path.as_deref();

        let choice = prompter.approve_fixes(todo, report_path).await;
        info!(analysis_id = %analysis_id, choice = ?choice, "Analysis reviewed");
        match choice {
            FixApproval::AutoFix => Ok(ReviewOutcome::Fixed(self.apply_fixes(analysis_id).await?)),
            FixApproval::Manual => Ok(ReviewOutcome::Manual(render_manual_instructions(
                todo,
                report_path,
            ))),
            FixApproval::Save => Ok(ReviewOutcome::Saved(result.report_path.clone())),
            FixApproval::Quit => {
                self.discard(analysis_id, report_path).await;
                Ok(ReviewOutcome::Discarded)
            }
        }
    }

    /// Applies the pending P0/P1 tasks of a saved fix list.
    pub async fn apply_fixes(&self, analysis_id: Uuid) -> Result<FixSummary> {
        let mut todo = self
            .todos
            .load(analysis_id)
            .await?
            .ok_or(OrchestratorError::TodoNotFound(analysis_id))?;

        IncrementalFixer::new(
            self.store.clone(),
            self.builder.clone(),
            self.qa.clone(),
            self.todos.clone(),
            self.event_bus.clone(),
        )
        .with_max_attempts(self.config.max_fix_attempts)
        .apply(&mut todo)
        .await
    }

    async fn save_todo(&self, context: &SharedContextStore) -> (TodoList, Option<PathBuf>) {
        let shared = context.snapshot().await;
        let todo = TodoList::from_report(
            shared.analysis_id,
            shared.workflow_id.clone(),
            &shared.analyst_report.unwrap_or_default(),
            shared.researcher_findings.as_ref(),
        );
        match self.todos.save(&todo).await {
            Ok(path) => (todo, Some(path)),
            Err(e) => {
                warn!(analysis_id = %shared.analysis_id, error = %e, "Failed to save fix list");
                (todo, None)
            }
        }
    }

    async fn discard(&self, analysis_id: Uuid, report_path: Option<&Path>) {
        if let Some(path) = report_path {
            if let Err(e) = fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete report");
            }
        }
        if let Err(e) = self.todos.remove(analysis_id).await {
            warn!(analysis_id = %analysis_id, error = %e, "Failed to delete fix list");
        }
    }

    async fn register_handlers(
        &self,
        coordinator: &MessageCoordinator,
        session_id: Uuid,
        context: &Arc<SharedContextStore>,
    ) {
        let handlers = [
            (AgentRole::Architect, Answerer::Architect(self.architect.clone())),
            (AgentRole::Researcher, Answerer::Researcher(self.researcher.clone())),
            (AgentRole::Analyst, Answerer::Analyst(self.analyst.clone())),
        ];
        for (role, answerer) in handlers {
            coordinator
                .register_handler(
                    role,
                    Arc::new(AgentHandler {
                        answerer,
                        session_id,
                        context: context.clone(),
                    }),
                )
                .await;
        }
    }

    async fn run(
        &self,
        session_id: Uuid,
        workflow_id: &str,
        project_path: Option<&Path>,
        context: &SharedContextStore,
        coordinator: &MessageCoordinator,
    ) -> Result<(PathBuf, String)> {
        self.store
            .add_history(
                session_id,
                ConversationEntry::user(format!("Analyze workflow {}", workflow_id)),
            )
            .await?;
        let mut rounds_left = self.config.max_qa_rounds;

        // Loading
        let docs = match project_path {
            Some(path) => load_project_docs(path).await?,
            None => ProjectDocs::default(),
        };
        info!(documents = docs.document_count(), "Loaded project docs");
        context
            .write(Writer::Orchestrator, ContextWrite::ProjectDocs(docs.clone()))
            .await?;

        let snapshot = self
            .researcher
            .fetch_workflow_snapshot(session_id, workflow_id)
            .await?
            .data;
        context
            .write(
                Writer::Orchestrator,
                ContextWrite::ExecutionHistory(snapshot.executions.clone()),
            )
            .await?;
        context
            .write(Writer::Orchestrator, ContextWrite::WorkflowData(snapshot.clone()))
            .await?;

        // Understanding
        context.set_status(AnalysisStatus::Understanding).await?;
        let architect_context = self
            .architect
            .analyze_project_context(session_id, workflow_id, &docs)
            .await?
            .data;
        context
            .write(
                Writer::Agent(AgentRole::Architect),
                ContextWrite::ArchitectContext(architect_context.clone()),
            )
            .await?;

        // Investigating
        context.set_status(AnalysisStatus::Investigating).await?;
        let findings = self
            .researcher
            .audit_workflow(session_id, &snapshot, &architect_context)
            .await?
            .data;
        context
            .write(
                Writer::Agent(AgentRole::Researcher),
                ContextWrite::ResearcherFindings(findings.clone()),
            )
            .await?;
        rounds_left -= ask_all(
            coordinator,
            AgentRole::Researcher,
            AgentRole::Architect,
            &findings.open_questions,
            rounds_left,
        )
        .await;
        debug!(summary = %context.summary().await, "Investigation done");

        // Synthesizing
        context.set_status(AnalysisStatus::Synthesizing).await?;
        let shared = context.snapshot().await;
        let report = self
            .analyst
            .synthesize_report(
                session_id,
                workflow_id,
                json!({
                    "architect_context": shared.architect_context,
                    "researcher_findings": shared.researcher_findings,
                    "execution_history": shared.execution_history,
                    "qa_exchanges": shared.qa_exchanges,
                }),
            )
            .await?
            .data;
        context
            .write(
                Writer::Agent(AgentRole::Analyst),
                ContextWrite::AnalystReport(report.clone()),
            )
            .await?;
        ask_all(
            coordinator,
            AgentRole::Analyst,
            AgentRole::Researcher,
            &report.open_questions,
            rounds_left,
        )
        .await;

        // Drain anything still queued before writing the report.
        for _ in 0..self.config.max_qa_rounds {
            if context.pending_questions().await.is_empty() {
                break;
            }
            coordinator.process_pending().await?;
        }

        let shared = context.snapshot().await;
        let markdown = render_report(&shared);
        let path = self
            .analyst
            .write_report(
                &format!("analysis_{}_{}.md", sanitize(workflow_id), shared.analysis_id),
                &markdown,
            )
            .await?;

        context.set_status(AnalysisStatus::Complete).await?;
        coordinator
            .notify(AgentRole::Analyst, AgentRole::Architect, "Analysis report written")
            .await?;
        info!(summary = %context.summary().await, path = %path.display(), "Analysis complete");
        Ok((path, markdown))
    }

    async fn finish_session(&self, session_id: Uuid, stage: Stage) {
        if let Err(e) = self.store.update_stage(session_id, stage).await {
            warn!(session_id = %session_id, error = %e, "Failed to close analysis session");
        }
        if let Err(e) = self.store.archive(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to archive analysis session");
        }
    }
}

fn spawn_pump(coordinator: Arc<MessageCoordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(coordinator.poll_interval());
        loop {
            interval.tick().await;
            if let Err(e) = coordinator.process_pending().await {
                warn!(error = %e, "Message pump failed");
            }
        }
    })
}

/// Asks up to `budget` non-empty questions concurrently. Returns how many were asked.
async fn ask_all(
    coordinator: &MessageCoordinator,
    from: AgentRole,
    to: AgentRole,
    questions: &[String],
    budget: u32,
) -> u32 {
    let asked: Vec<&String> = questions
        .iter()
        .filter(|q| !q.trim().is_empty())
        .take(budget as usize)
        .collect();
    let count = asked.len() as u32;
    join_all(
        asked
            .into_iter()
            .map(|question| ask_logged(coordinator, from, to, question)),
    )
    .await;
    count
}

async fn ask_logged(
    coordinator: &MessageCoordinator,
    from: AgentRole,
    to: AgentRole,
    question: &str,
) {
    match coordinator.ask(from, to, question, None).await {
        Ok(answer) => debug!(
            from = %from,
            to = %to,
            answer_len = answer.len(),
            "Question answered"
        ),
        Err(e) => warn!(from = %from, to = %to, error = %e, "Question unanswered"),
    }
}

/// README/TODO/PLAN/ARCHITECTURE at the root plus `.context/*.md`.
pub async fn load_project_docs(root: &Path) -> Result<ProjectDocs> {
    let mut docs = ProjectDocs::default();
    for name in ROOT_DOCS {
        let content = read_optional(&root.join(name)).await?;
        match name {
            "README.md" => docs.readme = content,
            "TODO.md" => docs.todo = content,
            "PLAN.md" => docs.plan = content,
            _ => docs.architecture = content,
        }
    }

    let context_dir = root.join(CONTEXT_DIR);
    let mut entries = match fs::read_dir(&context_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(docs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let content = fs::read_to_string(&path).await?;
        docs.context_files.push((name, content));
    }
    docs.context_files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(docs)
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn bullet_list(out: &mut String, items: &[String]) {
    if items.is_empty() {
        out.push_str("- None\n");
    }
    for item in items {
        let _ = writeln!(out, "- {}", item);
    }
}

pub fn render_report(ctx: &SharedContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Workflow Analysis: {}\n", ctx.workflow_id);
    let _ = writeln!(out, "- **Analysis:** {}", ctx.analysis_id);
    let _ = writeln!(out, "- **Generated:** {}", chrono::Utc::now().format("%Y-%m-%d %H:%M UTC"));
    if let Some(workflow) = &ctx.workflow_data {
        let _ = writeln!(
            out,
            "- **Workflow:** {} ({} nodes, {})",
            if workflow.name.is_empty() { &workflow.id } else { &workflow.name },
            workflow.nodes.len(),
            if workflow.active { "active" } else { "inactive" }
        );
    }
    let _ = writeln!(out, "- **Executions reviewed:** {}\n", ctx.execution_history.len());

    if let Some(report) = &ctx.analyst_report {
        let _ = writeln!(out, "## Summary\n\n{}\n", report.summary.trim());
        if !report.risk_level.is_empty() {
            let _ = writeln!(out, "**Risk level:** {}\n", report.risk_level);
        }
        let _ = writeln!(out, "## Root Causes\n");
        bullet_list(&mut out, &report.root_causes);
        let _ = writeln!(out, "\n## Recommendations\n");
        bullet_list(&mut out, &report.recommendations);
        out.push('\n');
    }

    if let Some(architect) = &ctx.architect_context {
        let _ = writeln!(out, "## Intended Behavior\n\n{}\n", architect.intended_behavior.trim());
        if !architect.concerns.is_empty() {
            let _ = writeln!(out, "### Concerns\n");
            bullet_list(&mut out, &architect.concerns);
            out.push('\n');
        }
    }

    if let Some(findings) = &ctx.researcher_findings {
        let _ = writeln!(out, "## Findings\n");
        if !findings.hypothesis.is_empty() {
            let _ = writeln!(out, "**Hypothesis:** {}\n", findings.hypothesis);
        }
        if findings.issues.is_empty() {
            out.push_str("- No issues found\n");
        }
        for issue in &findings.issues {
            let _ = writeln!(
                out,
                "- [{}] {}{}",
                if issue.severity.is_empty() { "info" } else { &issue.severity },
                issue.node.as_deref().map(|n| format!("{}: ", n)).unwrap_or_default(),
                issue.description
            );
        }
        if !findings.execution_summary.is_empty() {
            let _ = writeln!(out, "\n{}", findings.execution_summary.trim());
        }
        out.push('\n');
    }

    if !ctx.qa_exchanges.is_empty() {
        let _ = writeln!(out, "## Agent Q&A\n");
        for exchange in &ctx.qa_exchanges {
            let _ = writeln!(
                out,
                "**{} → {}:** {}\n\n> {}\n",
                exchange.from, exchange.to, exchange.question, exchange.answer
            );
        }
    }

    out.trim_end().to_string()
}
