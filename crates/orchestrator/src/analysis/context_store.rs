//! Shared analysis context
//!
//! One context object per audit, read by every role. Each field has exactly
//! one writer; writes from anyone else are rejected.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use events::{Event, EventBus};
use flowforge_core::{
    AgentMessage, AgentRole, AnalysisReport, AnalysisStatus, AuditFindings, ExecutionRecord,
    MessageKind, MessageStatus, ProjectAnalysis, ProjectDocs, QaExchange, WorkflowSnapshot,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Who is writing to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Orchestrator,
    Agent(AgentRole),
}

impl fmt::Display for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orchestrator => f.write_str("orchestrator"),
            Self::Agent(role) => write!(f, "{}", role),
        }
    }
}

/// A single-field write.
#[derive(Debug, Clone)]
pub enum ContextWrite {
    ProjectDocs(ProjectDocs),
    WorkflowData(WorkflowSnapshot),
    ExecutionHistory(Vec<ExecutionRecord>),
    ArchitectContext(ProjectAnalysis),
    ResearcherFindings(AuditFindings),
    AnalystReport(AnalysisReport),
}

impl ContextWrite {
    pub fn field(&self) -> &'static str {
        match self {
            Self::ProjectDocs(_) => "project_docs",
            Self::WorkflowData(_) => "workflow_data",
            Self::ExecutionHistory(_) => "execution_history",
            Self::ArchitectContext(_) => "architect_context",
            Self::ResearcherFindings(_) => "researcher_findings",
            Self::AnalystReport(_) => "analyst_report",
        }
    }

    pub fn owner(&self) -> Writer {
        match self {
            Self::ProjectDocs(_) | Self::WorkflowData(_) | Self::ExecutionHistory(_) => {
                Writer::Orchestrator
            }
            Self::ArchitectContext(_) => Writer::Agent(AgentRole::Architect),
            Self::ResearcherFindings(_) => Writer::Agent(AgentRole::Researcher),
            Self::AnalystReport(_) => Writer::Agent(AgentRole::Analyst),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedContext {
    pub analysis_id: Uuid,
    pub workflow_id: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub project_docs: ProjectDocs,
    #[serde(default)]
    pub workflow_data: Option<WorkflowSnapshot>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub architect_context: Option<ProjectAnalysis>,
    #[serde(default)]
    pub researcher_findings: Option<AuditFindings>,
    #[serde(default)]
    pub analyst_report: Option<AnalysisReport>,
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
    #[serde(default)]
    pub qa_exchanges: Vec<QaExchange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedContext {
    fn new(workflow_id: String) -> Self {
        let now = Utc::now();
        Self {
            analysis_id: Uuid::new_v4(),
            workflow_id,
            status: AnalysisStatus::default(),
            project_docs: ProjectDocs::default(),
            workflow_data: None,
            execution_history: Vec::new(),
            architect_context: None,
            researcher_findings: None,
            analyst_report: None,
            messages: Vec::new(),
            qa_exchanges: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn message_mut(&mut self, id: Uuid) -> Result<&mut AgentMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| OrchestratorError::ExecutionFailed(format!("Unknown message {}", id)))
    }

    pub fn summary(&self) -> String {
        let pending = self
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .count();
        format!(
            "analysis {} [{}] workflow={} docs={} executions={} architect={} \
             researcher={} report={} messages={} pending={} qa={}",
            self.analysis_id,
            self.status,
            self.workflow_id,
            self.project_docs.document_count(),
            self.execution_history.len(),
            self.architect_context.is_some(),
            self.researcher_findings.is_some(),
            self.analyst_report.is_some(),
            self.messages.len(),
            pending,
            self.qa_exchanges.len(),
        )
    }
}

pub struct SharedContextStore {
    dir: PathBuf,
    inner: RwLock<SharedContext>,
    event_bus: Option<EventBus>,
}

impl SharedContextStore {
    pub fn new(dir: impl AsRef<Path>, workflow_id: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            inner: RwLock::new(SharedContext::new(workflow_id.into())),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub async fn analysis_id(&self) -> Uuid {
        self.inner.read().await.analysis_id
    }

    pub async fn status(&self) -> AnalysisStatus {
        self.inner.read().await.status
    }

    pub async fn snapshot(&self) -> SharedContext {
        self.inner.read().await.clone()
    }

    pub async fn summary(&self) -> String {
        self.inner.read().await.summary()
    }

    pub async fn write(&self, writer: Writer, write: ContextWrite) -> Result<()> {
        let owner = write.owner();
        if writer != owner {
            return Err(OrchestratorError::WritePermissionDenied {
                field: write.field().to_string(),
                writer: writer.to_string(),
                owner: owner.to_string(),
            });
        }

        let field = write.field();
        self.update(|ctx| {
            match write {
                ContextWrite::ProjectDocs(docs) => ctx.project_docs = docs,
                ContextWrite::WorkflowData(data) => ctx.workflow_data = Some(data),
                ContextWrite::ExecutionHistory(history) => ctx.execution_history = history,
                ContextWrite::ArchitectContext(analysis) => ctx.architect_context = Some(analysis),
                ContextWrite::ResearcherFindings(findings) => {
                    ctx.researcher_findings = Some(findings)
                }
                ContextWrite::AnalystReport(report) => ctx.analyst_report = Some(report),
            }
            Ok(())
        })
        .await?;
        debug!(field, writer = %writer, "Context field written");
        Ok(())
    }

    /// Invalid transitions are logged and still applied.
    pub async fn set_status(&self, to: AnalysisStatus) -> Result<AnalysisStatus> {
        let (analysis_id, from) = self
            .update(|ctx| {
                let from = ctx.status;
                if !from.can_transition(&to) {
                    warn!(from = %from, to = %to, "Unexpected analysis status transition");
                }
                ctx.status = to;
                Ok((ctx.analysis_id, from))
            })
            .await?;

        info!(analysis_id = %analysis_id, from = %from, to = %to, "Analysis status");
        if let Some(bus) = &self.event_bus {
            bus.emit(Event::AnalysisStatusChanged {
                analysis_id,
                from,
                to,
            });
        }
        Ok(from)
    }

    pub async fn enqueue(&self, message: AgentMessage) -> Result<Uuid> {
        let id = message.id;
        self.update(|ctx| {
            ctx.messages.push(message);
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn pending_questions(&self) -> Vec<AgentMessage> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.kind == MessageKind::Question && m.status == MessageStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn message(&self, id: Uuid) -> Option<AgentMessage> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Marks the message answered and records the exchange.
    pub async fn resolve(&self, id: Uuid, answer: String) -> Result<()> {
        self.update(|ctx| {
            let message = ctx.message_mut(id)?;
            message.status = MessageStatus::Resolved;
            message.answer = Some(answer.clone());
            let exchange = QaExchange {
                from: message.from,
                to: message.to,
                question: message.content.clone(),
                answer,
                timestamp: Utc::now(),
            };
            ctx.qa_exchanges.push(exchange);
            Ok(())
        })
        .await
    }

    /// Returns the retry count after incrementing.
    pub async fn record_retry(&self, id: Uuid) -> Result<u32> {
        self.update(|ctx| {
            let message = ctx.message_mut(id)?;
            message.retries += 1;
            Ok(message.retries)
        })
        .await
    }

    pub async fn mark_timeout(&self, id: Uuid) -> Result<()> {
        self.update(|ctx| {
            ctx.message_mut(id)?.status = MessageStatus::Timeout;
            Ok(())
        })
        .await
    }

    pub async fn qa_exchanges(&self) -> Vec<QaExchange> {
        self.inner.read().await.qa_exchanges.clone()
    }

    pub fn context_path(&self, analysis_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", analysis_id))
    }

    async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SharedContext) -> Result<T>,
    {
        let (value, snapshot) = {
            let mut ctx = self.inner.write().await;
            let value = f(&mut ctx)?;
            ctx.updated_at = Utc::now();
            (value, ctx.clone())
        };
        self.persist_best_effort(&snapshot).await;
        Ok(value)
    }

    async fn persist_best_effort(&self, ctx: &SharedContext) {
        if let Err(e) = self.persist(ctx).await {
            warn!(analysis_id = %ctx.analysis_id, error = %e, "Failed to persist analysis context");
        }
    }

    async fn persist(&self, ctx: &SharedContext) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string_pretty(ctx)?;
        let path = self.context_path(ctx.analysis_id);
        let temp_path = self.dir.join(format!(".{}.tmp", ctx.analysis_id));
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SharedContextStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SharedContextStore::new(temp_dir.path().join("analyze"), "wf-1");
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_owner_can_write() {
        let (_dir, store) = setup();

        store
            .write(
                Writer::Agent(AgentRole::Architect),
                ContextWrite::ArchitectContext(ProjectAnalysis {
                    project_summary: "digest bot".to_string(),
                    ..ProjectAnalysis::default()
                }),
            )
            .await
            .unwrap();

        let ctx = store.snapshot().await;
        assert_eq!(
            ctx.architect_context.map(|a| a.project_summary).as_deref(),
            Some("digest bot")
        );
    }

    #[tokio::test]
    async fn test_foreign_writer_rejected() {
        let (_dir, store) = setup();

        let result = store
            .write(
                Writer::Agent(AgentRole::Architect),
                ContextWrite::ResearcherFindings(AuditFindings::default()),
            )
            .await;

        match result {
            Err(OrchestratorError::WritePermissionDenied { field, writer, owner }) => {
                assert_eq!(field, "researcher_findings");
                assert_eq!(writer, "architect");
                assert_eq!(owner, "researcher");
            }
            other => panic!("Expected WritePermissionDenied, got {:?}", other.map(|_| ())),
        }
        assert!(store.snapshot().await.researcher_findings.is_none());

        let result = store
            .write(
                Writer::Agent(AgentRole::Analyst),
                ContextWrite::ProjectDocs(ProjectDocs::default()),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_status_transitions_persist() {
        let (_dir, store) = setup();
        let analysis_id = store.analysis_id().await;

        assert_eq!(
            store.set_status(AnalysisStatus::Understanding).await.unwrap(),
            AnalysisStatus::Loading
        );
        // Skipping ahead is allowed but logged.
        store.set_status(AnalysisStatus::Synthesizing).await.unwrap();
        assert_eq!(store.status().await, AnalysisStatus::Synthesizing);

        let path = store.context_path(analysis_id);
        let persisted: SharedContext =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(persisted.status, AnalysisStatus::Synthesizing);
    }

    #[tokio::test]
    async fn test_resolve_records_exchange() {
        let (_dir, store) = setup();
        let id = store
            .enqueue(AgentMessage::question(
                AgentRole::Researcher,
                AgentRole::Architect,
                "Is the webhook public?",
                None,
            ))
            .await
            .unwrap();

        assert_eq!(store.pending_questions().await.len(), 1);
        store.resolve(id, "Yes".to_string()).await.unwrap();

        assert!(store.pending_questions().await.is_empty());
        let exchanges = store.qa_exchanges().await;
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].answer, "Yes");
        assert_eq!(exchanges[0].to, AgentRole::Architect);
    }

    #[tokio::test]
    async fn test_summary_line() {
        let (_dir, store) = setup();
        store
            .enqueue(AgentMessage::notification(
                AgentRole::Analyst,
                AgentRole::Architect,
                "done",
            ))
            .await
            .unwrap();

        let summary = store.summary().await;
        assert!(summary.contains("[loading]"));
        assert!(summary.contains("workflow=wf-1"));
        assert!(summary.contains("messages=1 pending=0"));
    }
}
