use std::sync::Arc;

use flowforge_core::{
    AgentRole, Answer, AuditFindings, CredentialDiscovery, Diagnosis, ProjectAnalysis,
    ResearchFindings, WorkflowSnapshot,
};
use serde_json::json;
use uuid::Uuid;

use super::invoker::{AgentInvoker, Invocation};
use crate::error::Result;
use crate::prompts::AgentPrompts;

/// Read-only investigator.
pub struct ResearcherAgent {
    invoker: Arc<AgentInvoker>,
}

impl ResearcherAgent {
    pub fn new(invoker: Arc<AgentInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn search(
        &self,
        session_id: Uuid,
        query: &str,
    ) -> Result<Invocation<ResearchFindings>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &AgentPrompts::search(query),
                json!({}),
                |_| ResearchFindings::default(),
            )
            .await
    }

    /// Second look at a hypothesis that came back unvalidated.
    pub async fn validate_hypothesis(
        &self,
        session_id: Uuid,
        findings: &ResearchFindings,
    ) -> Result<Invocation<ResearchFindings>> {
        let previous = findings.clone();
        let task = format!(
            "Validate this hypothesis with concrete evidence (node availability, templates, \
             existing workflows). Set hypothesis_validated only if the evidence supports it.\n\n\
             Hypothesis: {}",
            findings.hypothesis
        );
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &task,
                json!({ "previous_findings": findings }),
                move |_| previous,
            )
            .await
    }

    pub async fn discover_credentials(
        &self,
        session_id: Uuid,
        types: &[String],
    ) -> Result<Invocation<CredentialDiscovery>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &AgentPrompts::discover_credentials(types),
                json!({}),
                |_| CredentialDiscovery::default(),
            )
            .await
    }

    /// L2: targeted analysis of the latest failed execution.
    pub async fn analyze_execution(
        &self,
        session_id: Uuid,
        resource_id: &str,
        errors: &str,
    ) -> Result<Invocation<Diagnosis>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &AgentPrompts::analyze_execution(resource_id, errors),
                json!({}),
                |_| Diagnosis::default(),
            )
            .await
    }

    /// L3: full review of every prior fix attempt.
    pub async fn deep_dive(
        &self,
        session_id: Uuid,
        resource_id: &str,
        already_tried: &str,
    ) -> Result<Invocation<Diagnosis>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &AgentPrompts::deep_dive(resource_id, already_tried),
                json!({}),
                |_| Diagnosis::default(),
            )
            .await
    }

    pub async fn fetch_workflow_snapshot(
        &self,
        session_id: Uuid,
        workflow_id: &str,
    ) -> Result<Invocation<WorkflowSnapshot>> {
        let id = workflow_id.to_string();
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &AgentPrompts::fetch_snapshot(workflow_id),
                json!({}),
                move |_| WorkflowSnapshot {
                    id,
                    ..WorkflowSnapshot::default()
                },
            )
            .await
    }

    pub async fn audit_workflow(
        &self,
        session_id: Uuid,
        snapshot: &WorkflowSnapshot,
        architect_context: &ProjectAnalysis,
    ) -> Result<Invocation<AuditFindings>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &AgentPrompts::audit_workflow(&snapshot.id),
                json!({ "workflow": snapshot, "architect_context": architect_context }),
                |_| AuditFindings::default(),
            )
            .await
    }

    pub async fn answer(
        &self,
        session_id: Uuid,
        from: AgentRole,
        question: &str,
        context: serde_json::Value,
    ) -> Result<Invocation<Answer>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Researcher,
                &AgentPrompts::answer_question(from, question),
                context,
                |turn| Answer {
                    answer: turn.text.trim().to_string(),
                },
            )
            .await
    }
}
